// ABOUTME: Host and container resource sampling for capacity reporting
// ABOUTME: Failed sub-samples keep their previously cached value instead of blanking it

use crate::cache::StateCache;
use crate::engine::{ContainerEngine, BYTES_PER_GIB, CPU_PERIOD};
use crate::error::{Result, RunnerError};
use crate::scheduler::spawn_periodic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sentinel reported for fields that have never been sampled
pub const UNAVAILABLE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Host CPU usage in percent
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    /// vCPUs allocated to running sandboxes
    pub allocated_cpu: i64,
    /// GB of memory allocated to running sandboxes
    pub allocated_memory: i64,
    /// GB of disk quota across all sandboxes
    pub allocated_disk: i64,
    pub snapshot_count: i64,
    pub started_sandbox_count: i64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ResourceUsage {
    pub fn unavailable() -> Self {
        Self {
            cpu_usage: UNAVAILABLE as f64,
            ram_usage: UNAVAILABLE as f64,
            disk_usage: UNAVAILABLE as f64,
            allocated_cpu: UNAVAILABLE,
            allocated_memory: UNAVAILABLE,
            allocated_disk: UNAVAILABLE,
            snapshot_count: UNAVAILABLE,
            started_sandbox_count: UNAVAILABLE,
            last_updated: None,
        }
    }
}

/// Host-level usage gauges in percent
#[async_trait]
pub trait HostStats: Send + Sync {
    async fn cpu_usage(&self) -> Result<f64>;

    async fn ram_usage(&self) -> Result<f64>;

    async fn disk_usage(&self) -> Result<f64>;
}

pub struct SysinfoStats {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SysinfoStats {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            disk_path: PathBuf::from("/"),
        }
    }
}

impl Default for SysinfoStats {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    used as f64 / total as f64 * 100.0
}

#[async_trait]
impl HostStats for SysinfoStats {
    async fn cpu_usage(&self) -> Result<f64> {
        self.system
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .refresh_cpu();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_cpu();
        Ok(system.global_cpu_info().cpu_usage() as f64)
    }

    async fn ram_usage(&self) -> Result<f64> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(RunnerError::internal("host reports no memory"));
        }
        Ok(percent(total.saturating_sub(system.available_memory()), total))
    }

    async fn disk_usage(&self) -> Result<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| self.disk_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                RunnerError::not_found(format!("no disk mounted at {}", self.disk_path.display()))
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Err(RunnerError::internal("disk reports zero capacity"));
        }
        Ok(percent(total.saturating_sub(disk.available_space()), total))
    }
}

struct Allocation {
    cpu: i64,
    memory: i64,
    disk: i64,
    started: i64,
}

pub struct MetricsSampler {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn StateCache>,
    host_stats: Arc<dyn HostStats>,
}

impl MetricsSampler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn StateCache>,
        host_stats: Arc<dyn HostStats>,
    ) -> Self {
        Self {
            engine,
            cache,
            host_stats,
        }
    }

    /// Last cached sample, or all sentinels when nothing was ever collected
    pub fn cached(&self) -> ResourceUsage {
        self.cache
            .system_metrics()
            .unwrap_or_else(ResourceUsage::unavailable)
    }

    /// Take a sample, merge it over the cached one and store the result
    pub async fn collect(&self) -> ResourceUsage {
        let mut usage = self.cached();

        match self.host_stats.cpu_usage().await {
            Ok(value) => usage.cpu_usage = value,
            Err(e) => warn!("Failed to sample CPU usage: {}", e),
        }

        match self.host_stats.ram_usage().await {
            Ok(value) => usage.ram_usage = value,
            Err(e) => warn!("Failed to sample RAM usage: {}", e),
        }

        match self.host_stats.disk_usage().await {
            Ok(value) => usage.disk_usage = value,
            Err(e) => warn!("Failed to sample disk usage: {}", e),
        }

        match self.allocation().await {
            Ok(allocation) => {
                usage.allocated_cpu = allocation.cpu;
                usage.allocated_memory = allocation.memory;
                usage.allocated_disk = allocation.disk;
                usage.started_sandbox_count = allocation.started;
            }
            Err(e) => warn!("Failed to sample sandbox allocations: {}", e),
        }

        match self.engine.list_images().await {
            Ok(images) => usage.snapshot_count = images.len() as i64,
            Err(e) => warn!("Failed to count snapshots: {}", e),
        }

        usage.last_updated = Some(Utc::now());
        self.cache.set_system_metrics(usage.clone());

        debug!(
            "Sampled metrics: cpu {:.1}%, ram {:.1}%, disk {:.1}%, {} started sandboxes",
            usage.cpu_usage, usage.ram_usage, usage.disk_usage, usage.started_sandbox_count
        );

        usage
    }

    async fn allocation(&self) -> Result<Allocation> {
        let containers = self.engine.list_containers().await?;

        let mut cpu_quota = 0;
        let mut memory_bytes = 0;
        let mut disk = 0;
        let mut started = 0;

        for container in containers {
            let details = match self.engine.inspect_container(&container.id).await {
                Ok(details) => details,
                Err(e) => {
                    debug!("Skipping container {} in allocation: {}", container.id, e);
                    continue;
                }
            };

            if details.is_running() {
                cpu_quota += details.resources.cpu_quota;
                memory_bytes += details.resources.memory_bytes;
                started += 1;
            }
            disk += details.resources.disk_gb;
        }

        Ok(Allocation {
            cpu: cpu_quota / CPU_PERIOD,
            memory: memory_bytes / BYTES_PER_GIB,
            disk,
            started,
        })
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("metrics sampler", interval, cancel, move || {
            let sampler = self.clone();
            async move {
                sampler.collect().await;
            }
        })
    }
}
