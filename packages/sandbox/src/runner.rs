// ABOUTME: Process-wide wiring of the orchestrator and its background loops
// ABOUTME: Built once at startup from RunnerConfig and handed to callers explicitly

use crate::cache::{InMemoryStateCache, StateCache};
use crate::control_plane::{ControlPlane, HttpControlPlane};
use crate::engine::{ContainerEngine, DockerEngine, RegistryCredentials};
use crate::error::{Result, RunnerError};
use crate::gc::GarbageCollector;
use crate::health::HealthChecker;
use crate::images::ImagePipeline;
use crate::manager::SandboxManager;
use crate::metrics::{HostStats, MetricsSampler, SysinfoStats};
use crate::scheduler::spawn_periodic;
use crate::storage::{ObjectStorage, S3ObjectStorage};
use crate::sync::StateSyncReconciler;
use crate::volumes::{MountHelper, S3MountHelper, VolumeMountManager};
use runner_config::{RegistrySettings, RunnerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// External collaborators the runner is assembled from
pub struct Components {
    pub engine: Arc<dyn ContainerEngine>,
    pub control_plane: Option<Arc<dyn ControlPlane>>,
    pub mount_helper: Arc<dyn MountHelper>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub host_stats: Arc<dyn HostStats>,
}

impl Components {
    /// Docker, the HTTP control plane, mount-s3, S3 and sysinfo as configured
    pub async fn from_config(config: &RunnerConfig) -> Result<Self> {
        let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::new()?);

        let control_plane: Option<Arc<dyn ControlPlane>> = match &config.api.url {
            Some(url) => Some(Arc::new(HttpControlPlane::new(
                url.clone(),
                config.api.token.clone(),
                config.api.domain.clone(),
            )?)),
            None => {
                warn!("API_URL is not set; garbage collection and state sync are disabled");
                None
            }
        };

        let storage: Option<Arc<dyn ObjectStorage>> = if config.storage.is_configured() {
            Some(Arc::new(S3ObjectStorage::connect(&config.storage).await?))
        } else {
            debug!("Object storage is not configured; builds cannot use uploaded contexts");
            None
        };

        Ok(Self {
            engine,
            control_plane,
            mount_helper: Arc::new(S3MountHelper::new(config.storage.clone())),
            storage,
            host_stats: Arc::new(SysinfoStats::new()),
        })
    }
}

fn registry_credentials(registry: &RegistrySettings) -> RegistryCredentials {
    RegistryCredentials {
        url: registry.url.clone(),
        project: registry.project.clone(),
        username: registry.username.clone(),
        password: registry.password.clone(),
    }
}

/// The single orchestrator value of a runner process
pub struct Runner {
    config: RunnerConfig,
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<InMemoryStateCache>,
    manager: Arc<SandboxManager>,
    metrics: Arc<MetricsSampler>,
    health: HealthChecker,
    gc: Option<Arc<GarbageCollector>>,
    sync: Option<Arc<StateSyncReconciler>>,
}

impl Runner {
    pub async fn from_config(config: RunnerConfig) -> Result<Self> {
        let components = Components::from_config(&config).await?;
        Ok(Self::new(config, components))
    }

    pub fn new(config: RunnerConfig, components: Components) -> Self {
        let Components {
            engine,
            control_plane,
            mount_helper,
            storage,
            host_stats,
        } = components;

        let cache = Arc::new(InMemoryStateCache::new(
            config.cache.ttl,
            config.cache.metrics_ttl,
        ));
        let state_cache: Arc<dyn StateCache> = cache.clone();

        let mut images = ImagePipeline::new(
            engine.clone(),
            state_cache.clone(),
            config.build_log_dir.clone(),
        );
        if let Some(storage) = storage {
            images = images.with_storage(storage);
        }
        if let Some(registry) = &config.registry {
            images = images.with_internal_registry(registry_credentials(registry));
        }

        let volumes = Arc::new(VolumeMountManager::new(
            mount_helper,
            config.sandbox.volume_mount_root(),
        ));

        let manager = Arc::new(SandboxManager::new(
            engine.clone(),
            state_cache.clone(),
            volumes,
            Arc::new(images),
            config.sandbox.clone(),
        ));

        let metrics = Arc::new(MetricsSampler::new(
            engine.clone(),
            state_cache.clone(),
            host_stats,
        ));

        // Three missed samples before the node reports degraded
        let health = HealthChecker::new(
            engine.clone(),
            state_cache,
            config.metrics.interval * 3,
        );

        let gc = control_plane.as_ref().map(|control_plane| {
            Arc::new(GarbageCollector::new(
                engine.clone(),
                control_plane.clone(),
                config.gc.clone(),
            ))
        });
        let sync = control_plane
            .map(|control_plane| Arc::new(StateSyncReconciler::new(engine.clone(), control_plane)));

        Self {
            config,
            engine,
            cache,
            manager,
            metrics,
            health,
            gc,
            sync,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<MetricsSampler> {
        &self.metrics
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Garbage collector, available when a control plane is configured
    pub fn garbage_collector(&self) -> Result<&Arc<GarbageCollector>> {
        self.gc
            .as_ref()
            .ok_or_else(|| RunnerError::bad_request("garbage collection needs API_URL"))
    }

    /// State sync reconciler, available when a control plane is configured
    pub fn state_sync(&self) -> Result<&Arc<StateSyncReconciler>> {
        self.sync
            .as_ref()
            .ok_or_else(|| RunnerError::bad_request("state sync needs API_URL"))
    }

    /// Start every background loop; they all stop when `cancel` fires
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self
            .metrics
            .clone()
            .spawn(self.config.metrics.interval, cancel.clone())];

        match &self.sync {
            Some(sync) => handles.push(
                sync.clone()
                    .spawn(self.config.sync.interval, cancel.clone()),
            ),
            None => info!("State sync disabled"),
        }

        match &self.gc {
            Some(gc) if self.config.gc.enabled => handles.push(gc.clone().spawn(cancel.clone())),
            _ => info!("Garbage collection disabled"),
        }

        let cache = self.cache.clone();
        handles.push(spawn_periodic(
            "cache eviction",
            CACHE_EVICTION_INTERVAL,
            cancel.clone(),
            move || {
                let cache = cache.clone();
                async move {
                    let evicted = cache.evict_expired();
                    if evicted > 0 {
                        debug!("Evicted {} expired cache entries", evicted);
                    }
                }
            },
        ));

        handles
    }
}
