// ABOUTME: Container engine abstraction consumed by every runner subsystem
// ABOUTME: Engine-neutral container, image and build types plus the ContainerEngine trait

pub mod docker;

pub use docker::DockerEngine;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;

/// CPU quota period in microseconds; a quota of one period equals one vCPU
pub const CPU_PERIOD: i64 = 100_000;

pub const BYTES_PER_GIB: i64 = 1024 * 1024 * 1024;

/// Everything needed to construct a sandbox container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    /// Bind specs in `host:container[:mode]` form
    pub binds: Vec<String>,
    pub privileged: bool,
    pub extra_hosts: Vec<String>,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    /// Disk quota, only honored on XFS-backed engines
    pub storage_size_gb: Option<i64>,
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Other(other.to_string()),
        }
    }
}

/// Limits the engine enforces for one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAllocation {
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    pub disk_gb: i64,
}

/// Limit changes for an existing container; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub cpu_quota: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub storage_size_gb: Option<i64>,
}

/// Inspect result for one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub exit_code: i64,
    pub error: Option<String>,
    pub ip_address: Option<String>,
    pub resources: ResourceAllocation,
    /// Writable overlay layer on the host, when the storage driver exposes one
    pub upper_dir: Option<String>,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Entry returned when listing containers
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetails {
    pub id: String,
    pub architecture: String,
    /// Host directories of the image's layers (lower layers first)
    pub layer_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Execution result from running a command in a container
#[derive(Debug, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryCredentials {
    pub url: String,
    pub project: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub tag: String,
    pub dockerfile: String,
    pub platform: String,
}

/// Streamed output lines of a long-running engine operation
pub type LogStream = BoxStream<'static, Result<String>>;

/// Container runtime primitives the orchestrator depends on
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check that the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// Filesystem backing the engine's storage driver, e.g. "xfs"
    async fn backing_filesystem(&self) -> Result<Option<String>>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container, killing it after `timeout_secs`
    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()>;

    /// Remove a container and its anonymous volumes
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails>;

    /// List every container, including stopped ones
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Execute a command in a running container and wait for it to finish
    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecResult>;

    /// Last `lines` lines of combined stdout/stderr
    async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String> {
        self.container_logs(container_id, lines, false).await
    }

    /// Last `lines` lines of combined stdout/stderr, optionally timestamped
    async fn container_logs(
        &self,
        container_id: &str,
        lines: usize,
        timestamps: bool,
    ) -> Result<String>;

    /// Apply CPU and memory changes to a container in place
    async fn update_resources(&self, container_id: &str, update: &ResourceUpdate) -> Result<()>;

    async fn rename_container(&self, container_id: &str, new_name: &str) -> Result<()>;

    /// Create `name` with the configuration of `source`, replacing its image and limits
    async fn clone_container(
        &self,
        source: &str,
        name: &str,
        image: Option<&str>,
        update: &ResourceUpdate,
    ) -> Result<String>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    async fn pull_image(&self, image: &str, credentials: Option<&RegistryCredentials>)
        -> Result<()>;

    async fn push_image(&self, image: &str, credentials: Option<&RegistryCredentials>)
        -> Result<()>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;

    /// Build an image from a tar context, streaming build output
    async fn build_image(
        &self,
        options: &BuildOptions,
        context: Vec<u8>,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<LogStream>;

    /// Commit a container's filesystem to `image`
    async fn commit_container(&self, container_id: &str, image: &str) -> Result<()>;

    /// Flatten a container's filesystem into `image`, keeping its command, env and user
    async fn export_import_container(&self, container_id: &str, image: &str) -> Result<()>;
}

/// Split `repo[:tag]` into repository and tag, ignoring registry port colons
pub fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(offset) => {
            let split = name_start + offset;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}

/// Parse a storage size option like "10G" into whole gigabytes
pub fn parse_storage_gb(size: &str) -> Option<i64> {
    let size = size.trim();
    let digits = size.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let value: i64 = digits.parse().ok()?;
    match size[digits.len()..].to_uppercase().as_str() {
        "G" | "GB" | "" => Some(value),
        "T" | "TB" => Some(value * 1024),
        "M" | "MB" => Some(value / 1024),
        _ => None,
    }
}
