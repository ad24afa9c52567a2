// ABOUTME: Sandbox lifecycle orchestration for a single fleet node
// ABOUTME: Engine adapter, state cache, image pipeline and the GC, sync and metrics loops

pub mod build_logs;
pub mod cache;
pub mod control_plane;
pub mod derive;
pub mod engine;
pub mod error;
pub mod gc;
pub mod health;
pub mod images;
pub mod manager;
pub mod metrics;
pub mod resize;
pub mod runner;
pub mod sandbox_logs;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod sync;
pub mod volumes;

pub use build_logs::{build_log_path, BuildLogReader};
pub use cache::{CacheData, InMemoryStateCache, StateCache};
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use derive::{derive_state, observe_state, DerivedState};
pub use engine::{
    BuildOptions, ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus,
    ContainerSummary, DockerEngine, ExecResult, ImageDetails, ImageSummary, LogStream,
    RegistryCredentials, ResourceAllocation, ResourceUpdate, BYTES_PER_GIB, CPU_PERIOD,
};
pub use error::{Result, RunnerError};
pub use gc::{GarbageCollector, GcReport, SandboxCleanupInfo, SnapshotCleanupInfo};
pub use health::{HealthChecker, HealthReport, HealthStatus};
pub use images::{BuildRequest, ImagePipeline};
pub use manager::{CreateSandboxRequest, SandboxManager};
pub use metrics::{HostStats, MetricsSampler, ResourceUsage, SysinfoStats};
pub use resize::ResizeRequest;
pub use runner::{Components, Runner};
pub use sandbox_logs::normalize_logs;
pub use state::{Outcome, SandboxState, SnapshotState};
pub use storage::{ObjectStorage, S3ObjectStorage};
pub use sync::{StateSyncReconciler, SyncReport};
pub use volumes::{MountHelper, S3MountHelper, Volume, VolumeMountManager};
