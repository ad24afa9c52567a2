// ABOUTME: Configuration crate for the sandbox runner
// ABOUTME: Exposes env var names and the typed RunnerConfig loaded from the environment

pub mod constants;
mod duration;
mod settings;

pub use duration::parse_duration;
pub use settings::{
    ApiSettings, CacheSettings, ConfigError, GcSettings, LogSettings, MetricsSettings,
    RegistrySettings, RunnerConfig, SandboxSettings, StorageSettings, SyncSettings,
    AGENT_CONTAINER_PATH,
};
