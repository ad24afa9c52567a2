// ABOUTME: Typed runner configuration loaded from environment variables
// ABOUTME: Groups settings per subsystem with production defaults for every optional value

use crate::constants;
use crate::duration::parse_duration;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Path the agent binary is bound to inside every sandbox container
pub const AGENT_CONTAINER_PATH: &str = "/usr/local/bin/sandbox-agent";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Remote control plane connection
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub url: Option<String>,
    pub token: String,
    pub domain: String,
}

impl ApiSettings {
    /// The control plane URL, required by anything that talks to the remote API
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url
            .as_deref()
            .ok_or(ConfigError::Missing(constants::API_URL))
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            url: None,
            token: String::new(),
            domain: "localhost".to_string(),
        }
    }
}

/// Container construction and lifecycle polling
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub development: bool,
    pub agent_binary_path: PathBuf,
    pub bootstrap_command: Vec<String>,
    pub daemon_port: u16,
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub default_cpu: f64,
    pub default_memory_gb: i64,
    pub default_disk_gb: i64,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub create_wait_timeout: Duration,
    pub poll_interval: Duration,
    pub daemon_dial_attempts: u32,
    pub daemon_dial_timeout: Duration,
    pub daemon_dial_backoff: Duration,
}

impl SandboxSettings {
    /// Host directory under which network volumes are mounted
    pub fn volume_mount_root(&self) -> PathBuf {
        if self.development {
            PathBuf::from("/tmp")
        } else {
            PathBuf::from("/mnt")
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            development: false,
            agent_binary_path: PathBuf::from("/usr/local/lib/sandbox-runner/sandbox-agent"),
            bootstrap_command: vec![AGENT_CONTAINER_PATH.to_string()],
            daemon_port: 2280,
            runtime: None,
            network: None,
            default_cpu: 1.0,
            default_memory_gb: 2,
            default_disk_gb: 10,
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(60),
            create_wait_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_millis(100),
            daemon_dial_attempts: 10,
            daemon_dial_timeout: Duration::from_secs(1),
            daemon_dial_backoff: Duration::from_millis(50),
        }
    }
}

/// S3-compatible object storage shared by build contexts and volume mounts
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket: Option<String>,
}

impl StorageSettings {
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some() && self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

/// Internal registry used for snapshots and published builds
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub url: String,
    pub project: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub metrics_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            metrics_ttl: Duration::from_secs(12 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub dry_run: bool,
    pub exclude_sandboxes: Vec<String>,
    pub exclude_snapshots: Vec<String>,
    pub sandbox_threshold: usize,
    pub snapshot_threshold: usize,
    /// Snapshots younger than this are never collected
    pub exclude_age: Duration,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(12 * 60 * 60),
            dry_run: false,
            exclude_sandboxes: Vec::new(),
            exclude_snapshots: Vec::new(),
            sandbox_threshold: 10,
            snapshot_threshold: 10,
            exclude_age: Duration::from_secs(12 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub interval: Duration,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub file_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub api: ApiSettings,
    pub sandbox: SandboxSettings,
    pub storage: StorageSettings,
    pub registry: Option<RegistrySettings>,
    pub build_log_dir: PathBuf,
    pub cache: CacheSettings,
    pub gc: GcSettings,
    pub sync: SyncSettings,
    pub metrics: MetricsSettings,
    pub logging: LogSettings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            sandbox: SandboxSettings::default(),
            storage: StorageSettings::default(),
            registry: None,
            build_log_dir: PathBuf::from("/tmp/sandbox-runner/builds"),
            cache: CacheSettings::default(),
            gc: GcSettings::default(),
            sync: SyncSettings::default(),
            metrics: MetricsSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = RunnerConfig::default();

        let api = ApiSettings {
            url: env
                .string(constants::API_URL)
                .map(|url| url.trim_end_matches('/').to_string()),
            token: env.string(constants::API_TOKEN).unwrap_or_default(),
            domain: env
                .string(constants::RUNNER_DOMAIN)
                .unwrap_or(defaults.api.domain),
        };

        let development = env
            .string(constants::ENVIRONMENT)
            .map(|value| value.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        let sandbox = SandboxSettings {
            development,
            agent_binary_path: env
                .string(constants::AGENT_BINARY_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox.agent_binary_path),
            bootstrap_command: env
                .string(constants::AGENT_BOOTSTRAP_COMMAND)
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.sandbox.bootstrap_command),
            daemon_port: env
                .parse(constants::SANDBOX_DAEMON_PORT)?
                .unwrap_or(defaults.sandbox.daemon_port),
            runtime: env.string(constants::CONTAINER_RUNTIME),
            network: env.string(constants::CONTAINER_NETWORK),
            default_cpu: env
                .parse(constants::DEFAULT_CPU)?
                .unwrap_or(defaults.sandbox.default_cpu),
            default_memory_gb: env
                .parse(constants::DEFAULT_MEMORY_GB)?
                .unwrap_or(defaults.sandbox.default_memory_gb),
            default_disk_gb: env
                .parse(constants::DEFAULT_DISK_GB)?
                .unwrap_or(defaults.sandbox.default_disk_gb),
            start_timeout: env
                .nonzero_duration(constants::START_TIMEOUT)?
                .unwrap_or(defaults.sandbox.start_timeout),
            stop_timeout: env
                .nonzero_duration(constants::STOP_TIMEOUT)?
                .unwrap_or(defaults.sandbox.stop_timeout),
            create_wait_timeout: env
                .nonzero_duration(constants::CREATE_WAIT_TIMEOUT)?
                .unwrap_or(defaults.sandbox.create_wait_timeout),
            ..defaults.sandbox
        };

        if sandbox.bootstrap_command.is_empty() {
            return Err(ConfigError::Invalid {
                name: constants::AGENT_BOOTSTRAP_COMMAND,
                reason: "command must not be empty".to_string(),
            });
        }

        let storage = StorageSettings {
            region: env.string(constants::AWS_REGION),
            endpoint_url: env.string(constants::AWS_ENDPOINT_URL),
            access_key_id: env.string(constants::AWS_ACCESS_KEY_ID),
            secret_access_key: env.string(constants::AWS_SECRET_ACCESS_KEY),
            bucket: env.string(constants::AWS_DEFAULT_BUCKET),
        };

        let registry = env
            .string(constants::INTERNAL_REGISTRY_URL)
            .map(|url| RegistrySettings {
                url: url.trim_end_matches('/').to_string(),
                project: env.string(constants::INTERNAL_REGISTRY_PROJECT),
                username: env.string(constants::INTERNAL_REGISTRY_USERNAME),
                password: env.string(constants::INTERNAL_REGISTRY_PASSWORD),
            });

        let cache = CacheSettings {
            ttl: env
                .nonzero_duration(constants::CACHE_TTL)?
                .unwrap_or(defaults.cache.ttl),
            metrics_ttl: env
                .nonzero_duration(constants::METRICS_CACHE_TTL)?
                .unwrap_or(defaults.cache.metrics_ttl),
        };

        let gc = GcSettings {
            enabled: env
                .flag(constants::GC_ENABLED)?
                .unwrap_or(defaults.gc.enabled),
            interval: env
                .nonzero_duration(constants::GC_INTERVAL)?
                .unwrap_or(defaults.gc.interval),
            dry_run: env
                .flag(constants::GC_DRY_RUN)?
                .unwrap_or(defaults.gc.dry_run),
            exclude_sandboxes: env.list(constants::GC_EXCLUDE_SANDBOXES),
            exclude_snapshots: env.list(constants::GC_EXCLUDE_SNAPSHOTS),
            sandbox_threshold: env
                .parse(constants::GC_SANDBOX_THRESHOLD)?
                .unwrap_or(defaults.gc.sandbox_threshold),
            snapshot_threshold: env
                .parse(constants::GC_SNAPSHOT_THRESHOLD)?
                .unwrap_or(defaults.gc.snapshot_threshold),
            exclude_age: env
                .duration(constants::GC_EXCLUDE_AGE)?
                .unwrap_or(defaults.gc.exclude_age),
        };

        let sync = SyncSettings {
            interval: env
                .nonzero_duration(constants::SYNC_INTERVAL)?
                .unwrap_or(defaults.sync.interval),
        };

        let metrics = MetricsSettings {
            interval: env
                .nonzero_duration(constants::METRICS_INTERVAL)?
                .unwrap_or(defaults.metrics.interval),
        };

        let logging = LogSettings {
            level: env
                .string(constants::LOG_LEVEL)
                .unwrap_or(defaults.logging.level),
            file_path: env.string(constants::LOG_FILE_PATH).map(PathBuf::from),
        };

        let config = RunnerConfig {
            api,
            sandbox,
            storage,
            registry,
            build_log_dir: env
                .string(constants::BUILD_LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.build_log_dir),
            cache,
            gc,
            sync,
            metrics,
            logging,
        };

        debug!(
            "Loaded runner configuration for domain {} (gc every {:?}, sync every {:?})",
            config.api.domain, config.gc.interval, config.sync.interval
        );

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, name: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(name)
            .map(|value| match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    name,
                    reason: format!("expected a boolean, got '{}'", value),
                }),
            })
            .transpose()
    }

    fn duration(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.string(name)
            .map(|value| {
                parse_duration(&value).map_err(|reason| ConfigError::Invalid { name, reason })
            })
            .transpose()
    }

    /// Intervals, timeouts and TTLs; zero would spin a loop or expire everything at once
    fn nonzero_duration(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        match self.duration(name)? {
            Some(duration) if duration.is_zero() => Err(ConfigError::Invalid {
                name,
                reason: "must be greater than zero".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.string(name)
            .map(|value| {
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}
