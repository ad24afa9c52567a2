// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by the runner

// Control Plane
pub const API_URL: &str = "API_URL";
pub const API_TOKEN: &str = "API_TOKEN";
pub const RUNNER_DOMAIN: &str = "RUNNER_DOMAIN";
pub const ENVIRONMENT: &str = "ENVIRONMENT";

// Sandbox Containers
pub const AGENT_BINARY_PATH: &str = "AGENT_BINARY_PATH";
pub const AGENT_BOOTSTRAP_COMMAND: &str = "AGENT_BOOTSTRAP_COMMAND";
pub const SANDBOX_DAEMON_PORT: &str = "SANDBOX_DAEMON_PORT";
pub const CONTAINER_RUNTIME: &str = "CONTAINER_RUNTIME";
pub const CONTAINER_NETWORK: &str = "CONTAINER_NETWORK";
pub const DEFAULT_CPU: &str = "DEFAULT_CPU";
pub const DEFAULT_MEMORY_GB: &str = "DEFAULT_MEMORY_GB";
pub const DEFAULT_DISK_GB: &str = "DEFAULT_DISK_GB";
pub const START_TIMEOUT: &str = "START_TIMEOUT";
pub const STOP_TIMEOUT: &str = "STOP_TIMEOUT";
pub const CREATE_WAIT_TIMEOUT: &str = "CREATE_WAIT_TIMEOUT";

// Object Storage
pub const AWS_REGION: &str = "AWS_REGION";
pub const AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_DEFAULT_BUCKET: &str = "AWS_DEFAULT_BUCKET";

// Internal Registry
pub const INTERNAL_REGISTRY_URL: &str = "INTERNAL_REGISTRY_URL";
pub const INTERNAL_REGISTRY_PROJECT: &str = "INTERNAL_REGISTRY_PROJECT";
pub const INTERNAL_REGISTRY_USERNAME: &str = "INTERNAL_REGISTRY_USERNAME";
pub const INTERNAL_REGISTRY_PASSWORD: &str = "INTERNAL_REGISTRY_PASSWORD";

// Builds
pub const BUILD_LOG_DIR: &str = "BUILD_LOG_DIR";

// Caching
pub const CACHE_TTL: &str = "CACHE_TTL";
pub const METRICS_CACHE_TTL: &str = "METRICS_CACHE_TTL";

// Garbage Collection
pub const GC_ENABLED: &str = "GC_ENABLED";
pub const GC_INTERVAL: &str = "GC_INTERVAL";
pub const GC_DRY_RUN: &str = "GC_DRY_RUN";
pub const GC_EXCLUDE_SANDBOXES: &str = "GC_EXCLUDE_SANDBOXES";
pub const GC_EXCLUDE_SNAPSHOTS: &str = "GC_EXCLUDE_SNAPSHOTS";
pub const GC_SANDBOX_THRESHOLD: &str = "GC_SANDBOX_THRESHOLD";
pub const GC_SNAPSHOT_THRESHOLD: &str = "GC_SNAPSHOT_THRESHOLD";
pub const GC_EXCLUDE_AGE: &str = "GC_EXCLUDE_AGE";

// Background Loops
pub const SYNC_INTERVAL: &str = "SYNC_INTERVAL";
pub const METRICS_INTERVAL: &str = "METRICS_INTERVAL";

// Logging
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const LOG_FILE_PATH: &str = "LOG_FILE_PATH";
