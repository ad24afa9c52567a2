// ABOUTME: Sandbox lifecycle manager orchestrating the engine, state cache, volumes and images
// ABOUTME: Create/start/stop/destroy with idempotent short-circuits and an atomic create reservation

use crate::build_logs::BuildLogReader;
use crate::cache::{CacheData, StateCache};
use crate::derive::observe_state;
use crate::engine::{
    ContainerEngine, ContainerSpec, LogStream, RegistryCredentials, BYTES_PER_GIB, CPU_PERIOD,
};
use crate::error::{Result, RunnerError};
use crate::images::{validate_image_ref, BuildRequest, ImagePipeline};
use crate::resize::{copy_layer_data, ResizeRequest};
use crate::sandbox_logs::{normalize_logs, SANDBOX_LOG_LINES};
use crate::state::{Outcome, SandboxState, SnapshotState};
use crate::volumes::{Volume, VolumeMountManager};
use chrono::Utc;
use dashmap::DashMap;
use runner_config::{SandboxSettings, AGENT_CONTAINER_PATH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Image architectures the host can execute
const SUPPORTED_ARCHITECTURES: [&str; 2] = ["amd64", "x86_64"];

const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

/// Request to create a new sandbox
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    pub id: String,
    pub image: String,
    pub user: Option<String>,
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    /// vCPUs; falls back to the configured default
    pub cpus: Option<f64>,
    pub memory_gb: Option<i64>,
    pub storage_gb: Option<i64>,
    pub volumes: Vec<Volume>,
    /// Credentials for pulling `image`
    pub registry: Option<RegistryCredentials>,
}

/// Whether a resize failed before or after it touched the sandbox
enum ResizeError {
    Rejected(RunnerError),
    Failed(RunnerError),
}

use ResizeError::{Failed, Rejected};

struct SnapshotTask {
    generation: u64,
    cancel: CancellationToken,
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn StateCache>,
    volumes: Arc<VolumeMountManager>,
    images: Arc<ImagePipeline>,
    build_logs: BuildLogReader,
    settings: SandboxSettings,
    snapshot_tasks: Arc<DashMap<String, SnapshotTask>>,
    snapshot_generation: AtomicU64,
}

impl SandboxManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn StateCache>,
        volumes: Arc<VolumeMountManager>,
        images: Arc<ImagePipeline>,
        settings: SandboxSettings,
    ) -> Self {
        let build_logs = BuildLogReader::new(engine.clone(), images.build_log_dir().clone());
        Self {
            engine,
            cache,
            volumes,
            images,
            build_logs,
            settings,
            snapshot_tasks: Arc::new(DashMap::new()),
            snapshot_generation: AtomicU64::new(0),
        }
    }

    /// Replace the build log reader, e.g. to shorten its polling in tests
    pub fn with_build_log_reader(mut self, reader: BuildLogReader) -> Self {
        self.build_logs = reader;
        self
    }

    /// Cached state, treating `Unknown` as a miss
    fn cached_state(&self, sandbox_id: &str) -> Option<SandboxState> {
        self.cache
            .get(sandbox_id)
            .map(|data| data.sandbox_state)
            .filter(|state| *state != SandboxState::Unknown)
    }

    /// Create a sandbox, or resume/report the one already there.
    ///
    /// Only the caller that reserves the `Creating` state provisions a container;
    /// concurrent callers wait for its result.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Outcome> {
        let id = request.id.as_str();
        // The raw entry is the reservation's expectation, `Unknown` included
        let reserved_from = self.cache.get(id).map(|data| data.sandbox_state);
        let cached = self.cached_state(id);

        match cached {
            Some(SandboxState::Started | SandboxState::PullingImage | SandboxState::Starting) => {
                debug!("Sandbox {} already running or starting", id);
                return Ok(Outcome::Unchanged);
            }
            Some(SandboxState::Stopped) => return self.start_sandbox(id).await,
            _ => {}
        }

        let observed = observe_state(self.engine.as_ref(), id).await?;
        match cached.unwrap_or(observed.state) {
            SandboxState::Started | SandboxState::PullingImage | SandboxState::Starting => {
                self.cache.set_sandbox_state(id, observed.state);
                return Ok(Outcome::Unchanged);
            }
            SandboxState::Stopped => return self.start_sandbox(id).await,
            SandboxState::Creating if observed.exists => return self.start_sandbox(id).await,
            SandboxState::Creating => return self.wait_for_create(id).await,
            _ => {}
        }

        if !self
            .cache
            .compare_and_set(id, reserved_from, SandboxState::Creating)
        {
            debug!("Another caller is already creating sandbox {}", id);
            return self.wait_for_create(id).await;
        }

        info!("Creating sandbox {} from image {}", id, request.image);

        match self.provision(&request, observed.exists).await {
            Ok(()) => {
                info!("Sandbox {} created", id);
                Ok(Outcome::Applied)
            }
            Err(e) => {
                warn!("Failed to create sandbox {}: {}", id, e);
                self.cache.set_error_reason(id, Some(e.to_string()));
                self.cache.set_sandbox_state(id, SandboxState::Error);
                Err(e)
            }
        }
    }

    async fn provision(&self, request: &CreateSandboxRequest, leftover: bool) -> Result<()> {
        let id = request.id.as_str();

        if leftover {
            match self.engine.remove_container(id, true).await {
                Ok(()) => info!("Removed leftover container of sandbox {}", id),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.images
            .pull_image(&request.image, request.registry.as_ref(), Some(id))
            .await?;
        self.cache.set_sandbox_state(id, SandboxState::Creating);

        let image = self.engine.inspect_image(&request.image).await?;
        if !SUPPORTED_ARCHITECTURES.contains(&image.architecture.as_str()) {
            return Err(RunnerError::conflict(format!(
                "image {} is built for {}, this runner only executes amd64 images",
                request.image, image.architecture
            )));
        }

        let binds = self.volumes.bind_volumes(&request.volumes).await?;
        let spec = self.container_spec(request, binds).await;

        let container_id = self.engine.create_container(&spec).await?;
        debug!("Created container {} for sandbox {}", container_id, id);

        self.start_sandbox(id).await?;
        self.wait_for_daemon(id).await;
        Ok(())
    }

    async fn container_spec(
        &self,
        request: &CreateSandboxRequest,
        mut binds: Vec<String>,
    ) -> ContainerSpec {
        let user = request.user.clone().unwrap_or_default();

        let mut env: Vec<String> = request
            .env
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        env.sort();
        env.push(format!("SANDBOX_ID={}", request.id));
        env.push(format!("SANDBOX_IMAGE={}", request.image));
        env.push(format!("SANDBOX_USER={}", user));

        binds.push(format!(
            "{}:{}:ro",
            self.settings.agent_binary_path.display(),
            AGENT_CONTAINER_PATH
        ));

        let cpus = request.cpus.unwrap_or(self.settings.default_cpu);
        let memory_gb = request.memory_gb.unwrap_or(self.settings.default_memory_gb);
        let memory_bytes = memory_gb * BYTES_PER_GIB;
        let storage_gb = request.storage_gb.unwrap_or(self.settings.default_disk_gb);

        // Disk quotas need project quotas on an XFS-backed storage driver
        let storage_size_gb = match self.engine.backing_filesystem().await {
            Ok(Some(fs)) if fs.eq_ignore_ascii_case("xfs") => Some(storage_gb),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not determine engine backing filesystem: {}", e);
                None
            }
        };

        ContainerSpec {
            name: request.id.clone(),
            hostname: request.id.clone(),
            image: request.image.clone(),
            user: request.user.clone(),
            env,
            entrypoint: request.entrypoint.clone(),
            binds,
            privileged: true,
            extra_hosts: vec![HOST_GATEWAY.to_string()],
            cpu_period: CPU_PERIOD,
            cpu_quota: (cpus * CPU_PERIOD as f64) as i64,
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            storage_size_gb,
            runtime: self.settings.runtime.clone(),
            network: self.settings.network.clone(),
            labels: HashMap::from([(
                "sandbox-runner.sandbox-id".to_string(),
                request.id.clone(),
            )]),
        }
    }

    /// Wait for a create owned by another caller to settle
    async fn wait_for_create(&self, sandbox_id: &str) -> Result<Outcome> {
        let deadline = self.settings.create_wait_timeout;
        let settled = tokio::time::timeout(deadline, async {
            loop {
                let state = match self.cached_state(sandbox_id) {
                    Some(state) => state,
                    None => observe_state(self.engine.as_ref(), sandbox_id).await?.state,
                };
                if !state.is_create_in_flight() {
                    return Ok::<_, RunnerError>(state);
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        })
        .await
        .map_err(|_| {
            RunnerError::Timeout(format!(
                "sandbox {} was still being created after {:?}",
                sandbox_id, deadline
            ))
        })??;

        match settled {
            SandboxState::Started => Ok(Outcome::Unchanged),
            other => Err(RunnerError::conflict(format!(
                "concurrent create of sandbox {} ended in state {}",
                sandbox_id, other
            ))),
        }
    }

    /// Dial the in-container daemon until it accepts connections; never fails the caller
    async fn wait_for_daemon(&self, sandbox_id: &str) {
        let ip = match self.engine.inspect_container(sandbox_id).await {
            Ok(container) => container.ip_address.filter(|ip| !ip.is_empty()),
            Err(e) => {
                warn!(
                    "Could not inspect sandbox {} for daemon readiness check: {}",
                    sandbox_id, e
                );
                return;
            }
        };
        let Some(ip) = ip else {
            debug!(
                "Sandbox {} has no IP address, skipping daemon readiness check",
                sandbox_id
            );
            return;
        };

        let address = format!("{}:{}", ip, self.settings.daemon_port);
        for attempt in 1..=self.settings.daemon_dial_attempts {
            let dial = TcpStream::connect(&address);
            match tokio::time::timeout(self.settings.daemon_dial_timeout, dial).await {
                Ok(Ok(_)) => {
                    debug!(
                        "Daemon of sandbox {} ready after {} attempts",
                        sandbox_id, attempt
                    );
                    return;
                }
                Ok(Err(e)) => debug!("Daemon dial {} of {} failed: {}", attempt, address, e),
                Err(_) => debug!("Daemon dial {} of {} timed out", attempt, address),
            }
            tokio::time::sleep(self.settings.daemon_dial_backoff).await;
        }

        warn!(
            "Daemon of sandbox {} did not accept connections on {}",
            sandbox_id, address
        );
    }

    /// Start a sandbox's container and wait for it to run
    pub async fn start_sandbox(&self, sandbox_id: &str) -> Result<Outcome> {
        if let Some(state) = self
            .cached_state(sandbox_id)
            .filter(|s| s.is_absorbing() || *s == SandboxState::Destroying)
        {
            return Err(RunnerError::conflict(format!(
                "cannot start sandbox {} in state {}",
                sandbox_id, state
            )));
        }

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Starting);

        match self.start_container(sandbox_id).await {
            Ok(outcome) => {
                self.cache
                    .set_sandbox_state(sandbox_id, SandboxState::Started);
                Ok(outcome)
            }
            Err(e) => {
                self.record_failure(sandbox_id, &e).await;
                Err(e)
            }
        }
    }

    async fn start_container(&self, sandbox_id: &str) -> Result<Outcome> {
        let container = self.engine.inspect_container(sandbox_id).await?;
        if container.is_running() {
            return Ok(Outcome::Unchanged);
        }

        self.engine.start_container(sandbox_id).await?;
        self.wait_for_running(sandbox_id, true, self.settings.start_timeout)
            .await?;

        info!("Sandbox {} started", sandbox_id);
        self.spawn_bootstrap(sandbox_id);
        Ok(Outcome::Applied)
    }

    /// Run the agent bootstrap command in the background; failures are only logged
    fn spawn_bootstrap(&self, sandbox_id: &str) {
        if self.settings.bootstrap_command.is_empty() {
            return;
        }

        let engine = self.engine.clone();
        let command = self.settings.bootstrap_command.clone();
        let sandbox_id = sandbox_id.to_string();

        tokio::spawn(async move {
            match engine.exec(&sandbox_id, command).await {
                Ok(result) if result.exit_code == 0 => {
                    debug!("Agent bootstrap finished in sandbox {}", sandbox_id)
                }
                Ok(result) => warn!(
                    "Agent bootstrap in sandbox {} exited with {}: {}",
                    sandbox_id,
                    result.exit_code,
                    String::from_utf8_lossy(&result.stderr).trim()
                ),
                Err(e) => warn!("Agent bootstrap in sandbox {} failed: {}", sandbox_id, e),
            }
        });
    }

    async fn wait_for_running(
        &self,
        sandbox_id: &str,
        running: bool,
        deadline: Duration,
    ) -> Result<()> {
        tokio::time::timeout(deadline, async {
            loop {
                let container = self.engine.inspect_container(sandbox_id).await?;
                if container.is_running() == running {
                    return Ok(());
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        })
        .await
        .map_err(|_| {
            RunnerError::Timeout(format!(
                "sandbox {} did not {} within {:?}",
                sandbox_id,
                if running { "start" } else { "stop" },
                deadline
            ))
        })?
    }

    /// Re-derive the cached state after a failed transition
    async fn record_failure(&self, sandbox_id: &str, error: &RunnerError) {
        self.cache
            .set_error_reason(sandbox_id, Some(error.to_string()));
        match observe_state(self.engine.as_ref(), sandbox_id).await {
            Ok(derived) => self.cache.set_sandbox_state(sandbox_id, derived.state),
            Err(e) => debug!("Could not re-derive state of sandbox {}: {}", sandbox_id, e),
        }
    }

    /// Kill a sandbox's container and wait for it to stop
    pub async fn stop_sandbox(&self, sandbox_id: &str) -> Result<Outcome> {
        if let Some(state @ (SandboxState::Destroyed | SandboxState::Destroying)) =
            self.cached_state(sandbox_id)
        {
            return Err(RunnerError::conflict(format!(
                "cannot stop sandbox {} in state {}",
                sandbox_id, state
            )));
        }

        if self.cancel_snapshot(sandbox_id) {
            self.cache
                .set_snapshot_state(sandbox_id, SnapshotState::Error);
            self.cache.set_error_reason(
                sandbox_id,
                Some("snapshot cancelled because the sandbox was stopped".to_string()),
            );
        }

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Stopping);

        let stopped = async {
            self.engine.stop_container(sandbox_id, 0).await?;
            self.wait_for_running(sandbox_id, false, self.settings.stop_timeout)
                .await
        };

        match stopped.await {
            Ok(()) => {
                self.cache
                    .set_sandbox_state(sandbox_id, SandboxState::Stopped);
                info!("Sandbox {} stopped", sandbox_id);
                Ok(Outcome::Applied)
            }
            Err(e) => {
                self.record_failure(sandbox_id, &e).await;
                Err(e)
            }
        }
    }

    /// Force-remove a sandbox's container.
    ///
    /// A missing container still records `Destroyed` before the not-found error is returned.
    pub async fn destroy_sandbox(&self, sandbox_id: &str) -> Result<Outcome> {
        if let Some(SandboxState::Destroyed | SandboxState::Destroying) =
            self.cached_state(sandbox_id)
        {
            debug!("Sandbox {} already destroyed", sandbox_id);
            return Ok(Outcome::Unchanged);
        }

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Destroying);

        if let Err(e) = self.engine.inspect_container(sandbox_id).await {
            if e.is_not_found() {
                self.cache
                    .set_sandbox_state(sandbox_id, SandboxState::Destroyed);
            } else {
                self.record_failure(sandbox_id, &e).await;
            }
            return Err(e);
        }

        self.cancel_snapshot(sandbox_id);

        match self.engine.remove_container(sandbox_id, true).await {
            Ok(()) => {
                self.cache
                    .set_sandbox_state(sandbox_id, SandboxState::Destroyed);
                info!("Sandbox {} destroyed", sandbox_id);
                Ok(Outcome::Applied)
            }
            Err(e) => {
                self.record_failure(sandbox_id, &e).await;
                Err(e)
            }
        }
    }

    /// Remove the container of a sandbox that is already `Destroyed`
    pub async fn remove_destroyed_sandbox(&self, sandbox_id: &str) -> Result<Outcome> {
        let state = match self.cached_state(sandbox_id) {
            Some(state) => state,
            None => observe_state(self.engine.as_ref(), sandbox_id).await?.state,
        };

        if state != SandboxState::Destroyed {
            return Err(RunnerError::bad_request(format!(
                "sandbox {} is {}, only destroyed sandboxes can be removed",
                sandbox_id, state
            )));
        }

        match self.engine.remove_container(sandbox_id, true).await {
            Ok(()) => {
                info!("Removed destroyed sandbox {}", sandbox_id);
                Ok(Outcome::Applied)
            }
            Err(e) if e.is_not_found() => Ok(Outcome::Unchanged),
            Err(e) => Err(e),
        }
    }

    /// Current state of a sandbox, derived from the engine on a cache miss
    pub async fn sandbox_info(&self, sandbox_id: &str) -> Result<CacheData> {
        let cached = self.cache.get(sandbox_id);
        if let Some(data) = cached
            .as_ref()
            .filter(|data| data.sandbox_state != SandboxState::Unknown)
        {
            return Ok(data.clone());
        }

        let derived = observe_state(self.engine.as_ref(), sandbox_id).await?;
        self.cache.set_sandbox_state(sandbox_id, derived.state);
        if derived.reason.is_some() {
            self.cache.set_error_reason(sandbox_id, derived.reason.clone());
        }

        Ok(self.cache.get(sandbox_id).unwrap_or(CacheData {
            sandbox_state: derived.state,
            error_reason: derived.reason,
            ..CacheData::default()
        }))
    }

    /// Change the CPU, memory or disk limits of an existing sandbox.
    ///
    /// CPU and memory apply to the running container. A disk change needs a
    /// stopped sandbox on an XFS-backed engine: the container is recreated with
    /// the new quota and its writable layer copied across. Precondition failures
    /// leave the sandbox untouched; failures after that mark it `Error`.
    pub async fn resize_sandbox(
        &self,
        sandbox_id: &str,
        request: ResizeRequest,
    ) -> Result<Outcome> {
        request.validate()?;
        if request.is_empty() {
            return Ok(Outcome::Unchanged);
        }

        if let Some(state) = self.cached_state(sandbox_id).filter(|s| {
            s.is_create_in_flight()
                || matches!(
                    s,
                    SandboxState::Destroying | SandboxState::Destroyed | SandboxState::Resizing
                )
        }) {
            return Err(RunnerError::conflict(format!(
                "cannot resize sandbox {} in state {}",
                sandbox_id, state
            )));
        }

        let result = if request.disk_gb.is_some() {
            self.resize_disk(sandbox_id, &request).await
        } else {
            self.resize_live(sandbox_id, &request).await
        };

        match result {
            Ok(()) => {
                info!("Sandbox {} resized", sandbox_id);
                Ok(Outcome::Applied)
            }
            Err(Rejected(e)) => Err(e),
            Err(Failed(e)) => {
                warn!("Failed to resize sandbox {}: {}", sandbox_id, e);
                self.cache.set_error_reason(sandbox_id, Some(e.to_string()));
                self.cache.set_sandbox_state(sandbox_id, SandboxState::Error);
                Err(e)
            }
        }
    }

    async fn resize_live(
        &self,
        sandbox_id: &str,
        request: &ResizeRequest,
    ) -> std::result::Result<(), ResizeError> {
        let previous = match observe_state(self.engine.as_ref(), sandbox_id).await {
            Ok(derived) if !derived.exists => {
                return Err(Rejected(RunnerError::not_found(format!(
                    "sandbox {} has no container",
                    sandbox_id
                ))))
            }
            Ok(derived) => derived.state,
            Err(e) => {
                debug!("Could not derive state of sandbox {}: {}", sandbox_id, e);
                SandboxState::Started
            }
        };

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Resizing);
        let updated = self
            .engine
            .update_resources(sandbox_id, &request.to_update())
            .await;
        self.cache.set_sandbox_state(sandbox_id, previous);
        updated.map_err(Failed)
    }

    async fn resize_disk(
        &self,
        sandbox_id: &str,
        request: &ResizeRequest,
    ) -> std::result::Result<(), ResizeError> {
        let container = self
            .engine
            .inspect_container(sandbox_id)
            .await
            .map_err(Rejected)?;
        if container.is_running() {
            return Err(Rejected(RunnerError::conflict(format!(
                "disk resize of sandbox {} requires it to be stopped",
                sandbox_id
            ))));
        }
        let filesystem = self
            .engine
            .backing_filesystem()
            .await
            .map_err(Rejected)?
            .unwrap_or_default();
        if !filesystem.eq_ignore_ascii_case("xfs") {
            return Err(Rejected(RunnerError::bad_request(format!(
                "disk resize requires an XFS-backed engine, found '{}'",
                filesystem
            ))));
        }

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Resizing);

        let retired = format!("{}-resize-{}", sandbox_id, Utc::now().timestamp());
        self.engine
            .rename_container(sandbox_id, &retired)
            .await
            .map_err(Failed)?;

        if let Err(e) = self
            .engine
            .clone_container(&retired, sandbox_id, None, &request.to_update())
            .await
        {
            self.restore_name(&retired, sandbox_id).await;
            return Err(Failed(e));
        }

        if let Err(e) = self
            .copy_writable_layer(container.upper_dir.as_deref(), sandbox_id)
            .await
        {
            warn!(
                "Keeping container {} for data recovery after a failed copy",
                retired
            );
            if let Err(remove) = self.engine.remove_container(sandbox_id, true).await {
                warn!(
                    "Failed to remove new container of sandbox {}: {}",
                    sandbox_id, remove
                );
            }
            self.restore_name(&retired, sandbox_id).await;
            return Err(Failed(e));
        }

        if let Err(e) = self.engine.remove_container(&retired, true).await {
            warn!("Failed to remove retired container {}: {}", retired, e);
        }

        self.cache
            .set_sandbox_state(sandbox_id, SandboxState::Stopped);
        Ok(())
    }

    async fn copy_writable_layer(&self, from: Option<&str>, sandbox_id: &str) -> Result<()> {
        let Some(from) = from else {
            warn!(
                "Writable layer of sandbox {} is unknown, skipping data copy",
                sandbox_id
            );
            return Ok(());
        };
        let Some(to) = self.engine.inspect_container(sandbox_id).await?.upper_dir else {
            warn!(
                "Writable layer of the new container of sandbox {} is unknown, skipping data copy",
                sandbox_id
            );
            return Ok(());
        };
        copy_layer_data(from, &to).await
    }

    async fn restore_name(&self, retired: &str, sandbox_id: &str) {
        if let Err(e) = self.engine.rename_container(retired, sandbox_id).await {
            warn!(
                "Failed to rename container {} back to {}: {}",
                retired, sandbox_id, e
            );
        }
    }

    /// Last lines of a sandbox container's output, normalized for display
    pub async fn sandbox_logs(&self, sandbox_id: &str, timestamps: bool) -> Result<String> {
        let raw = self
            .engine
            .container_logs(sandbox_id, SANDBOX_LOG_LINES, timestamps)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RunnerError::not_found(format!("sandbox {} has no container", sandbox_id))
                } else {
                    e
                }
            })?;
        Ok(normalize_logs(&raw))
    }

    pub async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Outcome> {
        self.images.pull_image(image, credentials, None).await
    }

    pub async fn build_image(
        &self,
        request: &BuildRequest,
        log_sink: Option<UnboundedSender<String>>,
    ) -> Result<Outcome> {
        self.images.build_image(request, log_sink).await
    }

    pub async fn build_logs(&self, image: &str, follow: bool) -> Result<LogStream> {
        self.build_logs.read(image, follow).await
    }

    /// Start snapshotting a sandbox in the background.
    ///
    /// Returns once the snapshot is `Pending`; progress is visible through
    /// [`SandboxManager::sandbox_info`]. A newer request supersedes an in-flight one.
    pub fn create_snapshot(
        &self,
        sandbox_id: &str,
        image: &str,
        registry: Option<RegistryCredentials>,
    ) -> Result<Outcome> {
        validate_image_ref(image)?;
        if let Some(state @ (SandboxState::Destroyed | SandboxState::Destroying)) =
            self.cached_state(sandbox_id)
        {
            return Err(RunnerError::conflict(format!(
                "cannot snapshot sandbox {} in state {}",
                sandbox_id, state
            )));
        }

        self.cache
            .set_snapshot_state(sandbox_id, SnapshotState::Pending);

        let generation = self.snapshot_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let previous = self.snapshot_tasks.insert(
            sandbox_id.to_string(),
            SnapshotTask {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            info!("Superseding in-flight snapshot of sandbox {}", sandbox_id);
            previous.cancel.cancel();
        }

        let images = self.images.clone();
        let tasks = self.snapshot_tasks.clone();
        let sandbox_id = sandbox_id.to_string();
        let image = image.to_string();

        tokio::spawn(async move {
            // Failures are recorded in the cache by the pipeline
            let _ = images
                .create_snapshot(&sandbox_id, &image, registry.as_ref(), cancel)
                .await;
            tasks.remove_if(&sandbox_id, |_, task| task.generation == generation);
        });

        Ok(Outcome::Applied)
    }

    /// Cancel the in-flight snapshot of a sandbox, returning whether there was one
    fn cancel_snapshot(&self, sandbox_id: &str) -> bool {
        match self.snapshot_tasks.remove(sandbox_id) {
            Some((_, task)) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
