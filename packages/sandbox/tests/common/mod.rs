// ABOUTME: In-memory fakes shared by the integration tests
// ABOUTME: Engine with a call log, control plane, mount helper, object storage and host stats

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use runner_config::SandboxSettings;
use runner_sandbox::{
    BuildOptions, ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus,
    ContainerSummary, ControlPlane, ExecResult, HostStats, ImageDetails, ImagePipeline,
    ImageSummary, InMemoryStateCache, LogStream, MountHelper, ObjectStorage, RegistryCredentials,
    ResourceAllocation, ResourceUpdate, Result, RunnerError, SandboxManager, StateCache,
    VolumeMountManager,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

fn image_id(tag: &str) -> String {
    let mut hasher = DefaultHasher::new();
    tag.hash(&mut hasher);
    format!("sha256:{:016x}", hasher.finish())
}

struct FakeImage {
    summary: ImageSummary,
    architecture: String,
    layer_dirs: Vec<String>,
}

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, ContainerDetails>,
    images: HashMap<String, FakeImage>,
    logs: HashMap<String, String>,
    specs: Vec<ContainerSpec>,
    pull_architecture: Option<String>,
    backing_filesystem: Option<String>,
    commit_failures: usize,
    commit_error: Option<String>,
    commit_layer_dirs: Vec<String>,
    push_fails: bool,
    frozen: HashSet<String>,
    assigned_ip: Option<String>,
    engine_down: bool,
    failing_removals: HashSet<String>,
    build_output: Vec<String>,
    pull_delay: Duration,
}

/// Container engine keeping containers and images in memory and logging every call
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Every call in order, as `method:argument`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls to `method`
    pub fn count(&self, method: &str) -> usize {
        let prefix = format!("{}:", method);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub fn add_container(&self, name: &str, status: ContainerStatus, exit_code: i64) {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            ContainerDetails {
                id: name.to_string(),
                name: name.to_string(),
                image: "app:1.0".to_string(),
                status,
                exit_code,
                error: None,
                ip_address: None,
                resources: ResourceAllocation::default(),
                upper_dir: None,
            },
        );
    }

    pub fn add_container_with_resources(
        &self,
        name: &str,
        status: ContainerStatus,
        resources: ResourceAllocation,
    ) {
        self.add_container(name, status, 0);
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(name) {
            container.resources = resources;
        }
    }

    pub fn add_image(&self, tag: &str, architecture: &str, created_at: DateTime<Utc>) {
        self.state.lock().unwrap().images.insert(
            tag.to_string(),
            FakeImage {
                summary: ImageSummary {
                    id: image_id(tag),
                    repo_tags: vec![tag.to_string()],
                    repo_digests: Vec::new(),
                    created_at,
                },
                architecture: architecture.to_string(),
                layer_dirs: Vec::new(),
            },
        );
    }

    pub fn container_status(&self, name: &str) -> Option<ContainerStatus> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.status.clone())
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(tag)
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(name.to_string(), logs.to_string());
    }

    /// Architecture reported for images pulled from now on
    pub fn set_pull_architecture(&self, architecture: &str) {
        self.state.lock().unwrap().pull_architecture = Some(architecture.to_string());
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.state.lock().unwrap().pull_delay = delay;
    }

    pub fn set_backing_filesystem(&self, fs: &str) {
        self.state.lock().unwrap().backing_filesystem = Some(fs.to_string());
    }

    pub fn fail_commits(&self, times: usize) {
        self.state.lock().unwrap().commit_failures = times;
    }

    /// Fail the next `times` commits with `message`
    pub fn fail_commits_with(&self, times: usize, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.commit_failures = times;
        state.commit_error = Some(message.to_string());
    }

    /// Layer directories reported for images produced by commits
    pub fn set_commit_layer_dirs(&self, dirs: &[&Path]) {
        self.state.lock().unwrap().commit_layer_dirs =
            dirs.iter().map(|d| d.display().to_string()).collect();
    }

    /// Start and stop calls succeed but leave the container's status untouched
    pub fn freeze(&self, name: &str) {
        self.state.lock().unwrap().frozen.insert(name.to_string());
    }

    /// IP address given to containers created from now on
    pub fn assign_ip(&self, ip: &str) {
        self.state.lock().unwrap().assigned_ip = Some(ip.to_string());
    }

    pub fn resources_of(&self, name: &str) -> Option<ResourceAllocation> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.resources.clone())
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn fail_pushes(&self) {
        self.state.lock().unwrap().push_fails = true;
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().engine_down = down;
    }

    pub fn fail_removal_of(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_removals
            .insert(name.to_string());
    }

    pub fn set_build_output(&self, lines: &[&str]) {
        self.state.lock().unwrap().build_output = lines.iter().map(|l| l.to_string()).collect();
    }

    fn insert_image(&self, tag: &str, architecture: &str) {
        self.add_image(tag, architecture, Utc::now());
    }

    fn missing(what: &str) -> RunnerError {
        RunnerError::not_found(format!("no such object: {}", what))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<()> {
        self.record("ping:");
        if self.state.lock().unwrap().engine_down {
            return Err(RunnerError::Network("engine socket closed".to_string()));
        }
        Ok(())
    }

    async fn backing_filesystem(&self) -> Result<Option<String>> {
        self.record("backing_filesystem:");
        Ok(self.state.lock().unwrap().backing_filesystem.clone())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create_container:{}", spec.name));
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(RunnerError::conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let ip_address = state.assigned_ip.clone();
        state.containers.insert(
            spec.name.clone(),
            ContainerDetails {
                id: spec.name.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: ContainerStatus::Created,
                exit_code: 0,
                error: None,
                ip_address,
                resources: ResourceAllocation {
                    cpu_quota: spec.cpu_quota,
                    memory_bytes: spec.memory_bytes,
                    disk_gb: spec.storage_size_gb.unwrap_or(0),
                },
                upper_dir: None,
            },
        );
        state.specs.push(spec.clone());
        Ok(spec.name.clone())
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record(format!("start_container:{}", container_id));
        let mut state = self.state.lock().unwrap();
        if state.frozen.contains(container_id) {
            return Ok(());
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing(container_id))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: i64) -> Result<()> {
        self.record(format!("stop_container:{}", container_id));
        let mut state = self.state.lock().unwrap();
        if state.frozen.contains(container_id) {
            return Ok(());
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing(container_id))?;
        container.status = ContainerStatus::Exited;
        container.exit_code = 137;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.record(format!("remove_container:{}", container_id));
        let mut state = self.state.lock().unwrap();
        if state.failing_removals.contains(container_id) {
            return Err(RunnerError::internal("removal in progress"));
        }
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(container_id))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        self.record(format!("inspect_container:{}", container_id));
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Self::missing(container_id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.record("list_containers:");
        let mut containers: Vec<ContainerSummary> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status.clone(),
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecResult> {
        self.record(format!("exec:{} {}", container_id, command.join(" ")));
        Ok(ExecResult::default())
    }

    async fn tail_logs(&self, container_id: &str, _lines: usize) -> Result<String> {
        self.record(format!("tail_logs:{}", container_id));
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(container_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn container_logs(
        &self,
        container_id: &str,
        _lines: usize,
        _timestamps: bool,
    ) -> Result<String> {
        self.record(format!("container_logs:{}", container_id));
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(Self::missing(container_id));
        }
        Ok(state.logs.get(container_id).cloned().unwrap_or_default())
    }

    async fn update_resources(&self, container_id: &str, update: &ResourceUpdate) -> Result<()> {
        self.record(format!("update_resources:{}", container_id));
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing(container_id))?;
        if let Some(quota) = update.cpu_quota {
            container.resources.cpu_quota = quota;
        }
        if let Some(memory) = update.memory_bytes {
            container.resources.memory_bytes = memory;
        }
        Ok(())
    }

    async fn rename_container(&self, container_id: &str, new_name: &str) -> Result<()> {
        self.record(format!("rename_container:{} {}", container_id, new_name));
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(new_name) {
            return Err(RunnerError::conflict(format!("name {} already in use", new_name)));
        }
        let mut container = state
            .containers
            .remove(container_id)
            .ok_or_else(|| Self::missing(container_id))?;
        container.id = new_name.to_string();
        container.name = new_name.to_string();
        state.containers.insert(new_name.to_string(), container);
        Ok(())
    }

    async fn clone_container(
        &self,
        source: &str,
        name: &str,
        image: Option<&str>,
        update: &ResourceUpdate,
    ) -> Result<String> {
        self.record(format!("clone_container:{} {}", source, name));
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(name) {
            return Err(RunnerError::conflict(format!("name {} already in use", name)));
        }
        let mut container = state
            .containers
            .get(source)
            .cloned()
            .ok_or_else(|| Self::missing(source))?;
        container.id = name.to_string();
        container.name = name.to_string();
        container.status = ContainerStatus::Created;
        container.exit_code = 0;
        if let Some(image) = image {
            container.image = image.to_string();
        }
        if let Some(quota) = update.cpu_quota {
            container.resources.cpu_quota = quota;
        }
        if let Some(memory) = update.memory_bytes {
            container.resources.memory_bytes = memory;
        }
        if let Some(gb) = update.storage_size_gb {
            container.resources.disk_gb = gb;
        }
        state.containers.insert(name.to_string(), container);
        Ok(name.to_string())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(format!("image_exists:{}", image));
        Ok(self.has_image(image))
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails> {
        self.record(format!("inspect_image:{}", image));
        self.state
            .lock()
            .unwrap()
            .images
            .get(image)
            .map(|i| ImageDetails {
                id: i.summary.id.clone(),
                architecture: i.architecture.clone(),
                layer_dirs: i.layer_dirs.clone(),
            })
            .ok_or_else(|| Self::missing(image))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        self.record("list_images:");
        let mut images: Vec<ImageSummary> = self
            .state
            .lock()
            .unwrap()
            .images
            .values()
            .map(|i| i.summary.clone())
            .collect();
        images.sort_by(|a, b| a.repo_tags.cmp(&b.repo_tags));
        Ok(images)
    }

    async fn pull_image(
        &self,
        image: &str,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        self.record(format!("pull_image:{}", image));
        let (delay, architecture) = {
            let state = self.state.lock().unwrap();
            (
                state.pull_delay,
                state
                    .pull_architecture
                    .clone()
                    .unwrap_or_else(|| "amd64".to_string()),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.insert_image(image, &architecture);
        Ok(())
    }

    async fn push_image(
        &self,
        image: &str,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        self.record(format!("push_image:{}", image));
        if self.state.lock().unwrap().push_fails {
            return Err(RunnerError::Unauthorized("registry denied push".to_string()));
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.record(format!("tag_image:{} {}", source, target));
        if !self.has_image(source) {
            return Err(Self::missing(source));
        }
        self.insert_image(target, "amd64");
        Ok(())
    }

    async fn remove_image(&self, image: &str, _force: bool) -> Result<()> {
        self.record(format!("remove_image:{}", image));
        let mut state = self.state.lock().unwrap();
        if state.images.remove(image).is_some() {
            return Ok(());
        }
        let key = state
            .images
            .iter()
            .find(|(_, i)| {
                i.summary.id == image || i.summary.repo_digests.iter().any(|d| d == image)
            })
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                state.images.remove(&key);
                Ok(())
            }
            None => Err(Self::missing(image)),
        }
    }

    async fn build_image(
        &self,
        options: &BuildOptions,
        _context: Vec<u8>,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<LogStream> {
        self.record(format!("build_image:{}", options.tag));
        let output = self.state.lock().unwrap().build_output.clone();
        self.insert_image(&options.tag, "amd64");
        Ok(Box::pin(stream::iter(output.into_iter().map(Ok))))
    }

    async fn commit_container(&self, container_id: &str, image: &str) -> Result<()> {
        self.record(format!("commit_container:{}", container_id));
        let mut state = self.state.lock().unwrap();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            let message = state
                .commit_error
                .clone()
                .unwrap_or_else(|| "container is locked".to_string());
            return Err(RunnerError::internal(message));
        }
        if !state.containers.contains_key(container_id) {
            return Err(Self::missing(container_id));
        }
        let layer_dirs = state.commit_layer_dirs.clone();
        drop(state);
        self.insert_image(image, "amd64");
        if let Some(committed) = self.state.lock().unwrap().images.get_mut(image) {
            committed.layer_dirs = layer_dirs;
        }
        Ok(())
    }

    async fn export_import_container(&self, container_id: &str, image: &str) -> Result<()> {
        self.record(format!("export_import_container:{}", container_id));
        if !self.state.lock().unwrap().containers.contains_key(container_id) {
            return Err(Self::missing(container_id));
        }
        self.insert_image(image, "amd64");
        Ok(())
    }
}

/// Control plane answering from in-memory sets
#[derive(Default)]
pub struct FakeControlPlane {
    pub sandboxes: Mutex<HashSet<String>>,
    pub snapshots: Mutex<HashSet<String>>,
    pub started: Mutex<HashMap<String, String>>,
    pub updates: Mutex<Vec<(String, String)>>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn know_sandbox(&self, id: &str) {
        self.sandboxes.lock().unwrap().insert(id.to_string());
    }

    pub fn know_snapshot(&self, name: &str) {
        self.snapshots.lock().unwrap().insert(name.to_string());
    }

    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn sandbox_exists(&self, sandbox_id: &str) -> Result<bool> {
        Ok(self.sandboxes.lock().unwrap().contains(sandbox_id))
    }

    async fn snapshot_exists(&self, snapshot_ref: &str) -> Result<bool> {
        Ok(self.snapshots.lock().unwrap().contains(snapshot_ref))
    }

    async fn started_sandboxes(&self) -> Result<HashMap<String, String>> {
        Ok(self.started.lock().unwrap().clone())
    }

    async fn update_sandbox_state(&self, sandbox_id: &str, state: &str) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), state.to_string()));
        Ok(())
    }
}

/// Mount helper counting mounts; an optional barrier holds every mount until
/// the expected number of mounts are in progress at once
#[derive(Default)]
pub struct FakeMountHelper {
    mounted: Mutex<HashSet<PathBuf>>,
    mounts: AtomicUsize,
    delay: Duration,
    barrier: Option<Arc<Barrier>>,
}

impl FakeMountHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MountHelper for FakeMountHelper {
    async fn is_mounted(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(path))
    }

    async fn mount(&self, _bucket: &str, path: &Path) -> Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.mounted.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }
}

/// Object storage backed by a map of `(organization, hash)` to blob
#[derive(Default)]
pub struct FakeObjectStorage {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FakeObjectStorage {
    pub fn insert(&self, organization_id: &str, hash: &str, blob: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap()
            .insert((organization_id.to_string(), hash.to_string()), blob);
    }
}

#[async_trait]
impl ObjectStorage for FakeObjectStorage {
    async fn get_context(&self, organization_id: &str, hash: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(organization_id.to_string(), hash.to_string()))
            .cloned()
            .ok_or_else(|| RunnerError::not_found(format!("context {}", hash)))
    }
}

/// Host stats whose samples are set per field; `None` makes that sample fail
#[derive(Default)]
pub struct FakeHostStats {
    pub cpu: Mutex<Option<f64>>,
    pub ram: Mutex<Option<f64>>,
    pub disk: Mutex<Option<f64>>,
}

impl FakeHostStats {
    pub fn set(&self, cpu: Option<f64>, ram: Option<f64>, disk: Option<f64>) {
        *self.cpu.lock().unwrap() = cpu;
        *self.ram.lock().unwrap() = ram;
        *self.disk.lock().unwrap() = disk;
    }

    fn sample(value: &Mutex<Option<f64>>, name: &str) -> Result<f64> {
        value
            .lock()
            .unwrap()
            .ok_or_else(|| RunnerError::internal(format!("{} sample failed", name)))
    }
}

#[async_trait]
impl HostStats for FakeHostStats {
    async fn cpu_usage(&self) -> Result<f64> {
        Self::sample(&self.cpu, "cpu")
    }

    async fn ram_usage(&self) -> Result<f64> {
        Self::sample(&self.ram, "ram")
    }

    async fn disk_usage(&self) -> Result<f64> {
        Self::sample(&self.disk, "disk")
    }
}

pub fn test_cache() -> Arc<InMemoryStateCache> {
    Arc::new(InMemoryStateCache::new(
        Duration::from_secs(600),
        Duration::from_secs(600),
    ))
}

/// Lifecycle settings with short polling so tests finish quickly
pub fn fast_settings() -> SandboxSettings {
    SandboxSettings {
        development: true,
        start_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(2),
        create_wait_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        ..SandboxSettings::default()
    }
}

/// A manager wired to fakes, with volumes mounted under `root`
pub fn test_manager(
    engine: Arc<FakeEngine>,
    cache: Arc<InMemoryStateCache>,
    root: &Path,
) -> SandboxManager {
    test_manager_with(engine, cache, root, fast_settings())
}

pub fn test_manager_with(
    engine: Arc<FakeEngine>,
    cache: Arc<InMemoryStateCache>,
    root: &Path,
    settings: SandboxSettings,
) -> SandboxManager {
    let state_cache: Arc<dyn StateCache> = cache;
    let volumes = Arc::new(VolumeMountManager::new(
        Arc::new(FakeMountHelper::new()),
        root.join("volumes"),
    ));
    let images = Arc::new(ImagePipeline::new(
        engine.clone(),
        state_cache.clone(),
        root.join("builds"),
    ));
    SandboxManager::new(engine, state_cache, volumes, images, settings)
}
