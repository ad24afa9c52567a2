// ABOUTME: Image pipeline: pulls, Dockerfile builds from content-addressed contexts and snapshots
// ABOUTME: Builds stream output to a live sink and a per-image log file for later retrieval

use crate::build_logs::build_log_path;
use crate::cache::StateCache;
use crate::engine::{
    split_image_ref, BuildOptions, ContainerEngine, RegistryCredentials, ResourceUpdate,
};
use crate::error::{Result, RunnerError};
use crate::state::{Outcome, SandboxState, SnapshotState};
use crate::storage::ObjectStorage;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BUILD_PLATFORM: &str = "linux/amd64";

const COMMIT_ATTEMPTS: usize = 3;

/// Engine error text for commits the export/import path can still recover
const DIGEST_ERROR: &str = "failed to get digest";

const SOCKET_CLEANUP_PREFIX: &str = "socket-fix-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Target reference, `name:tag`
    pub image: String,
    pub dockerfile: String,
    pub organization_id: Option<String>,
    /// Hashes of previously uploaded context tarballs
    #[serde(default)]
    pub context_hashes: Vec<String>,
    #[serde(default)]
    pub push_to_internal_registry: bool,
    /// Credentials for base images referenced by the Dockerfile
    #[serde(skip)]
    pub registry: Option<RegistryCredentials>,
}

/// Reject references without exactly one non-empty tag
pub fn validate_image_ref(image: &str) -> Result<()> {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &image[name_start..];
    let mut parts = name.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(tag), None) if !repo.is_empty() && !tag.is_empty() => Ok(()),
        _ => Err(RunnerError::bad_request(format!(
            "image reference '{}' must be of the form name:tag",
            image
        ))),
    }
}

/// `latest` (explicit or implied) is never trusted from the local store
pub fn is_latest(image: &str) -> bool {
    matches!(split_image_ref(image).1, None | Some("latest"))
}

/// In-memory build context: the Dockerfile plus every file of each context tarball.
///
/// Unreadable tarballs or entries are skipped with a warning.
pub fn build_context_archive(dockerfile: &str, contexts: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    for (index, context) in contexts.iter().enumerate() {
        merge_context(&mut builder, context, index);
    }

    Ok(builder.into_inner()?)
}

fn merge_context(builder: &mut tar::Builder<Vec<u8>>, context: &[u8], index: usize) {
    let mut archive = tar::Archive::new(context);
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping unreadable build context #{}: {}", index, e);
            return;
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Stopped reading build context #{}: {}", index, e);
                break;
            }
        };

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let path = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(e) => {
                warn!("Skipping entry with invalid path in context #{}: {}", index, e);
                continue;
            }
        };

        let mut data = Vec::new();
        if let Err(e) = entry.read_to_end(&mut data) {
            warn!("Skipping unreadable entry {}: {}", path.display(), e);
            continue;
        }

        let mut header = entry.header().clone();
        header.set_size(data.len() as u64);
        header.set_cksum();
        if let Err(e) = builder.append_data(&mut header, &path, data.as_slice()) {
            warn!("Skipping entry {}: {}", path.display(), e);
        }
    }
}

/// First socket file under `dir`, without following symlinks
pub fn find_socket(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_socket() {
                return Ok(Some(entry.path()));
            }
            if file_type.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(None)
}

/// Whether any of the layer directories holds a socket; unreadable layers are skipped
async fn layers_contain_sockets(layer_dirs: Vec<String>) -> bool {
    let scan = tokio::task::spawn_blocking(move || {
        layer_dirs.iter().any(|dir| match find_socket(Path::new(dir)) {
            Ok(Some(socket)) => {
                debug!("Found socket file {}", socket.display());
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to scan layer {} for sockets: {}", dir, e);
                false
            }
        })
    });
    scan.await.unwrap_or(false)
}

pub struct ImagePipeline {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn StateCache>,
    storage: Option<Arc<dyn ObjectStorage>>,
    internal_registry: Option<RegistryCredentials>,
    build_log_dir: PathBuf,
}

impl ImagePipeline {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn StateCache>,
        build_log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            cache,
            storage: None,
            internal_registry: None,
            build_log_dir: build_log_dir.into(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_internal_registry(mut self, registry: RegistryCredentials) -> Self {
        self.internal_registry = Some(registry);
        self
    }

    pub fn build_log_dir(&self) -> &PathBuf {
        &self.build_log_dir
    }

    /// Pull `image` unless a pinned tag is already present locally.
    ///
    /// When `sandbox_id` is given the sandbox is marked `PullingImage` while the pull runs.
    pub async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
        sandbox_id: Option<&str>,
    ) -> Result<Outcome> {
        if !is_latest(image) && self.engine.image_exists(image).await? {
            info!("Image {} already present, skipping pull", image);
            return Ok(Outcome::Unchanged);
        }

        if let Some(id) = sandbox_id {
            self.cache.set_sandbox_state(id, SandboxState::PullingImage);
        }

        self.engine.pull_image(image, credentials).await?;
        Ok(Outcome::Applied)
    }

    fn internal_target(&self, image: &str) -> Result<(String, RegistryCredentials)> {
        let registry = self
            .internal_registry
            .clone()
            .ok_or_else(|| RunnerError::bad_request("internal registry is not configured"))?;
        let project = registry
            .project
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RunnerError::bad_request("internal registry project is required"))?;
        Ok((format!("{}/{}/{}", registry.url, project, image), registry))
    }

    async fn fetch_contexts(&self, request: &BuildRequest) -> Result<Vec<Vec<u8>>> {
        if request.context_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| RunnerError::bad_request("object storage is not configured"))?;
        let organization_id = request
            .organization_id
            .as_deref()
            .ok_or_else(|| RunnerError::bad_request("organization id is required for build contexts"))?;

        let mut contexts = Vec::with_capacity(request.context_hashes.len());
        for hash in &request.context_hashes {
            let blob = storage.get_context(organization_id, hash).await?;
            if blob.is_empty() {
                return Err(RunnerError::internal(format!("build context {} is empty", hash)));
            }
            contexts.push(blob);
        }
        Ok(contexts)
    }

    /// Build an image from a Dockerfile and stored contexts, optionally publishing it
    pub async fn build_image(
        &self,
        request: &BuildRequest,
        log_sink: Option<UnboundedSender<String>>,
    ) -> Result<Outcome> {
        validate_image_ref(&request.image)?;

        let publish = if request.push_to_internal_registry {
            Some(self.internal_target(&request.image)?)
        } else {
            None
        };
        let final_ref = publish
            .as_ref()
            .map(|(target, _)| target.clone())
            .unwrap_or_else(|| request.image.clone());

        if self.engine.image_exists(&final_ref).await? {
            info!("Image {} already exists, skipping build", final_ref);
            return Ok(Outcome::Unchanged);
        }

        let contexts = self.fetch_contexts(request).await?;
        let archive = build_context_archive(&request.dockerfile, &contexts)?;

        let log_path = build_log_path(&self.build_log_dir, &request.image);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log_file = tokio::fs::File::create(&log_path).await?;

        let options = BuildOptions {
            tag: request.image.clone(),
            dockerfile: "Dockerfile".to_string(),
            platform: BUILD_PLATFORM.to_string(),
        };

        let mut output = self
            .engine
            .build_image(&options, archive, request.registry.as_ref())
            .await?;

        while let Some(line) = output.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log_file
                        .write_all(format!("ERROR: {}\n", e).as_bytes())
                        .await?;
                    log_file.flush().await?;
                    return Err(e);
                }
            };
            log_file.write_all(line.as_bytes()).await?;
            log_file.write_all(b"\n").await?;
            if let Some(sink) = &log_sink {
                let _ = sink.send(line);
            }
        }
        log_file.flush().await?;

        info!("Image {} built", request.image);

        if let Some((target, registry)) = publish {
            self.engine.tag_image(&request.image, &target).await?;
            self.engine.push_image(&target, Some(&registry)).await?;
            info!("Image {} published as {}", request.image, target);
        }

        Ok(Outcome::Applied)
    }

    /// Commit a sandbox container to `image` and push it.
    ///
    /// Progress is recorded as the sandbox's snapshot state. A cancelled snapshot
    /// leaves the state to whoever cancelled it.
    pub async fn create_snapshot(
        &self,
        sandbox_id: &str,
        image: &str,
        registry: Option<&RegistryCredentials>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = tokio::select! {
            result = self.run_snapshot(sandbox_id, image, registry) => result,
            _ = cancel.cancelled() => {
                info!("Snapshot of sandbox {} cancelled", sandbox_id);
                return Err(RunnerError::conflict(format!(
                    "snapshot of sandbox {} was cancelled",
                    sandbox_id
                )));
            }
        };

        match &result {
            Ok(()) => {
                self.cache.set_error_reason(sandbox_id, None);
                self.cache.set_snapshot_state(sandbox_id, SnapshotState::Completed);
                self.remove_source_tag(image).await;
            }
            Err(e) => {
                warn!("Snapshot of sandbox {} failed: {}", sandbox_id, e);
                self.cache.set_error_reason(sandbox_id, Some(e.to_string()));
                self.cache.set_snapshot_state(sandbox_id, SnapshotState::Error);
            }
        }

        result
    }

    async fn run_snapshot(
        &self,
        sandbox_id: &str,
        image: &str,
        registry: Option<&RegistryCredentials>,
    ) -> Result<()> {
        validate_image_ref(image)?;
        self.cache
            .set_snapshot_state(sandbox_id, SnapshotState::InProgress);

        self.commit(sandbox_id, image).await?;
        info!("Committed sandbox {} as {}", sandbox_id, image);

        let credentials = registry.or(self.internal_registry.as_ref());
        self.engine.push_image(image, credentials).await?;
        info!("Snapshot {} of sandbox {} pushed", image, sandbox_id);
        Ok(())
    }

    /// Commit with retries. A digest failure falls back to export/import, and a
    /// committed image holding socket files is rebuilt without them.
    async fn commit(&self, sandbox_id: &str, image: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            let error = match self.engine.commit_container(sandbox_id, image).await {
                Ok(()) => return self.strip_sockets(sandbox_id, image).await,
                Err(e) if e.to_string().contains(DIGEST_ERROR) => {
                    warn!(
                        "Commit of sandbox {} hit a digest error, falling back to export/import",
                        sandbox_id
                    );
                    match self.engine.export_import_container(sandbox_id, image).await {
                        Ok(()) => return Ok(()),
                        Err(fallback) => {
                            warn!("Export/import of sandbox {} failed: {}", sandbox_id, fallback);
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            if attempt >= COMMIT_ATTEMPTS {
                return Err(error);
            }
            warn!(
                "Commit of sandbox {} failed (attempt {}/{}): {}",
                sandbox_id, attempt, COMMIT_ATTEMPTS, error
            );
            attempt += 1;
        }
    }

    async fn strip_sockets(&self, sandbox_id: &str, image: &str) -> Result<()> {
        let layer_dirs = match self.engine.inspect_image(image).await {
            Ok(details) => details.layer_dirs,
            Err(e) => {
                warn!("Could not inspect {} for socket files: {}", image, e);
                return Ok(());
            }
        };
        if !layers_contain_sockets(layer_dirs).await {
            return Ok(());
        }

        warn!(
            "Image {} contains socket files, rebuilding it through export/import",
            image
        );
        let helper = format!("{}{}", SOCKET_CLEANUP_PREFIX, sandbox_id);
        let result = self.rebuild_without_sockets(sandbox_id, image, &helper).await;
        if let Err(e) = self.engine.remove_container(&helper, true).await {
            if !e.is_not_found() {
                warn!("Failed to remove container {}: {}", helper, e);
            }
        }
        result
    }

    async fn rebuild_without_sockets(
        &self,
        sandbox_id: &str,
        image: &str,
        helper: &str,
    ) -> Result<()> {
        self.engine
            .clone_container(sandbox_id, helper, Some(image), &ResourceUpdate::default())
            .await?;
        self.engine.start_container(helper).await?;

        let command = ["find", "/", "-type", "s", "-delete"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        let cleanup = self.engine.exec(helper, command).await?;
        if cleanup.exit_code != 0 {
            // find reports unreadable pseudo filesystems; the sockets it could reach are gone
            debug!(
                "Socket cleanup in {} exited with {}: {}",
                helper,
                cleanup.exit_code,
                String::from_utf8_lossy(&cleanup.stderr).trim()
            );
        }

        if let Err(e) = self.engine.remove_image(image, true).await {
            warn!("Failed to remove image {} with socket files: {}", image, e);
        }
        self.engine.export_import_container(helper, image).await?;
        info!("Rebuilt {} without socket files", image);
        Ok(())
    }

    async fn remove_source_tag(&self, image: &str) {
        if let Err(e) = self.engine.remove_image(image, true).await {
            warn!("Failed to remove local snapshot image {}: {}", image, e);
        }
    }
}
