// ABOUTME: Network volume mounting with one lock per volume id
// ABOUTME: Bridges object-storage buckets onto deterministic host paths via an external helper

use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use runner_config::StorageSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    /// Target path inside the container
    pub mount_path: String,
}

/// Executable that attaches a bucket to a local directory
#[async_trait]
pub trait MountHelper: Send + Sync {
    async fn is_mounted(&self, path: &Path) -> Result<bool>;

    async fn mount(&self, bucket: &str, path: &Path) -> Result<()>;
}

/// `mount-s3` helper; credentials travel through the child environment only
pub struct S3MountHelper {
    binary: String,
    storage: StorageSettings,
}

impl S3MountHelper {
    pub fn new(storage: StorageSettings) -> Self {
        Self {
            binary: "mount-s3".to_string(),
            storage,
        }
    }

    fn command(&self, bucket: &str, path: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--allow-other",
            "--allow-delete",
            "--allow-overwrite",
            "--file-mode",
            "0666",
            "--dir-mode",
            "0777",
        ])
        .arg(bucket)
        .arg(path);

        let vars = [
            ("AWS_REGION", &self.storage.region),
            ("AWS_ENDPOINT_URL", &self.storage.endpoint_url),
            ("AWS_ACCESS_KEY_ID", &self.storage.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &self.storage.secret_access_key),
        ];
        for (name, value) in vars {
            if let Some(value) = value {
                cmd.env(name, value);
            }
        }

        cmd
    }
}

#[async_trait]
impl MountHelper for S3MountHelper {
    async fn is_mounted(&self, path: &Path) -> Result<bool> {
        let status = Command::new("mountpoint")
            .arg("-q")
            .arg(path)
            .status()
            .await?;
        Ok(status.success())
    }

    async fn mount(&self, bucket: &str, path: &Path) -> Result<()> {
        let output = self.command(bucket, path).output().await?;
        if !output.status.success() {
            return Err(RunnerError::internal(format!(
                "failed to mount volume bucket {} at {}: {}",
                bucket,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

pub struct VolumeMountManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
    helper: Arc<dyn MountHelper>,
    mount_root: PathBuf,
}

impl VolumeMountManager {
    pub fn new(helper: Arc<dyn MountHelper>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            locks: DashMap::new(),
            helper,
            mount_root: mount_root.into(),
        }
    }

    /// Deterministic host path for a volume id
    pub fn host_path(&self, volume_id: &str) -> PathBuf {
        self.mount_root.join(format!("sandbox-volume-{}", volume_id))
    }

    fn lock_for(&self, volume_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mount every volume and return their bind specs in request order
    pub async fn bind_volumes(&self, volumes: &[Volume]) -> Result<Vec<String>> {
        try_join_all(volumes.iter().map(|volume| self.bind_volume(volume))).await
    }

    async fn bind_volume(&self, volume: &Volume) -> Result<String> {
        let host_path = self.host_path(&volume.volume_id);
        let lock = self.lock_for(&volume.volume_id);
        let _guard = lock.lock().await;

        if self.helper.is_mounted(&host_path).await? {
            debug!(
                "Volume {} already mounted at {}",
                volume.volume_id,
                host_path.display()
            );
        } else {
            tokio::fs::create_dir_all(&host_path).await?;
            set_dir_mode(&host_path).await?;

            let bucket = format!("sandbox-volume-{}", volume.volume_id);
            self.helper.mount(&bucket, &host_path).await?;
            info!(
                "Mounted volume {} at {}",
                volume.volume_id,
                host_path.display()
            );
        }

        Ok(format!("{}/:{}/", host_path.display(), volume.mount_path))
    }
}

#[cfg(unix)]
async fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}
