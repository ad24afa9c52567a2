// ABOUTME: Resize requests for existing sandboxes and the layer copy behind disk resizes
// ABOUTME: CPU and memory change live; a new disk quota needs a recreated, stopped container

use crate::engine::{ResourceUpdate, BYTES_PER_GIB, CPU_PERIOD};
use crate::error::{Result, RunnerError};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const LAYER_COPY_TIMEOUT: Duration = Duration::from_secs(300);

/// New limits for a sandbox; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResizeRequest {
    pub cpus: Option<f64>,
    pub memory_gb: Option<i64>,
    pub disk_gb: Option<i64>,
}

impl ResizeRequest {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.memory_gb.is_none() && self.disk_gb.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpus.is_some_and(|cpus| !cpus.is_finite() || cpus <= 0.0) {
            return Err(RunnerError::bad_request("cpus must be positive"));
        }
        if self.memory_gb.is_some_and(|gb| gb <= 0) {
            return Err(RunnerError::bad_request("memory must be at least 1 GB"));
        }
        if self.disk_gb.is_some_and(|gb| gb <= 0) {
            return Err(RunnerError::bad_request("disk must be at least 1 GB"));
        }
        Ok(())
    }

    pub fn to_update(&self) -> ResourceUpdate {
        ResourceUpdate {
            cpu_quota: self.cpus.map(|cpus| (cpus * CPU_PERIOD as f64) as i64),
            memory_bytes: self.memory_gb.map(|gb| gb * BYTES_PER_GIB),
            storage_size_gb: self.disk_gb,
        }
    }
}

/// Copy a container's writable layer into another container's layer on the host
pub async fn copy_layer_data(from: &str, to: &str) -> Result<()> {
    debug!("Copying container layer data from {} to {}", from, to);

    let copy = Command::new("rsync")
        .arg("-a")
        .arg(format!("{}/", from.trim_end_matches('/')))
        .arg(format!("{}/", to.trim_end_matches('/')))
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(LAYER_COPY_TIMEOUT, copy)
        .await
        .map_err(|_| {
            RunnerError::Timeout(format!(
                "copying layer data from {} took longer than {:?}",
                from, LAYER_COPY_TIMEOUT
            ))
        })??;

    if !output.status.success() {
        return Err(RunnerError::internal(format!(
            "failed to copy layer data from {} to {}: {}",
            from,
            to,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
