// ABOUTME: State derivation from engine-observable container facts
// ABOUTME: Pure mapping plus the log-tail heuristic that detects in-container image pulls

use crate::engine::{ContainerDetails, ContainerEngine, ContainerStatus};
use crate::error::Result;
use crate::state::SandboxState;
use tracing::warn;

/// Number of log lines scanned for pull progress
pub const LOG_TAIL_LINES: usize = 10;

/// Exit codes of a clean exit, SIGKILL and SIGTERM
const STOPPED_EXIT_CODES: [i64; 3] = [0, 137, 143];

const PULL_PROGRESS_MARKERS: [&str; 8] = [
    "Pulling from",
    "Pulling fs layer",
    "Waiting",
    "Downloading",
    "Verifying Checksum",
    "Download complete",
    "Extracting",
    "Pull complete",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub state: SandboxState,
    /// Exit code and engine error for `Error` states
    pub reason: Option<String>,
    /// Whether the engine knows a container with this id
    pub exists: bool,
}

impl DerivedState {
    fn of(state: SandboxState) -> Self {
        Self {
            state,
            reason: None,
            exists: true,
        }
    }
}

/// Whether the log tail looks like an image pull in progress
pub fn looks_like_image_pull(log_tail: &str) -> bool {
    log_tail
        .lines()
        .rev()
        .take(LOG_TAIL_LINES)
        .any(|line| PULL_PROGRESS_MARKERS.iter().any(|marker| line.contains(marker)))
}

/// Map a container inspect result to a sandbox state.
///
/// `log_tail` is only consulted for running containers; `None` there means the
/// logs could not be read and the container is treated as started.
pub fn derive_state(container: Option<&ContainerDetails>, log_tail: Option<&str>) -> DerivedState {
    let Some(container) = container else {
        return DerivedState {
            state: SandboxState::Destroyed,
            reason: None,
            exists: false,
        };
    };

    match &container.status {
        ContainerStatus::Created => DerivedState::of(SandboxState::Creating),
        ContainerStatus::Running => {
            if log_tail.is_some_and(looks_like_image_pull) {
                DerivedState::of(SandboxState::PullingImage)
            } else {
                DerivedState::of(SandboxState::Started)
            }
        }
        ContainerStatus::Paused => DerivedState::of(SandboxState::Stopped),
        ContainerStatus::Restarting => DerivedState::of(SandboxState::Starting),
        ContainerStatus::Removing => DerivedState::of(SandboxState::Destroying),
        ContainerStatus::Exited if STOPPED_EXIT_CODES.contains(&container.exit_code) => {
            DerivedState::of(SandboxState::Stopped)
        }
        ContainerStatus::Exited => DerivedState {
            state: SandboxState::Error,
            reason: Some(match &container.error {
                Some(error) => format!("exit code {}: {}", container.exit_code, error),
                None => format!("exit code {}", container.exit_code),
            }),
            exists: true,
        },
        ContainerStatus::Dead => DerivedState::of(SandboxState::Destroyed),
        ContainerStatus::Other(_) => DerivedState::of(SandboxState::Unknown),
    }
}

/// Inspect a container (and its log tail when running) and derive its state
pub async fn observe_state(engine: &dyn ContainerEngine, sandbox_id: &str) -> Result<DerivedState> {
    let container = match engine.inspect_container(sandbox_id).await {
        Ok(container) => container,
        Err(e) if e.is_not_found() => return Ok(derive_state(None, None)),
        Err(e) => return Err(e),
    };

    let log_tail = if container.is_running() {
        match engine.tail_logs(sandbox_id, LOG_TAIL_LINES).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!("Could not read logs of sandbox {}: {}", sandbox_id, e);
                None
            }
        }
    } else {
        None
    };

    Ok(derive_state(Some(&container), log_tail.as_deref()))
}
