// ABOUTME: Sandbox and snapshot state enums plus the control-plane vocabulary mapping
// ABOUTME: Shared by the orchestrator, the state cache and the reconciliation loops

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Unknown,
    Creating,
    PullingImage,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Error,
    Restoring,
    PullingSnapshot,
    Resizing,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Unknown => "unknown",
            SandboxState::Creating => "creating",
            SandboxState::PullingImage => "pulling_image",
            SandboxState::Starting => "starting",
            SandboxState::Started => "started",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
            SandboxState::Destroying => "destroying",
            SandboxState::Destroyed => "destroyed",
            SandboxState::Error => "error",
            SandboxState::Restoring => "restoring",
            SandboxState::PullingSnapshot => "pulling_snapshot",
            SandboxState::Resizing => "resizing",
        }
    }

    /// Name the control plane uses for this state
    pub fn to_remote(&self) -> &'static str {
        match self {
            SandboxState::PullingImage => SandboxState::PullingSnapshot.as_str(),
            other => other.as_str(),
        }
    }

    /// Forward lifecycle operations cannot leave these states without a full re-create
    pub fn is_absorbing(&self) -> bool {
        matches!(self, SandboxState::Destroyed | SandboxState::Error)
    }

    /// States in which a create call is still making progress
    pub fn is_create_in_flight(&self) -> bool {
        matches!(
            self,
            SandboxState::Creating | SandboxState::PullingImage | SandboxState::Starting
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    None,
    Pending,
    InProgress,
    Completed,
    Error,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::None => "none",
            SnapshotState::Pending => "pending",
            SnapshotState::InProgress => "in_progress",
            SnapshotState::Completed => "completed",
            SnapshotState::Error => "error",
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a lifecycle call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The call changed the sandbox
    Applied,
    /// The sandbox was already in the requested state
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_vocabulary() {
        assert_eq!(SandboxState::PullingImage.to_remote(), "pulling_snapshot");
        assert_eq!(SandboxState::Started.to_remote(), "started");
        assert_eq!(SandboxState::Destroyed.to_remote(), "destroyed");
    }

    #[test]
    fn test_absorbing_states() {
        assert!(SandboxState::Destroyed.is_absorbing());
        assert!(SandboxState::Error.is_absorbing());
        assert!(!SandboxState::Stopped.is_absorbing());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&SnapshotState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
