// ABOUTME: Periodic one-way reconciliation of sandbox states from this node to the control plane
// ABOUTME: Only sandboxes the control plane believes are started take part in the comparison

use crate::control_plane::ControlPlane;
use crate::derive::observe_state;
use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::scheduler::spawn_periodic;
use crate::state::SandboxState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Local sandboxes whose state was derived
    pub checked: usize,
    /// Sandboxes whose remote state was corrected
    pub corrected: Vec<String>,
    /// Ids the control plane reports as started that do not exist here
    pub remote_only: Vec<String>,
}

pub struct StateSyncReconciler {
    engine: Arc<dyn ContainerEngine>,
    control_plane: Arc<dyn ControlPlane>,
}

impl StateSyncReconciler {
    pub fn new(engine: Arc<dyn ContainerEngine>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            engine,
            control_plane,
        }
    }

    pub async fn run(&self) -> Result<SyncReport> {
        let local = self.local_states().await?;
        let remote = self.control_plane.started_sandboxes().await?;

        let mut report = SyncReport {
            checked: local.len(),
            ..Default::default()
        };

        for (sandbox_id, remote_state) in &remote {
            let Some(local_state) = local.get(sandbox_id) else {
                warn!(
                    "Sandbox {} is {} in the control plane but not present on this runner",
                    sandbox_id, remote_state
                );
                report.remote_only.push(sandbox_id.clone());
                continue;
            };

            let desired = local_state.to_remote();
            if desired == remote_state.as_str() {
                continue;
            }

            match self
                .control_plane
                .update_sandbox_state(sandbox_id, desired)
                .await
            {
                Ok(()) => {
                    info!(
                        "Corrected sandbox {} state: {} -> {}",
                        sandbox_id, remote_state, desired
                    );
                    report.corrected.push(sandbox_id.clone());
                }
                Err(e) => warn!("Failed to update state of sandbox {}: {}", sandbox_id, e),
            }
        }

        report.corrected.sort();
        report.remote_only.sort();
        Ok(report)
    }

    async fn local_states(&self) -> Result<HashMap<String, SandboxState>> {
        let mut states = HashMap::new();
        for container in self.engine.list_containers().await? {
            match observe_state(self.engine.as_ref(), &container.name).await {
                Ok(derived) => {
                    states.insert(container.name, derived.state);
                }
                Err(e) => debug!("Skipping sandbox {} in sync: {}", container.name, e),
            }
        }
        Ok(states)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_periodic("state sync", interval, cancel, move || {
            let reconciler = self.clone();
            async move {
                match reconciler.run().await {
                    Ok(report) if !report.corrected.is_empty() => info!(
                        "State sync corrected {} of {} sandboxes",
                        report.corrected.len(),
                        report.checked
                    ),
                    Ok(_) => debug!("State sync found no drift"),
                    Err(e) => error!("State sync failed: {}", e),
                }
            }
        })
    }
}
