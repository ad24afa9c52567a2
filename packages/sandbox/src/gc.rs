// ABOUTME: Garbage collection of sandboxes and snapshots unknown to the control plane
// ABOUTME: Fails closed on API uncertainty and refuses to delete past the orphan thresholds

use crate::control_plane::ControlPlane;
use crate::engine::{ContainerEngine, ImageSummary};
use crate::error::{Result, RunnerError};
use crate::scheduler::spawn_periodic;
use chrono::{DateTime, Utc};
use runner_config::GcSettings;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxCleanupInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotCleanupInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub orphaned_sandboxes: Vec<SandboxCleanupInfo>,
    pub orphaned_snapshots: Vec<SnapshotCleanupInfo>,
    pub removed_sandboxes: usize,
    pub removed_snapshots: usize,
    pub dry_run: bool,
}

/// Display name of an image: first tag, else first digest, else short id
pub fn snapshot_name(image: &ImageSummary) -> String {
    image
        .repo_tags
        .iter()
        .find(|tag| tag.as_str() != "<none>:<none>")
        .or_else(|| image.repo_digests.first())
        .cloned()
        .unwrap_or_else(|| {
            let id = image.id.trim_start_matches("sha256:");
            id.chars().take(12).collect()
        })
}

/// Excluded under any of its references, or created at or after `cutoff`
fn is_protected_snapshot(
    image: &ImageSummary,
    excluded: &HashSet<&str>,
    cutoff: DateTime<Utc>,
) -> bool {
    let pinned = excluded.contains(snapshot_name(image).as_str())
        || image
            .repo_tags
            .iter()
            .chain(&image.repo_digests)
            .any(|reference| excluded.contains(reference.as_str()));
    pinned || image.created_at >= cutoff
}

pub struct GarbageCollector {
    engine: Arc<dyn ContainerEngine>,
    control_plane: Arc<dyn ControlPlane>,
    settings: GcSettings,
}

impl GarbageCollector {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        control_plane: Arc<dyn ControlPlane>,
        settings: GcSettings,
    ) -> Self {
        Self {
            engine,
            control_plane,
            settings,
        }
    }

    /// One collection pass. Nothing is deleted unless every orphan check succeeded
    /// and both orphan counts are within their thresholds.
    pub async fn run(&self) -> Result<GcReport> {
        self.run_with(self.settings.dry_run).await
    }

    pub async fn run_with(&self, dry_run: bool) -> Result<GcReport> {
        let orphaned_sandboxes = self.find_orphaned_sandboxes().await?;
        let orphaned_snapshots = self.find_orphaned_snapshots().await?;

        if orphaned_sandboxes.len() > self.settings.sandbox_threshold {
            return Err(RunnerError::ThresholdExceeded {
                resource: "sandboxes",
                found: orphaned_sandboxes.len(),
                threshold: self.settings.sandbox_threshold,
            });
        }

        if orphaned_snapshots.len() > self.settings.snapshot_threshold {
            return Err(RunnerError::ThresholdExceeded {
                resource: "snapshots",
                found: orphaned_snapshots.len(),
                threshold: self.settings.snapshot_threshold,
            });
        }

        let mut report = GcReport {
            orphaned_sandboxes,
            orphaned_snapshots,
            dry_run,
            ..Default::default()
        };

        if dry_run {
            for sandbox in &report.orphaned_sandboxes {
                info!("[dry run] Would remove orphaned sandbox {}", sandbox.name);
            }
            for snapshot in &report.orphaned_snapshots {
                info!("[dry run] Would remove orphaned snapshot {}", snapshot.name);
            }
            return Ok(report);
        }

        for sandbox in &report.orphaned_sandboxes {
            match self.engine.remove_container(&sandbox.id, true).await {
                Ok(()) => {
                    info!("Removed orphaned sandbox {}", sandbox.name);
                    report.removed_sandboxes += 1;
                }
                Err(e) => warn!("Failed to remove orphaned sandbox {}: {}", sandbox.name, e),
            }
        }

        for snapshot in &report.orphaned_snapshots {
            match self.engine.remove_image(&snapshot.name, true).await {
                Ok(()) => {
                    info!("Removed orphaned snapshot {}", snapshot.name);
                    report.removed_snapshots += 1;
                }
                Err(e) => warn!("Failed to remove orphaned snapshot {}: {}", snapshot.name, e),
            }
        }

        Ok(report)
    }

    async fn find_orphaned_sandboxes(&self) -> Result<Vec<SandboxCleanupInfo>> {
        let excluded: HashSet<&str> = self
            .settings
            .exclude_sandboxes
            .iter()
            .map(String::as_str)
            .collect();

        let mut orphans = Vec::new();
        for container in self.engine.list_containers().await? {
            if excluded.contains(container.name.as_str()) || excluded.contains(container.id.as_str())
            {
                continue;
            }

            if !self.control_plane.sandbox_exists(&container.name).await? {
                orphans.push(SandboxCleanupInfo {
                    id: container.id,
                    name: container.name,
                });
            }
        }

        Ok(orphans)
    }

    async fn find_orphaned_snapshots(&self) -> Result<Vec<SnapshotCleanupInfo>> {
        let excluded: HashSet<&str> = self
            .settings
            .exclude_snapshots
            .iter()
            .map(String::as_str)
            .collect();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.exclude_age)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut orphans = Vec::new();
        for image in self.engine.list_images().await? {
            if is_protected_snapshot(&image, &excluded, cutoff) {
                continue;
            }
            let name = snapshot_name(&image);

            if !self.control_plane.snapshot_exists(&name).await? {
                orphans.push(SnapshotCleanupInfo {
                    id: image.id,
                    name,
                    created_at: image.created_at,
                });
            }
        }

        Ok(orphans)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.settings.interval;
        spawn_periodic("garbage collector", interval, cancel, move || {
            let collector = self.clone();
            async move {
                match collector.run().await {
                    Ok(report) => info!(
                        "Garbage collection finished: {} orphaned sandboxes, {} orphaned snapshots, {} removed",
                        report.orphaned_sandboxes.len(),
                        report.orphaned_snapshots.len(),
                        report.removed_sandboxes + report.removed_snapshots
                    ),
                    Err(e) => error!("Garbage collection aborted: {}", e),
                }
            }
        })
    }
}
