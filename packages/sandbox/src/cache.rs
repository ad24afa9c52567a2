// ABOUTME: TTL state cache mapping sandbox ids to their last known lifecycle and snapshot states
// ABOUTME: Non-authoritative accelerator; a miss means "re-derive", never "does not exist"

use crate::metrics::ResourceUsage;
use crate::state::{SandboxState, SnapshotState};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheData {
    pub sandbox_state: SandboxState,
    pub snapshot_state: SnapshotState,
    pub destruction_time: Option<DateTime<Utc>>,
    /// Last engine or pipeline error recorded for this sandbox
    pub error_reason: Option<String>,
}

impl Default for CacheData {
    fn default() -> Self {
        Self {
            sandbox_state: SandboxState::Unknown,
            snapshot_state: SnapshotState::None,
            destruction_time: None,
            error_reason: None,
        }
    }
}

/// Concurrency-safe state store. No transactional guarantees across fields.
pub trait StateCache: Send + Sync {
    fn get(&self, sandbox_id: &str) -> Option<CacheData>;

    fn set_sandbox_state(&self, sandbox_id: &str, state: SandboxState);

    fn set_snapshot_state(&self, sandbox_id: &str, state: SnapshotState);

    fn set_error_reason(&self, sandbox_id: &str, reason: Option<String>);

    /// Atomically set the sandbox state to `next` only if the live cached state equals
    /// `expected` (`None` meaning absent or expired). Returns whether the write happened.
    fn compare_and_set(
        &self,
        sandbox_id: &str,
        expected: Option<SandboxState>,
        next: SandboxState,
    ) -> bool;

    fn system_metrics(&self) -> Option<ResourceUsage>;

    fn set_system_metrics(&self, usage: ResourceUsage);
}

struct CacheEntry {
    data: CacheData,
    touched: Instant,
}

/// In-process implementation with per-entry expiry checked on access
pub struct InMemoryStateCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    metrics: RwLock<Option<(ResourceUsage, Instant)>>,
    metrics_ttl: Duration,
}

impl InMemoryStateCache {
    pub fn new(ttl: Duration, metrics_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            metrics: RwLock::new(None),
            metrics_ttl,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.touched.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update<F>(&self, sandbox_id: &str, apply: F)
    where
        F: FnOnce(&mut CacheData),
    {
        let mut entry = self
            .entries
            .entry(sandbox_id.to_string())
            .or_insert_with(|| CacheEntry {
                data: CacheData::default(),
                touched: Instant::now(),
            });

        if entry.touched.elapsed() >= self.ttl {
            entry.data = CacheData::default();
        }
        apply(&mut entry.data);
        entry.touched = Instant::now();
    }
}

impl StateCache for InMemoryStateCache {
    fn get(&self, sandbox_id: &str) -> Option<CacheData> {
        let entry = self.entries.get(sandbox_id)?;
        if entry.touched.elapsed() >= self.ttl {
            drop(entry);
            self.entries
                .remove_if(sandbox_id, |_, e| e.touched.elapsed() >= self.ttl);
            return None;
        }
        Some(entry.data.clone())
    }

    fn set_sandbox_state(&self, sandbox_id: &str, state: SandboxState) {
        self.update(sandbox_id, |data| {
            data.sandbox_state = state;
            if state == SandboxState::Destroyed {
                data.destruction_time.get_or_insert_with(Utc::now);
            } else if !matches!(state, SandboxState::Destroying) {
                data.destruction_time = None;
            }
        });
    }

    fn set_snapshot_state(&self, sandbox_id: &str, state: SnapshotState) {
        self.update(sandbox_id, |data| data.snapshot_state = state);
    }

    fn set_error_reason(&self, sandbox_id: &str, reason: Option<String>) {
        self.update(sandbox_id, |data| data.error_reason = reason);
    }

    fn compare_and_set(
        &self,
        sandbox_id: &str,
        expected: Option<SandboxState>,
        next: SandboxState,
    ) -> bool {
        match self.entries.entry(sandbox_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().touched.elapsed() < self.ttl;
                let current = live.then(|| occupied.get().data.sandbox_state);
                if current != expected {
                    return false;
                }
                let entry = occupied.get_mut();
                if !live {
                    entry.data = CacheData::default();
                }
                entry.data.sandbox_state = next;
                entry.data.destruction_time = None;
                entry.touched = Instant::now();
                true
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return false;
                }
                vacant.insert(CacheEntry {
                    data: CacheData {
                        sandbox_state: next,
                        ..CacheData::default()
                    },
                    touched: Instant::now(),
                });
                true
            }
        }
    }

    fn system_metrics(&self) -> Option<ResourceUsage> {
        let guard = self.metrics.read().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .filter(|(_, stored)| stored.elapsed() < self.metrics_ttl)
            .map(|(usage, _)| usage.clone())
    }

    fn set_system_metrics(&self, usage: ResourceUsage) {
        let mut guard = self.metrics.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some((usage, Instant::now()));
    }
}
