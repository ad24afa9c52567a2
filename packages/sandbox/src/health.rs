// ABOUTME: Runner health check combining engine reachability and metrics freshness
// ABOUTME: Reports Healthy, Degraded (stale or missing metrics) or Unhealthy (engine down)

use crate::cache::StateCache;
use crate::engine::ContainerEngine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub engine_reachable: bool,
    pub engine_response_time_ms: Option<u64>,
    /// Seconds since the last metrics sample, if there ever was one
    pub metrics_age_secs: Option<i64>,
}

/// Health checker for the runner node
pub struct HealthChecker {
    engine: Arc<dyn ContainerEngine>,
    cache: Arc<dyn StateCache>,
    max_metrics_age: Duration,
}

impl HealthChecker {
    /// Metrics older than `max_metrics_age` degrade the node
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<dyn StateCache>,
        max_metrics_age: Duration,
    ) -> Self {
        Self {
            engine,
            cache,
            max_metrics_age,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let now = Utc::now();

        let started = Instant::now();
        let ping = self.engine.ping().await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let metrics_age_secs = self
            .cache
            .system_metrics()
            .and_then(|usage| usage.last_updated)
            .map(|updated| (now - updated).num_seconds());

        let (status, message, engine_reachable) = match ping {
            Err(e) => {
                warn!("Container engine health check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("container engine unreachable: {}", e)),
                    false,
                )
            }
            Ok(()) => match metrics_age_secs {
                None => (
                    HealthStatus::Degraded,
                    Some("no metrics sampled yet".to_string()),
                    true,
                ),
                Some(age) if age > self.max_metrics_age.as_secs() as i64 => (
                    HealthStatus::Degraded,
                    Some(format!("metrics are {}s old", age)),
                    true,
                ),
                Some(_) => (HealthStatus::Healthy, None, true),
            },
        };

        HealthReport {
            timestamp: now,
            status,
            message,
            engine_reachable,
            engine_response_time_ms: engine_reachable.then_some(response_time_ms),
            metrics_age_secs,
        }
    }
}
