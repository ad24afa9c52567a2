// ABOUTME: Client for the remote control plane used by the reconciliation loops
// ABOUTME: Answers orphan queries for this node's domain and accepts state corrections

use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Whether the control plane has a record of this sandbox that does not
    /// belong to a different node. `Ok(false)` only on a definite absence.
    async fn sandbox_exists(&self, sandbox_id: &str) -> Result<bool>;

    /// Whether a snapshot ref is recorded for this node's domain
    async fn snapshot_exists(&self, snapshot_ref: &str) -> Result<bool>;

    /// Sandboxes on this node the control plane believes are started, id to remote state
    async fn started_sandboxes(&self) -> Result<HashMap<String, String>>;

    async fn update_sandbox_state(&self, sandbox_id: &str, state: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RunnerRecord {
    domain: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRunnerRecord {
    runner_domain: String,
}

#[derive(Debug, Deserialize)]
struct SandboxRecord {
    id: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct StateUpdate<'a> {
    state: &'a str,
}

/// HTTP implementation authenticated with a bearer token
#[derive(Clone)]
pub struct HttpControlPlane {
    http_client: Client,
    base_url: String,
    token: String,
    domain: String,
}

impl HttpControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RunnerError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            domain: domain.into(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        Ok(self.authorized(request).send().await?)
    }

    async fn error_for(response: Response) -> RunnerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        RunnerError::from_status(
            status.as_u16(),
            format!("control plane returned {}: {}", status, body.trim()),
        )
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn sandbox_exists(&self, sandbox_id: &str) -> Result<bool> {
        let url = format!("{}/runners/by-sandbox/{}", self.base_url, sandbox_id);
        let response = self.send(self.http_client.get(&url)).await?;

        match response.status() {
            StatusCode::OK => {
                let record: RunnerRecord = response.json().await?;
                if record.domain != self.domain {
                    warn!(
                        "Sandbox {} is recorded on runner {}, not {}",
                        sandbox_id, record.domain, self.domain
                    );
                }
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(response).await),
        }
    }

    async fn snapshot_exists(&self, snapshot_ref: &str) -> Result<bool> {
        let url = format!("{}/runners/by-snapshot-ref", self.base_url);
        let request = self.http_client.get(&url).query(&[("ref", snapshot_ref)]);
        let response = self.send(request).await?;

        match response.status() {
            StatusCode::OK => {
                let records: Vec<SnapshotRunnerRecord> = response.json().await?;
                Ok(records.iter().any(|r| r.runner_domain == self.domain))
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(response).await),
        }
    }

    async fn started_sandboxes(&self) -> Result<HashMap<String, String>> {
        let url = format!("{}/sandboxes", self.base_url);
        let request = self
            .http_client
            .get(&url)
            .query(&[("runnerDomain", self.domain.as_str()), ("state", "started")]);
        let response = self.send(request).await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let records: Vec<SandboxRecord> = response.json().await?;
        Ok(records.into_iter().map(|r| (r.id, r.state)).collect())
    }

    async fn update_sandbox_state(&self, sandbox_id: &str, state: &str) -> Result<()> {
        let url = format!("{}/sandboxes/{}/state", self.base_url, sandbox_id);
        let request = self.http_client.put(&url).json(&StateUpdate { state });
        let response = self.send(request).await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        debug!("Pushed state {} for sandbox {}", state, sandbox_id);
        Ok(())
    }
}
