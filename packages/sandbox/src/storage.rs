// ABOUTME: Object storage access for content-addressed build context blobs
// ABOUTME: S3-compatible implementation keyed by organization and content hash

use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::Client;
use runner_config::StorageSettings;
use tracing::debug;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch the tar blob previously uploaded under `hash`
    async fn get_context(&self, organization_id: &str, hash: &str) -> Result<Vec<u8>>;
}

pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub async fn connect(settings: &StorageSettings) -> Result<Self> {
        let bucket = settings
            .bucket
            .clone()
            .ok_or_else(|| RunnerError::bad_request("object storage bucket is not configured"))?;

        let credentials = Credentials::new(
            settings.access_key_id.clone().unwrap_or_default(),
            settings.secret_access_key.clone().unwrap_or_default(),
            None,
            None,
            "sandbox-runner",
        );

        let mut config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(
                settings
                    .region
                    .clone()
                    .unwrap_or_else(|| "us-east-1".to_string()),
            ))
            .credentials_provider(credentials);

        if let Some(endpoint) = &settings.endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }

        let config = config_builder.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(settings.endpoint_url.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
        })
    }
}

/// Object key of a build context blob
pub fn context_key(organization_id: &str, hash: &str) -> String {
    format!("{}/{}/context.tar", organization_id, hash)
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn get_context(&self, organization_id: &str, hash: &str) -> Result<Vec<u8>> {
        let key = context_key(organization_id, hash);
        debug!("Fetching build context s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    RunnerError::not_found(format!("build context {}", key))
                } else {
                    RunnerError::Network(format!("failed to fetch build context {}: {}", key, e))
                }
            })?;

        let body = response.body.collect().await.map_err(|e| {
            RunnerError::Network(format!("failed to read build context {}: {}", key, e))
        })?;

        Ok(body.into_bytes().to_vec())
    }
}
