//! Snapshot persistence.
//!
//! Each run that finds reservations writes its aggregated state as `{prefix}{unix_seconds}.json`.
//! The default endpoint is the Cloud Storage XML API, which speaks the S3 protocol with HMAC keys.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Region, RequestChecksumCalculation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::config::StorageConfig;
use crate::errors::{Error, Result};
use crate::state::PipelineState;

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Stores `state` and returns the object key it was written to.
    async fn store(&self, state: &PipelineState) -> Result<String>;
}

pub fn object_key(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}{}.json", at.timestamp())
}

pub struct S3SnapshotSink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3SnapshotSink {
    /// Builds a sink for `config`, or `None` when no bucket is configured.
    pub async fn from_config(config: &StorageConfig) -> Option<Self> {
        let bucket = config.bucket.clone().filter(|bucket| !bucket.is_empty())?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint_url);
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key_id, secret, None, None, "slotwatch-config"));
        }
        let shared = loader.load().await;

        // Cloud Storage rejects aws-chunked uploads with trailing checksums
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();

        Some(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket,
            prefix: config.prefix.clone(),
        })
    }
}

#[async_trait]
impl SnapshotSink for S3SnapshotSink {
    #[instrument(skip_all, fields(bucket = %self.bucket))]
    async fn store(&self, state: &PipelineState) -> Result<String> {
        let key = object_key(&self.prefix, Utc::now());
        let body = serde_json::to_vec(state).map_err(|e| Error::Other(e.into()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Storage {
                key: key.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        info!(key = %key, "stored state snapshot");
        Ok(key)
    }
}
