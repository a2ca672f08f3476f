//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `SLOTWATCH_CONFIG`
//! environment variable. A missing file is not an error; every field has a default except
//! `project`, which must be set somewhere.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SLOTWATCH_` override YAML values
//! 3. **Deployment variables** - `PORT`, `GOOGLE_CLOUD_PROJECT`, `USAGE_THRESHOLD` and
//!    `STATE_BUCKET` as set by Cloud Run style deployments
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `SLOTWATCH_CACHE__MAX_AGE=30m` sets the `cache.max_age` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Owning project of the reservations
//! GOOGLE_CLOUD_PROJECT=capacity-admin
//!
//! # Alert when a reservation is 90% utilized
//! SLOTWATCH_THRESHOLD=0.9
//!
//! # Only watch two locations
//! SLOTWATCH_LOCATIONS='["US", "EU"]'
//!
//! # Persist snapshots
//! STATE_BUCKET=slot-snapshots
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SLOTWATCH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// BigQuery locations checked for reservations unless configured otherwise.
pub const DEFAULT_LOCATIONS: &[&str] = &[
    "US",
    "EU",
    "asia-east1",
    "asia-east2",
    "asia-northeast1",
    "asia-northeast2",
    "asia-northeast3",
    "asia-south1",
    "asia-south2",
    "asia-southeast1",
    "asia-southeast2",
    "australia-southeast1",
    "australia-southeast2",
    "europe-central2",
    "europe-north1",
    "europe-west1",
    "europe-west2",
    "europe-west3",
    "europe-west4",
    "europe-west5",
    "europe-west6",
    "northamerica-northeast1",
    "northamerica-northeast2",
    "southamerica-east1",
    // southamerica-west1 has no reservation endpoint
    "us-central1",
    "us-east1",
    "us-east4",
    "us-west1",
    "us-west2",
    "us-west3",
    "us-west4",
];

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Admin project that owns the reservations
    pub project: String,
    /// Locations listed during discovery
    pub locations: Vec<String>,
    /// Utilization fraction at or above which a reservation is reported as breached
    pub threshold: f64,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub upstream: UpstreamConfig,
    pub alerts: AlertsConfig,
    pub storage: StorageConfig,
    /// Expose Prometheus metrics at /internal/metrics
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard OTEL_* variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            project: String::new(),
            locations: DEFAULT_LOCATIONS.iter().map(|l| l.to_string()).collect(),
            threshold: 0.8,
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            upstream: UpstreamConfig::default(),
            alerts: AlertsConfig::default(),
            storage: StorageConfig::default(),
            enable_metrics: true,
            enable_otel_export: false,
        }
    }
}

/// Hierarchy cache settings. The cache lives for the whole process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How long an expanded folder or organization stays valid
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            max_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Upper bound on concurrently running workers within a stage
    pub max_concurrency: usize,
    /// Deepest folder nesting followed below an assignee
    pub max_hierarchy_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            max_hierarchy_depth: 32,
        }
    }
}

/// Google Cloud API endpoints and credentials.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub reservation_url: Url,
    pub resource_manager_url: Url,
    pub bigquery_url: Url,
    /// Per-request timeout. Requests are unbounded when unset.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    /// Static bearer token. When unset, tokens come from the metadata server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub metadata_url: Url,
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("reservation_url", &self.reservation_url)
            .field("resource_manager_url", &self.resource_manager_url)
            .field("bigquery_url", &self.bigquery_url)
            .field("request_timeout", &self.request_timeout)
            .field("access_token", &redacted(&self.access_token))
            .field("metadata_url", &self.metadata_url)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            reservation_url: "https://bigqueryreservation.googleapis.com".parse().expect("valid default URL"),
            resource_manager_url: "https://cloudresourcemanager.googleapis.com".parse().expect("valid default URL"),
            bigquery_url: "https://bigquery.googleapis.com".parse().expect("valid default URL"),
            request_timeout: None,
            access_token: None,
            metadata_url: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
                .parse()
                .expect("valid default URL"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    /// Message template. The built-in template is used if the file does not exist.
    pub template: PathBuf,
    /// Root of `<service>/webhook` secret files overriding webhook env vars
    pub secret_dir: PathBuf,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::from("templates/message.jinja"),
            secret_dir: PathBuf::from("/"),
        }
    }
}

/// Snapshot persistence. Disabled unless a bucket is set.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// S3-compatible endpoint; GCS interoperability by default
    pub endpoint_url: String,
    pub region: String,
    /// Object key prefix, followed by the unix timestamp of the run
    pub prefix: String,
    /// HMAC credentials. The default AWS credential chain is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .finish()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            endpoint_url: "https://storage.googleapis.com".to_string(),
            region: "auto".to_string(),
            prefix: "state-".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.project.trim().is_empty() {
            return Err(Error::Config {
                message: "project is not set. Set GOOGLE_CLOUD_PROJECT, SLOTWATCH_PROJECT or `project` in the config file."
                    .to_string(),
            });
        }

        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(Error::Config {
                message: format!("threshold must be a positive number, got {}", self.threshold),
            });
        }

        if self.locations.is_empty() {
            return Err(Error::Config {
                message: "at least one location must be configured".to_string(),
            });
        }

        if self.pipeline.max_concurrency == 0 {
            return Err(Error::Config {
                message: "pipeline.max_concurrency must be at least 1".to_string(),
            });
        }

        if self.pipeline.max_hierarchy_depth == 0 {
            return Err(Error::Config {
                message: "pipeline.max_hierarchy_depth must be at least 1".to_string(),
            });
        }

        if self.cache.max_age.is_zero() {
            return Err(Error::Config {
                message: "cache.max_age must be greater than zero".to_string(),
            });
        }

        if self.storage.access_key_id.is_some() != self.storage.secret_access_key.is_some() {
            return Err(Error::Config {
                message: "storage.access_key_id and storage.secret_access_key must be set together".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("SLOTWATCH_").split("__"))
            // Variables set by the deployment platform
            .merge(Env::raw().only(&["PORT"]).map(|_| "port".into()))
            .merge(Env::raw().only(&["GOOGLE_CLOUD_PROJECT"]).map(|_| "project".into()))
            .merge(Env::raw().only(&["USAGE_THRESHOLD"]).map(|_| "threshold".into()))
            .merge(Env::raw().only(&["STATE_BUCKET"]).map(|_| "storage.bucket".into()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
