//! Access tokens for the Google Cloud APIs.
//!
//! On Cloud Run and GCE the metadata server hands out short-lived tokens for the attached service
//! account. A static token can be configured instead for local runs
//! (`gcloud auth print-access-token`).
//!
//! Metadata tokens are reused until shortly before they expire, so a long run keeps working past
//! the lifetime of the token it started with.

use anyhow::{Context, anyhow};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

/// Tokens are refreshed once less than this much lifetime remains.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// A metadata token and the moment it should be replaced.
#[derive(Debug)]
pub struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    Metadata {
        http: Client,
        url: Url,
        cached: Arc<Mutex<Option<CachedToken>>>,
    },
}

impl TokenSource {
    pub fn metadata(http: Client, url: Url) -> Self {
        TokenSource::Metadata {
            http,
            url,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a bearer token valid for at least the refresh margin.
    pub async fn token(&self) -> anyhow::Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata { http, url, cached } => {
                // Held across the fetch so concurrent callers share one refresh
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref().filter(|token| Instant::now() < token.refresh_at) {
                    return Ok(token.value.clone());
                }

                let token = fetch_metadata_token(http, url).await?;
                let lifetime = Duration::from_secs(token.expires_in);
                *cached = (lifetime > REFRESH_MARGIN).then(|| CachedToken {
                    value: token.access_token.clone(),
                    refresh_at: Instant::now() + (lifetime - REFRESH_MARGIN),
                });
                Ok(token.access_token)
            }
        }
    }
}

async fn fetch_metadata_token(http: &Client, url: &Url) -> anyhow::Result<MetadataToken> {
    let response = http
        .get(url.clone())
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .context("metadata server unreachable")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("Metadata server error: {} - {}", status, body));
    }

    response.json().await.context("malformed metadata token response")
}
