//! Google Cloud REST implementations of the upstream services.
//!
//! - Reservations: BigQuery Reservation API v1
//! - Hierarchy: Cloud Resource Manager API v3
//! - Workloads: BigQuery API v2 jobs
//!
//! Every int64 field in these APIs is encoded as a JSON string; the wire structs accept either a
//! string or a number.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::models::{
    Account, Assignment, Folder, ReservationRecord, TimelineSample, WorkloadDetail, WorkloadKind, WorkloadRef,
};
use super::{ClientFactory, HierarchyService, Page, ReservationService, WorkloadService};
use crate::auth::TokenSource;
use crate::config::UpstreamConfig;
use crate::errors::{Error, Result};

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationWire {
    name: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    slot_capacity: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListReservationsResponse {
    #[serde(default)]
    reservations: Vec<ReservationWire>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssignmentWire {
    name: String,
    #[serde(default)]
    assignee: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAssignmentsResponse {
    #[serde(default)]
    assignments: Vec<AssignmentWire>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderWire {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFoldersResponse {
    #[serde(default)]
    folders: Vec<FolderWire>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectWire {
    project_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectWire>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobListEntry {
    job_reference: JobReference,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsResponse {
    #[serde(default)]
    jobs: Vec<JobListEntry>,
    next_page_token: Option<String>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineWire {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    elapsed_ms: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    total_slot_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
struct QueryStatistics {
    #[serde(default)]
    timeline: Vec<TimelineWire>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    query: Option<QueryStatistics>,
    // This one field is snake_case in the v2 API
    reservation_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobConfiguration {
    #[serde(default)]
    job_type: String,
}

#[derive(Debug, Deserialize)]
struct JobWire {
    id: String,
    #[serde(default)]
    configuration: JobConfiguration,
    #[serde(default)]
    statistics: JobStatistics,
}

impl From<JobWire> for WorkloadDetail {
    fn from(job: JobWire) -> Self {
        let timeline = job
            .statistics
            .query
            .map(|query| {
                query
                    .timeline
                    .into_iter()
                    .map(|sample| TimelineSample {
                        elapsed_ms: sample.elapsed_ms,
                        total_slot_ms: sample.total_slot_ms,
                    })
                    .collect()
            })
            .unwrap_or_default();

        WorkloadDetail {
            id: job.id,
            kind: WorkloadKind::from(job.configuration.job_type.as_str()),
            timeline,
            reservation_id: job.statistics.reservation_id.filter(|id| !id.is_empty()),
        }
    }
}

/// Last segment of a resource name, e.g. `projects/p/locations/US/reservations/batch` -> `batch`.
fn short_name(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

/// Authenticated JSON GETs against one Google API base URL.
#[derive(Clone)]
struct GoogleApi {
    http: Client,
    base_url: Url,
    tokens: TokenSource,
    request_timeout: Option<Duration>,
}

impl GoogleApi {
    fn endpoint(&self, path: &str, query: &[(&str, &str)], page_token: Option<&str>) -> anyhow::Result<Url> {
        let mut url = ensure_slash(&self.base_url)
            .join(path)
            .map_err(|e| anyhow!("Failed to construct URL for {}: {}", path, e))?;

        if !query.is_empty() || page_token.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }

        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> anyhow::Result<T> {
        debug!("GET {}", url);

        let token = self.tokens.token().await.context("failed to obtain access token")?;
        let mut request = self.http.get(url.clone()).bearer_auth(token);
        if let Some(timeout) = self.request_timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.with_context(|| format!("request to {url} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Google API error: {} - {}", status, body));
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("error decoding response body from {url}"))
    }
}

pub struct ReservationApi {
    api: GoogleApi,
}

#[async_trait]
impl ReservationService for ReservationApi {
    #[instrument(skip(self))]
    async fn list_reservations(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<ReservationRecord>> {
        let url = self
            .api
            .endpoint(&format!("v1/{parent}/reservations"), &[], page_token.as_deref())?;
        let response: ListReservationsResponse = self.api.get_json(url).await?;

        Ok(Page {
            items: response
                .reservations
                .into_iter()
                .map(|reservation| ReservationRecord {
                    name: short_name(&reservation.name).to_string(),
                    slot_capacity: reservation.slot_capacity as f64,
                })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_assignments(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Assignment>> {
        let url = self
            .api
            .endpoint(&format!("v1/{parent}/assignments"), &[], page_token.as_deref())?;
        let response: ListAssignmentsResponse = self.api.get_json(url).await?;

        Ok(Page {
            items: response
                .assignments
                .into_iter()
                .map(|assignment| Assignment {
                    name: assignment.name,
                    assignee: assignment.assignee,
                })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }
}

pub struct ResourceManagerApi {
    api: GoogleApi,
}

#[async_trait]
impl HierarchyService for ResourceManagerApi {
    #[instrument(skip(self))]
    async fn list_child_folders(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Folder>> {
        let url = self
            .api
            .endpoint("v3/folders", &[("parent", parent)], page_token.as_deref())?;
        let response: ListFoldersResponse = self.api.get_json(url).await?;

        Ok(Page {
            items: response
                .folders
                .into_iter()
                .map(|folder| Folder {
                    id: short_name(&folder.name).to_string(),
                })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_child_accounts(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Account>> {
        let url = self
            .api
            .endpoint("v3/projects", &[("parent", parent)], page_token.as_deref())?;
        let response: ListProjectsResponse = self.api.get_json(url).await?;

        Ok(Page {
            items: response
                .projects
                .into_iter()
                .map(|project| Account { id: project.project_id })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }
}

pub struct BigQueryApi {
    api: GoogleApi,
}

#[async_trait]
impl WorkloadService for BigQueryApi {
    #[instrument(skip(self))]
    async fn list_running_workloads(&self, account: &str, page_token: Option<String>) -> anyhow::Result<Page<WorkloadRef>> {
        let url = self.api.endpoint(
            &format!("bigquery/v2/projects/{account}/jobs"),
            &[("allUsers", "true"), ("stateFilter", "running")],
            page_token.as_deref(),
        )?;
        let response: ListJobsResponse = self.api.get_json(url).await?;

        Ok(Page {
            items: response
                .jobs
                .into_iter()
                .map(|job| WorkloadRef {
                    id: job.job_reference.job_id,
                    location: job.job_reference.location,
                })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn get_workload_detail(&self, account: &str, workload: &WorkloadRef) -> anyhow::Result<WorkloadDetail> {
        let path = format!("bigquery/v2/projects/{account}/jobs/{}", workload.id);
        let url = match workload.location.as_deref() {
            Some(location) => self.api.endpoint(&path, &[("location", location)], None)?,
            None => self.api.endpoint(&path, &[], None)?,
        };
        let job: JobWire = self.api.get_json(url).await?;
        Ok(job.into())
    }
}

/// Builds Google API clients. Building a client checks that an access token can be obtained;
/// each request then asks the token source again, which refreshes expiring metadata tokens.
pub struct GoogleClientFactory {
    http: Client,
    config: UpstreamConfig,
    tokens: TokenSource,
}

impl GoogleClientFactory {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = crate::http_client()?;
        let tokens = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::metadata(http.clone(), config.metadata_url.clone()),
        };

        Ok(Self {
            http,
            config: config.clone(),
            tokens,
        })
    }

    async fn api(&self, service: &'static str, base_url: &Url) -> Result<GoogleApi> {
        self.tokens
            .token()
            .await
            .map_err(|cause| Error::ClientInit { service, cause })?;

        Ok(GoogleApi {
            http: self.http.clone(),
            base_url: base_url.clone(),
            tokens: self.tokens.clone(),
            request_timeout: self.config.request_timeout,
        })
    }
}

#[async_trait]
impl ClientFactory for GoogleClientFactory {
    async fn reservation_service(&self) -> Result<Arc<dyn ReservationService>> {
        let api = self.api("reservation", &self.config.reservation_url).await?;
        Ok(Arc::new(ReservationApi { api }))
    }

    async fn hierarchy_service(&self) -> Result<Arc<dyn HierarchyService>> {
        let api = self.api("resource manager", &self.config.resource_manager_url).await?;
        Ok(Arc::new(ResourceManagerApi { api }))
    }

    async fn workload_service(&self) -> Result<Arc<dyn WorkloadService>> {
        let api = self.api("bigquery", &self.config.bigquery_url).await?;
        Ok(Arc::new(BigQueryApi { api }))
    }
}
