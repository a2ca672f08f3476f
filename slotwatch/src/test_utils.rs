//! In-memory upstream fakes and fixtures (available with `test-utils` feature).

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::upstream::models::{
    Account, Assignment, Folder, ReservationRecord, TimelineSample, WorkloadDetail, WorkloadKind, WorkloadRef,
};
use crate::upstream::{ClientFactory, HierarchyService, Page, ReservationService, WorkloadService};

pub fn create_test_config() -> crate::config::Config {
    crate::config::Config {
        project: "admin".to_string(),
        locations: locations(&["US", "EU"]),
        enable_metrics: false,
        ..Default::default()
    }
}

pub fn locations(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

pub fn record(name: &str, slots: f64) -> ReservationRecord {
    ReservationRecord {
        name: name.to_string(),
        slot_capacity: slots,
    }
}

pub fn assignment(name: &str, assignee: &str) -> Assignment {
    Assignment {
        name: name.to_string(),
        assignee: assignee.to_string(),
    }
}

/// A running query with a single timeline sample.
pub fn query_job(id: &str, reservation_id: &str, elapsed_ms: i64, total_slot_ms: i64) -> WorkloadDetail {
    WorkloadDetail {
        id: id.to_string(),
        kind: WorkloadKind::Query,
        timeline: vec![TimelineSample {
            elapsed_ms,
            total_slot_ms,
        }],
        reservation_id: Some(reservation_id.to_string()),
    }
}

pub fn job_of_kind(id: &str, kind: &str, elapsed_ms: i64, total_slot_ms: i64) -> WorkloadDetail {
    WorkloadDetail {
        kind: WorkloadKind::from(kind),
        reservation_id: None,
        ..query_job(id, "", elapsed_ms, total_slot_ms)
    }
}

/// Serves `pages` using the page index as the page token.
fn serve_page<T: Clone>(pages: Option<&Vec<Vec<T>>>, token: Option<String>, fail_at: Option<usize>, parent: &str) -> anyhow::Result<Page<T>> {
    let index = match token {
        Some(token) => token.parse::<usize>()?,
        None => 0,
    };
    if fail_at == Some(index) {
        bail!("injected failure on page {index} of {parent}");
    }
    let Some(pages) = pages else {
        return Ok(Page::last(Vec::new()));
    };

    Ok(Page {
        items: pages.get(index).cloned().unwrap_or_default(),
        next_page_token: (index + 1 < pages.len()).then(|| (index + 1).to_string()),
    })
}

#[derive(Debug, Clone, Default)]
pub struct FakeReservations {
    reservations: HashMap<String, Vec<Vec<ReservationRecord>>>,
    assignments: HashMap<String, Vec<Vec<Assignment>>>,
    reservation_failures: HashMap<String, usize>,
    assignment_failures: HashMap<String, usize>,
}

impl FakeReservations {
    pub fn with_reservations(mut self, parent: &str, pages: Vec<Vec<ReservationRecord>>) -> Self {
        self.reservations.insert(parent.to_string(), pages);
        self
    }

    pub fn fail_reservation_page(mut self, parent: &str, page: usize) -> Self {
        self.reservation_failures.insert(parent.to_string(), page);
        self
    }

    pub fn with_assignments(self, parent: &str, assignments: Vec<Assignment>) -> Self {
        self.with_assignment_pages(parent, vec![assignments])
    }

    pub fn with_assignment_pages(mut self, parent: &str, pages: Vec<Vec<Assignment>>) -> Self {
        self.assignments.insert(parent.to_string(), pages);
        self
    }

    pub fn fail_assignment_page(mut self, parent: &str, page: usize) -> Self {
        self.assignment_failures.insert(parent.to_string(), page);
        self
    }
}

#[async_trait]
impl ReservationService for FakeReservations {
    async fn list_reservations(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<ReservationRecord>> {
        serve_page(
            self.reservations.get(parent),
            page_token,
            self.reservation_failures.get(parent).copied(),
            parent,
        )
    }

    async fn list_assignments(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Assignment>> {
        serve_page(
            self.assignments.get(parent),
            page_token,
            self.assignment_failures.get(parent).copied(),
            parent,
        )
    }
}

/// Resource hierarchy keyed by qualified parent path. Counts every listing call.
#[derive(Debug, Clone, Default)]
pub struct FakeHierarchy {
    folders: HashMap<String, Vec<String>>,
    projects: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl FakeHierarchy {
    pub fn with_folders(mut self, parent: &str, folder_ids: &[&str]) -> Self {
        self.folders
            .insert(parent.to_string(), folder_ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn with_projects(mut self, parent: &str, project_ids: &[&str]) -> Self {
        self.projects
            .insert(parent.to_string(), project_ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn failing(mut self, parent: &str) -> Self {
        self.failing.insert(parent.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn children(&self, map: &HashMap<String, Vec<String>>, parent: &str) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(parent) {
            bail!("permission denied on {parent}");
        }
        Ok(map.get(parent).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl HierarchyService for FakeHierarchy {
    async fn list_child_folders(&self, parent: &str, _page_token: Option<String>) -> anyhow::Result<Page<Folder>> {
        let ids = self.children(&self.folders, parent).await?;
        Ok(Page::last(ids.into_iter().map(|id| Folder { id }).collect()))
    }

    async fn list_child_accounts(&self, parent: &str, _page_token: Option<String>) -> anyhow::Result<Page<Account>> {
        let ids = self.children(&self.projects, parent).await?;
        Ok(Page::last(ids.into_iter().map(|id| Account { id }).collect()))
    }
}

/// Running jobs keyed by project.
#[derive(Debug, Clone, Default)]
pub struct FakeWorkloads {
    jobs: HashMap<String, Vec<WorkloadDetail>>,
    failing_lists: HashSet<String>,
    failing_gets: HashSet<String>,
}

impl FakeWorkloads {
    pub fn with_jobs(mut self, account: &str, jobs: Vec<WorkloadDetail>) -> Self {
        self.jobs.insert(account.to_string(), jobs);
        self
    }

    pub fn failing_list(mut self, account: &str) -> Self {
        self.failing_lists.insert(account.to_string());
        self
    }

    pub fn failing_get(mut self, job_id: &str) -> Self {
        self.failing_gets.insert(job_id.to_string());
        self
    }
}

#[async_trait]
impl WorkloadService for FakeWorkloads {
    async fn list_running_workloads(&self, account: &str, _page_token: Option<String>) -> anyhow::Result<Page<WorkloadRef>> {
        if self.failing_lists.contains(account) {
            bail!("access denied listing jobs in {account}");
        }
        let refs = self
            .jobs
            .get(account)
            .map(|jobs| {
                jobs.iter()
                    .map(|job| WorkloadRef {
                        id: job.id.clone(),
                        location: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Page::last(refs))
    }

    async fn get_workload_detail(&self, account: &str, workload: &WorkloadRef) -> anyhow::Result<WorkloadDetail> {
        if self.failing_gets.contains(&workload.id) {
            bail!("job {} vanished", workload.id);
        }
        self.jobs
            .get(account)
            .and_then(|jobs| jobs.iter().find(|job| job.id == workload.id))
            .cloned()
            .ok_or_else(|| anyhow!("job {} not found in {account}", workload.id))
    }
}

pub struct FakeFactory {
    reservations: Arc<FakeReservations>,
    hierarchy: Arc<FakeHierarchy>,
    workloads: Arc<FakeWorkloads>,
    fail_reservation: bool,
    fail_hierarchy: bool,
    fail_workload: bool,
}

impl FakeFactory {
    pub fn new(reservations: FakeReservations, hierarchy: FakeHierarchy, workloads: FakeWorkloads) -> Self {
        Self {
            reservations: Arc::new(reservations),
            hierarchy: Arc::new(hierarchy),
            workloads: Arc::new(workloads),
            fail_reservation: false,
            fail_hierarchy: false,
            fail_workload: false,
        }
    }

    pub fn failing_reservation_client(mut self) -> Self {
        self.fail_reservation = true;
        self
    }

    pub fn failing_hierarchy_client(mut self) -> Self {
        self.fail_hierarchy = true;
        self
    }

    pub fn failing_workload_client(mut self) -> Self {
        self.fail_workload = true;
        self
    }
}

fn client_failure(service: &'static str) -> Error {
    Error::ClientInit {
        service,
        cause: anyhow!("could not load default credentials"),
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn reservation_service(&self) -> Result<Arc<dyn ReservationService>> {
        if self.fail_reservation {
            return Err(client_failure("reservation"));
        }
        Ok(self.reservations.clone())
    }

    async fn hierarchy_service(&self) -> Result<Arc<dyn HierarchyService>> {
        if self.fail_hierarchy {
            return Err(client_failure("resource manager"));
        }
        Ok(self.hierarchy.clone())
    }

    async fn workload_service(&self) -> Result<Arc<dyn WorkloadService>> {
        if self.fail_workload {
            return Err(client_failure("bigquery"));
        }
        Ok(self.workloads.clone())
    }
}
