//! The reservation utilization pipeline.
//!
//! A run moves through four stages, each finishing before the next starts:
//!
//! 1. [`discovery`] lists reservations in every configured location.
//! 2. [`assignments`] resolves which projects draw from each reservation, expanding folders and
//!    organizations through the [`hierarchy`] resolver and the shared [`HierarchyCache`].
//! 3. [`workloads`] collects running query jobs for those projects.
//! 4. [`utilization`] reduces the jobs into per-reservation totals and breach flags.
//!
//! Partial failures inside a stage are logged and the run carries on with what it has. Only a
//! failure to build the reservation client aborts the run.

pub mod assignments;
pub mod discovery;
pub mod hierarchy;
pub mod utilization;
pub mod workloads;

use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::cache::HierarchyCache;
use crate::config::Config;
use crate::errors::Result;
use crate::state::PipelineState;
use crate::upstream::{ClientFactory, ReservationService};
use hierarchy::HierarchyResolver;

/// Run parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Admin project that owns the reservations
    pub project: String,
    pub locations: Vec<String>,
    pub threshold: f64,
    pub max_concurrency: usize,
    pub max_hierarchy_depth: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            project: config.project.clone(),
            locations: config.locations.clone(),
            threshold: config.threshold,
            max_concurrency: config.pipeline.max_concurrency,
            max_hierarchy_depth: config.pipeline.max_hierarchy_depth,
        }
    }
}

pub struct Pipeline {
    factory: Arc<dyn ClientFactory>,
    cache: HierarchyCache,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(factory: Arc<dyn ClientFactory>, cache: HierarchyCache, settings: PipelineSettings) -> Self {
        Self {
            factory,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &HierarchyCache {
        &self.cache
    }

    /// Runs all stages once and returns the aggregated state.
    #[instrument(skip_all, fields(project = %self.settings.project))]
    pub async fn run(&self) -> Result<PipelineState> {
        let reservations = self.factory.reservation_service().await?;

        let mut state = self.discover(reservations.clone()).await;
        if state.is_empty() {
            info!("no reservations found");
            return Ok(state);
        }

        self.resolve_assignments(&mut state, reservations).await;
        self.collect_workloads(&mut state).await;
        self.aggregate(&mut state);

        Ok(state)
    }

    pub async fn discover(&self, service: Arc<dyn ReservationService>) -> PipelineState {
        discovery::discover_reservations(
            service,
            &self.settings.project,
            &self.settings.locations,
            self.settings.max_concurrency,
        )
        .await
    }

    pub async fn resolve_assignments(&self, state: &mut PipelineState, service: Arc<dyn ReservationService>) {
        let hierarchy = match self.factory.hierarchy_service().await {
            Ok(hierarchy) => hierarchy,
            Err(e) => {
                error!(error = %e, "skipping assignment resolution");
                return;
            }
        };
        let resolver = Arc::new(HierarchyResolver::new(
            hierarchy,
            self.cache.clone(),
            self.settings.max_hierarchy_depth,
        ));

        assignments::resolve_assignments(
            state,
            service,
            resolver,
            &self.settings.project,
            self.settings.max_concurrency,
        )
        .await;
    }

    pub async fn collect_workloads(&self, state: &mut PipelineState) {
        let workloads = match self.factory.workload_service().await {
            Ok(workloads) => workloads,
            Err(e) => {
                error!(error = %e, "skipping workload collection");
                return;
            }
        };

        workloads::collect_workloads(state, workloads, &self.settings.project, self.settings.max_concurrency).await;
    }

    pub fn aggregate(&self, state: &mut PipelineState) {
        utilization::aggregate(state, self.settings.threshold);
    }
}
