use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::errors::Error;
use crate::state::{Job, PipelineState};
use crate::upstream::models::{WorkloadDetail, WorkloadKind};
use crate::upstream::{self, WorkloadService};

/// Identifier a job reports when it ran under the given reservation.
pub fn expected_reservation_id(project: &str, location: &str, name: &str) -> String {
    format!("{project}:{location}.{name}")
}

/// Collects running query jobs for each reservation's projects.
///
/// Reservations are handled one after another; within a reservation each project gets its own
/// worker.
#[instrument(skip_all, fields(reservations = state.reservations.len()))]
pub async fn collect_workloads(
    state: &mut PipelineState,
    service: Arc<dyn WorkloadService>,
    project: &str,
    max_concurrency: usize,
) {
    for reservation in state.reservations.values_mut() {
        let expected = expected_reservation_id(project, &reservation.location, &reservation.name);
        let permits = Arc::new(Semaphore::new(max_concurrency));
        let (tx, mut rx) = mpsc::channel::<Job>(1);

        for account in &reservation.projects {
            let service = service.clone();
            let permits = permits.clone();
            let tx = tx.clone();
            let account = account.clone();
            let expected = expected.clone();

            tokio::spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    collect_account(service, account, expected, tx).await;
                }
                .instrument(Span::current()),
            );
        }
        drop(tx);

        while let Some(job) = rx.recv().await {
            reservation.jobs.push(job);
        }

        info!(reservation = %reservation.key(), jobs = reservation.jobs.len(), "collected running jobs");
    }
}

async fn collect_account(service: Arc<dyn WorkloadService>, account: String, expected: String, tx: mpsc::Sender<Job>) {
    let mut listing = upstream::running_workloads(service.clone(), account.clone());

    while let Some(item) = listing.next().await {
        let workload = match item {
            Ok(workload) => workload,
            Err(cause) => {
                let error = Error::Pagination {
                    resource: "jobs",
                    parent: format!("projects/{account}"),
                    cause,
                };
                warn!(account = %account, error = %error, "job listing stopped early");
                break;
            }
        };

        let detail = match service.get_workload_detail(&account, &workload).await {
            Ok(detail) => detail,
            Err(cause) => {
                let error = Error::Upstream {
                    operation: format!("fetching job {}", workload.id),
                    cause,
                };
                warn!(account = %account, error = %error, "skipping job");
                continue;
            }
        };

        if let Some(job) = evaluate_workload(&detail, &expected)
            && tx.send(job).await.is_err()
        {
            return;
        }
    }
}

/// Turns a job's detail into a usage record, or `None` if it should not count.
pub fn evaluate_workload(detail: &WorkloadDetail, expected_reservation: &str) -> Option<Job> {
    if detail.kind != WorkloadKind::Query {
        debug!(job = %detail.id, kind = %detail.kind, "skipping non-query job");
        return None;
    }

    let Some(sample) = detail.latest_sample() else {
        debug!(job = %detail.id, "skipping job without timeline");
        return None;
    };
    if sample.elapsed_ms <= 0 || sample.total_slot_ms <= 0 {
        debug!(job = %detail.id, "skipping job without runtime stats");
        return None;
    }

    let usage = sample.total_slot_ms as f64 / sample.elapsed_ms as f64;

    let actual = detail.reservation_id.as_deref().unwrap_or_default();
    if actual != expected_reservation {
        warn!(
            job = %detail.id,
            expected = %expected_reservation,
            found = %actual,
            "job reservation is missing or does not match"
        );
    }

    Some(Job {
        name: detail.id.clone(),
        usage,
    })
}
