use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, Span, debug, instrument, warn};

use crate::errors::Error;
use crate::pipeline::hierarchy::{HierarchyError, HierarchyResolver};
use crate::state::{PipelineState, Reservation, dedup_accounts};
use crate::upstream::models::Assignee;
use crate::upstream::{self, ReservationService};

/// Attaches the consumer projects of every reservation, one worker per reservation.
#[instrument(skip_all, fields(reservations = state.reservations.len()))]
pub async fn resolve_assignments(
    state: &mut PipelineState,
    service: Arc<dyn ReservationService>,
    resolver: Arc<HierarchyResolver>,
    project: &str,
    max_concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrency));
    let (tx, mut rx) = mpsc::channel::<Reservation>(1);

    for reservation in state.reservations.values() {
        let service = service.clone();
        let resolver = resolver.clone();
        let permits = permits.clone();
        let tx = tx.clone();
        let parent = format!(
            "projects/{project}/locations/{}/reservations/{}",
            reservation.location, reservation.name
        );
        let reservation = reservation.clone();

        tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let resolved = resolve_reservation(reservation, parent, service, &resolver).await;
                let _ = tx.send(resolved).await;
            }
            .instrument(Span::current()),
        );
    }
    drop(tx);

    // Each worker owns a distinct key
    while let Some(reservation) = rx.recv().await {
        state.reservations.insert(reservation.key(), reservation);
    }
}

async fn resolve_reservation(
    mut reservation: Reservation,
    parent: String,
    service: Arc<dyn ReservationService>,
    resolver: &HierarchyResolver,
) -> Reservation {
    let key = reservation.key();
    let mut accounts = std::mem::take(&mut reservation.projects);
    let mut listing = upstream::assignments(service, parent.clone());

    while let Some(item) = listing.next().await {
        let assignment = match item {
            Ok(assignment) => assignment,
            Err(cause) => {
                let error = Error::Pagination {
                    resource: "assignments",
                    parent,
                    cause,
                };
                warn!(reservation = %key, error = %error, "assignment listing stopped early");
                break;
            }
        };

        let assignee = match assignment.assignee.parse::<Assignee>() {
            Ok(assignee) => assignee,
            Err(unknown) => {
                let error = Error::from(HierarchyError::UnknownAssigneeKind(unknown.0));
                warn!(reservation = %key, assignment = %assignment.name, error = %error, "skipping assignee");
                continue;
            }
        };

        match resolver.resolve(&assignee).await {
            Ok(resolved) => {
                debug!(reservation = %key, assignee = %assignee, count = resolved.len(), "resolved assignee");
                accounts.extend(resolved);
            }
            Err(e) => {
                let error = Error::from(e);
                warn!(reservation = %key, assignee = %assignee, error = %error, "skipping assignee");
            }
        }
    }

    reservation.projects = dedup_accounts(accounts);
    reservation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HierarchyCache;
    use crate::test_utils::{FakeHierarchy, FakeReservations, assignment};
    use std::time::Duration;

    fn resolver(hierarchy: FakeHierarchy) -> Arc<HierarchyResolver> {
        Arc::new(HierarchyResolver::new(
            Arc::new(hierarchy),
            HierarchyCache::new(Duration::from_secs(3600), 100),
            32,
        ))
    }

    fn state_with(reservations: &[(&str, &str)]) -> PipelineState {
        reservations
            .iter()
            .map(|(location, name)| Reservation::new(*location, *name, 100.0))
            .collect()
    }

    #[tokio::test]
    async fn test_expands_and_deduplicates_assignees() {
        let reservations = FakeReservations::default().with_assignments(
            "projects/admin/locations/US/reservations/batch",
            vec![
                assignment("a1", "projects/P1"),
                assignment("a2", "organizations/ORG1"),
                assignment("a3", "folders/F1"),
            ],
        );
        let hierarchy = FakeHierarchy::default()
            .with_folders("organizations/ORG1", &["F1"])
            .with_projects("folders/F1", &["P1", "P2"])
            .with_projects("organizations/ORG1", &["P3"]);

        let mut state = state_with(&[("US", "batch"), ("EU", "idle")]);
        resolve_assignments(&mut state, Arc::new(reservations), resolver(hierarchy), "admin", 4).await;

        let mut projects = state.reservations["US.batch"].projects.clone();
        projects.sort();
        assert_eq!(projects, vec!["P1", "P2", "P3"]);
        assert!(state.reservations["EU.idle"].projects.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_assignee_does_not_drop_siblings() {
        let reservations = FakeReservations::default().with_assignments(
            "projects/admin/locations/US/reservations/batch",
            vec![
                assignment("a1", "folders/BROKEN"),
                assignment("a2", "billingAccounts/123"),
                assignment("a3", "projects/P7"),
            ],
        );
        let hierarchy = FakeHierarchy::default().failing("folders/BROKEN");

        let mut state = state_with(&[("US", "batch")]);
        resolve_assignments(&mut state, Arc::new(reservations), resolver(hierarchy), "admin", 4).await;

        assert_eq!(state.reservations["US.batch"].projects, vec!["P7"]);
    }

    #[tokio::test]
    async fn test_assignment_listing_failure_keeps_earlier_pages() {
        let reservations = FakeReservations::default()
            .with_assignment_pages(
                "projects/admin/locations/US/reservations/batch",
                vec![vec![assignment("a1", "projects/P1")], vec![assignment("a2", "projects/P2")]],
            )
            .fail_assignment_page("projects/admin/locations/US/reservations/batch", 1);

        let mut state = state_with(&[("US", "batch")]);
        resolve_assignments(&mut state, Arc::new(reservations), resolver(FakeHierarchy::default()), "admin", 1).await;

        assert_eq!(state.reservations["US.batch"].projects, vec!["P1"]);
    }
}
