use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::errors::Error;
use crate::state::{PipelineState, Reservation};
use crate::upstream::{self, ReservationService};

/// Name of the on-demand pool every project has in every location.
pub const DEFAULT_RESERVATION: &str = "default";

/// Lists reservations in every location concurrently and collects them into a fresh state.
///
/// A listing failure in one location keeps what that location already returned; other locations
/// carry on.
#[instrument(skip_all, fields(project = %project, locations = locations.len()))]
pub async fn discover_reservations(
    service: Arc<dyn ReservationService>,
    project: &str,
    locations: &[String],
    max_concurrency: usize,
) -> PipelineState {
    let permits = Arc::new(Semaphore::new(max_concurrency));
    let (tx, mut rx) = mpsc::channel::<Reservation>(1);

    for location in locations {
        let service = service.clone();
        let permits = permits.clone();
        let tx = tx.clone();
        let parent = format!("projects/{project}/locations/{location}");
        let location = location.clone();

        tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                discover_location(service, parent, location, tx).await;
            }
            .instrument(Span::current()),
        );
    }
    drop(tx);

    let mut state = PipelineState::default();
    while let Some(reservation) = rx.recv().await {
        state.reservations.insert(reservation.key(), reservation);
    }

    info!(count = state.reservations.len(), "reservation discovery finished");
    state
}

async fn discover_location(
    service: Arc<dyn ReservationService>,
    parent: String,
    location: String,
    tx: mpsc::Sender<Reservation>,
) {
    let mut listing = upstream::reservations(service, parent.clone());

    while let Some(item) = listing.next().await {
        match item {
            Ok(record) if record.name == DEFAULT_RESERVATION => {
                debug!(location = %location, "skipping default reservation");
            }
            Ok(record) => {
                info!(location = %location, reservation = %record.name, slots = record.slot_capacity, "discovered reservation");
                if tx
                    .send(Reservation::new(location.clone(), record.name, record.slot_capacity))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(cause) => {
                let error = Error::Pagination {
                    resource: "reservations",
                    parent,
                    cause,
                };
                warn!(location = %location, error = %error, "reservation listing stopped early");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeReservations, locations, record};

    #[tokio::test]
    async fn test_discovers_across_locations_and_skips_default() {
        let service = FakeReservations::default()
            .with_reservations("projects/admin/locations/US", vec![vec![record("default", 0.0), record("batch", 500.0)]])
            .with_reservations("projects/admin/locations/EU", vec![vec![record("etl", 100.0)]]);

        let state = discover_reservations(Arc::new(service), "admin", &locations(&["US", "EU", "asia-east1"]), 4).await;

        let keys: Vec<&str> = state.reservations.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["EU.etl", "US.batch"]);
        let batch = &state.reservations["US.batch"];
        assert_eq!(batch.location, "US");
        assert_eq!(batch.slots, 500.0);
        assert!(batch.projects.is_empty());
    }

    #[tokio::test]
    async fn test_follows_pages() {
        let service = FakeReservations::default().with_reservations(
            "projects/admin/locations/US",
            vec![vec![record("a", 1.0)], vec![record("b", 2.0)], vec![record("c", 3.0)]],
        );

        let state = discover_reservations(Arc::new(service), "admin", &locations(&["US"]), 1).await;

        assert_eq!(state.reservations.len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_pagination_error_keeps_partial_results() {
        let service = FakeReservations::default()
            .with_reservations(
                "projects/admin/locations/US",
                vec![vec![record("first", 10.0)], vec![record("never", 10.0)]],
            )
            .fail_reservation_page("projects/admin/locations/US", 1)
            .with_reservations("projects/admin/locations/EU", vec![vec![record("etl", 100.0)]]);

        let state = discover_reservations(Arc::new(service), "admin", &locations(&["US", "EU"]), 4).await;

        assert!(state.reservations.contains_key("US.first"));
        assert!(!state.reservations.contains_key("US.never"));
        assert!(state.reservations.contains_key("EU.etl"));
    }

    #[tokio::test]
    async fn test_no_locations_yields_empty_state() {
        let state = discover_reservations(Arc::new(FakeReservations::default()), "admin", &[], 4).await;
        assert!(state.is_empty());
    }
}
