//! Prometheus metrics for pipeline runs.
//!
//! Everything goes through the `metrics` facade; series show up on `/internal/metrics` once
//! [`install_recorder`] has run.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::warn;

use crate::cache::CacheOutcome;
use crate::state::PipelineState;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder on first call and returns its handle.
pub fn install_recorder() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                warn!("metrics recorder already installed: {}", e);
            }
            handle
        })
        .clone()
}

/// Per-reservation utilization and running query counts from the latest run.
pub fn record_state(state: &PipelineState) {
    for (key, reservation) in &state.reservations {
        let utilization = if reservation.slots > 0.0 {
            reservation.total_usage / reservation.slots
        } else {
            0.0
        };
        gauge!("slotwatch_reservation_utilization_ratio", "reservation" => key.clone()).set(utilization);
        gauge!("slotwatch_reservation_jobs", "reservation" => key.clone()).set(reservation.num_jobs as f64);
        gauge!("slotwatch_reservation_breached", "reservation" => key.clone())
            .set(if reservation.threshold_breached { 1.0 } else { 0.0 });
    }
}

pub fn record_cache_lookup(outcome: CacheOutcome) {
    counter!("slotwatch_hierarchy_cache_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn record_run(outcome: &'static str) {
    counter!("slotwatch_pipeline_runs_total", "outcome" => outcome).increment(1);
}

pub fn record_alerts(delivered: usize) {
    counter!("slotwatch_alerts_delivered_total").increment(delivered as u64);
}
