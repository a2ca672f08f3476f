use crate::state::{PipelineState, Reservation};

/// Percentage reported for a busy reservation with no slot capacity.
pub const NOT_COMPUTABLE: &str = "n/a";

/// Fills in job counts, totals, and breach flags for every reservation.
pub fn aggregate(state: &mut PipelineState, threshold: f64) {
    for reservation in state.reservations.values_mut() {
        aggregate_reservation(reservation, threshold);
    }
}

pub fn aggregate_reservation(reservation: &mut Reservation, threshold: f64) {
    let total_usage: f64 = reservation.jobs.iter().map(|job| job.usage).sum();

    reservation.num_jobs = reservation.jobs.len();
    reservation.total_usage = total_usage;
    reservation.total_usage_ceiling = total_usage.ceil() as i64;

    if reservation.slots > 0.0 {
        let utilization = total_usage / reservation.slots;
        reservation.threshold_breached = utilization >= threshold;
        reservation.percentage = format!("{:.2}", utilization * 100.0);
    } else if total_usage > 0.0 {
        // Capacity-less reservation that is still running work, e.g. autoscale-only
        reservation.threshold_breached = true;
        reservation.percentage = NOT_COMPUTABLE.to_string();
    } else {
        reservation.threshold_breached = false;
        reservation.percentage = format!("{:.2}", 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Job;

    fn job(name: &str, usage: f64) -> Job {
        Job {
            name: name.to_string(),
            usage,
        }
    }

    fn reservation(slots: f64, usages: &[f64]) -> Reservation {
        let mut reservation = Reservation::new("US", "r", slots);
        reservation.jobs = usages
            .iter()
            .enumerate()
            .map(|(i, usage)| job(&format!("job_{i}"), *usage))
            .collect();
        reservation
    }

    #[test]
    fn test_idle_reservation() {
        let mut r = reservation(100.0, &[]);
        aggregate_reservation(&mut r, 0.8);

        assert_eq!(r.num_jobs, 0);
        assert_eq!(r.total_usage, 0.0);
        assert_eq!(r.total_usage_ceiling, 0);
        assert!(!r.threshold_breached);
        assert_eq!(r.percentage, "0.00");
    }

    #[test]
    fn test_two_queries_against_ten_slots() {
        let mut r = reservation(10.0, &[4.0, 3.0]);
        aggregate_reservation(&mut r, 0.6);

        assert_eq!(r.num_jobs, 2);
        assert_eq!(r.total_usage, 7.0);
        assert_eq!(r.total_usage_ceiling, 7);
        assert_eq!(r.percentage, "70.00");
        assert!(r.threshold_breached);

        aggregate_reservation(&mut r, 0.8);
        assert!(!r.threshold_breached);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut at = reservation(10.0, &[8.0]);
        aggregate_reservation(&mut at, 0.8);
        assert!(at.threshold_breached);

        let mut below = reservation(10.0, &[7.0]);
        aggregate_reservation(&mut below, 0.8);
        assert!(!below.threshold_breached);
    }

    #[test]
    fn test_ceiling_and_oversubscription() {
        let mut r = reservation(2.0, &[1.25, 1.5]);
        aggregate_reservation(&mut r, 0.8);

        assert_eq!(r.total_usage_ceiling, 3);
        assert_eq!(r.percentage, "137.50");
        assert!(r.threshold_breached);
    }

    #[test]
    fn test_order_does_not_change_totals() {
        let mut forward = reservation(50.0, &[0.5, 2.0, 4.0]);
        let mut backward = reservation(50.0, &[4.0, 2.0, 0.5]);
        aggregate_reservation(&mut forward, 0.8);
        aggregate_reservation(&mut backward, 0.8);

        assert_eq!(forward.total_usage, backward.total_usage);
        assert_eq!(forward.num_jobs, backward.num_jobs);
        assert_eq!(forward.percentage, backward.percentage);
    }

    #[test]
    fn test_zero_slots() {
        let mut idle = reservation(0.0, &[]);
        aggregate_reservation(&mut idle, 0.8);
        assert!(!idle.threshold_breached);
        assert_eq!(idle.percentage, "0.00");

        let mut busy = reservation(0.0, &[0.5]);
        aggregate_reservation(&mut busy, 0.8);
        assert!(busy.threshold_breached);
        assert_eq!(busy.percentage, NOT_COMPUTABLE);
        assert_eq!(busy.total_usage, 0.5);
        assert_eq!(busy.total_usage_ceiling, 1);
    }

    #[test]
    fn test_aggregate_covers_every_reservation() {
        let mut state: PipelineState = [reservation(10.0, &[9.0])].into_iter().collect();
        let mut other = reservation(10.0, &[1.0]);
        other.name = "other".to_string();
        state.reservations.insert(other.key(), other);

        aggregate(&mut state, 0.8);

        assert!(state.reservations["US.r"].threshold_breached);
        assert!(!state.reservations["US.other"].threshold_breached);
        assert_eq!(state.reservations["US.other"].num_jobs, 1);
    }
}
