//! Per-run pipeline state.
//!
//! A [`PipelineState`] is built fresh on every run and handed to the alert renderer and the
//! snapshot sink once aggregation has finished. The serialized field names are the contract both
//! of those consumers read.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Key under which a reservation is stored: `"<location>.<name>"`.
pub fn reservation_key(location: &str, name: &str) -> String {
    format!("{location}.{name}")
}

/// A single running query attached to a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Average concurrent slots consumed: total slot-ms over elapsed ms
    pub usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub name: String,
    pub location: String,
    pub slots: f64,
    /// Consumer projects drawing from this reservation, deduplicated
    pub projects: Vec<String>,
    pub jobs: Vec<Job>,
    pub num_jobs: usize,
    pub total_usage: f64,
    pub total_usage_ceiling: i64,
    pub threshold_breached: bool,
    pub percentage: String,
}

impl Reservation {
    /// Creates an empty reservation as produced by discovery.
    pub fn new(location: impl Into<String>, name: impl Into<String>, slots: f64) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            slots,
            projects: Vec::new(),
            jobs: Vec::new(),
            num_jobs: 0,
            total_usage: 0.0,
            total_usage_ceiling: 0,
            threshold_breached: false,
            percentage: String::new(),
        }
    }

    pub fn key(&self) -> String {
        reservation_key(&self.location, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub reservations: BTreeMap<String, Reservation>,
}

impl PipelineState {
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn any_breached(&self) -> bool {
        self.reservations.values().any(|r| r.threshold_breached)
    }

    pub fn breached(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.threshold_breached)
    }
}

impl FromIterator<Reservation> for PipelineState {
    fn from_iter<I: IntoIterator<Item = Reservation>>(iter: I) -> Self {
        Self {
            reservations: iter.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }
}

/// Removes duplicate and empty account ids, keeping the first occurrence of each.
pub fn dedup_accounts(accounts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(accounts.len());
    accounts
        .into_iter()
        .filter(|account| !account.is_empty() && seen.insert(account.clone()))
        .collect()
}
