//! Transport-independent records returned by the upstream services.

use std::fmt;
use std::str::FromStr;

/// A reservation as listed by the reservation service.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRecord {
    /// Short name (last segment of the resource path)
    pub name: String,
    pub slot_capacity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssigneeKind {
    Account,
    Folder,
    Organization,
}

impl AssigneeKind {
    /// Collection segment used in resource paths.
    pub fn collection(&self) -> &'static str {
        match self {
            AssigneeKind::Account => "projects",
            AssigneeKind::Folder => "folders",
            AssigneeKind::Organization => "organizations",
        }
    }
}

/// Who a reservation's capacity is granted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Assignee {
    pub kind: AssigneeKind,
    pub id: String,
}

impl Assignee {
    pub fn new(kind: AssigneeKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    /// Fully-qualified resource path, e.g. `folders/123`.
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.kind.collection(), self.id)
    }
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.collection(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAssignee(pub String);

impl fmt::Display for UnknownAssignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized assignee '{}'", self.0)
    }
}

impl std::error::Error for UnknownAssignee {}

impl FromStr for Assignee {
    type Err = UnknownAssignee;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, id) = s.split_once('/').ok_or_else(|| UnknownAssignee(s.to_string()))?;
        if id.is_empty() {
            return Err(UnknownAssignee(s.to_string()));
        }
        let kind = match collection {
            "projects" => AssigneeKind::Account,
            "folders" => AssigneeKind::Folder,
            "organizations" => AssigneeKind::Organization,
            _ => return Err(UnknownAssignee(s.to_string())),
        };
        Ok(Assignee::new(kind, id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    /// Raw `<kind>/<id>` assignee string
    pub assignee: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
}

/// Reference to a running workload, enough to fetch its detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadKind {
    Query,
    Load,
    Copy,
    Extract,
    Unknown(String),
}

impl From<&str> for WorkloadKind {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "QUERY" => WorkloadKind::Query,
            "LOAD" => WorkloadKind::Load,
            "COPY" => WorkloadKind::Copy,
            "EXTRACT" => WorkloadKind::Extract,
            _ => WorkloadKind::Unknown(value.to_string()),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Query => f.write_str("query"),
            WorkloadKind::Load => f.write_str("load"),
            WorkloadKind::Copy => f.write_str("copy"),
            WorkloadKind::Extract => f.write_str("extract"),
            WorkloadKind::Unknown(other) => write!(f, "unknown({other})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSample {
    pub elapsed_ms: i64,
    pub total_slot_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadDetail {
    pub id: String,
    pub kind: WorkloadKind,
    pub timeline: Vec<TimelineSample>,
    /// Reservation the job actually ran under, `project:location.name`
    pub reservation_id: Option<String>,
}

impl WorkloadDetail {
    /// The most advanced timeline sample with positive elapsed time. Ties keep the earlier sample.
    pub fn latest_sample(&self) -> Option<TimelineSample> {
        self.timeline
            .iter()
            .copied()
            .filter(|sample| sample.elapsed_ms > 0)
            .fold(None, |latest, sample| match latest {
                Some(current) if sample.elapsed_ms <= current.elapsed_ms => Some(current),
                _ => Some(sample),
            })
    }
}
