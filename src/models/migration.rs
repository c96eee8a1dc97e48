//! Migration ledger and run-result models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of the migration ledger: one per applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Migration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Status of one version, merged from the migration set and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Pending, but a higher version is already applied
    pub out_of_order: bool,
    /// Applied, but absent from the migration set
    pub missing_source: bool,
}

/// Outcome of a `migrate_up` or `migrate_down` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub direction: MigrationDirection,
    /// Versions whose statements ran and were committed, in execution order
    pub executed: Vec<i64>,
    /// Last version committed by this run
    pub last_completed: Option<i64>,
    /// True when the run stopped early because cancellation was requested
    pub cancelled: bool,
}

impl MigrationReport {
    pub(crate) fn new(direction: MigrationDirection) -> Self {
        Self {
            direction,
            executed: Vec::new(),
            last_completed: None,
            cancelled: false,
        }
    }

    pub(crate) fn record(&mut self, version: i64) {
        self.executed.push(version);
        self.last_completed = Some(version);
    }

    /// True when the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.executed.is_empty()
    }
}
