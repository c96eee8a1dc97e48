//! Transaction-related data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], " ").as_str() {
            "read uncommitted" => Ok(Self::ReadUncommitted),
            "read committed" => Ok(Self::ReadCommitted),
            "repeatable read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Rollback could not restore the connection; it must be discarded
    Failed,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended.
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A named marker on a transaction's savepoint stack.
///
/// `depth` counts from the transaction root; the first savepoint has depth 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SavepointFrame {
    pub name: String,
    pub depth: usize,
}

/// Metadata about an active transaction (for listing without touching it).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    /// Unique transaction identifier
    pub transaction_id: String,
    /// Connection this transaction runs on
    pub connection_id: String,
    pub isolation_level: IsolationLevel,
    /// When the transaction started (absolute time)
    pub started_at: DateTime<Utc>,
    /// Seconds since transaction started
    pub duration_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_isolation_level_from_str() {
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>(),
            Ok(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>(),
            Ok(IsolationLevel::ReadCommitted)
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Committed.is_active());
        assert!(TransactionState::Failed.is_ended());
        assert_eq!(TransactionState::RolledBack.to_string(), "rolled back");
    }
}
