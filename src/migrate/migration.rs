//! Migration units and the ordered set the engine runs.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One versioned schema change.
///
/// Immutable once built; the checksum covers every up and down statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    version: i64,
    name: String,
    up: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down: Option<Vec<String>>,
    checksum: String,
}

impl Migration {
    /// Build a migration, computing its checksum from the statement text.
    ///
    /// `down` is `None` for migrations that cannot be reverted.
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up: Vec<String>,
        down: Option<Vec<String>>,
    ) -> Self {
        let checksum = compute_checksum(&up, down.as_deref());
        Self {
            version,
            name: name.into(),
            up,
            down,
            checksum,
        }
    }

    /// Replace the computed checksum with one supplied by the migration source.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up(&self) -> &[String] {
        &self.up
    }

    pub fn down(&self) -> Option<&[String]> {
        self.down.as_deref()
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

/// SHA-256 over the up statements, a direction marker, then the down statements.
fn compute_checksum(up: &[String], down: Option<&[String]>) -> String {
    let mut hasher = Sha256::new();
    for sql in up {
        hasher.update(sql.as_bytes());
        hasher.update(b"\n");
    }
    if let Some(down) = down {
        hasher.update(b"--down\n");
        for sql in down {
            hasher.update(sql.as_bytes());
            hasher.update(b"\n");
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Serialized form of a migration unit; the checksum is computed when absent.
#[derive(Debug, Deserialize)]
struct MigrationSource {
    version: i64,
    name: String,
    up: Vec<String>,
    #[serde(default)]
    down: Option<Vec<String>>,
    #[serde(default)]
    checksum: Option<String>,
}

impl From<MigrationSource> for Migration {
    fn from(source: MigrationSource) -> Self {
        let migration = Migration::new(source.version, source.name, source.up, source.down);
        match source.checksum {
            Some(checksum) => migration.with_checksum(checksum),
            None => migration,
        }
    }
}

/// Migrations sorted by version, with unique positive versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Sort `migrations` by version.
    ///
    /// Fails with [`DbError::DuplicateVersion`] when two share a version, and
    /// rejects versions below 1 (version 0 is reserved for the ledger itself).
    pub fn new(mut migrations: Vec<Migration>) -> DbResult<Self> {
        if let Some(m) = migrations.iter().find(|m| m.version <= 0) {
            return Err(DbError::invalid_input(format!(
                "Migration '{}' has version {}; versions must be positive (0 is reserved for the ledger)",
                m.name, m.version
            )));
        }
        if let Some(m) = migrations.iter().find(|m| m.up.is_empty()) {
            return Err(DbError::invalid_input(format!(
                "Migration {} ('{}') has no up statements",
                m.version, m.name
            )));
        }

        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(DbError::DuplicateVersion {
                version: pair[0].version,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
        Ok(Self { migrations })
    }

    /// Load a JSON array of `{version, name, up, down?, checksum?}` objects.
    pub fn from_json(json: &str) -> DbResult<Self> {
        let sources: Vec<MigrationSource> = serde_json::from_str(json)
            .map_err(|e| DbError::invalid_input(format!("Invalid migration set: {}", e)))?;
        Self::new(sources.into_iter().map(Migration::from).collect())
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(statements: &[&str]) -> Vec<String> {
        statements.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = Migration::new(1, "create_t", sql(&["CREATE TABLE t (id INT)"]), None);
        let b = Migration::new(1, "renamed", sql(&["CREATE TABLE t (id INT)"]), None);
        let c = Migration::new(1, "create_t", sql(&["CREATE TABLE t (id BIGINT)"]), None);
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_checksum_covers_down_statements() {
        let without = Migration::new(1, "m", sql(&["CREATE TABLE t (id INT)"]), None);
        let with = Migration::new(
            1,
            "m",
            sql(&["CREATE TABLE t (id INT)"]),
            Some(sql(&["DROP TABLE t"])),
        );
        assert_ne!(without.checksum(), with.checksum());
        assert!(with.is_reversible());
        assert!(!without.is_reversible());
    }

    #[test]
    fn test_statement_boundaries_matter() {
        let joined = Migration::new(1, "m", sql(&["SELECT 1; SELECT 2"]), None);
        let split = Migration::new(1, "m", sql(&["SELECT 1;", "SELECT 2"]), None);
        assert_ne!(joined.checksum(), split.checksum());
    }

    #[test]
    fn test_set_sorts_by_version() {
        let set = MigrationSet::new(vec![
            Migration::new(3, "three", sql(&["SELECT 3"]), None),
            Migration::new(1, "one", sql(&["SELECT 1"]), None),
            Migration::new(2, "two", sql(&["SELECT 2"]), None),
        ])
        .unwrap();
        let versions: Vec<i64> = set.iter().map(Migration::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(set.latest_version(), Some(3));
        assert_eq!(set.get(2).map(Migration::name), Some("two"));
        assert!(set.get(4).is_none());
    }

    #[test]
    fn test_set_rejects_duplicate_versions() {
        let err = MigrationSet::new(vec![
            Migration::new(1, "first", sql(&["SELECT 1"]), None),
            Migration::new(2, "other", sql(&["SELECT 2"]), None),
            Migration::new(1, "second", sql(&["SELECT 3"]), None),
        ])
        .unwrap_err();
        match err {
            DbError::DuplicateVersion {
                version,
                first,
                second,
            } => {
                assert_eq!(version, 1);
                assert_eq!(first, "first");
                assert_eq!(second, "second");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_set_rejects_reserved_version() {
        let err = MigrationSet::new(vec![Migration::new(0, "zero", sql(&["SELECT 1"]), None)])
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_set_rejects_empty_up() {
        let err = MigrationSet::new(vec![Migration::new(1, "empty", Vec::new(), None)]).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_from_json() {
        let json = r#"[
            {"version": 2, "name": "add_name", "up": ["ALTER TABLE t ADD COLUMN name TEXT"],
             "down": ["ALTER TABLE t DROP COLUMN name"]},
            {"version": 1, "name": "create_t", "up": ["CREATE TABLE t (id INT)"],
             "checksum": "external"}
        ]"#;
        let set = MigrationSet::from_json(json).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1).unwrap().checksum(), "external");
        assert!(set.get(2).unwrap().is_reversible());
        assert_eq!(set.get(2).unwrap().checksum().len(), 64);
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(matches!(
            MigrationSet::from_json("{\"version\": 1}"),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
