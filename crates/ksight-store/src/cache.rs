//! Durable Resource Cache (C3): a single embedded SQLite file holding the
//! most recently observed, redaction-applied object per identity.

use ksight_core::{redact, strip_last_applied_annotation, ClusterId, Gvr, SensitivityPolicy, Value};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resource_cache (
    uid              TEXT PRIMARY KEY,
    cluster_id       TEXT NOT NULL,
    gvr              TEXT NOT NULL,
    namespace        TEXT NOT NULL,
    name             TEXT NOT NULL,
    resource_version TEXT NOT NULL,
    data             TEXT NOT NULL,
    is_sensitive     INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at       TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(cluster_id, gvr, namespace, name)
);
CREATE INDEX IF NOT EXISTS resource_cache_updated_at ON resource_cache(updated_at);
"#;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize cached object: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("failed to create cache data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache is closed")]
    Closed,
}

/// Per-cluster-and-aggregate introspection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: u64,
    pub sensitive: u64,
    pub per_cluster: HashMap<String, u64>,
}

/// Embedded-SQL-backed store of the most recent observed object per identity.
///
/// Writes are serialized through a single mutex-guarded connection (§4.3);
/// reads open their own short-lived read-only connection so they proceed
/// concurrently with each other and with the writer (SQLite's WAL journal
/// mode allows this on a single file).
pub struct ResourceCache {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    policy: Arc<SensitivityPolicy>,
}

impl ResourceCache {
    pub fn open(path: impl Into<PathBuf>, policy: Arc<SensitivityPolicy>) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(conn)),
            policy,
        })
    }

    fn read_conn(&self) -> Result<Connection, CacheError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Strip the last-applied annotation and apply the Redactor, without
    /// writing anything to disk.
    ///
    /// `store` and [`Self::redact_for_delivery`] both go through this single
    /// path so the two can never disagree: a caller that must deliver an
    /// object to the event handler even when the write itself failed (the
    /// Watch Worker, on a `store` error) still gets the exact same redacted
    /// value `store` would have written, never the raw pre-redaction input.
    fn prepare(&self, gvr: &Gvr, object: &Value) -> (Value, bool) {
        let mut data = object.clone();
        strip_last_applied_annotation(&mut data);
        let kind = extract_kind(&data).unwrap_or_default();
        redact(&self.policy, &gvr.group, &kind, &data)
    }

    /// Strip the last-applied annotation and redact `object` as if it were
    /// about to be stored, without touching the database.
    ///
    /// Used as a correctness fallback when [`Self::store`] itself fails: a
    /// caller must never fall back to delivering the raw, pre-redaction
    /// object to the event handler just because the write failed.
    pub fn redact_for_delivery(&self, gvr: &Gvr, object: &Value) -> Value {
        self.prepare(gvr, object).0
    }

    /// Upsert. Strips the last-applied annotation, consults the Redactor,
    /// serializes, and writes with `is_sensitive` set accordingly.
    ///
    /// Returns `(is_sensitive, stored_object)` — `stored_object` is exactly
    /// what was written (redacted if sensitive), so a caller forwarding an
    /// event alongside the cache write never has to hold its own policy
    /// instance or redact a second time.
    pub fn store(
        &self,
        cluster: &ClusterId,
        gvr: &Gvr,
        uid: &str,
        namespace: &str,
        name: &str,
        resource_version: &str,
        object: &Value,
    ) -> Result<(bool, Value), CacheError> {
        let (redacted, is_sensitive) = self.prepare(gvr, object);
        let serialized = serde_json::to_string(&serde_json::Value::from(redacted.clone()))?;

        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(CacheError::Closed)?;
        conn.execute(
            r#"
            INSERT INTO resource_cache
                (uid, cluster_id, gvr, namespace, name, resource_version, data, is_sensitive, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'), datetime('now'))
            ON CONFLICT(uid) DO UPDATE SET
                cluster_id = excluded.cluster_id,
                gvr = excluded.gvr,
                namespace = excluded.namespace,
                name = excluded.name,
                resource_version = excluded.resource_version,
                data = excluded.data,
                is_sensitive = excluded.is_sensitive,
                updated_at = datetime('now')
            ON CONFLICT(cluster_id, gvr, namespace, name) DO UPDATE SET
                uid = excluded.uid,
                resource_version = excluded.resource_version,
                data = excluded.data,
                is_sensitive = excluded.is_sensitive,
                updated_at = datetime('now')
            "#,
            rusqlite::params![
                uid,
                cluster.as_str(),
                gvr.to_key(),
                namespace,
                name,
                resource_version,
                serialized,
                is_sensitive,
            ],
        )?;
        Ok((is_sensitive, redacted))
    }

    /// Point read. Returns `(object, is_sensitive)`, where `object` is the
    /// redacted twin if the row was stored sensitive.
    pub fn get(
        &self,
        cluster: &ClusterId,
        gvr: &Gvr,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(Value, bool)>, CacheError> {
        let conn = self.read_conn()?;
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT data, is_sensitive FROM resource_cache WHERE cluster_id = ?1 AND gvr = ?2 AND namespace = ?3 AND name = ?4",
                rusqlite::params![cluster.as_str(), gvr.to_key(), namespace, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((data, is_sensitive)) => {
                let value: serde_json::Value = serde_json::from_str(&data)?;
                Ok(Some((value.into(), is_sensitive)))
            }
            None => Ok(None),
        }
    }

    /// Used to warm the in-memory informer cache at startup. `latest-version`
    /// is the lexicographically-greatest resource-version across the
    /// returned rows. Resource versions are opaque and not reliably ordered
    /// this way in general (see `DESIGN.md`) — callers should prefer the
    /// Resource-Version Store as the authoritative resume point and treat
    /// this value as informational only.
    pub fn load_all(&self, cluster: &ClusterId, gvr: &Gvr) -> Result<(Vec<Value>, String), CacheError> {
        let conn = self.read_conn()?;
        let mut stmt =
            conn.prepare("SELECT data, resource_version FROM resource_cache WHERE cluster_id = ?1 AND gvr = ?2")?;
        let rows = stmt.query_map(rusqlite::params![cluster.as_str(), gvr.to_key()], |row| {
            let data: String = row.get(0)?;
            let version: String = row.get(1)?;
            Ok((data, version))
        })?;

        let mut objects = Vec::new();
        let mut latest_version = String::new();
        for row in rows {
            let (data, version) = row?;
            let value: serde_json::Value = serde_json::from_str(&data)?;
            objects.push(Value::from(value));
            if version > latest_version {
                latest_version = version;
            }
        }
        Ok((objects, latest_version))
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.read_conn()?;
        let mut stats = CacheStats::default();
        let mut stmt = conn.prepare("SELECT cluster_id, is_sensitive, COUNT(*) FROM resource_cache GROUP BY cluster_id, is_sensitive")?;
        let rows = stmt.query_map([], |row| {
            let cluster: String = row.get(0)?;
            let is_sensitive: bool = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((cluster, is_sensitive, count as u64))
        })?;
        for row in rows {
            let (cluster, is_sensitive, count) = row?;
            stats.total += count;
            if is_sensitive {
                stats.sensitive += count;
            }
            *stats.per_cluster.entry(cluster).or_insert(0) += count;
        }
        Ok(stats)
    }

    /// Delete rows whose `updated_at` precedes `now - age`. Returns the
    /// number of rows removed.
    pub fn clean_older_than(&self, age: Duration) -> Result<u64, CacheError> {
        let seconds = age.as_secs();
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(CacheError::Closed)?;
        let deleted = conn.execute(
            "DELETE FROM resource_cache WHERE updated_at < datetime('now', ?1)",
            rusqlite::params![format!("-{seconds} seconds")],
        )?;
        Ok(deleted as u64)
    }

    /// Release the database file. Safe to call multiple times.
    pub fn close(&self) {
        self.writer.lock().take();
    }
}

fn extract_kind(object: &Value) -> Option<String> {
    match object.as_object()?.get("kind")? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_with_default_policy() -> (tempfile::TempDir, ResourceCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResourceCache::open(
            dir.path().join("cache").join("resource_cache.db"),
            Arc::new(SensitivityPolicy::default_policy()),
        )
        .unwrap();
        (dir, cache)
    }

    fn pod(name: &str) -> Value {
        json!({"kind": "Pod", "apiVersion": "v1", "metadata": {"name": name}, "status": {"phase": "Running"}}).into()
    }

    #[test]
    fn store_then_get_round_trips() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        let (is_sensitive, _) = cache.store(&cluster, &gvr, "uid-1", "default", "p", "100", &pod("p")).unwrap();
        assert!(!is_sensitive);

        let (obj, sensitive) = cache.get(&cluster, &gvr, "default", "p").unwrap().unwrap();
        assert!(!sensitive);
        let back: serde_json::Value = obj.into();
        assert_eq!(back["metadata"]["name"], "p");
    }

    #[test]
    fn upsert_by_identity_replaces_prior_row() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        cache.store(&cluster, &gvr, "uid-1", "default", "p", "100", &pod("p")).unwrap();
        cache.store(&cluster, &gvr, "uid-1", "default", "p", "101", &pod("p")).unwrap();

        let (objects, latest) = cache.load_all(&cluster, &gvr).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(latest, "101");
    }

    #[test]
    fn secret_is_redacted_before_storage() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "secrets");
        let secret: Value = json!({
            "kind": "Secret",
            "apiVersion": "v1",
            "metadata": {"name": "s"},
            "data": {"password": "c2VjcmV0"}
        })
        .into();
        let (is_sensitive, redacted) = cache.store(&cluster, &gvr, "uid-2", "default", "s", "1", &secret).unwrap();
        assert!(is_sensitive);
        let redacted_json: serde_json::Value = redacted.into();
        assert_eq!(redacted_json["data"], "<redacted>");

        let (obj, sensitive) = cache.get(&cluster, &gvr, "default", "s").unwrap().unwrap();
        assert!(sensitive);
        let back: serde_json::Value = obj.into();
        assert_eq!(back["data"], "<redacted>");
    }

    #[test]
    fn last_applied_annotation_is_stripped() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        let obj: Value = json!({
            "kind": "Pod",
            "metadata": {
                "name": "p",
                "annotations": {"kubectl.kubernetes.io/last-applied-configuration": "{}", "keep": "me"}
            }
        })
        .into();
        cache.store(&cluster, &gvr, "uid-3", "default", "p", "1", &obj).unwrap();
        let (got, _) = cache.get(&cluster, &gvr, "default", "p").unwrap().unwrap();
        let back: serde_json::Value = got.into();
        assert_eq!(back["metadata"]["annotations"]["keep"], "me");
        assert!(back["metadata"]["annotations"].get("kubectl.kubernetes.io/last-applied-configuration").is_none());
    }

    #[test]
    fn get_on_miss_returns_none() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        assert!(cache.get(&cluster, &gvr, "default", "missing").unwrap().is_none());
    }

    #[test]
    fn stats_counts_total_sensitive_and_per_cluster() {
        let (_dir, cache) = cache_with_default_policy();
        let gvr_pods = Gvr::new("", "v1", "pods");
        let gvr_secrets = Gvr::new("", "v1", "secrets");
        cache.store(&ClusterId::new("c1"), &gvr_pods, "u1", "default", "p", "1", &pod("p")).unwrap();
        cache
            .store(
                &ClusterId::new("c2"),
                &gvr_secrets,
                "u2",
                "default",
                "s",
                "1",
                &json!({"kind": "Secret", "data": {"a": "b"}}).into(),
            )
            .unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.sensitive, 1);
        assert_eq!(stats.per_cluster.get("c1"), Some(&1));
        assert_eq!(stats.per_cluster.get("c2"), Some(&1));
    }

    #[test]
    fn clean_older_than_removes_stale_rows() {
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        cache.store(&cluster, &gvr, "u1", "default", "p", "1", &pod("p")).unwrap();

        // future cutoff: everything is "older" than now + 1 hour ago from now... use a 0s window
        // so nothing is stale yet - a 0 age should not delete freshly-written rows.
        let deleted = cache.clean_older_than(Duration::from_secs(3600)).unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn redact_for_delivery_matches_what_store_would_have_written() {
        let (_dir, cache) = cache_with_default_policy();
        let gvr = Gvr::new("", "v1", "secrets");
        let secret: Value = json!({
            "kind": "Secret",
            "apiVersion": "v1",
            "metadata": {"name": "s"},
            "data": {"password": "c2VjcmV0"}
        })
        .into();

        let delivered = cache.redact_for_delivery(&gvr, &secret);
        let delivered_json: serde_json::Value = delivered.into();
        assert_eq!(delivered_json["data"], "<redacted>");
        assert_eq!(delivered_json["metadata"]["name"], "s");
    }

    #[test]
    fn close_is_idempotent() {
        let (_dir, cache) = cache_with_default_policy();
        cache.close();
        cache.close();
    }

    #[test]
    fn cluster_scoped_rows_are_retained_across_cluster_removal() {
        // The cache has no notion of cluster lifecycle; removal is purely a
        // Manager/VersionStore concern. A re-add of the same cluster id
        // therefore transparently reuses any rows already on disk.
        let (_dir, cache) = cache_with_default_policy();
        let cluster = ClusterId::new("c1");
        let gvr = Gvr::new("", "v1", "pods");
        cache.store(&cluster, &gvr, "u1", "default", "p", "5", &pod("p")).unwrap();
        let (objects, _) = cache.load_all(&cluster, &gvr).unwrap();
        assert_eq!(objects.len(), 1);
    }
}
