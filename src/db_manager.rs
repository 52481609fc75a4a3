//! SQLite mirror of fetched catalog cache entries.
//!
//! The mirror is best effort: callers log failures and carry on with the
//! in-memory cache.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use rusqlite::{params, Connection};

use crate::error::CatalogError;
use crate::track_cache::{CacheKey, CacheNamespace, CachedValue};

/// Row restored from the mirror at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub key: CacheKey,
    pub value: CachedValue,
    pub fetched_at_unix: i64,
}

pub struct DbManager {
    conn: Connection,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

impl DbManager {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    CatalogError::Persistence(format!(
                        "could not create {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                namespace TEXT NOT NULL,
                params TEXT NOT NULL,
                payload TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY(namespace, params)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn save_entry(
        &self,
        key: &CacheKey,
        value: &CachedValue,
        fetched_at_unix: i64,
    ) -> Result<(), CatalogError> {
        let payload = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO cache_entries (namespace, params, payload, fetched_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, params)
             DO UPDATE SET payload = excluded.payload, fetched_at = excluded.fetched_at",
            params![key.namespace.as_str(), key.params, payload, fetched_at_unix],
        )?;
        Ok(())
    }

    pub fn delete_entry(&self, key: &CacheKey) -> Result<(), CatalogError> {
        self.conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND params = ?2",
            params![key.namespace.as_str(), key.params],
        )?;
        Ok(())
    }

    /// Every decodable row. Rows with an unknown namespace or payload shape are
    /// skipped.
    pub fn load_entries(&self) -> Result<Vec<PersistedEntry>, CatalogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT namespace, params, payload, fetched_at FROM cache_entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (namespace, params, payload, fetched_at_unix) = row?;
            let Some(namespace) = CacheNamespace::parse(&namespace) else {
                warn!("DbManager: skipping row with unknown namespace '{}'", namespace);
                continue;
            };
            match serde_json::from_str::<CachedValue>(&payload) {
                Ok(value) => entries.push(PersistedEntry {
                    key: CacheKey { namespace, params },
                    value,
                    fetched_at_unix,
                }),
                Err(err) => warn!(
                    "DbManager: skipping undecodable {} entry '{}': {}",
                    namespace.as_str(),
                    params,
                    err
                ),
            }
        }
        Ok(entries)
    }

    /// Deletes rows fetched before `cutoff_unix`. Returns the number removed.
    pub fn prune_older_than(&self, cutoff_unix: i64) -> Result<usize, CatalogError> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entries WHERE fetched_at < ?1",
            params![cutoff_unix],
        )?;
        Ok(removed)
    }

    /// Drops rows older than `retention_days` relative to `now_unix`.
    pub fn prune_retention(&self, now_unix: i64, retention_days: u32) -> Result<usize, CatalogError> {
        let cutoff = now_unix.saturating_sub(i64::from(retention_days) * 24 * 60 * 60);
        self.prune_older_than(cutoff)
    }
}
