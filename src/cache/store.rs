//! Persistent formula cache backed by a single SQLite file.
//!
//! One table, `katex_cache (hash TEXT PRIMARY KEY, html TEXT)`. Entries are
//! never evicted; a newer render for the same key replaces the older one.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Instant,
};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, warn};

use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS katex_cache (hash TEXT PRIMARY KEY, html TEXT)";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to prepare cache directory `{path}`: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open cache database `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("cache query failed: {0}")]
    Query(#[source] rusqlite::Error),
    #[error("cache write failed: {0}")]
    Write(#[source] rusqlite::Error),
}

/// Durable key → markup table.
///
/// The connection sits behind a mutex so the store can be shared between
/// threads; readers and writers are serialized on it.
pub struct CacheStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open (or create) the cache file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CacheError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let open_err = |source| CacheError::Open {
            path: path.clone(),
            source,
        };
        let conn = Connection::open(&path).map_err(open_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(open_err)?;
        conn.execute_batch(SCHEMA).map_err(open_err)?;

        debug!(
            target = SOURCE,
            op = "cache::open",
            path = %path.display(),
            "Formula cache opened"
        );

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, mostly useful for tests and dry runs.
    pub fn in_memory() -> Result<Self, CacheError> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| CacheError::Open {
            path: path.clone(),
            source,
        })?;
        conn.execute_batch(SCHEMA).map_err(CacheError::Query)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let conn = mutex_lock(&self.conn, SOURCE, "get");
        let mut stmt = conn
            .prepare_cached("SELECT html FROM katex_cache WHERE hash = ?1")
            .map_err(CacheError::Query)?;
        stmt.query_row(params![key.as_str()], |row| row.get::<_, Option<String>>(0))
            .optional()
            .map(Option::flatten)
            .map_err(CacheError::Query)
    }

    /// Write all entries in one transaction. Returns the number of rows written.
    pub fn put_many(&self, entries: &[(CacheKey, String)]) -> Result<usize, CacheError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let started_at = Instant::now();
        let mut conn = mutex_lock(&self.conn, SOURCE, "put_many");
        let tx = conn.transaction().map_err(CacheError::Write)?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT OR REPLACE INTO katex_cache (hash, html) VALUES (?1, ?2)")
                .map_err(CacheError::Write)?;
            for (key, html) in entries {
                stmt.execute(params![key.as_str(), html])
                    .map_err(CacheError::Write)?;
            }
        }
        tx.commit().map_err(CacheError::Write)?;

        debug!(
            target = SOURCE,
            op = "cache::put_many",
            entries = entries.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Formula cache entries written"
        );
        Ok(entries.len())
    }

    pub fn len(&self) -> Result<u64, CacheError> {
        let conn = mutex_lock(&self.conn, SOURCE, "len");
        conn.query_row("SELECT COUNT(*) FROM katex_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|count| u64::try_from(count).unwrap_or_default())
        .map_err(CacheError::Query)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry. Returns the number of rows deleted.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let conn = mutex_lock(&self.conn, SOURCE, "clear");
        conn.execute("DELETE FROM katex_cache", [])
            .map_err(CacheError::Write)
    }

    /// Close the underlying connection, logging (not returning) close failures.
    pub fn close(self) {
        let path = self.path;
        let conn = match self.conn.into_inner() {
            Ok(conn) => conn,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err((_conn, err)) = conn.close() {
            warn!(
                target = SOURCE,
                op = "cache::close",
                result = "error",
                path = %path.display(),
                error = %err,
                "Failed to close formula cache cleanly"
            );
        }
    }
}
