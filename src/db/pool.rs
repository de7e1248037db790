// src/db/pool.rs
// Async connection pool using deadpool-sqlite, with sqlite-vec loaded
//
// All database access goes through `interact()` (anyhow) or `run()`
// (VellumError): both execute the closure on a blocking thread so the
// cooperative scheduler is never starved by SQLite work. The SQLite
// connection is single-writer, many-reader; WAL + busy_timeout handle the
// write contention that the pool's concurrency can produce, and a short
// fixed backoff ladder retries the rare SQLITE_BUSY that escapes it.

use crate::error::VellumError;
use crate::utils::path_to_string;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;

/// Registers sqlite-vec extension globally (once per process).
/// Must be called before any SQLite connections are opened.
static SQLITE_VEC_INIT: Once = Once::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn ensure_sqlite_vec_registered() {
    SQLITE_VEC_INIT.call_once(|| {
        // SAFETY: sqlite3_vec_init has the signature expected by
        // sqlite3_auto_extension; the fn pointer is a statically-linked
        // symbol and stays valid for the life of the process.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec extension registered globally");
    });
}

/// SQLITE_BUSY (file DBs under write contention) or SQLITE_LOCKED
/// (shared-cache in-memory DBs).
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Walk an anyhow chain looking for a SQLite contention error.
fn is_contention(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<rusqlite::Error>() {
        return is_rusqlite_contention(e);
    }
    if let Some(VellumError::Db(e)) = err.downcast_ref::<VellumError>() {
        return is_rusqlite_contention(e);
    }
    false
}

/// Retry delays for SQLite contention backoff.
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// Pool wrapper with sqlite-vec support and per-connection PRAGMA setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (shares state between pool connections).
    memory_uri: Option<String>,
}

impl DatabasePool {
    /// Open a pooled database at the given path and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        ensure_sqlite_vec_registered();
        ensure_parent_directory(path)?;

        let conn_str = path_to_string(path);
        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(make_post_create_hook(false))
            .build()
            .context("Failed to build connection pool")?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
            memory_uri: None,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open a pooled in-memory database (tests).
    ///
    /// Uses a shared-cache URI so every pooled connection sees the same
    /// in-memory state; without it each connection would get a private DB.
    pub async fn open_in_memory() -> Result<Self> {
        ensure_sqlite_vec_registered();
        let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());

        let cfg = Config::new(&uri);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(8)
            .post_create(make_post_create_hook(true))
            .build()
            .context("Failed to build connection pool")?;

        let db = Self {
            pool,
            path: None,
            memory_uri: Some(uri),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get the memory URI (for sharing state in tests).
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a pooled connection on a blocking thread.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Like [`interact`](Self::interact) for closures returning rusqlite
    /// results directly.
    pub async fn interact_raw<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.interact(move |conn| f(conn).map_err(Into::into)).await
    }

    /// Run a closure, converting errors to `VellumError` for service-layer
    /// callers.
    pub async fn run<F, R, E>(&self, f: F) -> std::result::Result<R, VellumError>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<VellumError> + Send + 'static,
    {
        self.pool
            .get()
            .await
            .map_err(|e| VellumError::Other(format!("Failed to get connection: {}", e)))?
            .interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| VellumError::Other(format!("Database error: {}", e)))?
    }

    /// Run a closure with retry on SQLite contention, using the fixed
    /// backoff ladder. For writes that must not be lost (message persistence,
    /// conversation deletes). The closure must be `Clone` to support retries.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        for delay in RETRY_DELAYS.iter() {
            let attempt = f.clone();
            match self.interact(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if is_contention(&e) => {
                    tracing::warn!("SQLite contention, retrying in {:?}", delay);
                    tokio::time::sleep(*delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.interact(f).await
    }

    /// Run a closure, logging failures at debug without propagating.
    /// For best-effort operations (open-count bumps, statistics).
    pub async fn try_interact<F, R>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let label = label.to_string();
        match self.interact(f).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("{}: {}", label, e);
                None
            }
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            super::schema::run_all_migrations(conn)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }
}

/// Ensure parent directory exists with restricted permissions on Unix.
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

/// post_create hook: configure PRAGMAs on each new pooled connection.
fn make_post_create_hook(in_memory: bool) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(move |conn| {
                if in_memory {
                    // WAL is not applicable to in-memory databases
                    conn.execute_batch(
                        "PRAGMA foreign_keys=ON; \
                         PRAGMA busy_timeout=5000;",
                    )?;
                } else {
                    conn.execute_batch(
                        "PRAGMA journal_mode=WAL; \
                         PRAGMA foreign_keys=ON; \
                         PRAGMA busy_timeout=5000; \
                         PRAGMA synchronous=NORMAL; \
                         PRAGMA journal_size_limit=32768;",
                    )?;
                }
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory_shares_state() {
        let pool = DatabasePool::open_in_memory().await.expect("open pool");

        let rowid = pool
            .interact(|conn| {
                conn.execute(
                    "INSERT INTO doc_meta (id, path, mtime, ctime, content_hash, word_count, link_count, tags)
                     VALUES ('d1', 'notes/a.md', 0, 0, 'h', 10, 0, '[]')",
                    [],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .expect("insert");
        assert!(rowid > 0);

        // Read from another pooled connection (exercises shared cache)
        let path: String = pool
            .interact(|conn| {
                conn.query_row("SELECT path FROM doc_meta WHERE id = 'd1'", [], |row| {
                    row.get(0)
                })
                .map_err(Into::into)
            })
            .await
            .expect("query");
        assert_eq!(path, "notes/a.md");
    }

    #[tokio::test]
    async fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vault/index.db");
        let pool = DatabasePool::open(&db_path).await.expect("open file pool");
        assert_eq!(pool.path(), Some(db_path.as_path()));
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_writes() {
        let pool = std::sync::Arc::new(DatabasePool::open_in_memory().await.unwrap());

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO doc_meta (id, path, mtime, ctime, content_hash, word_count, link_count, tags)
                         VALUES (?, ?, 0, 0, 'h', 0, 0, '[]')",
                        rusqlite::params![format!("doc-{i}"), format!("notes/{i}.md")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("concurrent write failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM doc_meta", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_retry_fails_fast_on_sql_error() {
        let pool = DatabasePool::open_in_memory().await.unwrap();
        let result = pool
            .interact_with_retry(|conn| {
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_contention_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        );
        assert!(is_rusqlite_contention(&busy));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                extended_code: 19,
            },
            None,
        );
        assert!(!is_rusqlite_contention(&constraint));

        // String-only anyhow errors never count as contention
        assert!(!is_contention(&anyhow::anyhow!("database is locked")));
    }
}
