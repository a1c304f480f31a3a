//! Reconnecting libSQL handle with a retry decorator.
//!
//! The handle is recreated, never mutated, when a connection goes stale.
//! Rebuilds are serialized so concurrent callers never race to replace it.
//! Every acquire runs a `SELECT 1` probe first. A closed handle is rebuilt
//! on the spot.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use libsql::{Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::migrations;
use crate::error::DatabaseError;
use crate::resilience::retry::{self, RetryPolicy};

/// Where the pool connects to.
#[derive(Debug, Clone)]
pub enum PoolTarget {
    Local(PathBuf),
    /// Each rebuild starts from an empty database.
    Memory,
    Remote { url: String, token: SecretString },
}

impl PoolTarget {
    /// `libsql://`, `http(s)://` and `ws(s)://` locations are remote,
    /// `:memory:` is in-memory, anything else is a file path.
    pub fn from_location(location: &str, token: Option<SecretString>) -> Self {
        let remote = ["libsql://", "http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| location.starts_with(scheme));
        if remote {
            PoolTarget::Remote {
                url: location.to_string(),
                token: token.unwrap_or_else(|| SecretString::from(String::new())),
            }
        } else if location == ":memory:" {
            PoolTarget::Memory
        } else {
            PoolTarget::Local(PathBuf::from(location))
        }
    }

    fn describe(&self) -> String {
        match self {
            PoolTarget::Local(path) => path.display().to_string(),
            PoolTarget::Memory => ":memory:".to_string(),
            PoolTarget::Remote { url, .. } => url.clone(),
        }
    }
}

struct PoolHandle {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Connection,
}

/// Owns the tracking database handle.
pub struct PooledResource {
    target: PoolTarget,
    policy: RetryPolicy,
    handle: RwLock<Option<Arc<PoolHandle>>>,
    rebuild: Mutex<()>,
    reconnects: AtomicU64,
}

impl PooledResource {
    /// Create an unconnected pool. Call [`init`](Self::init) before use, or
    /// let the first acquire connect lazily.
    pub fn new(target: PoolTarget, policy: RetryPolicy) -> Self {
        Self {
            target,
            policy,
            handle: RwLock::new(None),
            rebuild: Mutex::new(()),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Open the database and run migrations.
    pub async fn init(&self) -> Result<(), DatabaseError> {
        let _guard = self.rebuild.lock().await;
        let handle = self.open().await?;
        *self.handle.write().await = Some(Arc::new(handle));
        info!(target = %self.target.describe(), "Tracking database opened");
        Ok(())
    }

    /// Drop the handle. A later acquire reconnects.
    pub async fn shutdown(&self) {
        let _guard = self.rebuild.lock().await;
        if self.handle.write().await.take().is_some() {
            info!(target = %self.target.describe(), "Tracking database closed");
        }
    }

    /// Replace the handle with a fresh one.
    pub async fn reconnect(&self) -> Result<(), DatabaseError> {
        let _guard = self.rebuild.lock().await;
        // Close the old handle before opening the new one.
        drop(self.handle.write().await.take());
        let handle = self.open().await?;
        *self.handle.write().await = Some(Arc::new(handle));
        let n = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(target = %self.target.describe(), reconnects = n, "Tracking database reconnected");
        Ok(())
    }

    /// Completed rebuilds since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub async fn is_open(&self) -> bool {
        self.handle.read().await.is_some()
    }

    /// A probed connection. A closed pool is reconnected first.
    pub async fn acquire(&self) -> Result<Connection, DatabaseError> {
        let current = self.handle.read().await.clone();
        let handle = match current {
            Some(handle) => handle,
            None => {
                warn!(target = %self.target.describe(), "Pool closed, reconnecting before use");
                self.reconnect().await?;
                self.handle
                    .read()
                    .await
                    .clone()
                    .ok_or_else(|| DatabaseError::Pool("handle missing after reconnect".into()))?
            }
        };

        ping(&handle.conn).await?;
        Ok(handle.conn.clone())
    }

    /// Run `op` on a probed connection, reconnecting and retrying on
    /// connection-class failures.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, DatabaseError>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let op = &op;
        retry::with_retry(
            &self.policy,
            || async move {
                let conn = self.acquire().await?;
                op(conn).await
            },
            || async move {
                if let Err(e) = self.reconnect().await {
                    warn!(error = %e, "Reconnect failed, next attempt will surface it");
                }
            },
        )
        .await
    }

    async fn open(&self) -> Result<PoolHandle, DatabaseError> {
        let db = match &self.target {
            PoolTarget::Local(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                    })?;
                }
                libsql::Builder::new_local(path).build().await
            }
            PoolTarget::Memory => libsql::Builder::new_local(":memory:").build().await,
            PoolTarget::Remote { url, token } => {
                libsql::Builder::new_remote(url.clone(), token.expose_secret().to_string())
                    .build()
                    .await
            }
        }
        .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(PoolHandle { db, conn })
    }
}

/// Liveness probe. Any failure counts as connection-class.
async fn ping(conn: &Connection) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query("SELECT 1", ())
        .await
        .map_err(|e| DatabaseError::Connection(format!("Liveness probe failed: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Connection(format!("Liveness probe failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn file_pool(dir: &tempfile::TempDir) -> PooledResource {
        PooledResource::new(
            PoolTarget::Local(dir.path().join("tracking.db")),
            fast_policy(),
        )
    }

    #[test]
    fn location_parsing() {
        assert!(matches!(
            PoolTarget::from_location("libsql://db.turso.io", None),
            PoolTarget::Remote { .. }
        ));
        assert!(matches!(PoolTarget::from_location(":memory:", None), PoolTarget::Memory));
        assert!(matches!(
            PoolTarget::from_location("./data/tracking.db", None),
            PoolTarget::Local(_)
        ));
    }

    #[tokio::test]
    async fn acquire_on_open_pool_does_not_reconnect() {
        let pool = PooledResource::new(PoolTarget::Memory, fast_policy());
        pool.init().await.unwrap();
        pool.acquire().await.unwrap();
        assert_eq!(pool.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn closed_pool_reconnects_on_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir);
        pool.init().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.execute(
            "INSERT INTO tracking_orders (customer_email, order_id) VALUES ('a@b.com', '1')",
            (),
        )
        .await
        .unwrap();

        pool.shutdown().await;
        assert!(!pool.is_open().await);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.reconnect_count(), 1);

        let mut rows = conn
            .query("SELECT COUNT(*) FROM tracking_orders", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn connection_failures_trigger_reconnect_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir);
        pool.init().await.unwrap();

        let calls = AtomicU32::new(0);
        let result = pool
            .with_retry(|_conn| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DatabaseError::Connection("stream closed".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(pool.reconnect_count(), 2);
    }

    #[tokio::test]
    async fn query_failures_are_not_retried() {
        let pool = PooledResource::new(PoolTarget::Memory, fast_policy());
        pool.init().await.unwrap();

        let calls = AtomicU32::new(0);
        let result: Result<(), DatabaseError> = pool
            .with_retry(|conn| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    conn.execute("SELECT * FROM no_such_table", ())
                        .await
                        .map(|_| ())
                        .map_err(DatabaseError::from_libsql)
                }
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn sql_error_mentioning_stream_or_closed_is_not_retried() {
        let pool = PooledResource::new(PoolTarget::Memory, fast_policy());
        pool.init().await.unwrap();

        for sql in [
            "SELECT stream_id FROM tracking_orders",
            "SELECT closed_at FROM tracking_orders",
            "SELECT * FROM connection_log",
        ] {
            let calls = AtomicU32::new(0);
            let result: Result<(), DatabaseError> = pool
                .with_retry(|conn| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        conn.execute(sql, ())
                            .await
                            .map(|_| ())
                            .map_err(DatabaseError::from_libsql)
                    }
                })
                .await;

            assert!(matches!(result, Err(DatabaseError::Query(_))), "{sql}");
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{sql}");
        }
        assert_eq!(pool.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_reconnects_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(file_pool(&dir));
        pool.init().await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.reconnect().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(pool.reconnect_count(), 4);
        pool.acquire().await.unwrap();
    }
}
