//! Implements a Postgres connection pool and statement cache.
//!
//! Unlike deadpool-postgres, we:
//! - limit the number of cached prepared statements owned by each connection
//!   in order to avoid high/unbounded memory usage on the Postgres server
//! - automatically clean up idle connections.

use std::collections::VecDeque;
use std::future;
use std::num::NonZeroUsize;
use std::sync::atomic::{
    self,
    AtomicBool,
};
use std::sync::{
    Arc,
    LazyLock,
    Weak,
};
use std::task::{
    ready,
    Poll,
};
use std::time::Duration;

use anyhow::Context as _;
use errors::ErrorMetadata;
use futures::future::Future;
use futures::{
    select_biased,
    FutureExt as _,
};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{
    oneshot,
    OwnedSemaphorePermit,
    Semaphore,
};
use tokio::task::JoinHandle;
use tokio::time::{
    sleep,
    Instant,
};
use tokio_postgres::types::ToSql;
use tokio_postgres::{
    AsyncMessage,
    Row,
    Statement,
};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::env_config;

static POSTGRES_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("POSTGRES_MAX_CONNECTIONS", 10));
static POSTGRES_MAX_CACHED_STATEMENTS: LazyLock<usize> =
    LazyLock::new(|| env_config("POSTGRES_MAX_CACHED_STATEMENTS", 256));
static POSTGRES_INACTIVE_CONNECTION_LIFETIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("POSTGRES_INACTIVE_CONNECTION_LIFETIME_SECS", 300))
});
static POSTGRES_TIMEOUT: LazyLock<u64> = LazyLock::new(|| env_config("POSTGRES_TIMEOUT_SECONDS", 60));

#[derive(Debug, thiserror::Error)]
#[error("Postgres timeout")]
pub struct PostgresTimeout;

/// Wraps anything that talks to Postgres so a wedged connection surfaces as
/// an error instead of hanging its task forever. Connections that time out
/// are poisoned and not returned to the pool.
pub(crate) async fn with_timeout<R, E, Fut: Future<Output = Result<R, E>>>(
    f: Fut,
) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
{
    select_biased! {
        r = f.fuse() => {
            match r {
                Ok(r) => Ok(r),
                Err(e) => Err(e.into()),
            }
        },
        _ = sleep(Duration::from_secs(*POSTGRES_TIMEOUT)).fuse() => {
            Err(anyhow::anyhow!(PostgresTimeout))
        },
    }
}

type StatementCache = LruCache<String, Statement>;

/// A Postgres connection, owned by either the pool ([`MundiPgPool`]) or an
/// active borrow ([`PgConnection`]).
struct PooledConnection {
    client: tokio_postgres::Client,
    statement_cache: Mutex<StatementCache>,
    last_used: Instant,
}

impl PooledConnection {
    fn new(client: tokio_postgres::Client) -> Self {
        let capacity = NonZeroUsize::new(*POSTGRES_MAX_CACHED_STATEMENTS)
            .unwrap_or(NonZeroUsize::new(256).expect("nonzero"));
        Self {
            client,
            statement_cache: Mutex::new(LruCache::new(capacity)),
            last_used: Instant::now(),
        }
    }
}

async fn prepare_cached(
    client: &tokio_postgres::Client,
    cache: &Mutex<StatementCache>,
    statement: &str,
) -> anyhow::Result<Statement> {
    if let Some(prepared) = cache.lock().get(statement) {
        return Ok(prepared.clone());
    }
    let prepared = client.prepare(statement).await?;
    // If the cache is at capacity this drops the oldest statement, which
    // sends a message on the connection asking to deallocate it.
    cache.lock().put(statement.to_string(), prepared.clone());
    Ok(prepared)
}

fn handle_error(poisoned: &AtomicBool, e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e: anyhow::Error = e.into();
    if e.downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed())
        || e.downcast_ref::<PostgresTimeout>().is_some()
    {
        tracing::error!("Not reusing connection after error: {e:#}");
        poisoned.store(true, atomic::Ordering::Relaxed);
    }
    e
}

/// An active Postgres connection borrowed from a [`MundiPgPool`].
///
/// Returns the underlying connection to the pool when dropped (unless it was
/// poisoned by a fatal error).
pub struct PgConnection {
    pool: Arc<MundiPgPool>,
    _permit: OwnedSemaphorePermit,
    conn: Option<PooledConnection>,
    poisoned: AtomicBool,
    label: &'static str,
}

impl PgConnection {
    fn conn(&self) -> &PooledConnection {
        self.conn.as_ref().expect("connection is only taken in Drop")
    }

    pub async fn batch_execute(&self, query: &str) -> anyhow::Result<()> {
        tracing::debug!(label = self.label, "batch_execute");
        with_timeout(self.conn().client.batch_execute(query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn prepare_cached(&self, query: &str) -> anyhow::Result<Statement> {
        let conn = self.conn();
        with_timeout(prepare_cached(&conn.client, &conn.statement_cache, query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        let statement = self.prepare_cached(query).await?;
        with_timeout(self.conn().client.query(&statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query_opt(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        let statement = self.prepare_cached(query).await?;
        with_timeout(self.conn().client.query_opt(&statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query_one(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Row> {
        let statement = self.prepare_cached(query).await?;
        with_timeout(self.conn().client.query_one(&statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn execute(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        let statement = self.prepare_cached(query).await?;
        with_timeout(self.conn().client.execute(&statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if *self.poisoned.get_mut() {
            tracing::warn!(label = self.label, "Dropping poisoned connection");
            return;
        }
        let mut conn = self.conn.take().expect("connection is only taken in Drop");
        conn.last_used = Instant::now();
        let mut idle_conns = self.pool.connections.lock();
        // don't return connections to a closed pool
        if !self.pool.semaphore.is_closed() {
            idle_conns.push_back(conn);
        }
    }
}

/// A Postgres connection pool. Always used behind an `Arc`.
pub struct MundiPgPool {
    pg_config: tokio_postgres::Config,
    tls_connect: MakeRustlsConnect,
    /// Limits the total number of connections handed out simultaneously.
    semaphore: Arc<Semaphore>,
    /// Idle connections, ordered by `last_used` from oldest to newest.
    connections: Mutex<VecDeque<PooledConnection>>,
    idle_worker: Mutex<Option<JoinHandle<()>>>,
}

impl MundiPgPool {
    pub fn new(pg_config: tokio_postgres::Config, tls_connect: MakeRustlsConnect) -> Arc<Self> {
        let max_size = *POSTGRES_MAX_CONNECTIONS;
        tracing::info!("Postgres connection pool max size {max_size}");
        // The idle worker needs a (weak) reference to the created pool, but
        // the pool also wants a handle to the worker; resolve this cyclic
        // situation by sneaking the weak reference through a channel.
        let (this_tx, this_rx) = oneshot::channel();
        let idle_worker = tokio::spawn(async move {
            let Ok(this) = this_rx.await else {
                return;
            };
            Self::idle_worker(this).await;
        });
        let this = Arc::new(MundiPgPool {
            pg_config,
            tls_connect,
            semaphore: Arc::new(Semaphore::new(max_size)),
            connections: Mutex::new(VecDeque::new()),
            idle_worker: Mutex::new(Some(idle_worker)),
        });
        _ = this_tx.send(Arc::downgrade(&this));
        this
    }

    /// Assumes that we already have a semaphore permit.
    async fn get_connection_internal(&self) -> anyhow::Result<PooledConnection> {
        {
            let mut conns = self.connections.lock();
            // Always reuse the newest connection
            while let Some(conn) = conns.pop_back() {
                if conn.client.is_closed() {
                    continue;
                }
                return Ok(conn);
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> anyhow::Result<PooledConnection> {
        let (client, mut conn) = self.pg_config.connect(self.tls_connect.clone()).await?;
        tokio::spawn(future::poll_fn(move |cx| loop {
            match ready!(conn.poll_message(cx)) {
                Some(Ok(AsyncMessage::Notice(notice))) => {
                    tracing::info!("{}: {}", notice.severity(), notice.message());
                },
                Some(Ok(_)) => {
                    // Notifications are only expected on the dedicated
                    // listener connection, never on pooled ones.
                    tracing::warn!("unexpected async message on pooled connection");
                },
                Some(Err(e)) => {
                    tracing::error!("connection error: {e}");
                    return Poll::Ready(());
                },
                None => return Poll::Ready(()),
            }
        }));
        Ok(PooledConnection::new(client))
    }

    pub async fn acquire(self: &Arc<Self>, label: &'static str) -> anyhow::Result<PgConnection> {
        let conn = with_timeout(async {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .context("MundiPgPool has been shut down")?;
            let conn = self.get_connection_internal().await?;
            anyhow::Ok((permit, conn))
        })
        .await
        .map_err(|e| {
            e.context(ErrorMetadata::overloaded(
                "DatabaseUnavailable",
                "The database is temporarily unavailable. Try again shortly.",
            ))
        })?;
        let (permit, conn) = conn;
        Ok(PgConnection {
            pool: self.clone(),
            _permit: permit,
            conn: Some(conn),
            poisoned: AtomicBool::new(false),
            label,
        })
    }

    /// Drops all pooled connections and prevents the creation of new ones.
    pub fn shutdown(&self) {
        self.semaphore.close();
        self.connections.lock().clear();
        if let Some(worker) = self.idle_worker.lock().take() {
            worker.abort();
        }
    }

    async fn idle_worker(this: Weak<Self>) {
        loop {
            let oldest = if let Some(this) = this.upgrade() {
                this.cleanup_idle_connections()
            } else {
                break;
            };
            let next_wakeup =
                oldest.unwrap_or_else(Instant::now) + *POSTGRES_INACTIVE_CONNECTION_LIFETIME;
            tokio::time::sleep_until(next_wakeup).await;
        }
    }

    // Returns the last_used time of the oldest remaining connection.
    fn cleanup_idle_connections(&self) -> Option<Instant> {
        let mut connections = self.connections.lock();
        while let Some(c) = connections.front() {
            if c.last_used.elapsed() > *POSTGRES_INACTIVE_CONNECTION_LIFETIME {
                connections.pop_front();
            } else {
                break;
            }
        }
        connections.front().map(|c| c.last_used)
    }
}

impl Drop for MundiPgPool {
    fn drop(&mut self) {
        if let Some(worker) = self.idle_worker.lock().take() {
            worker.abort();
        }
    }
}
