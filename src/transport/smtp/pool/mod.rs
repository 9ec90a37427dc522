//! Bounded connection pool with keep-alive and periodic eviction

use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    mem,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::lock::Mutex;
use tokio::sync::oneshot;

use super::{client::SmtpConnection, transport::SmtpClient, Error};
use crate::transport::smtp::error;

/// Configuration for a connection pool
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct PoolConfig {
    max_size: u32,
    keep_alive: bool,
    idle_timeout: Duration,
    cleaner_period: Duration,
    acquire_timeout: Duration,
}

impl PoolConfig {
    /// Create a new pool configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of live connections, idle and checked-out combined
    ///
    /// Defaults to `10`
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Whether idle connections are kept open for reuse
    ///
    /// When disabled every connection is QUIT-closed after its transaction.
    /// Defaults to `true`
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// How long an idle connection stays usable
    ///
    /// Defaults to `300 seconds`
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Interval between scans of the idle list for expired connections
    ///
    /// Defaults to `10 seconds`
    pub fn cleaner_period(mut self, cleaner_period: Duration) -> Self {
        self.cleaner_period = cleaner_period;
        self
    }

    /// How long an acquire waits for a free connection before failing
    ///
    /// Defaults to `30 seconds`
    pub fn acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            keep_alive: true,
            idle_timeout: Duration::from_secs(300),
            cleaner_period: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Pool {
    config: PoolConfig,
    client: SmtpClient,
    inner: Mutex<PoolInner>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct PoolInner {
    idle: Vec<ParkedConnection>,
    /// Idle plus checked-out connections; never exceeds `config.max_size`
    live: u32,
    /// FIFO queue of acquires waiting for a slot
    waiters: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

struct ParkedConnection {
    conn: SmtpConnection,
    since: Instant,
}

pub(crate) struct PooledConnection {
    conn: Option<SmtpConnection>,
    reused: bool,
    pool: Arc<Pool>,
}

enum Acquire {
    Reuse(ParkedConnection),
    Connect,
    Wait(oneshot::Receiver<()>),
}

impl Pool {
    pub(crate) fn new(config: PoolConfig, client: SmtpClient) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            client,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                live: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
            handle: Mutex::new(None),
        });

        if pool.config.keep_alive {
            let idle_timeout = pool.config.idle_timeout;
            let cleaner_period = pool.config.cleaner_period;
            let weak = Arc::downgrade(&pool);

            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(cleaner_period).await;
                    match weak.upgrade() {
                        Some(pool) => {
                            let expired = {
                                let mut inner = pool.inner.lock().await;
                                let (expired, kept) = mem::take(&mut inner.idle)
                                    .into_iter()
                                    .partition(|parked| parked.idle_duration() > idle_timeout);
                                inner.idle = kept;
                                expired
                            };

                            for parked in expired {
                                tracing::debug!("evicting expired idle connection");
                                pool.evict(parked.unpark()).await;
                            }
                        }
                        None => break,
                    }
                }
            });
            *pool
                .handle
                .try_lock()
                .expect("pool handle shouldn't be locked") = Some(handle);
        }

        pool
    }

    /// Hands out a connection: an idle one when available, a fresh one under
    /// the size bound, else waits FIFO for a slot
    pub(crate) async fn connection(self: &Arc<Self>) -> Result<PooledConnection, Error> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            let action = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(error::pool_closed());
                }
                if let Some(parked) = inner.idle.pop() {
                    Acquire::Reuse(parked)
                } else if inner.live < self.config.max_size {
                    inner.live += 1;
                    Acquire::Connect
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    Acquire::Wait(rx)
                }
            };

            match action {
                Acquire::Reuse(parked) => {
                    let expired = self.config.keep_alive
                        && parked.idle_duration() > self.config.idle_timeout;
                    let conn = parked.unpark();
                    if conn.has_broken() || expired {
                        self.evict(conn).await;
                        continue;
                    }
                    return Ok(PooledConnection::wrap(conn, true, Arc::clone(self)));
                }
                Acquire::Connect => match self.client.connection().await {
                    Ok(conn) => {
                        return Ok(PooledConnection::wrap(conn, false, Arc::clone(self)));
                    }
                    Err(err) => {
                        let mut inner = self.inner.lock().await;
                        inner.live -= 1;
                        Self::wake_one(&mut inner);
                        return Err(err);
                    }
                },
                Acquire::Wait(rx) => {
                    match tokio::time::timeout_at(deadline, rx).await {
                        // a slot was released, race for it again
                        Ok(Ok(())) => continue,
                        // the pool dropped the sender while closing
                        Ok(Err(_)) => continue,
                        Err(_) => return Err(error::pool_acquire_timeout()),
                    }
                }
            }
        }
    }

    /// Puts a connection back: parked for reuse when still valid, evicted
    /// otherwise
    async fn recycle(&self, mut conn: SmtpConnection) {
        let reusable = self.config.keep_alive
            && !conn.has_broken()
            && conn.check_no_pending_reply().is_ok();

        if !reusable {
            self.evict(conn).await;
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            drop(inner);
            self.evict(conn).await;
            return;
        }
        inner.idle.push(ParkedConnection::park(conn));
        Self::wake_one(&mut inner);
    }

    /// Closes a connection and releases its slot, waking one waiter
    async fn evict(&self, mut conn: SmtpConnection) {
        conn.abort().await;
        let mut inner = self.inner.lock().await;
        inner.live = inner.live.saturating_sub(1);
        Self::wake_one(&mut inner);
    }

    fn wake_one(inner: &mut PoolInner) {
        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
            // receiver gave up (timeout), try the next waiter
        }
    }

    /// Live connections, idle and checked-out combined
    pub(crate) async fn connection_count(&self) -> u32 {
        self.inner.lock().await.live
    }

    /// Prevents further acquires, fails queued waiters and QUIT-closes all
    /// idle connections
    pub(crate) async fn close(&self) {
        let (idle, waiters) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            (mem::take(&mut inner.idle), mem::take(&mut inner.waiters))
        };

        // dropping the senders fails the waiters, which then observe `closed`
        drop(waiters);

        for parked in idle {
            self.evict(parked.unpark()).await;
        }

        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}

impl Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field(
                "connections",
                &match self.inner.try_lock() {
                    Some(inner) => format!("{} idle, {} live", inner.idle.len(), inner.live),
                    None => "LOCKED".to_string(),
                },
            )
            .finish_non_exhaustive()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let idle = mem::take(&mut self.inner.get_mut().idle);
        let handle = self
            .handle
            .try_lock()
            .expect("pool handle shouldn't be locked")
            .take();
        tokio::spawn(async move {
            if let Some(handle) = handle {
                handle.abort();
            }

            for parked in idle {
                let mut conn = parked.unpark();
                conn.abort().await;
            }
        });
    }
}

impl ParkedConnection {
    fn park(conn: SmtpConnection) -> Self {
        Self {
            conn,
            since: Instant::now(),
        }
    }

    fn idle_duration(&self) -> Duration {
        self.since.elapsed()
    }

    fn unpark(self) -> SmtpConnection {
        self.conn
    }
}

impl PooledConnection {
    fn wrap(conn: SmtpConnection, reused: bool, pool: Arc<Pool>) -> Self {
        Self {
            conn: Some(conn),
            reused,
            pool,
        }
    }

    /// Whether the connection served a previous transaction and needs RSET
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }
}

impl Deref for PooledConnection {
    type Target = SmtpConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("conn hasn't been dropped yet")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("conn hasn't been dropped yet")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = self
            .conn
            .take()
            .expect("SmtpConnection hasn't been taken yet");
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            pool.recycle(conn).await;
        });
    }
}
