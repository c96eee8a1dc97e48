//! Bounded connection pool.
//!
//! All bookkeeping lives in one `PoolState` behind a `parking_lot` mutex that is
//! never held across an await. Connections are handed out as
//! [`PooledConnection`] leases; waiters queue FIFO and are served either a
//! returned connection or a reserved slot to open a new one.

use crate::config::{DatabaseConfig, PoolArgs, PoolConfig};
use crate::db::connection::{Connection, next_connection_id};
use crate::db::driver::Driver;
use crate::db::sqlx_driver::SqlxDriver;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, Dialect};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections plus those being opened
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    pub opening: usize,
    /// Callers queued in `acquire`
    pub waiters: usize,
    pub closed: bool,
}

/// What a queued waiter is handed.
enum Grant {
    /// A returned connection, already counted as leased
    Ready(Connection),
    /// A reserved slot, already counted as opening
    Open,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    /// Most recently used at the back
    idle: VecDeque<Connection>,
    leased: usize,
    opening: usize,
    waiters: VecDeque<Waiter>,
    closing: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.leased + self.opening
    }

    fn is_drained(&self) -> bool {
        self.leased == 0 && self.opening == 0
    }
}

struct PoolInner {
    driver: Arc<dyn Driver>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    drained: Notify,
    next_waiter_id: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of database connections.
///
/// Cloning is cheap; clones share the same pool. Create one per database and
/// pass it to the code that needs it; call [`close`](Self::close) on shutdown.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("dialect", &self.inner.driver.dialect())
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Where `acquire` gets its connection from.
enum Reservation {
    Existing(Connection),
    Open(OpeningSlot),
}

impl ConnectionPool {
    /// Create a pool, open `min_size` connections and start the reaper.
    ///
    /// Fails with the driver's error if an initial connection cannot be opened.
    pub async fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> DbResult<Self> {
        config.validate()?;
        let min_size = config.min_size as usize;
        let reap_interval = config.reap_interval;

        let inner = Arc::new(PoolInner {
            driver,
            config,
            state: Mutex::new(PoolState::default()),
            drained: Notify::new(),
            next_waiter_id: AtomicU64::new(1),
            reaper: Mutex::new(None),
        });

        for _ in 0..min_size {
            let conn = inner.open_connection().await;
            match conn {
                Ok(conn) => inner.state.lock().idle.push_back(conn),
                Err(e) => {
                    let idle: Vec<Connection> = inner.state.lock().idle.drain(..).collect();
                    for conn in idle {
                        conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            PoolInner::reaper_task(weak, reap_interval).await;
        });
        *inner.reaper.lock() = Some(handle);

        info!(
            dialect = %inner.driver.dialect(),
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "Connection pool created"
        );
        Ok(Self { inner })
    }

    /// Create a pool from a parsed database URL, using the sqlx driver.
    pub async fn connect(config: &DatabaseConfig, args: Option<&PoolArgs>) -> DbResult<Self> {
        let pool_config = config.pool_config(args)?;
        let driver = SqlxDriver::new(&config.connection_string)?;
        info!(connection_id = %config.id, dialect = %config.dialect, "Connecting pool");
        Self::new(Arc::new(driver), pool_config).await
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.driver.dialect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Lease a connection, waiting up to `timeout`.
    ///
    /// Idle connections are preferred; a new one is opened only while the pool is
    /// below `max_size`; otherwise the caller queues behind earlier waiters.
    /// Fails with [`DbError::PoolTimeout`] when `timeout` elapses and with
    /// [`DbError::PoolClosed`] once [`close`](Self::close) has begun. A failure to
    /// open a connection is returned as-is.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let reservation = self.inner.reserve(started, deadline).await?;
            let lease = match reservation {
                Reservation::Open(slot) => {
                    match tokio::time::timeout_at(deadline, slot.open()).await {
                        Ok(result) => PooledConnection::new(result?, Arc::clone(&self.inner)),
                        Err(_) => return Err(DbError::pool_timeout(started.elapsed())),
                    }
                }
                Reservation::Existing(conn) => {
                    let lease = PooledConnection::new(conn, Arc::clone(&self.inner));
                    match tokio::time::timeout_at(deadline, self.inner.validate_checkout(lease))
                        .await
                    {
                        Ok(Some(lease)) => lease,
                        Ok(None) => continue,
                        Err(_) => return Err(DbError::pool_timeout(started.elapsed())),
                    }
                }
            };
            return Ok(lease.hand_out());
        }
    }

    /// Return a leased connection.
    ///
    /// With `report_broken`, or when the session failed, is still inside a
    /// transaction, or has outlived `idle_timeout`/`max_lifetime`, the connection
    /// is closed and a replacement scheduled if the pool fell below `min_size`.
    /// The connection always goes back to the pool that leased it.
    pub async fn release(&self, mut lease: PooledConnection, report_broken: bool) {
        let Some(conn) = lease.conn.take() else {
            return;
        };
        if !Arc::ptr_eq(&lease.pool, &self.inner) {
            warn!(connection_id = %conn.id(), "Lease released through another pool");
        }
        if let Some(conn) = lease.pool.check_in(conn, report_broken) {
            conn.close().await;
        }
    }

    /// Probe a leased connection with the health check query.
    ///
    /// A failure marks the connection broken, so releasing it discards it.
    pub async fn health_check(&self, conn: &mut Connection) -> bool {
        let sql = self
            .inner
            .config
            .health_check_query_for(conn.dialect())
            .to_string();
        conn.ping(&sql).await
    }

    /// Drain the pool.
    ///
    /// New `acquire` calls and queued waiters fail with `PoolClosed`. Waits up to
    /// `close_grace_period` for outstanding leases, then closes every idle
    /// session. Leases returned later are closed on release. Idempotent.
    pub async fn close(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            let first = !state.closing;
            state.closing = true;
            if first {
                info!(
                    leased = state.leased,
                    idle = state.idle.len(),
                    "Closing connection pool"
                );
            }
            std::mem::take(&mut state.waiters)
        };
        // Dropping the senders wakes every waiter with PoolClosed
        drop(waiters);

        let deadline = Instant::now() + self.inner.config.close_grace_period;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let leased = {
                let state = self.inner.state.lock();
                if state.is_drained() {
                    break;
                }
                state.leased + state.opening
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    outstanding = leased,
                    "Grace period elapsed with leases outstanding; they will be closed on release"
                );
                break;
            }
        }

        let idle: Vec<Connection> = self.inner.state.lock().idle.drain(..).collect();
        for conn in idle {
            conn.close().await;
        }

        if let Some(handle) = self.inner.reaper.lock().take() {
            handle.abort();
            info!("Connection pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closing
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.total(),
            idle: state.idle.len(),
            leased: state.leased,
            opening: state.opening,
            waiters: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            closed: state.closing,
        }
    }
}

impl PoolInner {
    async fn open_connection(&self) -> DbResult<Connection> {
        let id = next_connection_id();
        let session = self
            .driver
            .connect()
            .await
            .map_err(|e| DbError::from_driver(e, id.to_string()))?;
        debug!(connection_id = %id, "Opened pooled connection");
        Ok(Connection::new(id, session, self.driver.dialect()))
    }

    /// Take an idle connection, reserve an opening slot, or queue.
    async fn reserve(self: &Arc<Self>, started: Instant, deadline: Instant) -> DbResult<Reservation> {
        let (id, rx) = {
            let mut state = self.state.lock();
            if state.closing {
                return Err(DbError::PoolClosed);
            }
            if state.waiters.is_empty() {
                if let Some(conn) = state.idle.pop_back() {
                    state.leased += 1;
                    return Ok(Reservation::Existing(conn));
                }
                if state.total() < self.config.max_size as usize {
                    state.opening += 1;
                    return Ok(Reservation::Open(OpeningSlot::new(Arc::clone(self))));
                }
            }
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        debug!(waiter_id = id, "Waiting for a pooled connection");
        let mut wait = WaitGuard {
            pool: Arc::clone(self),
            id,
            rx,
            done: false,
        };
        match tokio::time::timeout_at(deadline, &mut wait.rx).await {
            Ok(Ok(grant)) => {
                wait.done = true;
                Ok(match grant {
                    Grant::Ready(conn) => Reservation::Existing(conn),
                    Grant::Open => Reservation::Open(OpeningSlot::new(Arc::clone(self))),
                })
            }
            Ok(Err(_)) => {
                wait.done = true;
                Err(DbError::PoolClosed)
            }
            Err(_) => {
                // WaitGuard removes the waiter and hands back anything granted meanwhile
                drop(wait);
                let waited = started.elapsed();
                debug!(waiter_id = id, waited_ms = waited.as_millis() as u64, "Acquire timed out");
                Err(DbError::pool_timeout(waited))
            }
        }
    }

    /// Check an existing connection before handing it out.
    ///
    /// Returns `None` (after discarding it) if it expired or failed its health check.
    async fn validate_checkout(&self, mut lease: PooledConnection) -> Option<PooledConnection> {
        if self.lifetime_expired(&lease) || lease.is_broken() {
            debug!(connection_id = %lease.id(), "Discarding expired connection at checkout");
            lease.discard();
            return None;
        }
        if lease.idle_for() >= self.config.stale_after {
            let sql = self.config.health_check_query_for(lease.dialect()).to_string();
            // Dropped during the check (acquire timed out), the lease discards the connection
            lease.health_checking = true;
            if !lease.ping(&sql).await {
                lease.discard();
                return None;
            }
            lease.health_checking = false;
        }
        Some(lease)
    }

    fn lifetime_expired(&self, conn: &Connection) -> bool {
        self.config
            .max_lifetime
            .is_some_and(|lifetime| conn.age() >= lifetime)
    }

    fn idle_expired(&self, conn: &Connection) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|timeout| conn.idle_for() >= timeout)
    }

    /// Bookkeeping for a connection coming back from a lease.
    ///
    /// Returns the connection when it must be closed by the caller.
    fn check_in(self: &Arc<Self>, mut conn: Connection, report_broken: bool) -> Option<Connection> {
        let reason = if report_broken {
            Some("reported broken")
        } else if conn.is_broken() {
            Some("session failed")
        } else if conn.in_transaction() {
            Some("transaction left open")
        } else if self.lifetime_expired(&conn) {
            Some("max lifetime reached")
        } else if self.idle_expired(&conn) {
            Some("idle timeout reached")
        } else {
            None
        };

        let mut state = self.state.lock();
        state.leased -= 1;

        if let Some(reason) = reason {
            warn!(connection_id = %conn.id(), reason, "Discarding connection");
            conn.mark_broken();
        } else if !state.closing {
            conn.set_state(ConnectionState::Idle);
            match self.hand_to_waiter_locked(&mut state, conn) {
                None => {
                    self.notify_if_drained(&state);
                    return None;
                }
                Some(returned) => {
                    debug!(connection_id = %returned.id(), "Connection returned to pool");
                    state.idle.push_back(returned);
                    self.notify_if_drained(&state);
                    return None;
                }
            }
        }

        self.dispatch_slots_locked(&mut state);
        self.notify_if_drained(&state);
        drop(state);
        self.replenish();
        Some(conn)
    }

    /// Give `conn` to the first live waiter; hands it back if there is none.
    fn hand_to_waiter_locked(&self, state: &mut PoolState, conn: Connection) -> Option<Connection> {
        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            state.leased += 1;
            match waiter.tx.send(Grant::Ready(conn)) {
                Ok(()) => {
                    debug!(waiter_id = waiter.id, "Handed connection to waiter");
                    return None;
                }
                Err(grant) => {
                    state.leased -= 1;
                    conn = match grant {
                        Grant::Ready(returned) => returned,
                        Grant::Open => return None,
                    };
                }
            }
        }
        Some(conn)
    }

    /// Hand free capacity to queued waiters as opening slots.
    fn dispatch_slots_locked(&self, state: &mut PoolState) {
        while !state.closing && state.total() < self.config.max_size as usize {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.opening += 1;
            if waiter.tx.send(Grant::Open).is_err() {
                state.opening -= 1;
            }
        }
    }

    fn notify_if_drained(&self, state: &PoolState) {
        if state.is_drained() {
            self.drained.notify_waiters();
        }
    }

    fn release_opening_slot(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.opening -= 1;
        self.dispatch_slots_locked(&mut state);
        self.notify_if_drained(&state);
    }

    /// Schedule background connections until the pool is back at `min_size`.
    fn replenish(self: &Arc<Self>) {
        let needed = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            let needed = (self.config.min_size as usize).saturating_sub(state.total());
            state.opening += needed;
            needed
        };
        if needed == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let mut state = self.state.lock();
            state.opening -= needed;
            return;
        };

        debug!(count = needed, "Scheduling replacement connections");
        for _ in 0..needed {
            let pool = Arc::clone(self);
            runtime.spawn(async move {
                let result = pool.open_connection().await;
                match result {
                    Ok(conn) => {
                        if let Some(conn) = pool.adopt_opened(conn) {
                            conn.close().await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to open replacement connection");
                        pool.release_opening_slot();
                    }
                }
            });
        }
    }

    /// Place a connection opened in the background. Returns it if the pool is closing.
    fn adopt_opened(self: &Arc<Self>, conn: Connection) -> Option<Connection> {
        let mut state = self.state.lock();
        state.opening -= 1;
        if state.closing {
            self.notify_if_drained(&state);
            return Some(conn);
        }
        if let Some(conn) = self.hand_to_waiter_locked(&mut state, conn) {
            state.idle.push_back(conn);
        }
        self.notify_if_drained(&state);
        None
    }

    /// Retire expired idle connections, then top up to `min_size`.
    ///
    /// Holds only a `Weak` reference so the task ends once the pool is dropped.
    async fn reaper_task(weak_pool: Weak<Self>, reap_interval: Duration) {
        let mut interval = tokio::time::interval(reap_interval);
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Connection pool dropped, reaper exiting");
                return;
            };

            // Collect candidates under the lock, close them outside it
            let retired: Vec<Connection> = {
                let mut state = pool.state.lock();
                if state.closing {
                    return;
                }
                let min_size = pool.config.min_size as usize;
                let mut total = state.total();
                let mut keep = VecDeque::with_capacity(state.idle.len());
                let mut retired = Vec::new();
                // Oldest-used first, so the most recently used survive
                while let Some(conn) = state.idle.pop_front() {
                    if pool.lifetime_expired(&conn) || (total > min_size && pool.idle_expired(&conn))
                    {
                        total -= 1;
                        retired.push(conn);
                    } else {
                        keep.push_back(conn);
                    }
                }
                state.idle = keep;
                if !retired.is_empty() {
                    pool.dispatch_slots_locked(&mut state);
                }
                retired
            };

            if !retired.is_empty() {
                debug!(count = retired.len(), "Reaper retiring idle connections");
            }
            for conn in retired {
                conn.close().await;
            }
            pool.replenish();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Removes a queued waiter whose `acquire` timed out or was cancelled.
struct WaitGuard {
    pool: Arc<PoolInner>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    done: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let removed = {
            let mut state = self.pool.state.lock();
            let before = state.waiters.len();
            let id = self.id;
            state.waiters.retain(|w| w.id != id);
            state.waiters.len() != before
        };
        if removed {
            return;
        }
        // Something was granted between the timeout and the removal; give it back
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Grant::Ready(conn)) => {
                if let Some(conn) = self.pool.check_in(conn, false) {
                    spawn_close(conn);
                }
            }
            Ok(Grant::Open) => self.pool.release_opening_slot(),
            Err(_) => {}
        }
    }
}

/// A reserved slot for opening a connection; released if the open never completes.
struct OpeningSlot {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl OpeningSlot {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    async fn open(mut self) -> DbResult<Connection> {
        let conn = self.pool.open_connection().await?;
        self.armed = false;
        let closing = {
            let mut state = self.pool.state.lock();
            state.opening -= 1;
            if state.closing {
                self.pool.notify_if_drained(&state);
                true
            } else {
                state.leased += 1;
                false
            }
        };
        if closing {
            conn.close().await;
            return Err(DbError::PoolClosed);
        }
        Ok(conn)
    }
}

impl Drop for OpeningSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_opening_slot();
        }
    }
}

fn spawn_close(conn: Connection) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(conn.close());
    }
}

/// A leased connection.
///
/// Derefs to [`Connection`]. Return it with [`release`](Self::release) or
/// [`ConnectionPool::release`]; a lease that is dropped instead is returned
/// through the same bookkeeping with a warning.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    handed_out: bool,
    health_checking: bool,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            handed_out: false,
            health_checking: false,
        }
    }

    fn hand_out(mut self) -> Self {
        self.handed_out = true;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_state(ConnectionState::Leased);
            debug!(connection_id = %conn.id(), "Connection leased");
        }
        self
    }

    /// Return the connection to its pool.
    pub async fn release(self) {
        let pool = ConnectionPool {
            inner: Arc::clone(&self.pool),
        };
        pool.release(self, false).await;
    }

    /// Return the connection and have the pool discard it.
    pub async fn release_broken(self) {
        let pool = ConnectionPool {
            inner: Arc::clone(&self.pool),
        };
        pool.release(self, true).await;
    }

    fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(conn) = self.pool.check_in(conn, true) {
                spawn_close(conn);
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("lease holds its connection until released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .expect("lease holds its connection until released")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.handed_out {
            warn!(
                connection_id = %conn.id(),
                "Lease dropped without release - consider using explicit release()"
            );
        }
        if self.health_checking {
            debug!(connection_id = %conn.id(), "Health check interrupted, discarding connection");
        }
        if let Some(conn) = self.pool.check_in(conn, self.health_checking) {
            spawn_close(conn);
        }
    }
}
