//! Self-managed connection pool.
//!
//! The pool keeps two disjoint sets: idle connections ready to be loaned and
//! connections currently loaned out. All physical opens and closes happen in
//! the background sweep (or `shutdown`):
//!
//! 1. Returned connections are moved from the loaned set back to the idle set.
//!    Loans older than the max loan time are revoked.
//! 2. Idle connections are evicted on max lifetime, max idle time or a failed
//!    liveness probe.
//! 3. The idle set is topped up to the minimum size (or to the number of
//!    blocked callers) without exceeding the maximum, unless the pool has
//!    been unused for longer than the sleep-mode threshold.
//! 4. Blocked `acquire` callers are woken.
//!
//! `acquire` never opens connections itself. When growth is impossible it
//! fails fast with `PoolExhausted`; otherwise it waits, re-checking on every
//! wake until its deadline.

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, ConnectionSnapshot, ConnectionState, DatabaseType, PoolStatistics,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Resolved pool limits.
#[derive(Debug, Clone)]
struct Limits {
    min: usize,
    max: usize,
    sleep_mode_after: Duration,
    max_lifetime: Duration,
    max_idle_time: Duration,
    max_loan_time: Duration,
    sweep_period: Duration,
    acquire_timeout: Duration,
    probe_timeout: Duration,
}

impl Limits {
    fn from_config(config: &ConnectionConfig) -> Self {
        let s = &config.pool;
        Self {
            min: s.min_pool_size_or_default(),
            max: s.max_pool_size_or_default(),
            sleep_mode_after: s.sleep_mode_after_or_default(),
            max_lifetime: s.max_lifetime_or_default(),
            max_idle_time: s.max_idle_time_or_default(),
            max_loan_time: s.max_loan_time_or_default(),
            sweep_period: s.sweep_period_or_default(),
            acquire_timeout: s.acquire_timeout_or_default(),
            probe_timeout: s.probe_timeout_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    returned: AtomicU64,
    expired_lifetime: AtomicU64,
    expired_idle: AtomicU64,
    expired_loan: AtomicU64,
    invalid: AtomicU64,
    exhausted_blocking: AtomicU64,
    exhausted_rejecting: AtomicU64,
    top_up_capped: AtomicU64,
    sweep_runs: AtomicU64,
    last_sweep_duration_ms: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> PoolStatistics {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStatistics {
            opened: get(&self.opened),
            returned: get(&self.returned),
            expired_lifetime: get(&self.expired_lifetime),
            expired_idle: get(&self.expired_idle),
            expired_loan: get(&self.expired_loan),
            invalid: get(&self.invalid),
            exhausted_blocking: get(&self.exhausted_blocking),
            exhausted_rejecting: get(&self.exhausted_rejecting),
            top_up_capped: get(&self.top_up_capped),
            sweep_runs: get(&self.sweep_runs),
            last_sweep_duration_ms: get(&self.last_sweep_duration_ms),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.opened,
            &self.returned,
            &self.expired_lifetime,
            &self.expired_idle,
            &self.expired_loan,
            &self.invalid,
            &self.exhausted_blocking,
            &self.exhausted_rejecting,
            &self.top_up_capped,
            &self.sweep_runs,
            &self.last_sweep_duration_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionMeta {
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

struct IdleConnection {
    meta: ConnectionMeta,
    conn: DbConnection,
}

struct LoanRecord {
    meta: ConnectionMeta,
    loan_started: Instant,
    caller: &'static Location<'static>,
    revoked: Arc<AtomicBool>,
    /// Set when the borrower hands the connection back; collected by the sweep.
    returned: Option<DbConnection>,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<IdleConnection>,
    loaned: HashMap<u64, LoanRecord>,
    /// Connections taken out of `available` by the sweep for checking, or
    /// slots reserved for a connection being opened.
    in_check: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.available.len() + self.loaned.len() + self.in_check
    }

    fn active_loans(&self) -> usize {
        self.loaned.values().filter(|r| r.returned.is_none()).count()
    }
}

struct PoolInner {
    config: ConnectionConfig,
    limits: Limits,
    state: Mutex<PoolState>,
    /// Wakes callers blocked in `acquire`.
    available_notify: Notify,
    /// Asks the sweeper for an early pass.
    sweep_requested: Arc<Notify>,
    sweep_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    next_id: AtomicU64,
    waiters: AtomicUsize,
    closed: AtomicBool,
    created: Instant,
    last_acquire_ms: AtomicU64,
}

enum Checkout {
    Ready(PooledConnection),
    Exhausted { loaned: usize, max: usize },
    Wait,
}

/// Decrements the waiter count when a blocked `acquire` finishes or is cancelled.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn close_detached(conn: DbConnection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

impl PoolInner {
    fn lock_state(&self) -> DbResult<std::sync::MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| DbError::internal("pool state lock poisoned"))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_acquire_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_acquire_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    fn try_checkout(
        self: &Arc<Self>,
        caller: &'static Location<'static>,
    ) -> DbResult<Checkout> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        let mut state = self.lock_state()?;
        if let Some(idle) = state.available.pop_front() {
            let now = Instant::now();
            let revoked = Arc::new(AtomicBool::new(false));
            let id = idle.meta.id;
            state.loaned.insert(
                id,
                LoanRecord {
                    meta: idle.meta,
                    loan_started: now,
                    caller,
                    revoked: Arc::clone(&revoked),
                    returned: None,
                },
            );
            return Ok(Checkout::Ready(PooledConnection {
                conn: Some(idle.conn),
                id,
                pool: Arc::downgrade(self),
                revoked,
                loan_started: now,
            }));
        }

        let active = state.active_loans();
        if active >= self.limits.max {
            Ok(Checkout::Exhausted {
                loaned: active,
                max: self.limits.max,
            })
        } else {
            Ok(Checkout::Wait)
        }
    }

    async fn acquire(
        self: &Arc<Self>,
        caller: &'static Location<'static>,
    ) -> DbResult<PooledConnection> {
        self.touch();
        let started = tokio::time::Instant::now();
        let deadline = started + self.limits.acquire_timeout;
        let mut waiting: Option<WaiterGuard<'_>> = None;

        loop {
            let notified = self.available_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout(caller)? {
                Checkout::Ready(conn) => return Ok(conn),
                Checkout::Exhausted { loaned, max } => {
                    bump(&self.counters.exhausted_rejecting);
                    return Err(DbError::pool_exhausted(loaned, max));
                }
                Checkout::Wait => {}
            }

            if waiting.is_none() {
                bump(&self.counters.exhausted_blocking);
                self.waiters.fetch_add(1, Ordering::AcqRel);
                waiting = Some(WaiterGuard(&self.waiters));
            }
            self.sweep_requested.notify_one();

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look before giving up.
                return match self.try_checkout(caller)? {
                    Checkout::Ready(conn) => Ok(conn),
                    _ => Err(DbError::timeout(
                        "acquire connection",
                        started.elapsed().as_millis() as u64,
                    )),
                };
            }
        }
    }

    /// Hand a connection back from a guard.
    fn give_back(&self, id: u64, conn: DbConnection, revoked: bool) {
        let mut conn = Some(conn);
        if !self.is_closed() {
            if let Ok(mut state) = self.state.lock() {
                let overdue = state
                    .loaned
                    .get(&id)
                    .map(|r| r.loan_started.elapsed() > self.limits.max_loan_time);
                match overdue {
                    Some(false) if !revoked => {
                        if let Some(record) = state.loaned.get_mut(&id) {
                            record.returned = conn.take();
                        }
                    }
                    Some(overdue) => {
                        state.loaned.remove(&id);
                        if overdue && !revoked {
                            bump(&self.counters.expired_loan);
                        }
                    }
                    None => {}
                }
            }
        }
        if let Some(conn) = conn {
            debug!(connection_id = id, "Closing connection on release");
            close_detached(conn);
        }
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.sweep_requested.notify_one();
        }
    }

    /// One sweep pass. Background passes skip when another pass is running;
    /// explicit passes wait for it.
    async fn sweep(&self, wait: bool) -> DbResult<()> {
        let _running = if wait {
            self.sweep_lock.lock().await
        } else {
            match self.sweep_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(()),
            }
        };
        if self.is_closed() {
            return Ok(());
        }
        let started = Instant::now();

        self.collect_loans()?;
        self.check_available().await?;
        let top_up = self.top_up().await;

        self.available_notify.notify_waiters();
        bump(&self.counters.sweep_runs);
        self.counters
            .last_sweep_duration_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        top_up
    }

    fn collect_loans(&self) -> DbResult<()> {
        let mut state = self.lock_state()?;
        let now = Instant::now();

        let returned: Vec<u64> = state
            .loaned
            .iter()
            .filter(|(_, r)| r.returned.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in returned {
            if let Some(record) = state.loaned.remove(&id) {
                if let Some(conn) = record.returned {
                    let meta = ConnectionMeta {
                        idle_since: now,
                        ..record.meta
                    };
                    state.available.push_back(IdleConnection { meta, conn });
                    bump(&self.counters.returned);
                }
            }
        }

        for record in state.loaned.values() {
            let held = now.saturating_duration_since(record.loan_started);
            if held > self.limits.max_loan_time && !record.revoked.swap(true, Ordering::AcqRel) {
                bump(&self.counters.expired_loan);
                warn!(
                    connection_id = record.meta.id,
                    caller = %record.caller,
                    held_ms = held.as_millis() as u64,
                    "Revoked connection loan exceeding max loan time"
                );
            }
        }
        Ok(())
    }

    /// Evict expired idle connections, then probe the rest one at a time.
    /// Only the connection under probe leaves the idle set, so borrowers keep
    /// seeing every other healthy connection while the pass runs.
    async fn check_available(&self) -> DbResult<()> {
        let mut expired = Vec::new();
        {
            let mut state = self.lock_state()?;
            let drained: Vec<IdleConnection> = state.available.drain(..).collect();
            for idle in drained {
                match self.expiry(&idle) {
                    Some(reason) => expired.push((idle, reason)),
                    None => state.available.push_back(idle),
                }
            }
        }
        for (idle, (counter, reason)) in expired {
            bump(counter);
            debug!(connection_id = idle.meta.id, reason, "Evicting idle connection");
            idle.conn.close().await;
        }

        let ids: Vec<u64> = {
            let state = self.lock_state()?;
            state.available.iter().map(|idle| idle.meta.id).collect()
        };
        for id in ids {
            let taken = {
                let mut state = self.lock_state()?;
                if self.is_closed() {
                    return Ok(());
                }
                // Skip connections loaned out since the id list was taken
                let position = state.available.iter().position(|idle| idle.meta.id == id);
                let taken = position.and_then(|pos| state.available.remove(pos));
                if taken.is_some() {
                    state.in_check += 1;
                }
                taken
            };
            let Some(mut idle) = taken else {
                continue;
            };

            let alive = tokio::time::timeout(self.limits.probe_timeout, idle.conn.ping())
                .await
                .unwrap_or(false);
            let closing = {
                let mut state = self.lock_state()?;
                state.in_check = state.in_check.saturating_sub(1);
                if alive && !self.is_closed() {
                    state.available.push_back(idle);
                    None
                } else {
                    Some(idle)
                }
            };
            match closing {
                Some(idle) => {
                    if !alive {
                        bump(&self.counters.invalid);
                        debug!(connection_id = id, reason = "probe", "Evicting idle connection");
                    }
                    idle.conn.close().await;
                }
                None => self.available_notify.notify_waiters(),
            }
        }
        Ok(())
    }

    /// Expiry reason of an idle connection, if its lifetime or idle time is up.
    fn expiry(&self, idle: &IdleConnection) -> Option<(&AtomicU64, &'static str)> {
        if idle.meta.created_at.elapsed() >= self.limits.max_lifetime {
            Some((&self.counters.expired_lifetime, "lifetime"))
        } else if idle.meta.idle_since.elapsed() >= self.limits.max_idle_time {
            Some((&self.counters.expired_idle, "idle"))
        } else {
            None
        }
    }

    async fn top_up(&self) -> DbResult<()> {
        if self.idle_for() > self.limits.sleep_mode_after {
            return Ok(());
        }

        loop {
            {
                let mut state = self.lock_state()?;
                let waiting = self.waiters.load(Ordering::Acquire);
                let target = self.limits.min.max(waiting).min(self.limits.max);
                if state.available.len() >= target {
                    return Ok(());
                }
                if state.total() >= self.limits.max {
                    bump(&self.counters.top_up_capped);
                    return Ok(());
                }
                state.in_check += 1;
            }

            let opened = DbConnection::open(&self.config).await;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let leftover = {
                let mut state = self.lock_state()?;
                state.in_check = state.in_check.saturating_sub(1);
                match opened {
                    Ok(conn) if self.is_closed() => Some(conn),
                    Ok(conn) => {
                        let now = Instant::now();
                        state.available.push_back(IdleConnection {
                            meta: ConnectionMeta {
                                id,
                                created_at: now,
                                idle_since: now,
                            },
                            conn,
                        });
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to open pooled connection");
                        return Err(e);
                    }
                }
            };
            bump(&self.counters.opened);

            if let Some(conn) = leftover {
                conn.close().await;
                return Ok(());
            }
            debug!(connection_id = id, "Opened pooled connection");
            self.available_notify.notify_waiters();
        }
    }

    /// Close every connection and forget all loans.
    async fn close_all(&self) {
        let (idle, parked) = match self.state.lock() {
            Ok(mut state) => {
                let idle: Vec<DbConnection> = state.available.drain(..).map(|i| i.conn).collect();
                let mut parked = Vec::new();
                for (_, record) in state.loaned.drain() {
                    record.revoked.store(true, Ordering::Release);
                    if let Some(conn) = record.returned {
                        parked.push(conn);
                    }
                }
                state.in_check = 0;
                (idle, parked)
            }
            Err(_) => (Vec::new(), Vec::new()),
        };
        for conn in idle.into_iter().chain(parked) {
            conn.close().await;
        }
        self.available_notify.notify_waiters();
    }

    fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut out: Vec<ConnectionSnapshot> = state
            .available
            .iter()
            .map(|idle| ConnectionSnapshot {
                id: idle.meta.id,
                state: ConnectionState::Available,
                age_ms: now.saturating_duration_since(idle.meta.created_at).as_millis() as u64,
                loaned_for_ms: None,
                caller: None,
            })
            .collect();
        out.extend(state.loaned.values().map(|record| ConnectionSnapshot {
            id: record.meta.id,
            state: if record.revoked.load(Ordering::Acquire) {
                ConnectionState::Closing
            } else {
                ConnectionState::Loaned
            },
            age_ms: now.saturating_duration_since(record.meta.created_at).as_millis() as u64,
            loaned_for_ms: Some(now.saturating_duration_since(record.loan_started).as_millis() as u64),
            caller: Some(record.caller.to_string()),
        }));
        out.sort_by_key(|s| s.id);
        out
    }
}

async fn run_sweeper(weak: Weak<PoolInner>, nudge: Arc<Notify>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = nudge.notified() => {}
        }

        let Some(inner) = weak.upgrade() else {
            debug!("Connection pool dropped, sweeper exiting");
            return;
        };
        if inner.is_closed() {
            return;
        }
        if let Err(e) = inner.sweep(false).await {
            warn!(error = %e, "Pool sweep failed");
        }
    }
}

/// A bounded pool of physical connections with a background health sweep.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    /// Sweeper task handle. Uses std::sync::Mutex for synchronous storage.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_type", &self.inner.config.db_type)
            .field("available", &self.available_count())
            .field("loaned", &self.loaned_count())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create the pool, open the minimum number of connections and start the sweeper.
    ///
    /// Fails when a minimum size is configured and no connection can be opened.
    pub async fn connect(config: ConnectionConfig) -> DbResult<Self> {
        let limits = Limits::from_config(&config);
        let inner = Arc::new(PoolInner {
            config,
            limits,
            state: Mutex::new(PoolState::default()),
            available_notify: Notify::new(),
            sweep_requested: Arc::new(Notify::new()),
            sweep_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            created: Instant::now(),
            last_acquire_ms: AtomicU64::new(0),
        });

        let pool = Self {
            inner,
            sweeper: Mutex::new(None),
        };
        pool.start().await?;
        info!(
            db_type = %pool.inner.config.db_type,
            url = %pool.inner.config.masked_connection_string(),
            min = pool.inner.limits.min,
            max = pool.inner.limits.max,
            "Connection pool started"
        );
        Ok(pool)
    }

    async fn start(&self) -> DbResult<()> {
        if let Err(e) = self.inner.sweep(true).await {
            if self.inner.limits.min > 0 && self.available_count() == 0 {
                self.inner.closed.store(true, Ordering::Release);
                self.inner.close_all().await;
                return Err(e);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let nudge = Arc::clone(&self.inner.sweep_requested);
        let period = self.inner.limits.sweep_period;
        let handle = tokio::spawn(run_sweeper(weak, nudge, period));

        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
        Ok(())
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.config.db_type
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Borrow a connection.
    ///
    /// Returns immediately when a connection is idle. Fails with
    /// `PoolExhausted` when every slot is loaned out, otherwise waits for the
    /// sweep to provide one until the acquire timeout elapses.
    #[track_caller]
    pub fn acquire(&self) -> impl Future<Output = DbResult<PooledConnection>> + Send + '_ {
        let caller = Location::caller();
        async move { self.inner.acquire(caller).await }
    }

    /// Run one sweep pass now, after any pass already running.
    pub async fn sweep(&self) -> DbResult<()> {
        self.inner.sweep(true).await
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.inner.counters.snapshot()
    }

    pub fn available_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.available.len()).unwrap_or(0)
    }

    pub fn loaned_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.loaned.len()).unwrap_or(0)
    }

    /// Physical connections owned by the pool, including those being checked.
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.total()).unwrap_or(0)
    }

    /// Diagnostic view of every connection, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close every connection and stop the sweeper. Further `acquire` calls
    /// fail with `PoolClosed` until [`restart`](Self::restart).
    pub async fn shutdown(&self) -> PoolStatistics {
        {
            // Wait for a running pass so no connection is left in check.
            let _running = self.inner.sweep_lock.lock().await;
            self.inner.closed.store(true, Ordering::Release);
        }
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.inner.close_all().await;

        let stats = self.statistics();
        info!(
            opened = stats.opened,
            returned = stats.returned,
            sweeps = stats.sweep_runs,
            "Connection pool shut down"
        );
        stats
    }

    /// Shut down and start again with fresh counters. Returns the statistics
    /// of the previous run. Connections loaned before the restart are closed
    /// when released.
    pub async fn restart(&self) -> DbResult<PoolStatistics> {
        let stats = self.shutdown().await;
        self.inner.counters.reset();
        self.inner.touch();
        self.inner.closed.store(false, Ordering::Release);
        self.start().await?;
        info!("Connection pool restarted");
        Ok(stats)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.inner.available_notify.notify_waiters();
    }
}

/// A loaned connection.
///
/// Dropping the guard (or calling [`release`](Self::release)) hands the
/// connection back; the next sweep makes it available again. A loan held
/// longer than the max loan time is revoked: further use fails and the
/// connection is closed when handed back.
pub struct PooledConnection {
    conn: Option<DbConnection>,
    id: u64,
    pool: Weak<PoolInner>,
    revoked: Arc<AtomicBool>,
    loan_started: Instant,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("revoked", &self.is_revoked())
            .field("loaned_for", &self.loan_started.elapsed())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// The physical connection, unless the loan has been revoked.
    pub fn connection(&mut self) -> DbResult<&mut DbConnection> {
        if self.is_revoked() {
            return Err(DbError::timeout(
                "connection loan",
                self.loan_started.elapsed().as_millis() as u64,
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("connection already released"))
    }

    /// Hand the connection back to the pool.
    pub fn release(mut self) {
        self.hand_back();
    }

    fn hand_back(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.give_back(self.id, conn, self.is_revoked()),
            None => close_detached(conn),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.hand_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;

    fn memory_config(settings: PoolSettings) -> ConnectionConfig {
        ConnectionConfig::new("sqlite::memory:", settings).unwrap()
    }

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_pool_size: Some(min),
            max_pool_size: Some(max),
            // Tests drive sweeps by hand; the sweeper only runs when nudged.
            sweep_period_ms: Some(60_000),
            acquire_timeout_ms: Some(2000),
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn test_connect_opens_minimum() {
        let pool = ConnectionPool::connect(memory_config(settings(2, 4))).await.unwrap();
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.loaned_count(), 0);
        assert_eq!(pool.statistics().opened, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_and_release_cycle() {
        let pool = ConnectionPool::connect(memory_config(settings(1, 2))).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.connection().unwrap().ping().await);
        assert_eq!(pool.loaned_count(), 1);

        let snapshot = pool.connections();
        let loaned = snapshot.iter().find(|s| s.id == conn.id()).unwrap();
        assert_eq!(loaned.state, ConnectionState::Loaned);
        assert!(loaned.caller.as_deref().unwrap().contains("pool.rs"));

        conn.release();
        pool.sweep().await.unwrap();
        assert_eq!(pool.loaned_count(), 0);
        assert!(pool.statistics().returned >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_fails_fast() {
        let pool = ConnectionPool::connect(memory_config(settings(1, 1))).await.unwrap();
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { loaned: 1, max: 1 }));
        assert_eq!(pool.statistics().exhausted_rejecting, 1);
        drop(held);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiting_acquire_grows_pool() {
        let pool = ConnectionPool::connect(memory_config(settings(0, 2))).await.unwrap();
        assert_eq!(pool.available_count(), 0);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.statistics().exhausted_blocking, 1);
        drop(conn);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoked_loan_cannot_be_used() {
        let mut s = settings(1, 1);
        s.max_loan_time_ms = Some(10);
        let pool = ConnectionPool::connect(memory_config(s)).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.sweep().await.unwrap();
        assert!(conn.is_revoked());
        assert!(matches!(conn.connection(), Err(DbError::Timeout { .. })));
        assert_eq!(pool.statistics().expired_loan, 1);
        conn.release();
        assert_eq!(pool.loaned_count(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_empties_and_closes() {
        let pool = ConnectionPool::connect(memory_config(settings(2, 3))).await.unwrap();
        let stats = pool.shutdown().await;
        assert_eq!(stats.opened, 2);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.loaned_count(), 0);
        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
    }
}
