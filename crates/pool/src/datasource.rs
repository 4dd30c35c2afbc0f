//! Bounded connection pool with per-transaction affinity
//!
//! [`DataSource`] keeps a bounded set of reusable connections. Borrowers
//! take the most recently released connection first (LIFO, keeping the
//! working set hot and letting cold connections age out), wait on a
//! condition variable when the pool is exhausted, and fail after the
//! borrow timeout. A time-based idle sweep destroys connections unused
//! longer than the keep-alive.
//!
//! When the calling thread is inside a transaction, the first borrow is
//! pinned to that transaction: the connection is switched out of
//! auto-commit, enlisted as a one-phase resource, and every further
//! `get_connection` on that thread returns the same connection until the
//! transaction completes. Completion unpins the connection, restores
//! auto-commit and releases it back to the pool.
//!
//! Locking: one mutex + condition variable guard the pool state (idle
//! queue, counters, closed flag). Driver I/O (opening, closing, session
//! commands) always happens outside that monitor; an I/O stall must
//! never freeze borrowers.

use cistern_core::{ConnectProps, Driver, DriverError, RawConnection, XaResource};
use cistern_txn::{Transaction, TransactionCoordinator};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionInner, PooledConnection};
use crate::error::PoolError;
use crate::resource::ConnectionResource;

struct PoolState {
    /// Idle connections, front = most recently released.
    idle: VecDeque<Arc<ConnectionInner>>,
    /// Currently alive connections (idle + borrowed + pinned).
    created_count: u32,
    /// Threads blocked in borrow.
    waiting: u32,
    /// Next instant at which the idle sweep runs; `None` means due.
    check_idle_at: Option<Instant>,
    closed: bool,
}

pub(crate) struct PoolShared {
    name: String,
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    props: ConnectProps,
    state: Mutex<PoolState>,
    available: Condvar,
    /// Transaction global id -> pinned connection. Concurrent map outside
    /// the monitor: entries are keyed by transaction identity and each
    /// transaction is owned by exactly one thread at a time.
    in_transaction: DashMap<u64, Arc<ConnectionInner>>,
    /// Handle to this shared state, given to connections and adapters as
    /// their non-owning back-reference.
    weak_self: Weak<PoolShared>,
}

/// Point-in-time management readout of a [`DataSource`].
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Connection URL.
    pub url: String,
    /// Currently alive connections.
    pub open_connections: u32,
    /// Connections in the idle queue.
    pub idle_connections: usize,
    /// Transactions with a pinned connection.
    pub transactions: usize,
    /// Configured hard upper bound.
    pub max_connections: u32,
    /// Configured borrow timeout.
    pub borrow_timeout: Duration,
    /// Configured lock-timeout session setting.
    pub lock_timeout: i64,
}

/// A named, bounded pool of database connections.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct DataSource {
    shared: Arc<PoolShared>,
}

impl DataSource {
    /// Create a datasource over the given driver.
    ///
    /// No connection is opened here; connections are created on demand
    /// up to the configured pool size.
    ///
    /// # Errors
    ///
    /// [`PoolError::Config`] when the descriptor does not validate.
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let props = ConnectProps::new(config.user.clone(), config.password.clone());
        Ok(Self {
            shared: Arc::new_cyclic(|weak_self| PoolShared {
                name: name.into(),
                config,
                driver,
                props,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    created_count: 0,
                    waiting: 0,
                    check_idle_at: None,
                    closed: false,
                }),
                available: Condvar::new(),
                in_transaction: DashMap::new(),
                weak_self: weak_self.clone(),
            }),
        })
    }

    /// Name of this datasource.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Connection URL of this datasource.
    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    /// Borrow a connection.
    ///
    /// Without a transaction on the current thread this is a plain
    /// borrow. Inside a transaction, the connection already pinned to it
    /// is returned, or a fresh borrow is enlisted and pinned.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] after shutdown, [`PoolError::BorrowTimeout`]
    /// when nothing frees up in time, [`PoolError::Driver`] when opening
    /// a fresh connection fails (pool capacity is restored), and
    /// [`PoolError::Transaction`] when enlistment fails (the borrowed
    /// connection is released first).
    pub fn get_connection(&self) -> Result<PooledConnection, PoolError> {
        match TransactionCoordinator::current() {
            None => Ok(PooledConnection::from_inner(self.shared.borrow()?)),
            Some(tx) => {
                let existing = self
                    .shared
                    .in_transaction
                    .get(&tx.global_id())
                    .map(|entry| entry.value().clone());
                if let Some(inner) = existing {
                    debug!(datasource = %self.shared.name, tx = %tx, "reuse");
                    return Ok(PooledConnection::from_inner(inner));
                }
                let inner = self.shared.borrow()?;
                let inner = self.shared.register_in_transaction(inner, &tx)?;
                Ok(PooledConnection::from_inner(inner))
            }
        }
    }

    /// Borrow a connection, ignoring the given credentials.
    ///
    /// Credentials are fixed at pool construction; this exists for
    /// callers written against a per-call-credential surface.
    pub fn get_connection_as(
        &self,
        _user: &str,
        _password: &str,
    ) -> Result<PooledConnection, PoolError> {
        self.get_connection()
    }

    /// Shut the pool down.
    ///
    /// Idle connections are destroyed, waiting borrowers are woken and
    /// fail with [`PoolError::Closed`]. Connections currently pinned to
    /// transactions survive the call and are destroyed when their
    /// transactions complete. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the pool has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// Management readout.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataSource{{{}}}", self.shared.name)
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("DataSource")
            .field("name", &self.shared.name)
            .field("url", &stats.url)
            .field("open", &stats.open_connections)
            .field("idle", &stats.idle_connections)
            .finish()
    }
}

impl PoolShared {
    /// Lock the pool state, recovering from a poisoned monitor.
    ///
    /// The state is plain counters and queues, consistent at every
    /// unlock point, so a peer that panicked inside a critical section
    /// leaves nothing to repair. The poison flag is cleared here so one
    /// panicked thread cannot wedge the pool for every later caller.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            self.state.clear_poison();
            poisoned.into_inner()
        })
    }

    /// Borrow protocol. Reuses an idle connection, creates a new one
    /// while capacity permits, or waits until one frees up.
    fn borrow(&self) -> Result<Arc<ConnectionInner>, PoolError> {
        let entry = Instant::now();
        self.maybe_sweep_idle(entry);

        {
            let mut state = self.lock_state();
            loop {
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(inner) = state.idle.pop_front() {
                    inner.mark_borrowed(entry);
                    return Ok(inner);
                }
                if state.created_count < self.config.pool_size {
                    // Reserve capacity now; the open happens after the
                    // monitor is released.
                    state.created_count += 1;
                    break;
                }
                let Some(remaining) = self.config.borrow_timeout.checked_sub(entry.elapsed())
                else {
                    return Err(PoolError::BorrowTimeout);
                };
                if remaining.is_zero() {
                    return Err(PoolError::BorrowTimeout);
                }
                state.waiting += 1;
                match self.available.wait_timeout(state, remaining) {
                    Ok((guard, _)) => {
                        state = guard;
                        state.waiting -= 1;
                    }
                    Err(poisoned) => {
                        // A peer panicked inside the monitor while this
                        // borrower was blocked: only this borrower fails.
                        // Capacity was never reserved on this path, and
                        // clearing the flag keeps the monitor usable for
                        // everyone else.
                        let (mut state, _) = poisoned.into_inner();
                        state.waiting -= 1;
                        self.state.clear_poison();
                        return Err(PoolError::Interrupted);
                    }
                }
            }
        }

        match self.open_raw_connection() {
            Ok(raw) => Ok(Arc::new(ConnectionInner::new(
                raw,
                self.weak_self.clone(),
                entry,
            ))),
            Err(e) => {
                self.relinquish_capacity();
                Err(e.into())
            }
        }
    }

    /// Open a fresh raw connection and apply the lock-timeout session
    /// setting. Runs outside the monitor.
    fn open_raw_connection(&self) -> Result<Box<dyn RawConnection>, DriverError> {
        let mut raw = self.driver.connect(&self.config.url, &self.props)?;
        if self.config.lock_timeout >= 0 {
            let sql = format!("SET LOCK_TIMEOUT {}", self.config.lock_timeout);
            if let Err(e) = raw.execute(&sql) {
                error!(
                    datasource = %self.name,
                    sql = %sql,
                    error = %e,
                    "cannot execute session command"
                );
            }
        }
        Ok(raw)
    }

    /// Undo a capacity reservation after a failed open, waking one
    /// waiter so it can try to create instead.
    fn relinquish_capacity(&self) {
        let mut state = self.lock_state();
        if !state.closed {
            state.created_count -= 1;
            if state.waiting > 0 {
                self.available.notify_one();
            }
        }
    }

    /// Time-throttled idle sweep: at most once per `keep_alive / 10`,
    /// destroy every idle connection unused for longer than the
    /// keep-alive. Raw handles are closed after the monitor is released.
    fn maybe_sweep_idle(&self, now: Instant) {
        let expired: Vec<Arc<ConnectionInner>> = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let due = state.check_idle_at.is_none_or(|at| now > at);
            if !due {
                return;
            }
            state.check_idle_at = Some(now + self.config.keep_alive / 10);

            let Some(cutoff) = now.checked_sub(self.config.keep_alive) else {
                return;
            };
            let mut expired = Vec::new();
            state.idle.retain(|inner| {
                if inner.last_access() < cutoff {
                    expired.push(inner.clone());
                    false
                } else {
                    true
                }
            });
            for _ in &expired {
                state.created_count -= 1;
                if state.waiting > 0 {
                    self.available.notify_one();
                }
            }
            expired
        };

        if !expired.is_empty() {
            debug!(datasource = %self.name, count = expired.len(), "closing idle connections");
            for inner in expired {
                inner.destroy();
            }
        }
    }

    /// Release protocol: an invalidated connection gives its capacity
    /// back and is destroyed; otherwise the connection returns to the
    /// front of the idle queue, waking one waiter. After shutdown every
    /// released connection is destroyed.
    pub(crate) fn release(&self, inner: &Arc<ConnectionInner>) {
        if inner.invalidated() {
            if inner.begin_destroy() {
                self.relinquish_capacity();
                inner.close_raw();
            }
            return;
        }

        let destroy = {
            let mut state = self.lock_state();
            if state.closed {
                inner.begin_destroy()
            } else if inner.mark_idle() {
                state.idle.push_front(inner.clone());
                if state.waiting > 0 {
                    self.available.notify_one();
                }
                false
            } else {
                // Already idle or destroyed; nothing to release.
                false
            }
        };
        if destroy {
            inner.close_raw();
        }
    }

    /// Shutdown: destroy the idle set, zero the capacity, wake everyone.
    fn close(&self) {
        let victims: Vec<Arc<ConnectionInner>> = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.created_count = 0;
            self.available.notify_all();
            state.idle.drain(..).collect()
        };

        info!(datasource = %self.name, count = victims.len(), "closed");
        for inner in victims {
            inner.destroy();
        }
    }

    /// Pin a freshly borrowed connection to the transaction: switch off
    /// auto-commit, enlist the adapter, record the affinity. On failure
    /// the connection is released (honoring its invalidate flag) and the
    /// error propagates.
    pub(crate) fn register_in_transaction(
        &self,
        inner: Arc<ConnectionInner>,
        tx: &Arc<Transaction>,
    ) -> Result<Arc<ConnectionInner>, PoolError> {
        debug!(datasource = %self.name, tx = %tx, "register");

        let enlist = || -> Result<(), PoolError> {
            inner.with_raw(|raw| raw.set_auto_commit(false))?;
            let adapter: Arc<dyn XaResource> = Arc::new(ConnectionResource::new(
                inner.clone(),
                self.weak_self.clone(),
            ));
            tx.enlist_resource(adapter)?;
            Ok(())
        };
        if let Err(e) = enlist() {
            self.release(&inner);
            return Err(e);
        }

        inner.pin(tx.global_id());
        self.in_transaction.insert(tx.global_id(), inner.clone());
        Ok(inner)
    }

    /// Unpin after transaction completion: drop the affinity entry,
    /// restore auto-commit and release. Idempotent.
    pub(crate) fn unregister_from_transaction(&self, inner: &Arc<ConnectionInner>) {
        let Some(tx_id) = inner.unpin() else {
            return;
        };
        debug!(datasource = %self.name, tx = tx_id, "unregister");
        self.in_transaction.remove(&tx_id);

        if let Err(e) = inner.with_raw(|raw| raw.set_auto_commit(true)) {
            // The session state is unknown; do not hand this connection
            // to the next borrower.
            warn!(
                datasource = %self.name,
                error = %e,
                "cannot restore auto-commit, invalidating connection"
            );
            inner.set_invalidated();
        }
        self.release(inner);
    }

    fn stats(&self) -> PoolStats {
        let (open, idle) = {
            let state = self.lock_state();
            (state.created_count, state.idle.len())
        };
        PoolStats {
            url: self.config.url.clone(),
            open_connections: open,
            idle_connections: idle,
            transactions: self.in_transaction.len(),
            max_connections: self.config.pool_size,
            borrow_timeout: self.config.borrow_timeout,
            lock_timeout: self.config.lock_timeout,
        }
    }
}
