//! In-memory driver for tests and examples
//!
//! [`MemoryDriver`] opens connections for any `memory:` URL and records
//! everything that happens to them: opens, closes, statements, commits
//! and rollbacks. Failures can be injected per driver: the next N
//! connects can fail, and statements matching a marker can either break
//! the connection (fatal) or be rejected (non-fatal).
//!
//! The driver handle is cheaply cloneable; clones share the recorded
//! state, so a test can keep one handle for assertions and give another
//! to the datasource.

use cistern_core::{ConnectProps, Driver, DriverError, RawConnection};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct DriverState {
    opened: AtomicU32,
    closed: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
    fail_connects: AtomicU32,
    statements: Mutex<Vec<(u32, String)>>,
    break_marker: Mutex<Option<String>>,
    reject_marker: Mutex<Option<String>>,
}

/// In-memory driver that records calls and fails on demand.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<DriverState>,
}

impl MemoryDriver {
    /// A fresh driver with no recorded history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened so far.
    pub fn opened(&self) -> u32 {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn closed_count(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Commits observed across all connections.
    pub fn commits(&self) -> u32 {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks observed across all connections.
    pub fn rollbacks(&self) -> u32 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Statements executed across all connections, as
    /// `(connection id, sql)` in execution order.
    pub fn statements(&self) -> Vec<(u32, String)> {
        self.state.statements.lock().clone()
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Statements containing `marker` break their connection: they fail
    /// fatally and the connection refuses further work.
    pub fn break_on_statement(&self, marker: &str) {
        *self.state.break_marker.lock() = Some(marker.to_string());
    }

    /// Statements containing `marker` are rejected without harming the
    /// connection.
    pub fn reject_statement(&self, marker: &str) {
        *self.state.reject_marker.lock() = Some(marker.to_string());
    }
}

impl Driver for MemoryDriver {
    fn connect(
        &self,
        url: &str,
        _props: &ConnectProps,
    ) -> Result<Box<dyn RawConnection>, DriverError> {
        if !url.starts_with("memory:") {
            return Err(DriverError::UnsupportedUrl(url.to_string()));
        }
        let pending = &self.state.fail_connects;
        if pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(DriverError::Connect("injected connect failure".into()));
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            id,
            auto_commit: true,
            closed: false,
            broken: false,
        }))
    }
}

struct MemoryConnection {
    state: Arc<DriverState>,
    id: u32,
    auto_commit: bool,
    closed: bool,
    broken: bool,
}

impl MemoryConnection {
    fn check_usable(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.broken {
            return Err(DriverError::ConnectionBroken("connection is broken".into()));
        }
        Ok(())
    }

    fn matches(marker: &Mutex<Option<String>>, sql: &str) -> bool {
        marker
            .lock()
            .as_deref()
            .is_some_and(|m| sql.contains(m))
    }
}

impl RawConnection for MemoryConnection {
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.check_usable()?;
        if Self::matches(&self.state.break_marker, sql) {
            self.broken = true;
            return Err(DriverError::ConnectionBroken(format!(
                "broken by statement: {sql}"
            )));
        }
        if Self::matches(&self.state.reject_marker, sql) {
            return Err(DriverError::Rejected(sql.to_string()));
        }
        self.state.statements.lock().push((self.id, sql.to_string()));
        Ok(1)
    }

    fn query_row(&mut self, sql: &str) -> Result<Option<String>, DriverError> {
        self.execute(sql)?;
        Ok(Some(format!("conn-{}", self.id)))
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.check_usable()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.check_usable()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError> {
        self.check_usable()?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
