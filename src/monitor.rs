//! Resource accounting for response handles and connections.
//!
//! The monitor only counts; it never changes what the pool or a handle does.
//! An unreleased response is not an error anywhere in the client, so these
//! counters are the only place a leak becomes visible.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct LeakMonitor {
    handles_created: AtomicUsize,
    handles_released: AtomicUsize,
    handles_abandoned: AtomicUsize,
    outstanding: AtomicUsize,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    live_connections: AtomicUsize,
    background_workers: AtomicUsize,
    stale_retries: AtomicUsize,
    protocol_violations: AtomicUsize,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeakSnapshot {
    pub handles_created: usize,
    pub handles_released: usize,
    /// Handles dropped without an explicit release.
    pub handles_abandoned: usize,
    pub outstanding: usize,
    pub connections_opened: usize,
    pub connections_closed: usize,
    /// Open connections, idle or borrowed.
    pub live_connections: usize,
    /// Open connections reserved by an in-flight request or response.
    pub background_workers: usize,
    pub stale_retries: usize,
    pub protocol_violations: usize,
}

impl LeakMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles created and not yet released or dropped.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Connections currently held outside the idle pool, each of which
    /// stands for a reader waiting on its socket.
    pub fn background_worker_count(&self) -> usize {
        self.background_workers.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> LeakSnapshot {
        LeakSnapshot {
            handles_created: self.handles_created.load(Ordering::SeqCst),
            handles_released: self.handles_released.load(Ordering::SeqCst),
            handles_abandoned: self.handles_abandoned.load(Ordering::SeqCst),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            connections_opened: self.connections_opened.load(Ordering::SeqCst),
            connections_closed: self.connections_closed.load(Ordering::SeqCst),
            live_connections: self.live_connections.load(Ordering::SeqCst),
            background_workers: self.background_workers.load(Ordering::SeqCst),
            stale_retries: self.stale_retries.load(Ordering::SeqCst),
            protocol_violations: self.protocol_violations.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn handle_created(&self) {
        self.handles_created.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_released(&self) {
        self.handles_released.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_abandoned(&self) {
        self.handles_abandoned.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// A new connection starts out borrowed by the request that opened it.
    pub(crate) fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.live_connections.fetch_add(1, Ordering::SeqCst);
        self.background_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::SeqCst);
        self.live_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_started(&self) {
        self.background_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_stopped(&self) {
        self.background_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn stale_retry(&self) {
        self.stale_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::SeqCst);
    }
}
