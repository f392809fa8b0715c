//! Idle connection pool
//!
//! Keeps released connections per destination so later requests can skip the
//! dial. Buckets are ordered most-recently-released first; borrowing takes
//! from the front, eviction under global pressure takes the oldest back
//! entry across all buckets.

use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::pool::Destination;
use crate::transport::{ByteConnection, ConnId, ConnectionState};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Why a returned connection was closed instead of pooled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Failed the liveness check or had unread bytes buffered.
    Unhealthy,
    /// The destination already holds `per_destination_idle_cap` connections.
    DestinationFull,
    /// `global_idle_cap` is zero.
    PoolDisabled,
    ShutDown,
}

/// What `put` did with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Parked at the head of its bucket; `evicted` older connections were
    /// closed to stay under the global cap.
    Pooled { evicted: usize },
    Closed(CloseReason),
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<Destination, VecDeque<ByteConnection>>,
    idle: usize,
    shut_down: bool,
}

impl PoolState {
    fn pop_newest(&mut self, destination: &Destination) -> Option<ByteConnection> {
        let bucket = self.buckets.get_mut(destination)?;
        let conn = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(destination);
        }
        if conn.is_some() {
            self.idle -= 1;
        }
        conn
    }

    /// Split off the idle connections in `destination` older than
    /// `idle_timeout`. Buckets are newest-first, so they form its tail.
    fn take_expired(&mut self, destination: &Destination, idle_timeout: Duration) -> Vec<ByteConnection> {
        let Some(bucket) = self.buckets.get_mut(destination) else {
            return Vec::new();
        };
        let first_expired = bucket
            .iter()
            .position(|c| c.idle_for() > idle_timeout)
            .unwrap_or(bucket.len());
        let taken = Vec::from(bucket.split_off(first_expired));
        if bucket.is_empty() {
            self.buckets.remove(destination);
        }
        self.idle -= taken.len();
        taken
    }

    /// Remove the least-recently-released idle connection in the pool.
    fn pop_oldest(&mut self) -> Option<ByteConnection> {
        let destination = self
            .buckets
            .iter()
            .filter_map(|(dest, bucket)| bucket.back().map(|c| (dest, c.last_used())))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(dest, _)| dest.clone())?;

        let bucket = self.buckets.get_mut(&destination)?;
        let conn = bucket.pop_back();
        if bucket.is_empty() {
            self.buckets.remove(&destination);
        }
        if conn.is_some() {
            self.idle -= 1;
        }
        conn
    }

    fn remove(&mut self, id: ConnId) -> Option<ByteConnection> {
        let (destination, index) = self.buckets.iter().find_map(|(dest, bucket)| {
            bucket
                .iter()
                .position(|c| c.id() == id)
                .map(|i| (dest.clone(), i))
        })?;

        let bucket = self.buckets.get_mut(&destination)?;
        let conn = bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&destination);
        }
        if conn.is_some() {
            self.idle -= 1;
        }
        conn
    }
}

/// Keyed cache of idle connections.
///
/// One mutex guards all buckets because the global cap evicts across
/// destinations. It is held only while moving connections in or out; probes,
/// closes and all other I/O happen after it is released.
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the most recently released live connection for `destination`.
    ///
    /// Never waits for a connection to be returned: `None` tells the caller
    /// to dial a new one. Expired or dead connections found on the way are
    /// discarded.
    pub async fn borrow(&self, destination: &Destination) -> Option<ByteConnection> {
        loop {
            let mut conn = self.state.lock().await.pop_newest(destination)?;

            if conn.idle_for() > self.config.idle_timeout {
                let expired = self
                    .state
                    .lock()
                    .await
                    .take_expired(destination, self.config.idle_timeout);
                debug!(
                    destination = %destination,
                    count = expired.len() + 1,
                    "Discarding expired idle connections"
                );
                return None;
            }

            if !conn.probe() {
                debug!(conn_id = %conn.id(), destination = %destination, "Discarding dead idle connection");
                continue;
            }

            conn.mark_borrowed();
            trace!(conn_id = %conn.id(), destination = %destination, "Reusing idle connection");
            return Some(conn);
        }
    }

    /// Hand a connection back after its response was released.
    ///
    /// Over the per-destination cap the returned connection is closed; over
    /// the global cap the oldest idle connection anywhere is closed to make
    /// room. Close failures of healthy connections are returned.
    pub async fn put(&self, destination: &Destination, mut conn: ByteConnection) -> Result<ReturnOutcome> {
        let healthy = conn.state() == ConnectionState::Borrowed && !conn.has_buffered() && conn.probe();
        if !healthy {
            debug!(conn_id = %conn.id(), destination = %destination, "Not pooling unhealthy connection");
            return Ok(ReturnOutcome::Closed(CloseReason::Unhealthy));
        }

        let (outcome, victim) = {
            let mut state = self.state.lock().await;
            let held = state.buckets.get(destination).map_or(0, VecDeque::len);

            if state.shut_down {
                (ReturnOutcome::Closed(CloseReason::ShutDown), Some(conn))
            } else if self.config.global_idle_cap == 0 {
                (ReturnOutcome::Closed(CloseReason::PoolDisabled), Some(conn))
            } else if held >= self.config.per_destination_idle_cap {
                (ReturnOutcome::Closed(CloseReason::DestinationFull), Some(conn))
            } else {
                let evicted = if state.idle >= self.config.global_idle_cap {
                    state.pop_oldest()
                } else {
                    None
                };
                conn.mark_idle();
                trace!(conn_id = %conn.id(), destination = %destination, "Connection returned to pool");
                state
                    .buckets
                    .entry(destination.clone())
                    .or_default()
                    .push_front(conn);
                state.idle += 1;
                (
                    ReturnOutcome::Pooled {
                        evicted: usize::from(evicted.is_some()),
                    },
                    evicted,
                )
            }
        };

        if let Some(victim) = victim {
            debug!(conn_id = %victim.id(), outcome = ?outcome, "Closing connection on return");
            victim.close().await.map_err(ClientError::Close)?;
        }
        Ok(outcome)
    }

    /// Remove one idle connection, wherever it is, and close it.
    ///
    /// Returns `false` if the connection is no longer idle in this pool.
    pub async fn evict(&self, id: ConnId) -> Result<bool> {
        let Some(conn) = self.state.lock().await.remove(id) else {
            return Ok(false);
        };
        debug!(conn_id = %id, destination = %conn.destination(), "Evicting idle connection");
        conn.close().await.map_err(ClientError::Close)?;
        Ok(true)
    }

    /// Evict every idle connection older than the idle timeout.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired: Vec<ConnId> = {
            let state = self.state.lock().await;
            state
                .buckets
                .values()
                .flatten()
                .filter(|c| c.idle_for() > self.config.idle_timeout)
                .map(ByteConnection::id)
                .collect()
        };

        let mut evicted = 0;
        for id in expired {
            if self.evict(id).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Run `sweep_expired` every `every` until the pool is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                match pool.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!(evicted = n, "Idle sweep"),
                    Err(e) => warn!(error = %e, "Idle sweep failed"),
                }
            }
        })
    }

    /// Close every idle connection; later returns are closed too.
    pub async fn shutdown(&self) -> Result<usize> {
        let drained: Vec<ByteConnection> = {
            let mut state = self.state.lock().await;
            state.shut_down = true;
            state.idle = 0;
            state.buckets.drain().flat_map(|(_, bucket)| bucket).collect()
        };

        let count = drained.len();
        let mut first_error = None;
        for conn in drained {
            if let Err(e) = conn.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(ClientError::Close(e)),
            None => Ok(count),
        }
    }

    pub async fn idle_count(&self, destination: &Destination) -> usize {
        self.state
            .lock()
            .await
            .buckets
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    pub async fn total_idle(&self) -> usize {
        self.state.lock().await.idle
    }

    /// Idle connection ids for `destination`, most recently released first.
    pub async fn idle_ids(&self, destination: &Destination) -> Vec<ConnId> {
        self.state
            .lock()
            .await
            .buckets
            .get(destination)
            .map(|b| b.iter().map(ByteConnection::id).collect())
            .unwrap_or_default()
    }
}
