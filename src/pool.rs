use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::route::Address;
use crate::util::{lock_unpoisoned, wait_timeout_unpoisoned};

pub(crate) const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;
pub(crate) const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);
const CLEANUP_THREAD_NAME: &str = "callx-pool-cleanup";

struct IdleConnection {
    connection: Connection,
    idle_since: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    in_use: usize,
    cleanup_running: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    condvar: Condvar,
    max_idle_connections: usize,
    keep_alive: Duration,
}

/// Keeps idle connections for reuse by later calls with an equal [`Address`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionPool")
            .field("max_idle_connections", &self.inner.max_idle_connections)
            .field("keep_alive", &self.inner.keep_alive)
            .field("idle", &self.idle_connection_count())
            .field("total", &self.connection_count())
            .finish()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_KEEP_ALIVE)
    }
}

impl PartialEq for ConnectionPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ConnectionPool {
    pub fn new(max_idle_connections: usize, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    cleanup_running: false,
                }),
                condvar: Condvar::new(),
                max_idle_connections,
                keep_alive,
            }),
        }
    }

    pub fn max_idle_connections(&self) -> usize {
        self.inner.max_idle_connections
    }

    pub fn keep_alive(&self) -> Duration {
        self.inner.keep_alive
    }

    pub fn idle_connection_count(&self) -> usize {
        lock_unpoisoned(&self.inner.state).idle.len()
    }

    pub fn connection_count(&self) -> usize {
        let state = lock_unpoisoned(&self.inner.state);
        state.idle.len() + state.in_use
    }

    /// Takes an idle connection whose address equals `address`. Unhealthy
    /// candidates stay in the idle set for the cleanup thread to close.
    pub fn acquire(&self, address: &Address) -> Option<PooledConnection> {
        let mut state = lock_unpoisoned(&self.inner.state);
        let mut saw_unhealthy = false;
        let position = state.idle.iter().position(|idle| {
            if idle.connection.route().address() != address {
                return false;
            }
            let healthy = idle.connection.is_healthy();
            saw_unhealthy |= !healthy;
            healthy
        });
        if saw_unhealthy {
            self.inner.condvar.notify_all();
        }
        let connection = state.idle.remove(position?).connection;
        state.in_use += 1;
        drop(state);

        debug!(connection_id = connection.id(), "reusing pooled connection");
        Some(PooledConnection {
            pool: self.clone(),
            connection: Some(connection),
            reused: true,
        })
    }

    /// Registers a freshly established connection as in use.
    pub fn track(&self, connection: Connection) -> PooledConnection {
        lock_unpoisoned(&self.inner.state).in_use += 1;
        PooledConnection {
            pool: self.clone(),
            connection: Some(connection),
            reused: false,
        }
    }

    /// Runs one eviction sweep now. Returns the number of connections closed.
    pub fn evict_idle(&self) -> usize {
        let evicted = {
            let mut state = lock_unpoisoned(&self.inner.state);
            let (evicted, _) = self.inner.sweep(&mut state, Instant::now());
            evicted
        };
        let count = evicted.len();
        for connection in evicted {
            connection.close();
        }
        count
    }

    pub fn evict_all(&self) {
        let evicted = std::mem::take(&mut lock_unpoisoned(&self.inner.state).idle);
        for idle in evicted {
            idle.connection.close();
        }
        self.inner.condvar.notify_all();
    }

    fn release(&self, connection: Connection) {
        let close = connection.no_new_exchanges()
            || self.inner.max_idle_connections == 0
            || !connection.is_healthy();
        let mut state = lock_unpoisoned(&self.inner.state);
        state.in_use = state.in_use.saturating_sub(1);
        if close {
            drop(state);
            debug!(connection_id = connection.id(), "closing released connection");
            connection.close();
            return;
        }

        state.idle.push(IdleConnection {
            connection,
            idle_since: Instant::now(),
        });
        if state.cleanup_running {
            self.inner.condvar.notify_all();
            return;
        }
        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name(CLEANUP_THREAD_NAME.to_owned())
            .spawn(move || run_cleanup(inner))
        {
            Ok(_) => state.cleanup_running = true,
            Err(error) => warn!(error = %error, "failed to spawn pool cleanup thread"),
        }
    }
}

impl PoolInner {
    /// Evicts unhealthy and expired connections, then trims the idle set to
    /// its cap, longest idle first. Returns the evicted connections and how
    /// long to wait before the next sweep, or `None` when nothing is idle.
    fn sweep(&self, state: &mut PoolState, now: Instant) -> (Vec<Connection>, Option<Duration>) {
        let mut evicted = Vec::new();
        let mut index = 0;
        while index < state.idle.len() {
            let idle = &state.idle[index];
            let expired = now.saturating_duration_since(idle.idle_since) >= self.keep_alive;
            if expired || !idle.connection.is_healthy() {
                evicted.push(state.idle.remove(index).connection);
            } else {
                index += 1;
            }
        }

        while state.idle.len() > self.max_idle_connections {
            let Some(oldest) = state
                .idle
                .iter()
                .enumerate()
                .min_by_key(|(_, idle)| idle.idle_since)
                .map(|(index, _)| index)
            else {
                break;
            };
            evicted.push(state.idle.remove(oldest).connection);
        }

        let next = state
            .idle
            .iter()
            .map(|idle| idle.idle_since)
            .min()
            .map(|oldest| {
                self.keep_alive
                    .saturating_sub(now.saturating_duration_since(oldest))
            });
        (evicted, next)
    }
}

fn run_cleanup(inner: Arc<PoolInner>) {
    let mut state = lock_unpoisoned(&inner.state);
    loop {
        let (evicted, next) = inner.sweep(&mut state, Instant::now());
        if !evicted.is_empty() {
            drop(state);
            debug!(evicted = evicted.len(), "evicted idle connections");
            for connection in evicted {
                connection.close();
            }
            state = lock_unpoisoned(&inner.state);
            continue;
        }
        match next {
            None => {
                state.cleanup_running = false;
                return;
            }
            Some(wait) => {
                state = wait_timeout_unpoisoned(&inner.condvar, state, wait);
            }
        }
    }
}

/// Exclusive use of one pooled connection. Dropping the guard releases the
/// connection back to the pool, or closes it when it cannot be reused.
pub struct PooledConnection {
    pool: ConnectionPool,
    connection: Option<Connection>,
    reused: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .field("reused", &self.reused)
            .finish()
    }
}

impl PooledConnection {
    /// True when the connection came from the idle set rather than being
    /// freshly established for this call.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
