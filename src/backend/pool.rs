use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::metrics::metrics;
use crate::topology::NodeDescriptor;

use super::connection::{BackendConnection, ConnectionState};
use super::{BackendError, Connector};

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No backend connection available within {0:?}")]
    Exhausted(Duration),

    #[error("Failed to establish backend connection: {0}")]
    Connect(#[source] BackendError),

    #[error("Pool is shut down")]
    Closed,
}

struct PoolCore {
    idle: VecDeque<Arc<BackendConnection>>,
    /// Live (non-discarded) connections, idle or handed out
    live: usize,
}

/// Per-node set of backend connections.
///
/// `acquire` hands out exclusively owned connections bounded by a caller
/// deadline; the caller decides `release` vs `discard` on return. A
/// background refresher validates idle connections and repairs the pool to
/// its configured size.
pub struct BackendPool {
    node: NodeDescriptor,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    core: Mutex<PoolCore>,
    notify: Notify,
    cancel: CancellationToken,
}

impl BackendPool {
    pub fn new(node: NodeDescriptor, config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            node,
            config,
            connector,
            core: Mutex::new(PoolCore {
                idle: VecDeque::new(),
                live: 0,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn node_tag(&self) -> &str {
        &self.node.tag
    }

    /// Acquire a connection, blocking up to `timeout` for one to become
    /// available or creatable.
    pub async fn acquire(&self, timeout: Duration) -> Result<Arc<BackendConnection>, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PoolError::Closed);
            }

            // Register for wakeups before checking, so a release racing
            // with the check is not missed.
            let notified = self.notify.notified();

            // Reuse an idle connection
            let (got, junk) = {
                let mut core = self.core.lock();
                let mut got = None;
                let mut junk = Vec::new();
                while let Some(conn) = core.idle.pop_front() {
                    if conn.is_broken() || !conn.try_mark_in_use() {
                        junk.push(conn);
                        continue;
                    }
                    got = Some(conn);
                    break;
                }
                (got, junk)
            };
            for conn in junk {
                debug!(addr = %self.node.addr(), "Dropping unusable idle connection");
                self.discard(conn).await;
            }
            if let Some(conn) = got {
                metrics().pool_acquired_total.inc();
                debug!(addr = %self.node.addr(), "Reusing idle connection");
                return Ok(conn);
            }

            // Create a new connection if under capacity
            let reserved = {
                let mut core = self.core.lock();
                if core.live < self.config.capacity {
                    core.live += 1;
                    true
                } else {
                    false
                }
            };
            if reserved {
                match self.connector.connect(&self.node).await {
                    Ok(link) => {
                        let conn = Arc::new(BackendConnection::new(
                            &self.node,
                            link,
                            self.config.statement_cache_capacity,
                        ));
                        conn.try_mark_in_use();
                        metrics().pool_acquired_total.inc();
                        debug!(addr = %self.node.addr(), "Created new connection");
                        return Ok(conn);
                    }
                    Err(e) => {
                        self.core.lock().live -= 1;
                        self.notify.notify_one();
                        warn!(addr = %self.node.addr(), error = %e, "Backend connect failed");
                        return Err(PoolError::Connect(e));
                    }
                }
            }

            // At capacity: wait for a release or the deadline
            let now = Instant::now();
            if now >= deadline {
                metrics().pool_exhausted_total.inc();
                return Err(PoolError::Exhausted(timeout));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(deadline - now) => {
                    metrics().pool_exhausted_total.inc();
                    return Err(PoolError::Exhausted(timeout));
                }
            }
        }
    }

    /// Return a connection to the idle set. The caller has already decided
    /// the connection's session state is clean; a connection that broke in
    /// the meantime is discarded instead.
    pub async fn release(&self, conn: Arc<BackendConnection>) {
        if conn.is_broken() || conn.state() == ConnectionState::Closed {
            debug!(addr = %self.node.addr(), "Released connection is unusable, discarding");
            self.discard(conn).await;
            return;
        }

        conn.mark_idle();
        {
            let mut core = self.core.lock();
            core.idle.push_back(conn);
        }
        self.notify.notify_one();
    }

    /// Remove a connection from accounting and close its socket. Safe to
    /// call twice; the second call is a no-op. Socket closure always runs
    /// when accounting removal does.
    pub async fn discard(&self, conn: Arc<BackendConnection>) {
        if !conn.mark_closed() {
            return;
        }
        {
            let mut core = self.core.lock();
            core.live = core.live.saturating_sub(1);
            core.idle.retain(|c| !Arc::ptr_eq(c, &conn));
        }
        metrics().pool_discarded_total.inc();
        conn.close_link().await;
        self.notify.notify_one();
    }

    /// One refresher pass: validate idle connections, discard failures,
    /// and repair the idle set up to the configured minimum.
    pub async fn maintain(&self) {
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);

        // Removal from the idle set is the mutual exclusion against a
        // concurrent acquire of a connection under validation.
        let candidates: Vec<_> = {
            let mut core = self.core.lock();
            core.idle.drain(..).collect()
        };

        for conn in candidates {
            if !conn.try_mark_in_use() {
                self.discard(conn).await;
                continue;
            }
            let alive = tokio::time::timeout(probe_timeout, conn.ping())
                .await
                .unwrap_or(false);
            if alive {
                self.release(conn).await;
            } else {
                debug!(addr = %self.node.addr(), "Idle connection failed validation");
                self.discard(conn).await;
            }
        }

        // Repair pool size
        let floor = self.config.min_idle.min(self.config.capacity);
        loop {
            let reserved = {
                let mut core = self.core.lock();
                if core.live < floor {
                    core.live += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            match self.connector.connect(&self.node).await {
                Ok(link) => {
                    let conn = Arc::new(BackendConnection::new(
                        &self.node,
                        link,
                        self.config.statement_cache_capacity,
                    ));
                    let mut core = self.core.lock();
                    core.idle.push_back(conn);
                    drop(core);
                    self.notify.notify_one();
                }
                Err(e) => {
                    self.core.lock().live -= 1;
                    warn!(addr = %self.node.addr(), error = %e, "Pool repair connect failed");
                    break;
                }
            }
        }
    }

    /// Spawn the background refresher with a random initial stagger.
    pub fn spawn_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = Duration::from_millis(self.config.refresh_interval_ms);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let stagger = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
            tokio::time::sleep(Duration::from_millis(stagger)).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(addr = %pool.node.addr(), "Pool refresher cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.maintain().await;
                    }
                }
            }
        })
    }

    /// Stop the refresher and close every idle connection. Connections
    /// currently handed out are discarded when their owners return them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let idle: Vec<_> = {
            let mut core = self.core.lock();
            core.idle.drain(..).collect()
        };
        for conn in idle {
            self.discard(conn).await;
        }
        info!(addr = %self.node.addr(), "Pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let core = self.core.lock();
        PoolStats {
            live: core.live,
            idle: core.idle.len(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
}
