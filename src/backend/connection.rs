use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::topology::{NodeDescriptor, NodeRole};

use super::guard::LeakGuard;
use super::statement::{StatementCache, StatementKey};
use super::{BackendError, BackendLink, ParamValue, QueryOutcome, SessionSnapshot, StatementHandle};

/// Pool-visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is available for use
    Idle,
    /// Connection is exclusively held by one transaction context
    InUse,
    /// Connection is broken/closed
    Closed,
}

struct ConnInner {
    link: Box<dyn BackendLink>,
    /// Prepared statements currently parked on this connection, keyed by
    /// schema + text. Sequenced with command execution by this mutex.
    statements: StatementCache,
    /// Session state believed to be live on the wire
    session: SessionSnapshot,
    last_used_at: Instant,
}

/// One physical session to one cluster node.
///
/// Exclusivity is the central invariant: at most one transaction context
/// holds this connection at a time. The pool enforces it through the
/// `state` transitions; commands serialize on the inner mutex.
pub struct BackendConnection {
    node_tag: String,
    addr: String,
    node_role: NodeRole,
    /// Cluster-assigned connection id, 0 until probed (login may not have
    /// completed when the link was handed over)
    conn_id: AtomicU64,
    /// Set when a mid-command failure left the session state unknown
    broken: AtomicBool,
    state: Mutex<ConnectionState>,
    guard: Mutex<LeakGuard>,
    inner: tokio::sync::Mutex<ConnInner>,
    created_at: Instant,
}

impl BackendConnection {
    pub fn new(node: &NodeDescriptor, link: Box<dyn BackendLink>, cache_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            node_tag: node.tag.clone(),
            addr: node.addr(),
            node_role: node.role,
            conn_id: AtomicU64::new(0),
            broken: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Idle),
            guard: Mutex::new(LeakGuard::new(format!("conn:{}", node.addr()))),
            inner: tokio::sync::Mutex::new(ConnInner {
                link,
                statements: StatementCache::new(cache_capacity),
                session: SessionSnapshot::default(),
                last_used_at: now,
            }),
            created_at: now,
        }
    }

    pub fn node_tag(&self) -> &str {
        &self.node_tag
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn node_role(&self) -> NodeRole {
        self.node_role
    }

    /// Cluster connection id, if it has been probed yet. Lock-free so the
    /// kill path can read it while a command is in flight.
    pub fn connection_id(&self) -> Option<u64> {
        match self.conn_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    // ------------------------------------------------------------------
    // Pool bookkeeping
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Idle → InUse transition; fails if the connection is already held or
    /// closed. This is the exclusivity gate.
    pub(crate) fn try_mark_in_use(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Idle {
            *state = ConnectionState::InUse;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_idle(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Idle;
        }
    }

    /// Transition to Closed. Returns false if already closed, so discard
    /// accounting runs at most once.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            false
        } else {
            *state = ConnectionState::Closed;
            true
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub async fn query(&self, text: &str) -> Result<QueryOutcome, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.last_used_at = Instant::now();
        let result = inner.link.send_query(text).await;
        self.note_command_result(&result);
        result
    }

    pub async fn prepare(&self, text: &str) -> Result<StatementHandle, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.last_used_at = Instant::now();
        let result = inner.link.prepare(text).await;
        self.note_command_result(&result);
        result
    }

    pub async fn execute(
        &self,
        statement_id: u32,
        params: &[ParamValue],
    ) -> Result<QueryOutcome, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.last_used_at = Instant::now();
        let result = inner.link.execute(statement_id, params).await;
        self.note_command_result(&result);
        result
    }

    pub async fn reset_statement(&self, statement_id: u32) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        let result = inner.link.reset_statement(statement_id).await;
        self.note_command_result(&result);
        result
    }

    /// Take a cached statement for the given text under the connection's
    /// current schema, moving it out of the cache and into active use.
    pub async fn take_cached_statement(&self, text: &str) -> Option<StatementHandle> {
        let mut inner = self.inner.lock().await;
        let key = StatementKey::new(inner.session.schema.clone().unwrap_or_default(), text);
        inner.statements.take(&key)
    }

    /// Park a statement back in the cache under its schema + text key.
    ///
    /// If the insert displaces an entry, the displaced backend statement id
    /// is deallocated on this connection before the insert returns. A
    /// failed deallocate is logged; the displaced handle is dropped either
    /// way so capacity stays a hard ceiling.
    pub async fn cache_statement(
        &self,
        key: StatementKey,
        handle: StatementHandle,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if let Some((evicted_key, evicted)) = inner.statements.insert(key, handle) {
            debug!(
                addr = %self.addr,
                statement_id = evicted.statement_id,
                text = %evicted_key.text,
                "Evicting prepared statement"
            );
            if let Err(e) = inner.link.close_statement(evicted.statement_id).await {
                warn!(
                    addr = %self.addr,
                    statement_id = evicted.statement_id,
                    error = %e,
                    "Failed to deallocate evicted statement"
                );
                self.note_failure(&e);
            }
        }
        Ok(())
    }

    /// Deallocate a statement on the backend, outside of cache bookkeeping.
    pub async fn close_statement(&self, statement_id: u32) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        let result = inner.link.close_statement(statement_id).await;
        self.note_command_result(&result);
        result
    }

    /// Probe and cache the cluster connection id.
    pub async fn probe_id(&self) -> Result<u64, BackendError> {
        if let Some(id) = self.connection_id() {
            return Ok(id);
        }
        let mut inner = self.inner.lock().await;
        let id = inner.link.probe_connection_id().await?;
        self.conn_id.store(id, Ordering::Release);
        Ok(id)
    }

    /// Bring the connection's session state up to `target`, replaying only
    /// the delta against what is believed live on the wire.
    pub async fn restore_session(&self, target: &SessionSnapshot) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        let Some(delta) = target.delta_from(&inner.session) else {
            return Ok(());
        };
        debug!(
            addr = %self.addr,
            schema = ?delta.schema,
            variables = delta.variables.len(),
            "Restoring session state"
        );
        let result = inner.link.restore_context(&delta).await;
        match result {
            Ok(()) => {
                inner.session.apply(&delta);
                Ok(())
            }
            Err(e) => {
                // Partial replay leaves the wire state unknown
                self.note_failure(&e);
                self.broken.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Liveness probe used by the pool refresher.
    pub async fn ping(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.link.ping().await {
            Ok(()) => {
                inner.last_used_at = Instant::now();
                true
            }
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "Liveness probe failed");
                self.broken.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Mark the connection's session state as unknown, e.g. after a
    /// cleanup command was abandoned mid-flight.
    pub(crate) fn poison(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Close the underlying link. Infallible: accounting already happened,
    /// and the link's close contract never leaves the socket open.
    pub(crate) async fn close_link(&self) {
        self.guard.lock().disarm();
        let mut inner = self.inner.lock().await;
        inner.link.close().await;
    }

    fn note_command_result<T>(&self, result: &Result<T, BackendError>) {
        if let Err(e) = result {
            self.note_failure(e);
        }
    }

    fn note_failure(&self, error: &BackendError) {
        if error.poisons_connection() {
            self.broken.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("node_tag", &self.node_tag)
            .field("addr", &self.addr)
            .field("conn_id", &self.connection_id())
            .field("state", &self.state())
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{MockCluster, MockCommand};
    use crate::topology::NodeRole;

    async fn test_connection(cluster: &MockCluster) -> BackendConnection {
        let node = cluster.descriptor("db-1", NodeRole::Writer);
        let link = cluster.connect_link(&node).await;
        BackendConnection::new(&node, link, 4)
    }

    #[tokio::test]
    async fn test_state_transitions_enforce_exclusivity() {
        let cluster = MockCluster::new();
        let conn = test_connection(&cluster).await;

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.try_mark_in_use());
        // Second acquirer is rejected
        assert!(!conn.try_mark_in_use());

        conn.mark_idle();
        assert!(conn.try_mark_in_use());

        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(!conn.try_mark_in_use());
        conn.close_link().await;
    }

    #[tokio::test]
    async fn test_probe_id_is_cached() {
        let cluster = MockCluster::new();
        let conn = test_connection(&cluster).await;

        assert!(conn.connection_id().is_none());
        let id = conn.probe_id().await.unwrap();
        assert_eq!(conn.connection_id(), Some(id));

        // Second probe does not hit the link again
        let before = cluster.commands_for(id).len();
        assert_eq!(conn.probe_id().await.unwrap(), id);
        assert_eq!(cluster.commands_for(id).len(), before);
        conn.close_link().await;
    }

    #[tokio::test]
    async fn test_restore_session_replays_only_delta() {
        let cluster = MockCluster::new();
        let conn = test_connection(&cluster).await;
        let id = conn.probe_id().await.unwrap();

        let mut target = SessionSnapshot::default();
        target.schema = Some("app".to_string());
        conn.restore_session(&target).await.unwrap();

        // Same target again: nothing to replay
        conn.restore_session(&target).await.unwrap();

        let restores: Vec<_> = cluster
            .commands_for(id)
            .into_iter()
            .filter(|c| matches!(c, MockCommand::Restore(_)))
            .collect();
        assert_eq!(restores.len(), 1);
        conn.close_link().await;
    }

    #[tokio::test]
    async fn test_failed_restore_marks_connection_broken() {
        let cluster = MockCluster::new();
        cluster.behavior().fail_restore();
        let conn = test_connection(&cluster).await;

        let mut target = SessionSnapshot::default();
        target.schema = Some("app".to_string());
        assert!(conn.restore_session(&target).await.is_err());
        assert!(conn.is_broken());
        conn.close_link().await;
    }

    #[tokio::test]
    async fn test_cache_statement_overflow_deallocates_evicted() {
        let cluster = MockCluster::new();
        let conn = test_connection(&cluster).await;
        let id = conn.probe_id().await.unwrap();

        for i in 0..4u32 {
            let key = StatementKey::new("app", format!("SELECT {i}"));
            conn.cache_statement(
                key,
                StatementHandle {
                    statement_id: i + 1,
                    param_count: 0,
                    column_count: 1,
                },
            )
            .await
            .unwrap();
        }

        // Fifth insert evicts the LRU (statement id 1) and deallocates it
        conn.cache_statement(
            StatementKey::new("app", "SELECT 4"),
            StatementHandle {
                statement_id: 5,
                param_count: 0,
                column_count: 1,
            },
        )
        .await
        .unwrap();

        let deallocs: Vec<_> = cluster
            .commands_for(id)
            .into_iter()
            .filter_map(|c| match c {
                MockCommand::CloseStatement(sid) => Some(sid),
                _ => None,
            })
            .collect();
        assert_eq!(deallocs, vec![1]);
        conn.close_link().await;
    }

    #[tokio::test]
    async fn test_io_error_marks_broken() {
        let cluster = MockCluster::new();
        let conn = test_connection(&cluster).await;
        cluster.behavior().fail_queries();

        assert!(conn.query("SELECT 1").await.is_err());
        assert!(conn.is_broken());
        conn.close_link().await;
    }
}
