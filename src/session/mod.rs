mod context;

pub use context::{ContextError, TransactionContext};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identity of one frontend transaction context: monotonic within the
/// process, tagged with the proxy node so it stays distinguishable in logs
/// and kill messages across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId {
    pub node_tag: Arc<str>,
    pub seq: u64,
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.node_tag, self.seq)
    }
}

/// Generator of node-tagged context ids
pub struct ContextIdGen {
    node_tag: Arc<str>,
    next: AtomicU64,
}

impl ContextIdGen {
    pub fn new(node_tag: &str) -> Self {
        Self {
            node_tag: Arc::from(node_tag),
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ContextId {
        ContextId {
            node_tag: self.node_tag.clone(),
            seq: self.next.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// One registered client session, as visible to the control plane.
///
/// The session reactor registers each authenticated client here; the kill
/// handler scans the registry by the proxy-assigned connection id.
pub struct SessionEntry {
    /// Proxy-assigned client connection id
    pub id: u64,
    cancel: CancellationToken,
    context: Mutex<Option<Arc<TransactionContext>>>,
}

impl SessionEntry {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            context: Mutex::new(None),
        }
    }

    /// Token the session's reactor task selects on; cancelling it
    /// disconnects the client.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request local disconnect of this client session.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Attach the transaction context currently serving this session.
    pub fn attach_context(&self, ctx: Arc<TransactionContext>) {
        *self.context.lock() = Some(ctx);
    }

    /// Detach the context at unit-of-work end.
    pub fn detach_context(&self) -> Option<Arc<TransactionContext>> {
        self.context.lock().take()
    }

    pub fn current_context(&self) -> Option<Arc<TransactionContext>> {
        self.context.lock().clone()
    }
}

/// Registry of active client sessions on this proxy node
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64) -> Arc<SessionEntry> {
        let entry = Arc::new(SessionEntry::new(id));
        self.sessions.insert(id, entry.clone());
        debug!(session_id = id, "Session registered");
        entry
    }

    pub fn unregister(&self, id: u64) {
        if self.sessions.remove(&id).is_some() {
            info!(session_id = id, "Session unregistered");
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<SessionEntry>> {
        self.sessions.get(&id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
