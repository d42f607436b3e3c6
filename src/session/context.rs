use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{
    BackendConnection, BackendError, BackendPool, BackendRole, LeakGuard, ParamValue, PoolError,
    QueryOutcome, SessionSnapshot, StatementHandle, StatementKey,
};
use crate::metrics::metrics;
use crate::router::{RouteError, Router};

use super::ContextId;

/// Errors surfaced by transaction-context operations
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Transaction context {0} is closed")]
    Closed(ContextId),

    #[error("Transaction context {0} is discarded")]
    Discarded(ContextId),

    #[error("Context restore failed: {0}")]
    RestoreFailed(#[source] BackendError),

    #[error("Unknown statement id {0}")]
    UnknownStatement(u32),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Backend command failed: {0}")]
    Backend(#[from] BackendError),
}

struct Binding {
    conn: Arc<BackendConnection>,
    pool: Arc<BackendPool>,
}

struct ActiveStatement {
    handle: StatementHandle,
    role: BackendRole,
    /// Schema the statement was prepared against
    schema: String,
    text: String,
    in_cursor: bool,
}

struct CtxInner {
    closed: bool,
    force_discard: bool,
    connection_hold: bool,
    transaction_started: bool,
    /// Client-visible session state to hold on every bound connection
    session: SessionSnapshot,
    rw: Option<Binding>,
    ro: Option<Binding>,
    /// Client-visible statement id -> active statement
    statements: HashMap<u32, ActiveStatement>,
    next_statement_id: u32,
    guard: LeakGuard,
}

impl CtxInner {
    fn binding(&self, role: BackendRole) -> Option<&Binding> {
        match role {
            BackendRole::Writer => self.rw.as_ref(),
            BackendRole::Reader => self.ro.as_ref(),
        }
    }

    fn bound_connections(&self) -> Vec<Arc<BackendConnection>> {
        [self.rw.as_ref(), self.ro.as_ref()]
            .into_iter()
            .flatten()
            .map(|b| b.conn.clone())
            .collect()
    }
}

/// Per-client-transaction state: lazily bound RW/RO backend connections,
/// the active prepared-statement set, and the release-vs-discard decision
/// at close.
///
/// One async mutex guards the whole check-then-act of binding and the
/// in-memory transition of `close`, so no binding started before a close
/// can be observed as bound after the close completes. Cleanup I/O runs on
/// a snapshot after that transition.
pub struct TransactionContext {
    id: ContextId,
    router: Arc<Router>,
    acquire_timeout: Duration,
    inner: tokio::sync::Mutex<CtxInner>,
}

impl TransactionContext {
    pub fn new(
        id: ContextId,
        router: Arc<Router>,
        acquire_timeout: Duration,
        session: SessionSnapshot,
    ) -> Self {
        metrics().contexts_opened_total.inc();
        let guard = LeakGuard::new(format!("ctx:{id}"));
        Self {
            id,
            router,
            acquire_timeout,
            inner: tokio::sync::Mutex::new(CtxInner {
                closed: false,
                force_discard: false,
                connection_hold: false,
                transaction_started: false,
                session,
                rw: None,
                ro: None,
                statements: HashMap::new(),
                next_statement_id: 1,
                guard,
            }),
        }
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    // ------------------------------------------------------------------
    // Connection binding
    // ------------------------------------------------------------------

    /// The connection bound for `role`, binding one first if
    /// `create_if_absent` is set.
    pub async fn get_connection(
        &self,
        role: BackendRole,
        create_if_absent: bool,
    ) -> Result<Option<Arc<BackendConnection>>, ContextError> {
        if create_if_absent {
            return self.acquire_bound(role).await.map(Some);
        }
        let inner = self.inner.lock().await;
        self.check_usable(&inner)?;
        Ok(inner.binding(role).map(|b| b.conn.clone()))
    }

    fn check_usable(&self, inner: &CtxInner) -> Result<(), ContextError> {
        if inner.closed {
            return Err(ContextError::Closed(self.id.clone()));
        }
        if inner.force_discard {
            return Err(ContextError::Discarded(self.id.clone()));
        }
        Ok(())
    }

    /// Bind-or-return for `role`. The whole check-then-act runs under the
    /// context mutex: closed check, existing-binding check, routing, pool
    /// acquisition, and context restore.
    async fn acquire_bound(&self, role: BackendRole) -> Result<Arc<BackendConnection>, ContextError> {
        let mut inner = self.inner.lock().await;
        self.check_usable(&inner)?;
        if let Some(binding) = inner.binding(role) {
            return Ok(binding.conn.clone());
        }

        let pool = self.router.route(role)?;
        let conn = pool.acquire(self.acquire_timeout).await?;

        if let Err(e) = conn.restore_session(&inner.session).await {
            warn!(
                ctx = %self.id,
                role = %role,
                error = %e,
                "Context restore failed, poisoning context"
            );
            inner.force_discard = true;
            metrics().restore_failures_total.inc();
            pool.discard(conn).await;
            return Err(ContextError::RestoreFailed(e));
        }

        if let Err(e) = conn.probe_id().await {
            debug!(
                ctx = %self.id,
                role = %role,
                error = %e,
                "Connection id probe failed, kill targeting unavailable"
            );
        }

        debug!(
            ctx = %self.id,
            role = %role,
            node = conn.node_tag(),
            conn_id = ?conn.connection_id(),
            "Bound backend connection"
        );
        let conn_out = conn.clone();
        let binding = Binding { conn, pool };
        match role {
            BackendRole::Writer => inner.rw = Some(binding),
            BackendRole::Reader => inner.ro = Some(binding),
        }
        Ok(conn_out)
    }

    /// Run a text query on the connection of the given role, binding one
    /// if needed.
    pub async fn query(&self, role: BackendRole, text: &str) -> Result<QueryOutcome, ContextError> {
        let conn = self.acquire_bound(role).await?;
        Ok(conn.query(text).await?)
    }

    // ------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------

    /// Prepare a statement for `role`, consulting the bound connection's
    /// statement cache first. Returns the client-visible statement id.
    pub async fn prepare(&self, role: BackendRole, text: &str) -> Result<u32, ContextError> {
        let conn = self.acquire_bound(role).await?;

        let handle = match conn.take_cached_statement(text).await {
            Some(handle) => {
                debug!(ctx = %self.id, text = %text, "Prepared-statement cache hit");
                handle
            }
            None => conn.prepare(text).await?,
        };

        let mut inner = self.inner.lock().await;
        if let Err(err) = self.check_usable(&inner) {
            // The context went away while we were preparing; do not leak
            // the backend handle.
            drop(inner);
            if let Err(e) = conn.close_statement(handle.statement_id).await {
                warn!(ctx = %self.id, error = %e, "Failed to deallocate orphaned statement");
            }
            return Err(err);
        }

        let id = inner.next_statement_id;
        inner.next_statement_id += 1;
        let schema = inner.session.schema.clone().unwrap_or_default();
        inner.statements.insert(
            id,
            ActiveStatement {
                handle,
                role,
                schema,
                text: text.to_string(),
                in_cursor: false,
            },
        );
        Ok(id)
    }

    /// Execute an active statement. A backend `StatementNotFound` is a
    /// cache miss: the statement is re-prepared once and the execute
    /// retried.
    pub async fn execute(
        &self,
        statement_id: u32,
        params: &[ParamValue],
        with_cursor: bool,
    ) -> Result<QueryOutcome, ContextError> {
        let (role, backend_id, text) = {
            let inner = self.inner.lock().await;
            self.check_usable(&inner)?;
            let stmt = inner
                .statements
                .get(&statement_id)
                .ok_or(ContextError::UnknownStatement(statement_id))?;
            (stmt.role, stmt.handle.statement_id, stmt.text.clone())
        };

        let conn = self.acquire_bound(role).await?;
        let outcome = match conn.execute(backend_id, params).await {
            Ok(outcome) => outcome,
            Err(BackendError::StatementNotFound(_)) => {
                debug!(
                    ctx = %self.id,
                    statement_id,
                    "Backend lost statement, re-preparing"
                );
                let handle = conn.prepare(&text).await?;
                let new_backend_id = handle.statement_id;
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(stmt) = inner.statements.get_mut(&statement_id) {
                        stmt.handle = handle;
                    }
                }
                conn.execute(new_backend_id, params).await?
            }
            Err(e) => return Err(e.into()),
        };

        if with_cursor {
            let mut inner = self.inner.lock().await;
            if let Some(stmt) = inner.statements.get_mut(&statement_id) {
                stmt.in_cursor = true;
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Session state
    // ------------------------------------------------------------------

    /// Change the client's current schema, replaying it onto every bound
    /// connection.
    pub async fn set_schema(&self, schema: &str) -> Result<(), ContextError> {
        self.update_session(|s| s.schema = Some(schema.to_string()))
            .await
    }

    /// Set a client session variable, replaying it onto every bound
    /// connection.
    pub async fn set_variable(&self, name: &str, value: &str) -> Result<(), ContextError> {
        self.update_session(|s| {
            s.variables.insert(name.to_string(), value.to_string());
        })
        .await
    }

    async fn update_session(
        &self,
        mutate: impl FnOnce(&mut SessionSnapshot),
    ) -> Result<(), ContextError> {
        let (conns, snapshot) = {
            let mut inner = self.inner.lock().await;
            self.check_usable(&inner)?;
            mutate(&mut inner.session);
            (inner.bound_connections(), inner.session.clone())
        };

        for conn in conns {
            if let Err(e) = conn.restore_session(&snapshot).await {
                warn!(
                    ctx = %self.id,
                    node = conn.node_tag(),
                    error = %e,
                    "Session replay failed, poisoning context"
                );
                self.inner.lock().await.force_discard = true;
                metrics().restore_failures_total.inc();
                return Err(ContextError::RestoreFailed(e));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Client requested explicit connection pinning.
    pub async fn set_connection_hold(&self, hold: bool) {
        self.inner.lock().await.connection_hold = hold;
    }

    /// An open multi-statement transaction now exists on a bound
    /// connection.
    pub async fn mark_transaction_started(&self) {
        self.inner.lock().await.transaction_started = true;
    }

    /// The open transaction ended cleanly (COMMIT/ROLLBACK acknowledged).
    pub async fn mark_transaction_finished(&self) {
        self.inner.lock().await.transaction_started = false;
    }

    /// Poison the context: bound connections will be destroyed, never
    /// returned to their pools. Sticky.
    pub async fn force_discard(&self) {
        self.inner.lock().await.force_discard = true;
    }

    pub async fn is_force_discarded(&self) -> bool {
        self.inner.lock().await.force_discard
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Whether the context itself may be torn down: no explicit hold, no
    /// open transaction, and no statement mid-cursor.
    pub async fn can_free_if_no_reference(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.connection_hold
            && !inner.transaction_started
            && !inner.statements.values().any(|s| s.in_cursor)
    }

    /// `(node tag, cluster connection id)` of each bound backend whose id
    /// has been probed. Used by the kill handler.
    pub async fn bound_backend_ids(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock().await;
        inner
            .bound_connections()
            .iter()
            .filter_map(|c| c.connection_id().map(|id| (c.node_tag().to_string(), id)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Tear down the context: park reusable prepared statements, then
    /// release or discard each bound connection. Idempotent; linearized
    /// against `get_connection` by the context mutex. Cleanup failures are
    /// logged and never short-circuit the remaining resources.
    pub async fn close(&self) {
        let (rw, ro, statements, should_discard) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                debug!(ctx = %self.id, "Close on already-closed context");
                return;
            }
            inner.closed = true;
            inner.guard.disarm();
            let rw = inner.rw.take();
            let ro = inner.ro.take();
            let statements: Vec<ActiveStatement> =
                inner.statements.drain().map(|(_, s)| s).collect();
            let should_discard =
                inner.connection_hold || inner.transaction_started || inner.force_discard;
            (rw, ro, statements, should_discard)
        };

        if should_discard {
            metrics().contexts_discarded_total.inc();
            for binding in [rw, ro].into_iter().flatten() {
                binding.pool.discard(binding.conn).await;
            }
            info!(ctx = %self.id, "Context closed, connections discarded");
            return;
        }

        // Park statements back in their connections' caches. Any failure
        // along the way means "not cached": the handle is dropped and the
        // next use re-prepares. The network I/O here is bounded; an
        // abandoned command leaves the connection's state unknown, so it
        // is poisoned and will be discarded on release.
        let cleanup_timeout = self.acquire_timeout;
        for stmt in statements {
            let binding = match stmt.role {
                BackendRole::Writer => rw.as_ref(),
                BackendRole::Reader => ro.as_ref(),
            };
            let Some(binding) = binding else {
                continue;
            };
            if stmt.in_cursor {
                let reset = tokio::time::timeout(
                    cleanup_timeout,
                    binding.conn.reset_statement(stmt.handle.statement_id),
                )
                .await;
                match reset {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(
                            ctx = %self.id,
                            statement_id = stmt.handle.statement_id,
                            error = %e,
                            "Statement reset failed, not caching"
                        );
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            ctx = %self.id,
                            statement_id = stmt.handle.statement_id,
                            "Statement reset timed out, not caching"
                        );
                        binding.conn.poison();
                        continue;
                    }
                }
            }
            let key = StatementKey::new(stmt.schema, stmt.text);
            match tokio::time::timeout(
                cleanup_timeout,
                binding.conn.cache_statement(key, stmt.handle),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(ctx = %self.id, error = %e, "Statement re-cache failed")
                }
                Err(_) => {
                    warn!(ctx = %self.id, "Statement re-cache timed out");
                    binding.conn.poison();
                }
            }
        }

        for binding in [rw, ro].into_iter().flatten() {
            binding.pool.release(binding.conn).await;
        }
        info!(ctx = %self.id, "Context closed, connections released");
    }
}
