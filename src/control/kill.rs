//! Kill propagation
//!
//! A kill targets a client session by its proxy-assigned connection id,
//! which may live on any node of the proxy cluster. The initiating node
//! broadcasts to every member concurrently and best-effort; each member
//! scans its local session registry and reports how many sessions matched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::metrics::metrics;
use crate::router::Router;
use crate::session::SessionRegistry;

use super::{
    ClusterMembership, ControlHandler, ControlRequest, ControlResponse, RpcTransport,
    KILL_MESSAGE_TYPE,
};

/// Kill request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    /// Proxy-assigned connection id of the target client session
    pub process_id: u64,
    /// Kill the whole connection rather than just the running query
    pub connection: bool,
}

/// Outcome of a cluster-wide kill broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSummary {
    /// Sessions matched on nodes that responded
    pub matched: usize,
    /// Nodes that responded within the deadline
    pub responded: usize,
    /// Nodes the broadcast was sent to
    pub targets: usize,
}

impl KillSummary {
    pub fn message(&self) -> String {
        format!("{} killed.", self.matched)
    }
}

/// Executes kill requests against this node's local sessions.
pub struct KillExecutor {
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    acquire_timeout: Duration,
}

impl KillExecutor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        router: Arc<Router>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            acquire_timeout,
        }
    }

    /// Scan local sessions for the target and apply the kill. Returns the
    /// number of sessions matched (0 or 1; connection ids are unique per
    /// node).
    pub async fn kill_local(&self, request: &KillRequest) -> usize {
        let Some(entry) = self.registry.get(request.process_id) else {
            debug!(process_id = request.process_id, "Kill matched no local session");
            return 0;
        };

        let kind = if request.connection { "connection" } else { "query" };
        metrics().kills_total.with_label_values(&[kind]).inc();

        if request.connection {
            // Disconnect the client and destroy its bound backends
            if let Some(ctx) = entry.current_context() {
                ctx.force_discard().await;
                ctx.close().await;
            }
            entry.terminate();
            self.registry.unregister(request.process_id);
            info!(process_id = request.process_id, "Killed client session");
        } else {
            let Some(ctx) = entry.current_context() else {
                debug!(
                    process_id = request.process_id,
                    "Session matched but has no active transaction context"
                );
                return 1;
            };
            for (node_tag, backend_id) in ctx.bound_backend_ids().await {
                self.kill_backend_query(&node_tag, backend_id).await;
            }
            info!(process_id = request.process_id, "Killed running query");
        }
        1
    }

    /// Issue `KILL QUERY <id>` on the given node using a freshly acquired
    /// sibling connection. The session's bound connection is in use, so
    /// the pool can never hand it back to us here. A query that already
    /// finished makes this a backend-side no-op.
    async fn kill_backend_query(&self, node_tag: &str, backend_id: u64) {
        let Some(pool) = self.router.pool_by_tag(node_tag) else {
            warn!(node = node_tag, "No pool for kill target node");
            return;
        };
        match pool.acquire(self.acquire_timeout).await {
            Ok(conn) => {
                match conn.query(&format!("KILL QUERY {backend_id}")).await {
                    Ok(_) => debug!(node = node_tag, backend_id, "Issued KILL QUERY"),
                    Err(e) => warn!(
                        node = node_tag,
                        backend_id,
                        error = %e,
                        "KILL QUERY failed"
                    ),
                }
                pool.release(conn).await;
            }
            Err(e) => warn!(
                node = node_tag,
                backend_id,
                error = %e,
                "Could not acquire connection for KILL QUERY"
            ),
        }
    }
}

/// Control handler exposing [`KillExecutor`] under the `kill` message type.
pub struct KillHandler {
    executor: Arc<KillExecutor>,
}

impl KillHandler {
    pub fn new(executor: Arc<KillExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ControlHandler for KillHandler {
    async fn handle(&self, payload: serde_json::Value) -> ControlResponse {
        let request: KillRequest = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => return ControlResponse::error(format!("Invalid kill payload: {e}")),
        };
        let matched = self.executor.kill_local(&request).await;
        ControlResponse::success(format!("{matched} killed."))
    }
}

/// Cluster-facing side of the control channel: fans a kill out to every
/// member concurrently, bounded per call, without letting one unreachable
/// peer abort delivery to the rest.
pub struct ControlChannel {
    transport: Arc<dyn RpcTransport>,
    membership: Arc<dyn ClusterMembership>,
    rpc_timeout: Duration,
}

impl ControlChannel {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        membership: Arc<dyn ClusterMembership>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            membership,
            rpc_timeout,
        }
    }

    /// Broadcast a kill to every cluster member. The aggregate only
    /// reflects sessions matched on members that responded in time.
    pub async fn broadcast_kill(&self, process_id: u64, connection: bool) -> KillSummary {
        let request = ControlRequest::new(
            KILL_MESSAGE_TYPE,
            json!({ "process_id": process_id, "connection": connection }),
        );
        let members = self.membership.members();
        let targets = members.len();

        let calls = members.iter().map(|addr| {
            let request = &request;
            async move {
                match self.transport.call(addr, request, self.rpc_timeout).await {
                    Ok(response) if response.is_success() => {
                        Some(parse_killed_count(&response.message))
                    }
                    Ok(response) => {
                        warn!(addr = %addr, message = %response.message, "Kill rejected by peer");
                        Some(0)
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Kill delivery failed");
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(calls).await;
        let responded = results.iter().filter(|r| r.is_some()).count();
        let matched = results.into_iter().flatten().sum();

        info!(
            process_id,
            connection, matched, responded, targets, "Kill broadcast complete"
        );
        KillSummary {
            matched,
            responded,
            targets,
        }
    }
}

fn parse_killed_count(message: &str) -> usize {
    message
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}
