//! Cross-node control channel
//!
//! Typed request/response control messages dispatched to a registered
//! handler table, carried by a point-to-point RPC transport with a
//! caller-specified timeout. The transport itself is a collaborator; this
//! module owns the dispatch contract and the kill broadcast built on it.

mod kill;

pub use kill::{ControlChannel, KillExecutor, KillHandler, KillRequest, KillSummary};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Message type of kill requests
pub const KILL_MESSAGE_TYPE: &str = "kill";

/// A typed control request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

impl ControlRequest {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Success,
    Error,
}

/// Response to a control request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: ControlStatus,
    pub message: String,
}

impl ControlResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ControlStatus::Success
    }
}

/// Handler for one control message type
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> ControlResponse;
}

/// Handler table keyed by message type
#[derive(Default)]
pub struct ControlDispatcher {
    handlers: DashMap<String, Arc<dyn ControlHandler>>,
}

impl ControlDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn ControlHandler>) {
        let kind = kind.into();
        debug!(kind = %kind, "Control handler registered");
        self.handlers.insert(kind, handler);
    }

    pub fn unregister(&self, kind: &str) {
        if self.handlers.remove(kind).is_some() {
            debug!(kind = %kind, "Control handler unregistered");
        }
    }

    /// Dispatch a request to its registered handler.
    pub async fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        let handler = match self.handlers.get(&request.kind) {
            Some(h) => h.clone(),
            None => {
                return ControlResponse::error(format!(
                    "No handler for message type '{}'",
                    request.kind
                ))
            }
        };
        handler.handle(request.payload.clone()).await
    }
}

/// RPC errors
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Point-to-point control RPC transport (collaborator seam)
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(
        &self,
        addr: &str,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<ControlResponse, RpcError>;
}

/// Source of cluster member addresses for broadcasts (collaborator seam)
pub trait ClusterMembership: Send + Sync {
    /// Addresses of every cluster node, this one included.
    fn members(&self) -> Vec<String>;
}

/// Fixed member list
pub struct StaticMembership {
    members: Vec<String>,
}

impl StaticMembership {
    pub fn new(members: Vec<String>) -> Self {
        Self { members }
    }
}

impl ClusterMembership for StaticMembership {
    fn members(&self) -> Vec<String> {
        self.members.clone()
    }
}
