mod connection;
mod guard;
mod pool;
mod statement;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{BackendConnection, ConnectionState};
pub use guard::{leaked_total, LeakGuard};
pub use pool::{BackendPool, PoolError, PoolStats};
pub use statement::{StatementCache, StatementKey};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::topology::NodeDescriptor;

/// Role of backend traffic a caller needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendRole {
    Writer,
    Reader,
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendRole::Writer => write!(f, "writer"),
            BackendRole::Reader => write!(f, "reader"),
        }
    }
}

/// Backend-assigned prepared statement handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementHandle {
    /// Backend statement id
    pub statement_id: u32,
    /// Parameter descriptor count
    pub param_count: u16,
    /// Result column descriptor count
    pub column_count: u16,
}

/// Parameter value for prepared-statement execution
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Result of a query or execute command, as far as the core needs it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    /// Textual row values; `None` per cell for SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
}

/// Client-visible session state that must hold on whichever backend
/// connection serves the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Current schema (database)
    pub schema: Option<String>,
    /// Session variables the client has set
    pub variables: HashMap<String, String>,
}

impl SessionSnapshot {
    /// Compute what must be replayed to bring a connection currently at
    /// `actual` up to this snapshot. Returns `None` when nothing differs.
    pub fn delta_from(&self, actual: &SessionSnapshot) -> Option<SessionDelta> {
        let schema = if self.schema != actual.schema {
            self.schema.clone()
        } else {
            None
        };

        let mut variables: Vec<(String, String)> = self
            .variables
            .iter()
            .filter(|(k, v)| actual.variables.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.sort();

        if schema.is_none() && variables.is_empty() {
            None
        } else {
            Some(SessionDelta { schema, variables })
        }
    }

    /// Fold a replayed delta into this snapshot.
    pub fn apply(&mut self, delta: &SessionDelta) {
        if let Some(ref schema) = delta.schema {
            self.schema = Some(schema.clone());
        }
        for (k, v) in &delta.variables {
            self.variables.insert(k.clone(), v.clone());
        }
    }
}

/// The part of a session snapshot that actually needs replaying onto a
/// backend connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub schema: Option<String>,
    pub variables: Vec<(String, String)>,
}

/// Errors surfaced by the wire-protocol layer
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Statement {0} not found on backend")]
    StatementNotFound(u32),

    #[error("Login has not completed")]
    LoginIncomplete,

    #[error("Connection closed")]
    Closed,
}

impl BackendError {
    /// Whether the error leaves the connection's session state unknown,
    /// forcing a discard rather than a return to the pool.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, BackendError::Io(_) | BackendError::Closed)
    }
}

/// One physical session to one cluster node, as seen by the routing core.
///
/// The byte-level codec lives behind this trait; implementations frame and
/// ship the actual protocol commands.
#[async_trait]
pub trait BackendLink: Send {
    /// Run a text query.
    async fn send_query(&mut self, text: &str) -> Result<QueryOutcome, BackendError>;

    /// Prepare a statement, returning the backend-assigned handle.
    async fn prepare(&mut self, text: &str) -> Result<StatementHandle, BackendError>;

    /// Execute a previously prepared statement.
    async fn execute(
        &mut self,
        statement_id: u32,
        params: &[ParamValue],
    ) -> Result<QueryOutcome, BackendError>;

    /// Reset a statement's cursor/parameter state.
    async fn reset_statement(&mut self, statement_id: u32) -> Result<(), BackendError>;

    /// Deallocate a prepared statement on the backend.
    async fn close_statement(&mut self, statement_id: u32) -> Result<(), BackendError>;

    /// The cluster-assigned connection id. Fails with `LoginIncomplete`
    /// before the login handshake finishes.
    async fn probe_connection_id(&mut self) -> Result<u64, BackendError>;

    /// Replay client session state onto the connection.
    async fn restore_context(&mut self, delta: &SessionDelta) -> Result<(), BackendError>;

    /// Lightweight liveness probe.
    async fn ping(&mut self) -> Result<(), BackendError>;

    /// Close the underlying socket. Must not fail in a way that leaves the
    /// socket open.
    async fn close(&mut self);
}

/// Produces fresh links to a backend node. The pool uses this on demand and
/// from its background refresher.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &NodeDescriptor) -> Result<Box<dyn BackendLink>, BackendError>;
}
