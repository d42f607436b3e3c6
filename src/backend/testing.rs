//! In-memory backend link for unit tests
//!
//! `MockCluster` plays the role of the wire-protocol layer: it hands out
//! links whose connection ids are assigned sequentially and records every
//! command issued on every link so tests can assert exactly what reached
//! which backend session.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::topology::{NodeDescriptor, NodeRole};

use super::{
    BackendError, BackendLink, Connector, ParamValue, QueryOutcome, SessionDelta, StatementHandle,
};

/// A command observed by the mock backend
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MockCommand {
    Query(String),
    Prepare(String),
    Execute(u32),
    ResetStatement(u32),
    CloseStatement(u32),
    Restore(SessionDelta),
    Ping,
    Close,
}

/// Failure injection switches, shared by every link of a cluster
#[derive(Default)]
pub(crate) struct MockBehavior {
    fail_connect: AtomicBool,
    fail_queries: AtomicBool,
    fail_restore: AtomicBool,
    fail_ping: AtomicBool,
    fail_reset: AtomicBool,
    /// Number of upcoming executes that report StatementNotFound
    stmt_not_found: AtomicUsize,
}

impl MockBehavior {
    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_queries(&self) {
        self.fail_queries.store(true, Ordering::SeqCst);
    }

    pub fn fail_restore(&self) {
        self.fail_restore.store(true, Ordering::SeqCst);
    }

    pub fn fail_ping(&self) {
        self.fail_ping.store(true, Ordering::SeqCst);
    }

    pub fn recover_ping(&self) {
        self.fail_ping.store(false, Ordering::SeqCst);
    }

    pub fn fail_reset(&self) {
        self.fail_reset.store(true, Ordering::SeqCst);
    }

    pub fn statement_not_found_times(&self, n: usize) {
        self.stmt_not_found.store(n, Ordering::SeqCst);
    }
}

struct MockState {
    journal: Mutex<Vec<(u64, MockCommand)>>,
    behavior: MockBehavior,
    next_conn_id: AtomicU64,
}

/// Factory and journal for mock backend links
#[derive(Clone)]
pub(crate) struct MockCluster {
    state: Arc<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                journal: Mutex::new(Vec::new()),
                behavior: MockBehavior::default(),
                next_conn_id: AtomicU64::new(100),
            }),
        }
    }

    pub fn behavior(&self) -> &MockBehavior {
        &self.state.behavior
    }

    pub fn descriptor(&self, tag: &str, role: NodeRole) -> NodeDescriptor {
        NodeDescriptor {
            tag: tag.to_string(),
            host: format!("{tag}.db.local"),
            port: 3306,
            role,
            peers: vec![],
            cluster_id: "main".to_string(),
            update_time: 0,
        }
    }

    /// Create a link directly, bypassing the `Connector` error path.
    pub async fn connect_link(&self, _node: &NodeDescriptor) -> Box<dyn BackendLink> {
        let conn_id = self.state.next_conn_id.fetch_add(1, Ordering::SeqCst);
        Box::new(MockLink {
            conn_id,
            next_stmt_id: 1,
            state: self.state.clone(),
        })
    }

    /// Every command issued on the link with the given connection id.
    pub fn commands_for(&self, conn_id: u64) -> Vec<MockCommand> {
        self.state
            .journal
            .lock()
            .iter()
            .filter(|(id, _)| *id == conn_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every `(connection id, command)` pair in issue order.
    pub fn all_commands(&self) -> Vec<(u64, MockCommand)> {
        self.state.journal.lock().clone()
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, node: &NodeDescriptor) -> Result<Box<dyn BackendLink>, BackendError> {
        if self.state.behavior.fail_connect.load(Ordering::SeqCst) {
            return Err(BackendError::Io(format!(
                "connection refused: {}",
                node.addr()
            )));
        }
        Ok(self.connect_link(node).await)
    }
}

struct MockLink {
    conn_id: u64,
    next_stmt_id: u32,
    state: Arc<MockState>,
}

impl MockLink {
    fn record(&self, command: MockCommand) {
        self.state.journal.lock().push((self.conn_id, command));
    }

    fn behavior(&self) -> &MockBehavior {
        &self.state.behavior
    }
}

#[async_trait]
impl BackendLink for MockLink {
    async fn send_query(&mut self, text: &str) -> Result<QueryOutcome, BackendError> {
        self.record(MockCommand::Query(text.to_string()));
        if self.behavior().fail_queries.load(Ordering::SeqCst) {
            return Err(BackendError::Io("connection reset".into()));
        }
        Ok(QueryOutcome::default())
    }

    async fn prepare(&mut self, text: &str) -> Result<StatementHandle, BackendError> {
        self.record(MockCommand::Prepare(text.to_string()));
        let statement_id = self.next_stmt_id;
        self.next_stmt_id += 1;
        Ok(StatementHandle {
            statement_id,
            param_count: 0,
            column_count: 1,
        })
    }

    async fn execute(
        &mut self,
        statement_id: u32,
        _params: &[ParamValue],
    ) -> Result<QueryOutcome, BackendError> {
        self.record(MockCommand::Execute(statement_id));
        let pending = self.behavior().stmt_not_found.load(Ordering::SeqCst);
        if pending > 0 {
            self.behavior()
                .stmt_not_found
                .store(pending - 1, Ordering::SeqCst);
            return Err(BackendError::StatementNotFound(statement_id));
        }
        Ok(QueryOutcome::default())
    }

    async fn reset_statement(&mut self, statement_id: u32) -> Result<(), BackendError> {
        self.record(MockCommand::ResetStatement(statement_id));
        if self.behavior().fail_reset.load(Ordering::SeqCst) {
            return Err(BackendError::Protocol("reset rejected".into()));
        }
        Ok(())
    }

    async fn close_statement(&mut self, statement_id: u32) -> Result<(), BackendError> {
        self.record(MockCommand::CloseStatement(statement_id));
        Ok(())
    }

    async fn probe_connection_id(&mut self) -> Result<u64, BackendError> {
        Ok(self.conn_id)
    }

    async fn restore_context(&mut self, delta: &SessionDelta) -> Result<(), BackendError> {
        self.record(MockCommand::Restore(delta.clone()));
        if self.behavior().fail_restore.load(Ordering::SeqCst) {
            return Err(BackendError::Protocol("restore rejected".into()));
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.record(MockCommand::Ping);
        if self.behavior().fail_ping.load(Ordering::SeqCst) {
            return Err(BackendError::Io("ping timeout".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.record(MockCommand::Close);
    }
}
