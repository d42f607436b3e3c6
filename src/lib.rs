//! janus — session lifecycle and read-write-split routing core for a SQL
//! cluster proxy.
//!
//! The crate multiplexes short-lived client sessions onto pools of
//! long-lived backend connections: a [`session::TransactionContext`] lazily
//! binds a writer and/or reader connection through the
//! [`router::Router`], restores the client's session state onto reassigned
//! connections, tracks server-side prepared statements across that
//! reassignment, and decides release-vs-discard when the unit of work
//! ends. The [`control`] module propagates kill operations across the
//! proxy cluster.
//!
//! The wire codec, SQL classifier, network reactor, HA detection, and RPC
//! transport are collaborators behind the [`backend::BackendLink`],
//! [`backend::Connector`], [`topology::TopologyWatch`],
//! [`control::RpcTransport`], and [`control::ClusterMembership`] seams.

pub mod backend;
pub mod config;
pub mod control;
pub mod metrics;
pub mod router;
pub mod session;
pub mod topology;

pub use backend::{BackendConnection, BackendPool, BackendRole, PoolError};
pub use config::Config;
pub use control::{ControlChannel, ControlDispatcher, KillExecutor, KillHandler};
pub use router::{RouteError, Router};
pub use session::{ContextId, ContextIdGen, SessionRegistry, TransactionContext};
pub use topology::{NodeDescriptor, NodeRole, TopologySnapshot, TopologyWatch};
