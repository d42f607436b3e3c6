//! Consumed cluster topology and health
//!
//! The HA subsystem owns detection and leader election; this module only
//! holds the read-only snapshots it publishes. The router re-reads the
//! latest snapshot on every call, so a failover is visible as soon as the
//! HA side swaps a new snapshot in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Role a cluster node currently serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Writer,
    Reader,
    #[default]
    Unknown,
}

/// Static description of a cluster node (persisted form)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDescriptor {
    /// Unique node tag
    pub tag: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: NodeRole,
    /// Tags of the node's cluster peers
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub cluster_id: String,
    /// Epoch milliseconds of the last descriptor update
    #[serde(default)]
    pub update_time: u64,
}

impl NodeDescriptor {
    /// Address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Latest health observation for one node (runtime form)
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub tag: String,
    pub role: NodeRole,
    /// Token the HA subsystem hands out for proxy-originated work
    pub proxy_token: u64,
    /// Replication progress as observed by the HA subsystem
    pub commit_index: u64,
    pub apply_index: u64,
    /// Round-trip latency of the last probe
    pub rtt: Duration,
    /// When this record was produced
    pub updated_at: Instant,
}

impl NodeHealth {
    /// A record older than the threshold no longer counts as evidence of
    /// liveness.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.updated_at.elapsed() > threshold
    }
}

/// Immutable view of the cluster at one point in time
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    nodes: Vec<NodeDescriptor>,
    health: HashMap<String, NodeHealth>,
}

impl TopologySnapshot {
    pub fn new(nodes: Vec<NodeDescriptor>, health: Vec<NodeHealth>) -> Self {
        let health = health.into_iter().map(|h| (h.tag.clone(), h)).collect();
        Self { nodes, health }
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn node(&self, tag: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.tag == tag)
    }

    pub fn health(&self, tag: &str) -> Option<&NodeHealth> {
        self.health.get(tag)
    }

    /// Whether a node has a fresh health record of the expected role
    pub fn is_live(&self, tag: &str, role: NodeRole, stale_after: Duration) -> bool {
        self.health
            .get(tag)
            .map(|h| h.role == role && !h.is_stale(stale_after))
            .unwrap_or(false)
    }

    /// The current primary: the node whose fresh health record says writer.
    ///
    /// The health record wins over the descriptor's configured role, so a
    /// promoted replica is the primary as soon as the HA side reports it.
    pub fn primary(&self, stale_after: Duration) -> Option<&NodeDescriptor> {
        self.nodes
            .iter()
            .find(|n| self.is_live(&n.tag, NodeRole::Writer, stale_after))
    }

    /// All nodes with a fresh reader health record
    pub fn readers(&self, stale_after: Duration) -> Vec<&NodeDescriptor> {
        self.nodes
            .iter()
            .filter(|n| self.is_live(&n.tag, NodeRole::Reader, stale_after))
            .collect()
    }
}

/// Shared handle through which the HA collaborator publishes snapshots and
/// consumers read them. Consumers never mutate the snapshot.
#[derive(Clone, Default)]
pub struct TopologyWatch {
    current: Arc<RwLock<Arc<TopologySnapshot>>>,
}

impl TopologyWatch {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Latest snapshot. Cheap: clones an Arc.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.read().clone()
    }

    /// Publish a new snapshot (HA side only).
    pub fn publish(&self, snapshot: TopologySnapshot) {
        info!(nodes = snapshot.nodes().len(), "Topology snapshot updated");
        *self.current.write() = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(tag: &str, role: NodeRole) -> NodeDescriptor {
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

    fn fresh_health(tag: &str, role: NodeRole) -> NodeHealth {
        NodeHealth {
            tag: tag.to_string(),
            role,
            proxy_token: 1,
            commit_index: 100,
            apply_index: 100,
            rtt: Duration::from_millis(2),
            updated_at: Instant::now(),
        }
    }

    fn stale_health(tag: &str, role: NodeRole) -> NodeHealth {
        NodeHealth {
            updated_at: Instant::now() - Duration::from_secs(60),
            ..fresh_health(tag, role)
        }
    }

    const STALE_AFTER: Duration = Duration::from_secs(15);

    #[test]
    fn test_primary_follows_health_not_descriptor() {
        // db-1 is configured writer but its health record says reader now
        let snapshot = TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
            ],
            vec![
                fresh_health("db-1", NodeRole::Reader),
                fresh_health("db-2", NodeRole::Writer),
            ],
        );

        let primary = snapshot.primary(STALE_AFTER).unwrap();
        assert_eq!(primary.tag, "db-2");
    }

    #[test]
    fn test_stale_primary_is_excluded() {
        let snapshot = TopologySnapshot::new(
            vec![descriptor("db-1", NodeRole::Writer)],
            vec![stale_health("db-1", NodeRole::Writer)],
        );

        assert!(snapshot.primary(STALE_AFTER).is_none());
    }

    #[test]
    fn test_readers_filters_role_and_staleness() {
        let snapshot = TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
                descriptor("db-3", NodeRole::Reader),
            ],
            vec![
                fresh_health("db-1", NodeRole::Writer),
                fresh_health("db-2", NodeRole::Reader),
                stale_health("db-3", NodeRole::Reader),
            ],
        );

        let readers = snapshot.readers(STALE_AFTER);
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].tag, "db-2");
    }

    #[test]
    fn test_watch_publish_replaces_snapshot() {
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![descriptor("db-1", NodeRole::Writer)],
            vec![fresh_health("db-1", NodeRole::Writer)],
        ));
        assert_eq!(watch.snapshot().nodes().len(), 1);

        watch.publish(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
            ],
            vec![],
        ));
        assert_eq!(watch.snapshot().nodes().len(), 2);
        // No fresh health in the new snapshot
        assert!(watch.snapshot().primary(STALE_AFTER).is_none());
    }

    #[test]
    fn test_node_descriptor_addr() {
        let node = descriptor("db-1", NodeRole::Writer);
        assert_eq!(node.addr(), "db-1.db.local:3306");
    }
}
