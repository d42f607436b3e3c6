//! Read-write splitting router
//!
//! Maps a role request (writer/reader) to the backend pool of a concrete
//! cluster node, resolved against the latest topology snapshot on every
//! call so a failover takes effect on the very next route.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::backend::{BackendPool, BackendRole, Connector};
use crate::config::{PoolConfig, ReaderPolicy, RoutingConfig};
use crate::metrics::metrics;
use crate::topology::{NodeDescriptor, TopologyWatch};

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No healthy backend available for role {role}")]
    NoAvailableBackend { role: BackendRole },
}

/// Read-write splitting router.
///
/// Pools are created lazily per node tag and kept across topology changes;
/// which pool a call returns is decided fresh from the current snapshot.
pub struct Router {
    topology: TopologyWatch,
    config: RoutingConfig,
    pool_config: PoolConfig,
    connector: Arc<dyn Connector>,
    pools: DashMap<String, Arc<BackendPool>>,
    reader_counter: AtomicUsize,
}

impl Router {
    pub fn new(
        topology: TopologyWatch,
        config: RoutingConfig,
        pool_config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            topology,
            config,
            pool_config,
            connector,
            pools: DashMap::new(),
            reader_counter: AtomicUsize::new(0),
        }
    }

    fn stale_after(&self) -> Duration {
        Duration::from_millis(self.config.health_stale_after_ms)
    }

    /// Select the pool serving the requested role.
    pub fn route(&self, role: BackendRole) -> Result<Arc<BackendPool>, RouteError> {
        let snapshot = self.topology.snapshot();
        let stale_after = self.stale_after();

        let node = match role {
            BackendRole::Writer => snapshot
                .primary(stale_after)
                .ok_or(RouteError::NoAvailableBackend { role })?,
            BackendRole::Reader => {
                let readers = snapshot.readers(stale_after);
                if readers.is_empty() {
                    if !self.config.read_fallback_to_primary {
                        return Err(RouteError::NoAvailableBackend { role });
                    }
                    debug!("No healthy replica, falling back to primary for read");
                    snapshot
                        .primary(stale_after)
                        .ok_or(RouteError::NoAvailableBackend { role })?
                } else {
                    self.select_reader(&snapshot, &readers)
                }
            }
        };

        let role_label = role.to_string();
        metrics()
            .routes_total
            .with_label_values(&[role_label.as_str()])
            .inc();
        debug!(role = %role, node = %node.tag, "Routed");
        Ok(self.pool_for(node))
    }

    fn select_reader<'a>(
        &self,
        snapshot: &crate::topology::TopologySnapshot,
        readers: &[&'a NodeDescriptor],
    ) -> &'a NodeDescriptor {
        match self.config.reader_policy {
            ReaderPolicy::RoundRobin => {
                let idx = self.reader_counter.fetch_add(1, Ordering::Relaxed) % readers.len();
                readers[idx]
            }
            ReaderPolicy::LatencyWeighted => {
                readers
                    .iter()
                    .min_by_key(|n| {
                        snapshot
                            .health(&n.tag)
                            .map(|h| h.rtt)
                            .unwrap_or(Duration::MAX)
                    })
                    .copied()
                    .unwrap_or(readers[0])
            }
        }
    }

    fn pool_for(&self, node: &NodeDescriptor) -> Arc<BackendPool> {
        self.pools
            .entry(node.tag.clone())
            .or_insert_with(|| {
                Arc::new(BackendPool::new(
                    node.clone(),
                    self.pool_config.clone(),
                    self.connector.clone(),
                ))
            })
            .clone()
    }

    /// Pool for a specific node tag, if one has been created.
    pub fn pool_by_tag(&self, tag: &str) -> Option<Arc<BackendPool>> {
        self.pools.get(tag).map(|p| p.clone())
    }

    /// Shut down every pool this router created.
    pub async fn shutdown(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockCluster;
    use crate::topology::{NodeHealth, NodeRole, TopologySnapshot};
    use std::time::Instant;

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

    fn health(tag: &str, role: NodeRole, rtt_ms: u64) -> NodeHealth {
        NodeHealth {
            tag: tag.to_string(),
            role,
            proxy_token: 1,
            commit_index: 10,
            apply_index: 10,
            rtt: Duration::from_millis(rtt_ms),
            updated_at: Instant::now(),
        }
    }

    fn stale(tag: &str, role: NodeRole) -> NodeHealth {
        NodeHealth {
            updated_at: Instant::now() - Duration::from_secs(120),
            ..health(tag, role, 1)
        }
    }

    fn routing_config() -> RoutingConfig {
        RoutingConfig {
            reader_policy: ReaderPolicy::RoundRobin,
            read_fallback_to_primary: true,
            health_stale_after_ms: 15_000,
        }
    }

    fn test_router(cluster: &MockCluster, watch: TopologyWatch, config: RoutingConfig) -> Router {
        Router::new(
            watch,
            config,
            PoolConfig::default(),
            Arc::new(cluster.clone()),
        )
    }

    #[test]
    fn test_writer_routes_to_primary() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
            ],
            vec![
                health("db-1", NodeRole::Writer, 1),
                health("db-2", NodeRole::Reader, 1),
            ],
        ));
        let router = test_router(&cluster, watch, routing_config());

        let pool = router.route(BackendRole::Writer).unwrap();
        assert_eq!(pool.node_tag(), "db-1");
    }

    #[test]
    fn test_reader_round_robin_over_replicas() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
                descriptor("db-3", NodeRole::Reader),
            ],
            vec![
                health("db-1", NodeRole::Writer, 1),
                health("db-2", NodeRole::Reader, 1),
                health("db-3", NodeRole::Reader, 1),
            ],
        ));
        let router = test_router(&cluster, watch, routing_config());

        let first = router.route(BackendRole::Reader).unwrap();
        let second = router.route(BackendRole::Reader).unwrap();
        let third = router.route(BackendRole::Reader).unwrap();

        assert_eq!(first.node_tag(), "db-2");
        assert_eq!(second.node_tag(), "db-3");
        assert_eq!(third.node_tag(), "db-2"); // wraps around
    }

    #[test]
    fn test_latency_weighted_picks_lowest_rtt() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![
                descriptor("db-2", NodeRole::Reader),
                descriptor("db-3", NodeRole::Reader),
            ],
            vec![
                health("db-2", NodeRole::Reader, 9),
                health("db-3", NodeRole::Reader, 2),
            ],
        ));
        let mut config = routing_config();
        config.reader_policy = ReaderPolicy::LatencyWeighted;
        let router = test_router(&cluster, watch, config);

        for _ in 0..3 {
            assert_eq!(
                router.route(BackendRole::Reader).unwrap().node_tag(),
                "db-3"
            );
        }
    }

    #[test]
    fn test_reader_falls_back_to_primary() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
            ],
            vec![
                health("db-1", NodeRole::Writer, 1),
                stale("db-2", NodeRole::Reader),
            ],
        ));
        let router = test_router(&cluster, watch, routing_config());

        let pool = router.route(BackendRole::Reader).unwrap();
        assert_eq!(pool.node_tag(), "db-1");
    }

    #[test]
    fn test_reader_without_fallback_fails() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![descriptor("db-1", NodeRole::Writer)],
            vec![health("db-1", NodeRole::Writer, 1)],
        ));
        let mut config = routing_config();
        config.read_fallback_to_primary = false;
        let router = test_router(&cluster, watch, config);

        assert!(matches!(
            router.route(BackendRole::Reader),
            Err(RouteError::NoAvailableBackend {
                role: BackendRole::Reader
            })
        ));
    }

    #[test]
    fn test_no_primary_fails_writer_route() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![descriptor("db-1", NodeRole::Writer)],
            vec![stale("db-1", NodeRole::Writer)],
        ));
        let router = test_router(&cluster, watch, routing_config());

        assert!(router.route(BackendRole::Writer).is_err());
    }

    #[test]
    fn test_failover_routes_to_new_primary() {
        let cluster = MockCluster::new();
        let watch = TopologyWatch::new(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Reader),
            ],
            vec![
                health("db-1", NodeRole::Writer, 1),
                health("db-2", NodeRole::Reader, 1),
            ],
        ));
        let router = test_router(&cluster, watch.clone(), routing_config());

        let before = router.route(BackendRole::Writer).unwrap();
        assert_eq!(before.node_tag(), "db-1");

        // db-1 goes stale, db-2 is promoted
        watch.publish(TopologySnapshot::new(
            vec![
                descriptor("db-1", NodeRole::Writer),
                descriptor("db-2", NodeRole::Writer),
            ],
            vec![
                stale("db-1", NodeRole::Writer),
                health("db-2", NodeRole::Writer, 1),
            ],
        ));

        // A caller may still hold `before`; a fresh route never returns it
        let after = router.route(BackendRole::Writer).unwrap();
        assert_eq!(after.node_tag(), "db-2");
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
