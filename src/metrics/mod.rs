//! Prometheus metrics for the routing/lifecycle core
//!
//! Exposed through the process's metrics endpoint for scraping.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Core metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Pool metrics
    /// Connections handed out by pools
    pub pool_acquired_total: IntCounter,
    /// Connections destroyed instead of returned
    pub pool_discarded_total: IntCounter,
    /// Acquire deadlines that expired with the pool at capacity
    pub pool_exhausted_total: IntCounter,

    // Routing metrics
    /// Route decisions by requested role
    pub routes_total: IntCounterVec,

    // Transaction context metrics
    /// Contexts created
    pub contexts_opened_total: IntCounter,
    /// Contexts whose close destroyed the bound connections
    pub contexts_discarded_total: IntCounter,
    /// Session-state restores that failed and poisoned a context
    pub restore_failures_total: IntCounter,

    // Kill propagation metrics
    /// Kill operations handled locally, by kind
    pub kills_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let pool_acquired_total = IntCounter::new(
            "janus_pool_acquired_total",
            "Backend connections handed out by pools",
        )
        .unwrap();

        let pool_discarded_total = IntCounter::new(
            "janus_pool_discarded_total",
            "Backend connections destroyed instead of returned to a pool",
        )
        .unwrap();

        let pool_exhausted_total = IntCounter::new(
            "janus_pool_exhausted_total",
            "Pool acquire deadlines that expired at capacity",
        )
        .unwrap();

        let routes_total = IntCounterVec::new(
            Opts::new("janus_routes_total", "Route decisions by requested role"),
            &["role"],
        )
        .unwrap();

        let contexts_opened_total = IntCounter::new(
            "janus_contexts_opened_total",
            "Frontend transaction contexts created",
        )
        .unwrap();

        let contexts_discarded_total = IntCounter::new(
            "janus_contexts_discarded_total",
            "Contexts closed with their connections destroyed",
        )
        .unwrap();

        let restore_failures_total = IntCounter::new(
            "janus_restore_failures_total",
            "Session-state restores that failed and poisoned a context",
        )
        .unwrap();

        let kills_total = IntCounterVec::new(
            Opts::new("janus_kills_total", "Kill operations handled locally"),
            &["kind"],
        )
        .unwrap();

        registry
            .register(Box::new(pool_acquired_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_discarded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_exhausted_total.clone()))
            .unwrap();
        registry.register(Box::new(routes_total.clone())).unwrap();
        registry
            .register(Box::new(contexts_opened_total.clone()))
            .unwrap();
        registry
            .register(Box::new(contexts_discarded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(restore_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(kills_total.clone())).unwrap();

        Self {
            registry,
            pool_acquired_total,
            pool_discarded_total,
            pool_exhausted_total,
            routes_total,
            contexts_opened_total,
            contexts_discarded_total,
            restore_failures_total,
            kills_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
