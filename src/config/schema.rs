use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Identity of this proxy node
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Backend pool sizing and deadlines
    #[serde(default)]
    pub pool: PoolConfig,
    /// Read-write splitting configuration
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Cross-node control channel configuration
    #[serde(default)]
    pub control: ControlConfig,
}

// ============================================================================
// Proxy identity
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Tag identifying this node in context ids and kill messages
    #[serde(default = "default_node_tag")]
    pub node_tag: String,
}

fn default_node_tag() -> String {
    "janus-0".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            node_tag: default_node_tag(),
        }
    }
}

// ============================================================================
// Pool configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Hard ceiling on live connections per backend node
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
    /// Default deadline for acquiring a connection (milliseconds)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Interval between refresher passes (milliseconds)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Timeout for a single liveness probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Target number of idle connections the refresher maintains
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    /// Prepared-statement handles kept per physical connection
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

fn default_pool_capacity() -> usize {
    16
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_min_idle() -> usize {
    2
}

fn default_statement_cache_capacity() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            min_idle: default_min_idle(),
            statement_cache_capacity: default_statement_cache_capacity(),
        }
    }
}

// ============================================================================
// Routing configuration
// ============================================================================

/// Strategy for picking a replica pool for read traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReaderPolicy {
    #[default]
    RoundRobin,
    LatencyWeighted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// How replica pools are selected for reads
    #[serde(default)]
    pub reader_policy: ReaderPolicy,
    /// Whether reads may fall back to the primary when no replica is healthy
    #[serde(default = "default_read_fallback")]
    pub read_fallback_to_primary: bool,
    /// Health records older than this are treated as stale (milliseconds)
    #[serde(default = "default_health_stale_after_ms")]
    pub health_stale_after_ms: u64,
}

fn default_read_fallback() -> bool {
    true
}

fn default_health_stale_after_ms() -> u64 {
    15_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            reader_policy: ReaderPolicy::default(),
            read_fallback_to_primary: default_read_fallback(),
            health_stale_after_ms: default_health_stale_after_ms(),
        }
    }
}

// ============================================================================
// Control channel configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Per-call deadline for cross-node control RPCs (milliseconds)
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}
