//! # Node Configuration
//!
//! Every tunable of the overlay lives here, grouped per component. Each
//! group implements `Default` with the protocol constants and offers
//! `with_*` builders:
//!
//! ```ignore
//! let config = NodeConfig::default()
//!     .with_bind("127.0.0.1:4000".parse()?)
//!     .with_storage_dir("/var/lib/shardnet".into());
//! ```
//!
//! Configs are serde-serializable so embedding applications can persist them,
//! but this crate never reads configuration files itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::unl::NodeType;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Timeout for a single UDP RPC.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall budget for an iterative lookup (`QUERY_TIMEOUT × 24`).
pub const WALK_TIMEOUT: Duration = Duration::from_secs(5 * 24);

/// Kademlia bucket size.
pub const DEFAULT_K: usize = 20;

/// Kademlia lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Environment variable overriding [`MonitorConfig::max_tries`].
pub const MONITOR_MAX_TRIES_ENV: &str = "MONITOR_MAX_TRIES";

const DEFAULT_MONITOR_MAX_TRIES: u32 = 3;

// ============================================================================
// Component Configs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    pub walk_timeout: Duration,
    /// Maximum number of entries kept by the local store.
    pub max_entries: usize,
    /// Time-to-live of a stored entry.
    pub ttl: Duration,
    /// Interval of the neighbor refresher.
    pub refresh_interval: Duration,
    /// Locally originated entries are re-stored this often.
    pub republish_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: QUERY_TIMEOUT,
            walk_timeout: WALK_TIMEOUT,
            max_entries: 2048,
            ttl: Duration::from_secs(604_800),
            refresh_interval: Duration::from_secs(60),
            republish_interval: Duration::from_secs(3600),
        }
    }
}

impl DhtConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_walk_timeout(mut self, timeout: Duration) -> Self {
        self.walk_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Initial hop budget of a relayed envelope.
    pub hop_limit: u8,
    /// Resend thresholds, measured from submission.
    pub rebroadcast_schedule: Vec<Duration>,
    /// Entries older than this leave the rebroadcast queue.
    pub rebroadcast_expiry: Duration,
    /// Scheduler tick.
    pub rebroadcast_tick: Duration,
    /// Minimum time an envelope hash stays in the de-dup cache.
    pub dedup_retention: Duration,
    /// Number of duplicate sightings that may extend an entry's window.
    pub dedup_max_repeats: u32,
    /// Bound on tracked envelope hashes.
    pub dedup_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            hop_limit: 64,
            rebroadcast_schedule: [10, 30, 60, 120, 250, 500, 1000]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            rebroadcast_expiry: Duration::from_secs(120),
            rebroadcast_tick: Duration::from_secs(1),
            dedup_retention: Duration::from_secs(30),
            dedup_max_repeats: 100,
            dedup_capacity: 10_000,
        }
    }
}

impl MessagingConfig {
    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn with_rebroadcast_schedule(mut self, schedule: Vec<Duration>, expiry: Duration) -> Self {
        self.rebroadcast_schedule = schedule;
        self.rebroadcast_expiry = expiry;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// TCP port for inbound transfer connections; 0 picks a free port.
    pub passive_port: u16,
    /// Skip probing and advertise this node type.
    pub node_type_override: Option<NodeType>,
    pub enable_upnp: bool,
    pub enable_natpmp: bool,
    /// NAT-PMP gateway; defaults to `x.y.z.1` of the LAN address.
    pub natpmp_gateway: Option<Ipv4Addr>,
    /// Answer reachability probes that target private or loopback addresses.
    pub allow_private_probes: bool,
    pub probe_timeout: Duration,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            passive_port: 0,
            node_type_override: None,
            enable_upnp: true,
            enable_natpmp: true,
            natpmp_gateway: None,
            allow_private_probes: false,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Handshakes that never reach ACK expire after this long.
    pub handshake_expiry: Duration,
    /// Connections with no I/O progress for this long are closed.
    pub idle_timeout: Duration,
    pub chunk_size: usize,
    /// Upper bound on a serialized contract.
    pub max_contract_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            handshake_expiry: Duration::from_secs(350),
            idle_timeout: Duration::from_secs(15),
            chunk_size: 64 * 1024,
            max_contract_size: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Bytes per second; 0 disables the limit.
    pub sec_upstream: u64,
    pub sec_downstream: u64,
    /// Bytes per calendar month; 0 disables the limit.
    pub month_upstream: u64,
    pub month_downstream: u64,
    /// Share of the per-second limit baked into the cake.
    pub cake_scale: f64,
    /// Monthly usage file; `None` keeps usage in memory only.
    pub usage_path: Option<PathBuf>,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            sec_upstream: 0,
            sec_downstream: 0,
            month_upstream: 0,
            month_downstream: 0,
            cake_scale: 0.95,
            usage_path: None,
        }
    }
}

impl BandwidthConfig {
    pub fn with_sec_limits(mut self, upstream: u64, downstream: u64) -> Self {
        self.sec_upstream = upstream;
        self.sec_downstream = downstream;
        self
    }

    pub fn with_month_limits(mut self, upstream: u64, downstream: u64) -> Self {
        self.month_upstream = upstream;
        self.month_downstream = downstream;
        self
    }

    pub fn with_usage_path(mut self, path: PathBuf) -> Self {
        self.usage_path = Some(path);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthTestConfig {
    /// Test sizes in bytes, tried in order while tests finish fast.
    pub sizes: Vec<u64>,
    /// A direction finishing faster than this escalates to the next size.
    pub escalation_threshold: Duration,
    /// A test that has not completed after this long is reset.
    pub timeout: Duration,
}

impl Default for BandwidthTestConfig {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            sizes: [1, 5, 50, 100, 250, 500, 1000].iter().map(|m| m * MIB).collect(),
            escalation_threshold: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

impl BandwidthTestConfig {
    pub fn with_sizes(mut self, sizes: Vec<u64>) -> Self {
        self.sizes = sizes;
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: Duration) -> Self {
        self.escalation_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Stop after this many processed peers.
    pub limit: Option<usize>,
    /// Stop once the crawl has run this long.
    pub deadline: Duration,
    /// Attempts per peer before it is abandoned.
    pub max_tries: u32,
    /// Base of the per-peer exponential backoff.
    pub retry_base: Duration,
    pub tick: Duration,
    /// Peers in the scanning stage at once.
    pub max_scanning: usize,
    /// Run a bandwidth test against each scanned peer.
    pub bandwidth_test: bool,
    /// Run a crawl periodically; `None` leaves crawling to explicit calls.
    pub interval: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            limit: None,
            deadline: Duration::from_secs(3600),
            max_tries: max_tries_from_env(),
            retry_base: WALK_TIMEOUT,
            tick: Duration::from_millis(100),
            max_scanning: 16,
            bandwidth_test: true,
            interval: None,
        }
    }
}

impl MonitorConfig {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_bandwidth_test(mut self, enabled: bool) -> Self {
        self.bandwidth_test = enabled;
        self
    }
}

fn max_tries_from_env() -> u32 {
    std::env::var(MONITOR_MAX_TRIES_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|&n: &u32| n > 0)
        .unwrap_or(DEFAULT_MONITOR_MAX_TRIES)
}

// ============================================================================
// Node Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP address for overlay RPC.
    pub bind: SocketAddr,
    /// Seed addresses contacted during startup.
    pub bootstrap: Vec<SocketAddr>,
    /// Root directory for shards and persisted state.
    pub storage_dir: PathBuf,
    /// Byte limit of the shard store; 0 disables the limit.
    pub storage_limit: u64,
    pub dht: DhtConfig,
    pub messaging: MessagingConfig,
    pub nat: NatConfig,
    pub transfer: TransferConfig,
    pub bandwidth: BandwidthConfig,
    pub bandwidth_test: BandwidthTestConfig,
    pub monitor: MonitorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            bootstrap: Vec::new(),
            storage_dir: PathBuf::from("shardnet-data"),
            storage_limit: 0,
            dht: DhtConfig::default(),
            messaging: MessagingConfig::default(),
            nat: NatConfig::default(),
            transfer: TransferConfig::default(),
            bandwidth: BandwidthConfig::default(),
            bandwidth_test: BandwidthTestConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_bootstrap(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.bootstrap = seeds;
        self
    }

    pub fn with_storage_dir(mut self, dir: PathBuf) -> Self {
        self.storage_dir = dir;
        self
    }

    pub fn with_storage_limit(mut self, limit: u64) -> Self {
        self.storage_limit = limit;
        self
    }

    pub fn with_passive_port(mut self, port: u16) -> Self {
        self.nat.passive_port = port;
        self
    }

    /// Skip NAT probing and advertise a fixed node type.
    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.nat.node_type_override = Some(node_type);
        self
    }

    pub fn with_dht(mut self, dht: DhtConfig) -> Self {
        self.dht = dht;
        self
    }

    pub fn with_messaging(mut self, messaging: MessagingConfig) -> Self {
        self.messaging = messaging;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_bandwidth_test(mut self, bandwidth_test: BandwidthTestConfig) -> Self {
        self.bandwidth_test = bandwidth_test;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Directory holding shards.
    pub fn shard_dir(&self) -> PathBuf {
        self.storage_dir.join("shards")
    }

    /// Monthly bandwidth usage file, defaulting into the storage directory.
    pub fn usage_path(&self) -> PathBuf {
        self.bandwidth
            .usage_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("bandwidth_usage.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_timeout_is_twenty_four_queries() {
        assert_eq!(WALK_TIMEOUT, QUERY_TIMEOUT * 24);
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.dht.max_entries, 2048);
        assert_eq!(config.dht.ttl, Duration::from_secs(604_800));
        assert_eq!(config.messaging.hop_limit, 64);
        assert_eq!(config.messaging.rebroadcast_schedule.len(), 7);
        assert_eq!(config.messaging.rebroadcast_expiry, Duration::from_secs(120));
        assert_eq!(config.transfer.handshake_expiry, Duration::from_secs(350));
        assert_eq!(config.transfer.idle_timeout, Duration::from_secs(15));
        assert!((config.bandwidth.cake_scale - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.bandwidth_test.sizes.last().copied(), Some(1000 * 1024 * 1024));
        assert_eq!(config.monitor.tick, Duration::from_millis(100));
        assert_eq!(config.monitor.retry_base, WALK_TIMEOUT);
    }

    #[test]
    fn builders_override_fields() {
        let config = NodeConfig::default()
            .with_passive_port(5000)
            .with_node_type(NodeType::Passive)
            .with_storage_limit(1024)
            .with_bandwidth(BandwidthConfig::default().with_sec_limits(1000, 2000));
        assert_eq!(config.nat.passive_port, 5000);
        assert_eq!(config.nat.node_type_override, Some(NodeType::Passive));
        assert_eq!(config.storage_limit, 1024);
        assert_eq!(config.bandwidth.sec_upstream, 1000);
        assert_eq!(config.bandwidth.sec_downstream, 2000);
    }

    #[test]
    fn usage_path_defaults_into_storage_dir() {
        let config = NodeConfig::default().with_storage_dir(PathBuf::from("/tmp/node"));
        assert_eq!(config.usage_path(), PathBuf::from("/tmp/node/bandwidth_usage.json"));
        assert_eq!(config.shard_dir(), PathBuf::from("/tmp/node/shards"));
    }

    #[test]
    fn config_serializes_to_json() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: NodeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.dht.k, config.dht.k);
        assert_eq!(back.messaging.rebroadcast_schedule, config.messaging.rebroadcast_schedule);
    }
}
