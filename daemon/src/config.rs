use clap::Parser;
use std::path::PathBuf;

use stratos_common::api::Checkpoint;

// bind addresses
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "127.0.0.1:9345";

// Event pipeline defaults
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_EVENT_SEEN_TTL_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
// completed events older than a day and failed events older than a week are purged
pub const EVENT_COMPLETED_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const EVENT_FAILED_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

// Propagation defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PROPAGATION_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DEAD_NODE_THRESHOLD_SECS: u64 = 90;
pub const DEFAULT_MAX_CASCADE_LEVELS: usize = 3;
pub const DEFAULT_CASCADE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 10;
// adaptive timeout = base * (1.5 - reliability), clamped to this band
pub const ADAPTIVE_TIMEOUT_MIN_MS: u64 = 1_000;
pub const ADAPTIVE_TIMEOUT_MAX_MS: u64 = 10_000;
// failed-peer memory: suppress for count * base * 1.5 seconds, forget after an hour
pub const FAILED_PEER_BACKOFF_FACTOR: f64 = 1.5;
pub const FAILED_PEER_FORGET_SECS: u64 = 60 * 60;
// heartbeat goes to the top N reputation peers
pub const HEARTBEAT_FANOUT: usize = 5;

// Cascade reliability bands
pub const CASCADE_HIGH_RELIABILITY: f64 = 0.9;
pub const CASCADE_MEDIUM_RELIABILITY: f64 = 0.7;
pub const CASCADE_LEVEL0_COUNT: usize = 3;
pub const CASCADE_LEVEL1_COUNT: usize = 5;

// Peer registry
pub const ACTIVE_REPUTATION_THRESHOLD: u8 = 50;
pub const DEFAULT_RELIABILITY: f64 = 0.8;
pub const INITIAL_REPUTATION: u8 = 60;

// Sync engine defaults
pub const DEFAULT_BATCH_BLOCK_SIZE: u64 = 100;
pub const DEFAULT_STATE_SNAPSHOT_SIZE: u64 = 50_000;
pub const DEFAULT_FAST_SYNC_THRESHOLD: u64 = 1_000;
pub const DEFAULT_MAX_SYNC_TIME_SECS: u64 = 3_600;
// below this height gap a plain full sync is always chosen
pub const FULL_SYNC_THRESHOLD: u64 = 100;
// gap handler bands
pub const GAP_IMMEDIATE_LIMIT: u64 = 10;
pub const GAP_BATCH_LIMIT: u64 = 100;
// fork resolution
pub const FORK_QUORUM_RATIO: f64 = 0.51;
pub const FORK_RETRY_COOLDOWN_SECS: u64 = 60;

// Rate limiter: sliding window and per-type budgets (requests per minute)
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_BLOCK_SYNC_RPM: u32 = 60;
pub const DEFAULT_TX_SYNC_RPM: u32 = 300;
pub const DEFAULT_MEMPOOL_SYNC_RPM: u32 = 30;
pub const DEFAULT_WALLET_SYNC_RPM: u32 = 120;
pub const DEFAULT_FULL_SYNC_RPM: u32 = 6;
// deferred queue backoff: 2^retry * base, capped
pub const SYNC_QUEUE_BACKOFF_BASE_SECS: u64 = 5;
pub const SYNC_QUEUE_BACKOFF_CAP_SECS: u64 = 300;
pub const SYNC_QUEUE_MAX_RETRIES: u32 = 3;

// Circuit breaker
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS: u64 = 30;

// Load balancer
pub const DEFAULT_FAILOVER_ATTEMPTS: usize = 3;

// Snapshots
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 10;
pub const SNAPSHOT_COMPRESSION_LEVEL: u32 = 6;

// Auto recovery
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 300;
pub const HEIGHT_DELTA_WARNING: u64 = 10;
pub const HEIGHT_DELTA_CRITICAL: u64 = 50;
pub const DEFAULT_MEMPOOL_MAX: usize = 1_000;
pub const MEMPOOL_WARNING_RATIO: f64 = 0.8;
pub const OLD_TX_ESCALATION_COUNT: usize = 10;
pub const MEMPOOL_OLD_TX_SECS: u64 = 2 * 60 * 60;
pub const CONNECTIVITY_WARNING_RATIO: f64 = 0.5;
pub const CONNECTIVITY_CRITICAL_RATIO: f64 = 0.25;
pub const PENDING_EVENTS_WARNING: u64 = 100;
pub const PENDING_EVENTS_CRITICAL: u64 = 500;
pub const FAILED_EVENTS_CRITICAL: u64 = 50;

/// Runtime configuration of a node. Every recognized tunable from the sync
/// protocol is exposed as a flag; defaults mirror the constants above.
#[derive(Debug, Clone, Parser)]
#[command(name = "stratosd", version, about = "Stratos Network blockchain daemon")]
pub struct NodeConfig {
    /// Unique node identifier advertised to peers; derived from the bind
    /// address when omitted
    #[arg(long)]
    pub node_id: Option<String>,

    /// HTTP bind address for the inter-node API
    #[arg(long, default_value = DEFAULT_HTTP_BIND_ADDRESS)]
    pub bind_address: String,

    /// Directory holding the chain database, snapshots and peer cache
    #[arg(long, default_value = "stratos-data")]
    pub data_dir: PathBuf,

    /// Seed peer URLs, e.g. https://peer.example.org:9345
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Log level filter (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUE_SIZE)]
    pub max_queue_size: usize,
    #[arg(long, default_value_t = DEFAULT_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: u64,
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval: u64,
    #[arg(long, default_value_t = DEFAULT_PROPAGATION_TIMEOUT_SECS)]
    pub propagation_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_DEAD_NODE_THRESHOLD_SECS)]
    pub dead_node_threshold: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_CASCADE_LEVELS)]
    pub max_cascade_levels: usize,
    #[arg(long, default_value_t = DEFAULT_CASCADE_DELAY_MS)]
    pub sync_cascade_delay_ms: u64,
    #[arg(long, default_value_t = DEFAULT_BATCH_BLOCK_SIZE)]
    pub batch_block_size: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_CONNECTIONS)]
    pub parallel_downloads: usize,
    #[arg(long, default_value_t = DEFAULT_STATE_SNAPSHOT_SIZE)]
    pub state_snapshot_size: u64,
    #[arg(long, default_value_t = DEFAULT_FAST_SYNC_THRESHOLD)]
    pub fast_sync_threshold: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_SYNC_TIME_SECS)]
    pub max_sync_time: u64,
    #[arg(long, default_value_t = DEFAULT_BLOCK_SYNC_RPM)]
    pub block_sync_rpm: u32,
    #[arg(long, default_value_t = DEFAULT_TX_SYNC_RPM)]
    pub tx_sync_rpm: u32,
    #[arg(long, default_value_t = DEFAULT_MEMPOOL_SYNC_RPM)]
    pub mempool_sync_rpm: u32,
    #[arg(long, default_value_t = DEFAULT_WALLET_SYNC_RPM)]
    pub wallet_sync_rpm: u32,
    #[arg(long, default_value_t = DEFAULT_FULL_SYNC_RPM)]
    pub full_sync_rpm: u32,
    #[arg(long, default_value_t = DEFAULT_CIRCUIT_BREAKER_THRESHOLD)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS)]
    pub circuit_breaker_timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_RETRY_ATTEMPTS)]
    pub max_retry_attempts: u32,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub adaptive_timeouts: bool,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub enable_compression: bool,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub event_deduplication: bool,
    #[arg(long, default_value_t = DEFAULT_MEMPOOL_MAX)]
    pub mempool_max: usize,
    #[arg(long, default_value_t = DEFAULT_RECOVERY_INTERVAL_SECS)]
    pub recovery_interval: u64,
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_RETENTION)]
    pub snapshot_retention: usize,

    /// Hex key enabling authenticated snapshot encryption
    #[arg(long)]
    pub snapshot_key: Option<String>,

    /// Trusted checkpoints as height:hash:state_root triples
    #[arg(long = "checkpoint", value_parser = parse_checkpoint)]
    pub checkpoints: Vec<Checkpoint>,
}

impl NodeConfig {
    /// Identifier advertised in event envelopes and heartbeats.
    pub fn effective_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", self.bind_address))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        // parse from an empty command line so clap fills every default
        NodeConfig::parse_from(["stratosd"])
    }
}

fn parse_checkpoint(raw: &str) -> Result<Checkpoint, String> {
    let mut parts = raw.splitn(3, ':');
    let height = parts
        .next()
        .ok_or("missing height")?
        .parse::<u64>()
        .map_err(|e| e.to_string())?;
    let hash = parts.next().ok_or("missing hash")?.to_string();
    let state_root = parts
        .next()
        .ok_or("missing state root")?
        .parse()
        .map_err(|_| "invalid state root hex".to_string())?;
    Ok(Checkpoint {
        height,
        hash,
        state_root,
    })
}
