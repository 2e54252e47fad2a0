pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Block rules
// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Gas ceiling of a block when the builder is not given one explicitly
pub const DEFAULT_BLOCK_GAS_LIMIT: u64 = 30_000_000;

// Default gas accounting for a plain transfer
pub const BASE_TX_GAS: u64 = 21_000;

// Maximum transactions selected into one block
pub const DEFAULT_MAX_TX_PER_BLOCK: usize = 100;
