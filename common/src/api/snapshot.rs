// State snapshot formats
//
// A snapshot is the full account/contract/validator state at one height,
// with a metadata sidecar kept in the clear for fast listing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    block::BlockHeight,
    crypto::{Address, Hash},
    time::TimestampMillis,
};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
    #[serde(default)]
    pub stake: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCounts {
    pub accounts: usize,
    pub contracts: usize,
    pub validators: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub height: BlockHeight,
    pub block_hash: String,
    pub state_root: Hash,
    pub timestamp: TimestampMillis,
    pub counts: SnapshotCounts,
    pub compressed: bool,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub accounts: BTreeMap<Address, AccountState>,
    pub contracts: BTreeMap<Address, Value>,
    pub validators: BTreeMap<Address, u64>,
    #[serde(default)]
    pub governance: BTreeMap<String, Value>,
    pub height: BlockHeight,
}

impl SnapshotState {
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            accounts: self.accounts.len(),
            contracts: self.contracts.len(),
            validators: self.validators.len(),
        }
    }
}

/// Snapshot as shipped over the wire or stored on disk (before the optional
/// compression/encryption layers are applied to the whole document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub metadata: SnapshotMetadata,
    pub state: SnapshotState,
}
