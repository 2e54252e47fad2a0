mod block;
pub mod header;
pub mod merkle;

pub use block::{compute_state_root, genesis_block, Block, BlockBuilder, BlockError};
pub use header::{
    verify_header_chain, BlockHeader, BlockHeight, HeaderError, GENESIS_PREVIOUS_HASH,
};
pub use merkle::{calculate_merkle_root, MerkleTree, ProofNode, ProofPosition};
