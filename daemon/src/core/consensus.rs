// Proof-of-stake consensus capability
//
// The chain treats consensus as an opaque capability: who may mint, whether
// a minted block is acceptable, and how a validator seals a block. The
// default is stake-weighted: any address holding stake may validate, and
// validator selection is a deterministic weighted draw over the stake map.

use log::debug;
use serde_json::json;
use std::collections::BTreeMap;

use stratos_common::{
    block::{Block, BlockError},
    crypto::{self, Address, Hash, KeyPair, Signature},
};

use crate::core::error::BlockchainError;

pub const VALIDATOR_SIGNATURE_KEY: &str = "validator_signature";

pub trait Consensus: Send + Sync {
    /// Whether this validator may mint the next block.
    fn can_validate(&self, validator: &Address, stakeholders: &BTreeMap<Address, u64>) -> bool;

    /// Acceptance check for an incoming block beyond structural validity.
    fn validate_block(
        &self,
        block: &Block,
        stakeholders: &BTreeMap<Address, u64>,
    ) -> Result<(), BlockchainError>;

    /// Deterministic stake-weighted validator draw for a given seed.
    fn select_validator(
        &self,
        stakeholders: &BTreeMap<Address, u64>,
        seed: &Hash,
    ) -> Option<Address>;

    /// Seal a freshly built block with the validator's signature.
    fn sign_block(&self, block: Block, keypair: &KeyPair) -> Result<Block, BlockchainError>;
}

pub struct ProofOfStake;

impl ProofOfStake {
    // The signature covers the hash of the block as built before the
    // signature metadata is attached, so verifiers can rebuild that form.
    fn unsigned_form(block: &Block) -> Result<Block, BlockError> {
        block
            .clone()
            .into_builder()
            .without_metadata(VALIDATOR_SIGNATURE_KEY)
            .build()
    }
}

impl Consensus for ProofOfStake {
    fn can_validate(&self, validator: &Address, stakeholders: &BTreeMap<Address, u64>) -> bool {
        // during bootstrap, before any stake exists, anyone may mint
        if stakeholders.is_empty() {
            return true;
        }
        stakeholders.get(validator).copied().unwrap_or(0) > 0
    }

    fn validate_block(
        &self,
        block: &Block,
        stakeholders: &BTreeMap<Address, u64>,
    ) -> Result<(), BlockchainError> {
        if block.is_genesis() {
            return Ok(());
        }

        let validators = &block.header().validators;
        if validators.is_empty() {
            return Err(BlockchainError::ValidatorNotAllowed(
                "<none declared>".to_string(),
            ));
        }
        for validator in validators {
            if !self.can_validate(validator, stakeholders) {
                return Err(BlockchainError::ValidatorNotAllowed(validator.clone()));
            }
        }

        // when the minter sealed the block, check the seal
        if let Some(seal) = block.metadata().get(VALIDATOR_SIGNATURE_KEY) {
            let validator = seal
                .get("validator")
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    BlockchainError::ValidatorNotAllowed("<malformed seal>".to_string())
                })?;
            let signature = seal
                .get("signature")
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    BlockchainError::ValidatorNotAllowed("<malformed seal>".to_string())
                })?;

            let unsigned = Self::unsigned_form(block)?;
            crypto::verify(
                validator,
                unsigned.hash().to_hex().as_bytes(),
                &Signature::from_hex(signature.to_string()),
            )
            .map_err(|_| BlockchainError::ValidatorNotAllowed(validator.to_string()))?;
        }
        Ok(())
    }

    fn select_validator(
        &self,
        stakeholders: &BTreeMap<Address, u64>,
        seed: &Hash,
    ) -> Option<Address> {
        let total: u64 = stakeholders.values().sum();
        if total == 0 {
            return None;
        }

        // fold the seed into a draw in [0, total)
        let draw = u64::from_be_bytes(seed.as_bytes()[..8].try_into().ok()?) % total;
        let mut cumulative = 0u64;
        for (address, stake) in stakeholders {
            cumulative += stake;
            if draw < cumulative {
                return Some(address.clone());
            }
        }
        None
    }

    fn sign_block(&self, block: Block, keypair: &KeyPair) -> Result<Block, BlockchainError> {
        let signature = keypair.sign(block.hash().to_hex().as_bytes());
        debug!("sealing block {} as {}", block.height(), keypair.address());
        let sealed = block
            .into_builder()
            .with_metadata(
                VALIDATOR_SIGNATURE_KEY,
                json!({
                    "validator": keypair.address(),
                    "signature": signature.as_hex(),
                }),
            )
            .build()?;
        Ok(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratos_common::block::BlockBuilder;

    fn stakeholders(entries: &[(&str, u64)]) -> BTreeMap<Address, u64> {
        entries
            .iter()
            .map(|(address, stake)| (address.to_string(), *stake))
            .collect()
    }

    #[test]
    fn test_can_validate_requires_stake() {
        let consensus = ProofOfStake;
        let stakes = stakeholders(&[("alice", 100), ("bob", 0)]);
        assert!(consensus.can_validate(&"alice".to_string(), &stakes));
        assert!(!consensus.can_validate(&"bob".to_string(), &stakes));
        assert!(!consensus.can_validate(&"carol".to_string(), &stakes));
        // bootstrap: empty stake map admits anyone
        assert!(consensus.can_validate(&"carol".to_string(), &BTreeMap::new()));
    }

    #[test]
    fn test_selection_is_deterministic_and_weighted() {
        let consensus = ProofOfStake;
        let stakes = stakeholders(&[("alice", 1), ("bob", 1_000_000)]);

        let seed = stratos_common::crypto::sha256(b"round-1");
        let first = consensus.select_validator(&stakes, &seed);
        let second = consensus.select_validator(&stakes, &seed);
        assert_eq!(first, second);

        // with bob holding nearly all stake, varied seeds overwhelmingly pick bob
        let bob_picks = (0u8..50)
            .filter(|round| {
                let seed = stratos_common::crypto::sha256(&[*round]);
                consensus.select_validator(&stakes, &seed).as_deref() == Some("bob")
            })
            .count();
        assert!(bob_picks >= 45, "bob picked only {} times", bob_picks);
    }

    #[test]
    fn test_seal_round_trip() {
        let consensus = ProofOfStake;
        let keypair = KeyPair::generate();
        let stakes = stakeholders(&[(keypair.address().as_str(), 100)]);

        let block = BlockBuilder::new(
            1,
            Vec::new(),
            "g".to_string(),
            vec![keypair.address()],
            stakes.clone(),
        )
        .build()
        .unwrap();
        let sealed = consensus.sign_block(block, &keypair).unwrap();

        assert!(sealed.metadata().contains_key(VALIDATOR_SIGNATURE_KEY));
        assert!(consensus.validate_block(&sealed, &stakes).is_ok());
    }

    #[test]
    fn test_forged_seal_rejected() {
        let consensus = ProofOfStake;
        let keypair = KeyPair::generate();
        let outsider = KeyPair::generate();
        let stakes = stakeholders(&[(keypair.address().as_str(), 100)]);

        let block = BlockBuilder::new(
            1,
            Vec::new(),
            "g".to_string(),
            vec![keypair.address()],
            stakes.clone(),
        )
        .build()
        .unwrap();
        // sealed by a key that does not match the claimed validator
        let forged = block
            .into_builder()
            .with_metadata(
                VALIDATOR_SIGNATURE_KEY,
                json!({
                    "validator": keypair.address(),
                    "signature": outsider.sign(b"whatever").as_hex(),
                }),
            )
            .build()
            .unwrap();
        assert!(consensus.validate_block(&forged, &stakes).is_err());
    }

    #[test]
    fn test_unstaked_validator_rejected() {
        let consensus = ProofOfStake;
        let stakes = stakeholders(&[("alice", 100)]);
        let block = BlockBuilder::new(
            1,
            Vec::new(),
            "g".to_string(),
            vec!["mallory".to_string()],
            stakes.clone(),
        )
        .build()
        .unwrap();
        assert!(matches!(
            consensus.validate_block(&block, &stakes),
            Err(BlockchainError::ValidatorNotAllowed(_))
        ));
    }
}
