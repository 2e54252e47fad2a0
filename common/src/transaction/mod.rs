// Transaction record
//
// A transaction is immutable once signed: its hash commits to every field
// except `hash` and `signature` themselves, and the signature covers the
// same canonical rendering. Only the lifecycle `status` may move
// (pending -> confirmed | failed); it is bookkeeping, not part of the
// commitment, or confirming a transaction would change its identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use thiserror::Error;

use crate::{
    crypto::{self, sha256, Address, Hash, Signature},
    error::CommonError,
    serializer::to_canonical_bytes,
    time::TimestampMillis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
    #[error("invalid signature from {0}")]
    InvalidSignature(Address),
    #[error("invalid nonce: expected {expected}, got {actual}")]
    InvalidNonce { expected: u64, actual: u64 },
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },
    #[error(transparent)]
    Common(#[from] CommonError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    hash: Hash,
    from: Address,
    to: Address,
    amount: u64,
    fee: u64,
    nonce: u64,
    gas_limit: u64,
    gas_used: u64,
    gas_price: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    signature: Signature,
    status: TransactionStatus,
    timestamp: TimestampMillis,
}

// The canonical preimage shared by the transaction hash and its signature.
#[derive(Serialize)]
struct TransactionPreimage<'a> {
    from: &'a str,
    to: &'a str,
    amount: u64,
    fee: u64,
    nonce: u64,
    gas_limit: u64,
    gas_used: u64,
    gas_price: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    timestamp: TimestampMillis,
}

impl Transaction {
    /// Assemble a transaction from already-signed parts (wire decoding).
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        from: Address,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        gas_limit: u64,
        gas_used: u64,
        gas_price: u64,
        data: Option<Value>,
        signature: Signature,
        status: TransactionStatus,
        timestamp: TimestampMillis,
    ) -> Result<Self, CommonError> {
        let mut tx = Transaction {
            hash: Hash::zero(),
            from,
            to,
            amount,
            fee,
            nonce,
            gas_limit,
            gas_used,
            gas_price,
            data,
            signature,
            status,
            timestamp,
        };
        tx.hash = tx.compute_hash()?;
        Ok(tx)
    }

    /// Create and sign a new pending transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        keypair: &crypto::KeyPair,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        gas_limit: u64,
        gas_price: u64,
        data: Option<Value>,
        timestamp: TimestampMillis,
    ) -> Result<Self, CommonError> {
        let mut tx = Transaction {
            hash: Hash::zero(),
            from: keypair.address(),
            to,
            amount,
            fee,
            nonce,
            gas_limit,
            gas_used: 0,
            gas_price,
            data,
            signature: Signature::from_hex(String::new()),
            status: TransactionStatus::Pending,
            timestamp,
        };
        let preimage = tx.preimage_bytes()?;
        tx.signature = keypair.sign(&preimage);
        tx.hash = sha256(&preimage);
        Ok(tx)
    }

    fn preimage_bytes(&self) -> Result<Vec<u8>, CommonError> {
        to_canonical_bytes(&TransactionPreimage {
            from: &self.from,
            to: &self.to,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            gas_price: self.gas_price,
            data: self.data.as_ref(),
            timestamp: self.timestamp,
        })
    }

    pub fn compute_hash(&self) -> Result<Hash, CommonError> {
        Ok(sha256(&self.preimage_bytes()?))
    }

    /// Check that the hash commits to the fields and the signature verifies
    /// under the sender's key. Balance and nonce are contextual and checked
    /// separately at application time.
    pub fn verify_integrity(&self) -> Result<(), TransactionError> {
        let expected = self.compute_hash()?;
        if expected != self.hash {
            return Err(TransactionError::HashMismatch {
                expected,
                actual: self.hash.clone(),
            });
        }

        let preimage = self.preimage_bytes()?;
        crypto::verify(&self.from, &preimage, &self.signature)
            .map_err(|_| TransactionError::InvalidSignature(self.from.clone()))
    }

    /// Check that the sender can afford and sequence this transaction.
    pub fn verify_spendable(
        &self,
        expected_nonce: u64,
        sender_balance: u64,
    ) -> Result<(), TransactionError> {
        if self.nonce != expected_nonce {
            return Err(TransactionError::InvalidNonce {
                expected: expected_nonce,
                actual: self.nonce,
            });
        }

        let required = self.amount.saturating_add(self.fee);
        if required > sender_balance {
            return Err(TransactionError::InsufficientFunds {
                balance: sender_balance,
                required,
            });
        }
        Ok(())
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn from_address(&self) -> &Address {
        &self.from
    }

    pub fn to_address(&self) -> &Address {
        &self.to
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    pub fn gas_price(&self) -> u64 {
        self.gas_price
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    pub fn timestamp(&self) -> TimestampMillis {
        self.timestamp
    }

    /// Total debit applied to the sender when this transaction confirms.
    pub fn total_cost(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    pub(crate) fn sample_tx(keypair: &KeyPair, amount: u64, nonce: u64) -> Transaction {
        Transaction::create(
            keypair,
            "recipient".to_string(),
            amount,
            1,
            nonce,
            21000,
            1,
            None,
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_hash_commits_to_fields() {
        let keypair = KeyPair::generate();
        let tx = sample_tx(&keypair, 5, 0);
        assert_eq!(tx.compute_hash().unwrap(), *tx.hash());
        assert!(tx.verify_integrity().is_ok());
    }

    #[test]
    fn test_status_change_keeps_hash() {
        let keypair = KeyPair::generate();
        let mut tx = sample_tx(&keypair, 5, 0);
        let original = tx.hash().clone();
        tx.set_status(TransactionStatus::Confirmed);
        assert_eq!(*tx.hash(), original);
        assert!(tx.verify_integrity().is_ok());
    }

    #[test]
    fn test_tampered_amount_detected() {
        let keypair = KeyPair::generate();
        let tx = sample_tx(&keypair, 5, 0);
        let mut value = serde_json::to_value(&tx).unwrap();
        value["amount"] = serde_json::json!(500u64);
        let tampered: Transaction = serde_json::from_value(value).unwrap();
        assert!(matches!(
            tampered.verify_integrity(),
            Err(TransactionError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_spendable_checks() {
        let keypair = KeyPair::generate();
        let tx = sample_tx(&keypair, 5, 3);

        assert!(tx.verify_spendable(3, 6).is_ok());
        assert!(matches!(
            tx.verify_spendable(4, 100),
            Err(TransactionError::InvalidNonce { .. })
        ));
        assert!(matches!(
            tx.verify_spendable(3, 5),
            Err(TransactionError::InsufficientFunds { .. })
        ));
    }
}
