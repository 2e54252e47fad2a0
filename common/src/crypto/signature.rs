// Signature primitives
//
// The protocol treats signing as an external capability: transactions carry
// an ed25519 signature over their canonical bytes, made with the key whose
// hex-encoded verifying key is the sender address.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::error::CommonError;

pub const SIGNATURE_SIZE: usize = 64;

/// Hex-encoded account address (the ed25519 verifying key).
pub type Address = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn from_hex(hex: String) -> Self {
        Signature(hex)
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    fn to_dalek(&self) -> Result<DalekSignature, CommonError> {
        let bytes = hex::decode(&self.0).map_err(|_| CommonError::InvalidSignature)?;
        let bytes: [u8; SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| CommonError::InvalidSignature)?;
        Ok(DalekSignature::from_bytes(&bytes))
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verify a signature over `message` under the verifying key encoded in `address`.
pub fn verify(address: &str, message: &[u8], signature: &Signature) -> Result<(), CommonError> {
    let key_bytes = hex::decode(address).map_err(|_| CommonError::InvalidPublicKey)?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| CommonError::InvalidPublicKey)?;
    let key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CommonError::InvalidPublicKey)?;
    key.verify(message, &signature.to_dalek()?)
        .map_err(|_| CommonError::InvalidSignature)
}

/// An in-process keypair. Wallet tooling is out of scope; this exists for
/// signing blocks a validator mints locally and for tests.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        KeyPair { signing }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        KeyPair {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// Hex-encoded verifying key, used as the account address.
    pub fn address(&self) -> Address {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let signature = self.signing.sign(message);
        Signature(hex::encode(signature.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"payload");
        assert!(verify(&keypair.address(), b"payload", &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_rejected() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"payload");
        assert!(verify(&keypair.address(), b"other", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = keypair.sign(b"payload");
        assert!(verify(&other.address(), b"payload", &signature).is_err());
    }
}
