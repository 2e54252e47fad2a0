use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid hash: {0}")]
    InvalidHash(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}
