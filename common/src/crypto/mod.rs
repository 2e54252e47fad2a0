pub mod hash;
pub mod signature;

pub use hash::{sha256, sha256_hex, Hash, Hashable, HASH_SIZE};
pub use signature::{verify, Address, KeyPair, Signature, SIGNATURE_SIZE};
