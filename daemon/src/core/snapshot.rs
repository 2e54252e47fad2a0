// State snapshots
//
// A snapshot file holds the full {metadata, state} document, deflated and
// optionally sealed with ChaCha20-Poly1305 (nonce prepended). The metadata
// sidecar is always written in the clear so listing never has to touch the
// heavy body. Retention keeps the newest K snapshots.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit};
use chrono::{TimeZone, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use log::{debug, info, warn};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use stratos_common::{
    api::{SnapshotDocument, SnapshotMetadata, SnapshotState, SNAPSHOT_FORMAT_VERSION},
    block::BlockHeight,
    crypto::{sha256, Hash},
    serializer::to_canonical_bytes,
    time::get_current_time_in_millis,
};

use crate::{
    config::SNAPSHOT_COMPRESSION_LEVEL,
    core::error::BlockchainError,
};

const NONCE_SIZE: usize = 12;

/// Commitment over a snapshot state: sha256 of its canonical rendering.
pub fn compute_snapshot_state_root(state: &SnapshotState) -> Result<Hash, BlockchainError> {
    Ok(sha256(&to_canonical_bytes(state)?))
}

pub struct SnapshotManager {
    dir: PathBuf,
    compress: bool,
    key: Option<[u8; 32]>,
    retention: usize,
    // fail closed on state-root mismatch instead of warning
    strict: bool,
}

impl SnapshotManager {
    pub fn new(
        dir: PathBuf,
        compress: bool,
        key: Option<[u8; 32]>,
        retention: usize,
        strict: bool,
    ) -> Result<Self, BlockchainError> {
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotManager {
            dir,
            compress,
            key,
            retention,
            strict,
        })
    }

    /// Build and persist a snapshot of `state` as of `height`. Returns the
    /// path of the snapshot file; the `.meta.json` sidecar sits next to it.
    pub fn create(
        &self,
        height: BlockHeight,
        block_hash: String,
        state: SnapshotState,
    ) -> Result<PathBuf, BlockchainError> {
        let state_root = compute_snapshot_state_root(&state)?;
        let timestamp = get_current_time_in_millis();
        let metadata = SnapshotMetadata {
            version: SNAPSHOT_FORMAT_VERSION,
            height,
            block_hash,
            state_root,
            timestamp,
            counts: state.counts(),
            compressed: self.compress,
            encrypted: self.key.is_some(),
        };
        let document = SnapshotDocument {
            metadata: metadata.clone(),
            state,
        };

        let mut body = serde_json::to_vec(&document)?;
        if self.compress {
            let mut encoder = DeflateEncoder::new(
                Vec::new(),
                Compression::new(SNAPSHOT_COMPRESSION_LEVEL),
            );
            encoder.write_all(&body)?;
            body = encoder.finish()?;
        }
        if let Some(key) = &self.key {
            body = seal(key, &body)?;
        }

        let stamp = Utc
            .timestamp_millis_opt(timestamp as i64)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d_%H-%M-%S");
        let path = self.dir.join(format!("snapshot_{}_{}.json", height, stamp));
        std::fs::write(&path, &body)?;

        // sidecar stays plain for cheap listing
        let meta_path = path.with_extension("meta.json");
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&metadata)?)?;

        info!(
            "snapshot at height {} written to {} ({} bytes)",
            height,
            path.display(),
            std::fs::metadata(&path)?.len()
        );
        self.prune()?;
        Ok(path)
    }

    /// Read, unseal, inflate and verify a snapshot file.
    pub fn load(&self, path: &Path) -> Result<SnapshotDocument, BlockchainError> {
        let mut body = std::fs::read(path)?;
        if let Some(key) = &self.key {
            body = open(key, &body)?;
        }

        // compressed snapshots never start with a JSON brace
        if body.first() != Some(&b'{') {
            let mut decoder = DeflateDecoder::new(body.as_slice());
            let mut inflated = Vec::new();
            decoder.read_to_end(&mut inflated)?;
            body = inflated;
        }
        let document: SnapshotDocument = serde_json::from_slice(&body)?;
        self.verify(&document)?;
        Ok(document)
    }

    /// Verify a snapshot document against its own metadata.
    pub fn verify(&self, document: &SnapshotDocument) -> Result<(), BlockchainError> {
        let metadata = &document.metadata;
        if metadata.version != SNAPSHOT_FORMAT_VERSION {
            return Err(BlockchainError::SnapshotVerification(format!(
                "unsupported snapshot version {}",
                metadata.version
            )));
        }
        let counts = document.state.counts();
        if counts != metadata.counts {
            return Err(BlockchainError::SnapshotVerification(format!(
                "count mismatch: metadata says {:?}, state has {:?}",
                metadata.counts, counts
            )));
        }

        let recomputed = compute_snapshot_state_root(&document.state)?;
        if recomputed != metadata.state_root {
            if self.strict {
                return Err(BlockchainError::SnapshotVerification(format!(
                    "state root mismatch at height {}",
                    metadata.height
                )));
            }
            warn!(
                "snapshot state root mismatch at height {} (expected {}, got {})",
                metadata.height, metadata.state_root, recomputed
            );
        }
        Ok(())
    }

    /// All known snapshots (from sidecars), newest height first.
    pub fn list(&self) -> Result<Vec<(PathBuf, SnapshotMetadata)>, BlockchainError> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".meta.json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(BlockchainError::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(BlockchainError::from))
            {
                Ok(metadata) => {
                    let metadata: SnapshotMetadata = metadata;
                    let body_path = self.dir.join(name.replace(".meta.json", ".json"));
                    if body_path.exists() {
                        snapshots.push((body_path, metadata));
                    }
                }
                Err(error) => warn!("skipping unreadable sidecar {}: {}", name, error),
            }
        }
        snapshots.sort_by(|a, b| b.1.height.cmp(&a.1.height));
        Ok(snapshots)
    }

    /// Newest snapshot at or below `height`.
    pub fn latest_at_or_below(
        &self,
        height: BlockHeight,
    ) -> Result<Option<(PathBuf, SnapshotMetadata)>, BlockchainError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|(_, metadata)| metadata.height <= height))
    }

    pub fn has_snapshot_at(&self, height: BlockHeight) -> Result<bool, BlockchainError> {
        Ok(self
            .list()?
            .iter()
            .any(|(_, metadata)| metadata.height == height))
    }

    pub fn load_at(&self, height: BlockHeight) -> Result<Option<SnapshotDocument>, BlockchainError> {
        for (path, metadata) in self.list()? {
            if metadata.height == height {
                return self.load(&path).map(Some);
            }
        }
        Ok(None)
    }

    // Drop everything beyond the newest `retention` snapshots.
    fn prune(&self) -> Result<(), BlockchainError> {
        let snapshots = self.list()?;
        for (path, metadata) in snapshots.into_iter().skip(self.retention) {
            debug!("pruning snapshot at height {}", metadata.height);
            if let Err(error) = std::fs::remove_file(&path) {
                warn!("could not prune {}: {}", path.display(), error);
            }
            let _ = std::fs::remove_file(path.with_extension("meta.json"));
        }
        Ok(())
    }
}

// The unique nonce is prepended in plaintext to the sealed body.
fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, BlockchainError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| BlockchainError::SnapshotVerification("invalid key".to_string()))?;
    let nonce: [u8; NONCE_SIZE] = rand::random();
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| BlockchainError::SnapshotVerification("encryption failed".to_string()))?;
    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, BlockchainError> {
    if sealed.len() < NONCE_SIZE {
        return Err(BlockchainError::SnapshotVerification(
            "sealed snapshot too short".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce_bytes
        .try_into()
        .map_err(|_| BlockchainError::SnapshotVerification("malformed nonce".to_string()))?;
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| BlockchainError::SnapshotVerification("invalid key".to_string()))?;
    cipher.decrypt((&nonce).into(), ciphertext).map_err(|_| {
        BlockchainError::SnapshotVerification(
            "snapshot decryption failed (wrong key or tampered file)".to_string(),
        )
    })
}
