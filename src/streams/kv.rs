//! Per-stream checkpoint store
//!
//! A single-entry key-value file named `s` next to the stream log. It holds
//! the sequence number of the oldest un-acknowledged record, versioned so a
//! layout change discards stale files instead of misreading them. A corrupt
//! or mismatched file is treated as "no checkpoint" and deleted, which
//! restarts iteration at the oldest record — safe under at-least-once
//! delivery.

use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the checkpoint store inside a partition directory.
pub const KV_STORE_FILENAME: &str = "s";

const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
const CHECKPOINT_FILE_LEN: usize = 4 + 8;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(partition_dir: &Path) -> Self {
        Self {
            path: partition_dir.join(KV_STORE_FILENAME),
        }
    }

    /// The persisted checkpoint, or `None` when absent, corrupt, or written
    /// by an unsupported schema version (the bad file is discarded).
    pub fn read(&self) -> Option<u64> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read checkpoint");
                return None;
            }
        };
        if bytes.len() != CHECKPOINT_FILE_LEN {
            warn!(path = %self.path.display(), len = bytes.len(), "Corrupt checkpoint, discarding it");
            let _ = std::fs::remove_file(&self.path);
            return None;
        }
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != CHECKPOINT_SCHEMA_VERSION {
            warn!(
                path = %self.path.display(),
                version,
                "Checkpoint schema version not supported, discarding it"
            );
            let _ = std::fs::remove_file(&self.path);
            return None;
        }
        let mut sequence_bytes = [0u8; 8];
        sequence_bytes.copy_from_slice(&bytes[4..12]);
        Some(u64::from_le_bytes(sequence_bytes))
    }

    /// Persist a new checkpoint.
    pub fn write(&self, sequence: u64) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(CHECKPOINT_FILE_LEN);
        bytes.extend_from_slice(&CHECKPOINT_SCHEMA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&sequence.to_le_bytes());
        std::fs::write(&self.path, bytes)
    }
}
