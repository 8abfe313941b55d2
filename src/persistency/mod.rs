//! Persistency workspace
//!
//! Disk cache for cloud schema payloads and collected data awaiting upload,
//! under `<root>/FWE_Persistency/`. Every persisted blob has an adjacent
//! `.sha1` sidecar with its lowercase hex digest; reads recompute and
//! verify, and a mismatch deletes both files. A JSON metadata file tracks
//! the collected-data files and its own schema version; a version mismatch
//! discards the cached data wholesale.

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Workspace directory under the persistency root.
pub const PERSISTENCY_WORKSPACE: &str = "FWE_Persistency";

const DECODER_MANIFEST_FILE: &str = "decoder_manifest";
const COLLECTION_SCHEME_LIST_FILE: &str = "collection_scheme_list";
const PAYLOAD_METADATA_FILE: &str = "payload_metadata";
const COLLECTED_DATA_FOLDER: &str = "collected_data";
const CHECKSUM_EXTENSION: &str = "sha1";

/// Bump when the payload metadata layout changes; older files are cleared.
const METADATA_SCHEME_VERSION: u64 = 1;

/// What a blob is, deciding where it lives in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    DecoderManifest,
    CampaignList,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistencyError {
    #[error("no persisted data")]
    NotFound,
    #[error("nothing to persist")]
    EmptyData,
    #[error("checksum or schema version mismatch")]
    InvalidData,
    #[error("persistency budget exceeded")]
    MemoryFull,
    #[error("filesystem error: {0}")]
    Filesystem(String),
}

fn io_err(e: std::io::Error) -> PersistencyError {
    PersistencyError::Filesystem(e.to_string())
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_EXTENSION);
    PathBuf::from(name)
}

/// The workspace. Shared as `Arc`; the metadata document is guarded by one
/// mutex.
pub struct PersistencyWorkspace {
    workspace: PathBuf,
    collected_data_dir: PathBuf,
    max_partition_size: u64,
    keep_extensions: Vec<String>,
    metadata: Mutex<serde_json::Value>,
}

impl PersistencyWorkspace {
    /// Open (or create) the workspace, validate the payload metadata, and
    /// sweep stale collected-data files.
    pub fn open(
        root: &Path,
        max_partition_size: u64,
        keep_extensions: Vec<String>,
    ) -> Result<Arc<Self>, PersistencyError> {
        let workspace = root.join(PERSISTENCY_WORKSPACE);
        let collected_data_dir = workspace.join(COLLECTED_DATA_FOLDER);
        std::fs::create_dir_all(&collected_data_dir).map_err(io_err)?;

        let this = Self {
            workspace,
            collected_data_dir,
            max_partition_size,
            keep_extensions,
            metadata: Mutex::new(fresh_metadata()),
        };

        match this.read_verified(&this.workspace.join(PAYLOAD_METADATA_FILE)) {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(metadata) if metadata["version"] == METADATA_SCHEME_VERSION => {
                    debug!("Read persisted payload metadata");
                    *this.lock_metadata() = metadata;
                }
                Ok(_) => {
                    error!("Payload metadata scheme version is not supported, ignoring persisted files");
                    let _ = std::fs::remove_file(this.workspace.join(PAYLOAD_METADATA_FILE));
                    this.clear_collected_data();
                }
                Err(e) => {
                    warn!(error = %e, "Payload metadata does not parse, starting fresh");
                }
            },
            Err(PersistencyError::NotFound) => {}
            Err(e) => {
                warn!(error = %e, "Could not read payload metadata, starting fresh");
            }
        }

        this.sweep_unreferenced_files();
        Ok(Arc::new(this))
    }

    fn blob_path(&self, data_type: DataType) -> PathBuf {
        match data_type {
            DataType::DecoderManifest => self.workspace.join(DECODER_MANIFEST_FILE),
            DataType::CampaignList => self.workspace.join(COLLECTION_SCHEME_LIST_FILE),
        }
    }

    /// Persist a schema blob with its checksum sidecar.
    pub fn write_blob(&self, data_type: DataType, bytes: &[u8]) -> Result<(), PersistencyError> {
        self.write_verified(&self.blob_path(data_type), bytes)
    }

    /// Read a schema blob back, verifying its checksum.
    pub fn read_blob(&self, data_type: DataType) -> Result<Vec<u8>, PersistencyError> {
        self.read_verified(&self.blob_path(data_type))
    }

    /// Remove a schema blob and its sidecar.
    pub fn erase_blob(&self, data_type: DataType) -> Result<(), PersistencyError> {
        let path = self.blob_path(data_type);
        let _ = std::fs::remove_file(checksum_path(&path));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    /// Persist one collected-data file and record it in the metadata.
    pub fn write_collected(
        &self,
        filename: &str,
        bytes: &[u8],
        metadata_entry: serde_json::Value,
    ) -> Result<(), PersistencyError> {
        self.write_verified(&self.collected_data_dir.join(filename), bytes)?;

        let mut metadata = self.lock_metadata();
        if let Some(files) = metadata["files"].as_array_mut() {
            files.push(metadata_entry);
        }
        let serialized =
            serde_json::to_vec(&*metadata).map_err(|e| PersistencyError::Filesystem(e.to_string()))?;
        drop(metadata);
        self.write_verified(&self.workspace.join(PAYLOAD_METADATA_FILE), &serialized)
    }

    /// Read one collected-data file back, verifying its checksum.
    pub fn read_collected(&self, filename: &str) -> Result<Vec<u8>, PersistencyError> {
        self.read_verified(&self.collected_data_dir.join(filename))
    }

    /// Remove one collected-data file and drop it from the metadata.
    pub fn erase_collected(&self, filename: &str) -> Result<(), PersistencyError> {
        let path = self.collected_data_dir.join(filename);
        let _ = std::fs::remove_file(checksum_path(&path));
        let _ = std::fs::remove_file(&path);

        let mut metadata = self.lock_metadata();
        if let Some(files) = metadata["files"].as_array_mut() {
            files.retain(|entry| entry["filename"] != filename);
        }
        let serialized =
            serde_json::to_vec(&*metadata).map_err(|e| PersistencyError::Filesystem(e.to_string()))?;
        drop(metadata);
        self.write_verified(&self.workspace.join(PAYLOAD_METADATA_FILE), &serialized)
    }

    /// Metadata entries of the collected-data files awaiting upload.
    pub fn collected_files(&self) -> Vec<serde_json::Value> {
        self.lock_metadata()["files"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    /// Bytes currently used by the workspace.
    pub fn total_size(&self) -> u64 {
        fn dir_size(path: &Path) -> u64 {
            let Ok(entries) = std::fs::read_dir(path) else {
                return 0;
            };
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        dir_size(&path)
                    } else {
                        entry.metadata().map(|m| m.len()).unwrap_or(0)
                    }
                })
                .sum()
        }
        dir_size(&self.workspace)
    }

    fn write_verified(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistencyError> {
        if bytes.is_empty() {
            return Err(PersistencyError::EmptyData);
        }
        if self.total_size() + bytes.len() as u64 > self.max_partition_size {
            warn!(
                path = %path.display(),
                size = bytes.len(),
                budget = self.max_partition_size,
                "Persistency budget exceeded, not writing"
            );
            return Err(PersistencyError::MemoryFull);
        }
        std::fs::write(path, bytes).map_err(io_err)?;
        std::fs::write(checksum_path(path), sha1_hex(bytes)).map_err(io_err)?;
        debug!(path = %path.display(), size = bytes.len(), "Persisted blob");
        Ok(())
    }

    /// Read a blob and verify it against its sidecar digest. On any
    /// mismatch both files are deleted and `InvalidData` is reported.
    fn read_verified(&self, path: &Path) -> Result<Vec<u8>, PersistencyError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistencyError::NotFound)
            }
            Err(e) => return Err(io_err(e)),
        };
        let stored_checksum = std::fs::read_to_string(checksum_path(path)).unwrap_or_default();
        let computed = sha1_hex(&bytes);
        if stored_checksum.trim() != computed {
            error!(
                path = %path.display(),
                "Checksum mismatch on persisted file, deleting it"
            );
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(checksum_path(path));
            return Err(PersistencyError::InvalidData);
        }
        Ok(bytes)
    }

    fn clear_collected_data(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.collected_data_dir) {
            for entry in entries.filter_map(|entry| entry.ok()) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        *self.lock_metadata() = fresh_metadata();
    }

    /// Remove collected-data files that the metadata no longer references,
    /// except those whose extension is on the do-not-delete list. Sidecars
    /// follow their blobs.
    fn sweep_unreferenced_files(&self) {
        let referenced: Vec<String> = self
            .collected_files()
            .iter()
            .filter_map(|entry| entry["filename"].as_str().map(str::to_string))
            .collect();

        let Ok(entries) = std::fs::read_dir(&self.collected_data_dir) else {
            return;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if path.extension().and_then(|ext| ext.to_str()) == Some(CHECKSUM_EXTENSION) {
                // handled together with its blob
                continue;
            }
            if referenced.iter().any(|referenced| referenced == name) {
                continue;
            }
            let protected = self
                .keep_extensions
                .iter()
                .any(|extension| name.ends_with(extension.as_str()));
            if protected {
                continue;
            }
            info!(file = name, "Removing unreferenced collected-data file");
            let _ = std::fs::remove_file(checksum_path(&path));
            let _ = std::fs::remove_file(&path);
        }
    }

    fn lock_metadata(&self) -> MutexGuard<'_, serde_json::Value> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fresh_metadata() -> serde_json::Value {
    serde_json::json!({ "version": METADATA_SCHEME_VERSION, "files": [] })
}
