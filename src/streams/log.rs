//! Append-only record log
//!
//! One `0.log` file per partition. Each record is framed as
//! `[ u64 sequence | u32 payload_len | u64 num_signals | u64 trigger_time_ms | payload ]`
//! (little-endian). Sequence numbers are assigned at append time, persisted
//! in the frame, and survive restarts and pruning, so a reader's checkpoint
//! stays meaningful. The file is never rewritten in place; pruning rewrites
//! the retained suffix into a temporary file and renames it over the log.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of the record log inside a partition directory.
pub const LOG_FILENAME: &str = "0.log";

const FRAME_HEADER_LEN: u64 = 8 + 4 + 8 + 8;

/// Metadata stored with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub num_signals: u64,
    pub trigger_time_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    sequence: u64,
    offset: u64,
    payload_len: u32,
    metadata: RecordMetadata,
}

impl IndexEntry {
    fn frame_len(&self) -> u64 {
        FRAME_HEADER_LEN + u64::from(self.payload_len)
    }
}

struct LogInner {
    index: Vec<IndexEntry>,
    next_sequence: u64,
}

/// The log. Appends, reads, and pruning are internally synchronized.
pub struct RecordLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl RecordLog {
    /// Open or create the log in `partition_dir`, scanning existing frames
    /// to rebuild the in-memory index. A corrupt tail (torn write from a
    /// crash) is truncated away.
    pub fn open_or_create(partition_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(partition_dir)?;
        let path = partition_dir.join(LOG_FILENAME);

        let mut index = Vec::new();
        let mut next_sequence = 0u64;
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let mut offset = 0u64;
            let mut valid_end = 0u64;
            while (offset + FRAME_HEADER_LEN) as usize <= bytes.len() {
                let at = offset as usize;
                let sequence = u64::from_le_bytes(read8(&bytes, at));
                let payload_len = u32::from_le_bytes(read4(&bytes, at + 8));
                let num_signals = u64::from_le_bytes(read8(&bytes, at + 12));
                let trigger_time_ms = u64::from_le_bytes(read8(&bytes, at + 20));
                let frame_end = offset + FRAME_HEADER_LEN + u64::from(payload_len);
                if frame_end as usize > bytes.len() {
                    break;
                }
                index.push(IndexEntry {
                    sequence,
                    offset,
                    payload_len,
                    metadata: RecordMetadata {
                        num_signals,
                        trigger_time_ms,
                    },
                });
                next_sequence = sequence + 1;
                offset = frame_end;
                valid_end = frame_end;
            }
            if (valid_end as usize) < bytes.len() {
                warn!(
                    path = %path.display(),
                    valid = valid_end,
                    total = bytes.len(),
                    "Truncating corrupt log tail"
                );
                let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_end)?;
            }
            debug!(path = %path.display(), records = index.len(), "Opened record log");
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                index,
                next_sequence,
            }),
        })
    }

    /// Append one record; returns its sequence number.
    pub fn append(&self, payload: &[u8], metadata: RecordMetadata) -> std::io::Result<u64> {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&metadata.num_signals.to_le_bytes());
        frame.extend_from_slice(&metadata.trigger_time_ms.to_le_bytes());
        frame.extend_from_slice(payload);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;

        inner.index.push(IndexEntry {
            sequence,
            offset,
            payload_len: payload.len() as u32,
            metadata,
        });
        inner.next_sequence = sequence + 1;
        Ok(sequence)
    }

    /// First record with `sequence >= min_sequence`, in append order.
    /// `None` means the reader has consumed everything. The lock is held
    /// across the file read so pruning cannot rewrite the log mid-read.
    pub fn read_from(
        &self,
        min_sequence: u64,
    ) -> std::io::Result<Option<(u64, RecordMetadata, Vec<u8>)>> {
        let inner = self.lock();
        let Some(entry) = inner
            .index
            .iter()
            .find(|entry| entry.sequence >= min_sequence)
            .copied()
        else {
            return Ok(None);
        };

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset + FRAME_HEADER_LEN))?;
        let mut payload = vec![0u8; entry.payload_len as usize];
        file.read_exact(&mut payload)?;
        Ok(Some((entry.sequence, entry.metadata, payload)))
    }

    /// Drop records with `trigger_time_ms` strictly below the cutoff.
    /// Returns the pruned byte count (frames, not just payloads).
    pub fn prune_older_than(&self, cutoff_trigger_time_ms: u64) -> std::io::Result<u64> {
        self.prune(|entry| entry.metadata.trigger_time_ms >= cutoff_trigger_time_ms)
    }

    /// Drop oldest records until the log fits `max_bytes`. Returns the
    /// pruned byte count.
    pub fn enforce_max_bytes(&self, max_bytes: u64) -> std::io::Result<u64> {
        let mut remaining = self.total_bytes();
        if remaining <= max_bytes {
            return Ok(0);
        }
        let cutoff_sequence = {
            let inner = self.lock();
            let mut cutoff = inner.next_sequence;
            for entry in &inner.index {
                if remaining <= max_bytes {
                    cutoff = entry.sequence;
                    break;
                }
                remaining -= entry.frame_len();
            }
            cutoff
        };
        self.prune(|entry| entry.sequence >= cutoff_sequence)
    }

    /// Bytes currently occupied by all frames.
    pub fn total_bytes(&self) -> u64 {
        self.lock().index.iter().map(IndexEntry::frame_len).sum()
    }

    pub fn record_count(&self) -> usize {
        self.lock().index.len()
    }

    /// Rewrite the log keeping only records that satisfy `keep`. Sequence
    /// numbers of retained records are preserved.
    fn prune(&self, keep: impl Fn(&IndexEntry) -> bool) -> std::io::Result<u64> {
        let mut inner = self.lock();

        let keep_flags: Vec<bool> = inner.index.iter().map(&keep).collect();
        let pruned_bytes: u64 = inner
            .index
            .iter()
            .zip(&keep_flags)
            .filter(|(_, keep)| !**keep)
            .map(|(entry, _)| entry.frame_len())
            .sum();
        if pruned_bytes == 0 {
            return Ok(0);
        }

        let bytes = std::fs::read(&self.path)?;
        let mut retained = Vec::with_capacity(bytes.len() - pruned_bytes as usize);
        let mut new_index = Vec::new();
        for (entry, keep) in inner.index.iter().zip(&keep_flags) {
            if !keep {
                continue;
            }
            let start = entry.offset as usize;
            let end = start + entry.frame_len() as usize;
            let mut rewritten = *entry;
            rewritten.offset = retained.len() as u64;
            retained.extend_from_slice(&bytes[start..end]);
            new_index.push(rewritten);
        }

        let tmp_path = self.path.with_extension("log.tmp");
        std::fs::write(&tmp_path, &retained)?;
        std::fs::rename(&tmp_path, &self.path)?;
        inner.index = new_index;
        Ok(pruned_bytes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn read4(bytes: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[at..at + 4]);
    out
}

fn read8(bytes: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[at..at + 8]);
    out
}
