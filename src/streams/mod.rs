//! Store-and-Forward Stream Engine
//!
//! Append-only per-partition logs for campaigns that carry a
//! store-and-forward configuration. The forwarder reads records one at a
//! time and acknowledges each by invoking the returned checkpoint closure,
//! which advances the stream's iterator past the record so it is never
//! delivered again after a restart.
//!
//! On-disk layout:
//!
//! ```text
//! <root>/<campaign_name>/<partition_location>/0.log
//! <root>/<campaign_name>/<partition_location>/s
//! ```

pub mod kv;
pub mod log;

pub use kv::KV_STORE_FILENAME;
pub use log::{RecordMetadata, LOG_FILENAME};

use crate::campaign::{ActiveCampaigns, BuiltCampaign};
use crate::metrics::Metrics;
use crate::persistency::PERSISTENCY_WORKSPACE;
use crate::time::Clock;
use crate::types::{CampaignArn, PartitionId, SignalId};
use kv::CheckpointStore;
use log::RecordLog;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no stream for this campaign/partition")]
    StreamNotFound,
    #[error("record carries no signals")]
    EmptyData,
    #[error("end of stream")]
    EndOfStream,
    #[error("stream I/O failed: {0}")]
    Io(String),
}

/// One record headed for a partition log.
#[derive(Debug, Clone)]
pub struct DataToPersist {
    pub campaign_arn: CampaignArn,
    pub partition_id: PartitionId,
    pub payload: Vec<u8>,
    pub num_signals: u64,
    pub trigger_time_ms: u64,
}

/// One record read back, with its acknowledge closure. Invoking
/// `checkpoint` persists the new oldest-unacknowledged sequence number;
/// dropping it unconsumed leaves the record to be read again.
pub struct StreamRecord {
    pub payload: Vec<u8>,
    pub metadata: RecordMetadata,
    pub checkpoint: Box<dyn FnOnce() + Send>,
}

struct PartitionStream {
    id: PartitionId,
    log: Arc<RecordLog>,
    checkpoint: CheckpointStore,
    /// Signals routed to this partition; kept for the forwarder's benefit.
    #[allow(dead_code)]
    signal_ids: HashSet<SignalId>,
    max_size_bytes: u64,
    min_ttl_seconds: u64,
}

struct CampaignStreams {
    campaign: Arc<BuiltCampaign>,
    partitions: Vec<PartitionStream>,
}

/// The engine. Campaign-change operations are globally serialized by the
/// campaigns mutex; per-stream appends and reads synchronize inside the
/// log.
pub struct StreamEngine {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    campaigns: Mutex<HashMap<String, CampaignStreams>>,
}

impl StreamEngine {
    pub fn new(root: PathBuf, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            root,
            clock,
            metrics,
            campaigns: Mutex::new(HashMap::new()),
        })
    }

    /// Diff the new active set against the known one: close and delete
    /// streams of removed campaigns, create streams for added ones, clean
    /// up stray files, then prune by TTL.
    pub fn on_campaigns_changed(&self, active: &ActiveCampaigns) {
        let mut campaigns = self.lock_campaigns();

        // removed or replaced campaigns lose their on-disk streams
        let removed: Vec<String> = campaigns
            .iter()
            .filter(|(name, entry)| {
                !active.campaigns.iter().any(|campaign| {
                    campaign.name() == name.as_str() && Arc::ptr_eq(campaign, &entry.campaign)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in removed {
            campaigns.remove(&name);
            let campaign_path = self.root.join(&name);
            let deleted = match std::fs::remove_dir_all(&campaign_path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    error!(path = %campaign_path.display(), error = %e, "Unable to delete campaign data");
                    false
                }
            };
            crate::graceful_fatal_assert!(deleted, "unable to delete campaign stream data from disk");
            info!(campaign = %name, "Deleted streams for campaign");
        }

        // new campaigns with a store-and-forward config get their streams
        for campaign in &active.campaigns {
            if campaigns.contains_key(campaign.name()) {
                continue;
            }
            let partitions_config = &campaign.description.store_and_forward_configuration;
            if partitions_config.is_empty() {
                debug!(campaign = %campaign.name(), "Campaign is not configured for store-and-forward");
                continue;
            }

            // reject the whole campaign on any bad storage location before
            // anything lands on disk
            let locations: Vec<Option<String>> = partitions_config
                .iter()
                .map(|partition| {
                    Path::new(&partition.storage_options.storage_location)
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(str::to_string)
                })
                .collect();
            if locations.iter().any(Option::is_none) {
                error!(
                    campaign = %campaign.name(),
                    "Campaign has an invalid partition storage location, ignoring it"
                );
                continue;
            }

            let mut partitions = Vec::with_capacity(partitions_config.len());
            let mut failed = false;
            for (index, (partition_config, location)) in
                partitions_config.iter().zip(&locations).enumerate()
            {
                let partition_id = index as PartitionId;
                let location = location.as_deref().unwrap_or_default();
                let partition_dir = self.root.join(campaign.name()).join(location);
                let log = match RecordLog::open_or_create(&partition_dir) {
                    Ok(log) => Arc::new(log),
                    Err(e) => {
                        error!(
                            campaign = %campaign.name(),
                            partition = partition_id,
                            error = %e,
                            "Failed to open stream"
                        );
                        failed = true;
                        break;
                    }
                };
                info!(campaign = %campaign.name(), partition = partition_id, "Opened stream");

                let signal_ids = campaign
                    .signals
                    .iter()
                    .filter(|signal| signal.data_partition_id == partition_id)
                    .map(|signal| signal.signal_id)
                    .collect();
                partitions.push(PartitionStream {
                    id: partition_id,
                    log,
                    checkpoint: CheckpointStore::new(&partition_dir),
                    signal_ids,
                    max_size_bytes: partition_config.storage_options.maximum_size_in_bytes,
                    min_ttl_seconds: partition_config.storage_options.minimum_time_to_live_in_seconds,
                });
            }
            if failed {
                continue;
            }

            campaigns.insert(
                campaign.name().to_string(),
                CampaignStreams {
                    campaign: Arc::clone(campaign),
                    partitions,
                },
            );
        }

        self.cleanup_stray_files(&campaigns);
        self.remove_older_records(&campaigns);
    }

    /// Append a framed record to its partition log.
    pub fn append(&self, data: &DataToPersist) -> Result<(), StreamError> {
        if data.num_signals == 0 {
            return Err(StreamError::EmptyData);
        }

        // Hold the lock for the whole append so a concurrent campaign
        // change cannot delete the stream under us; campaigns change
        // rarely, so contention is low.
        let campaigns = self.lock_campaigns();
        let name = crate::types::campaign_name(&data.campaign_arn);
        let Some(entry) = campaigns.get(name) else {
            warn!(
                campaign = name,
                "No stream for campaign, it was likely deleted since the data was produced. Discarding."
            );
            return Err(StreamError::StreamNotFound);
        };
        let Some(partition) = entry
            .partitions
            .iter()
            .find(|partition| partition.id == data.partition_id)
        else {
            warn!(
                campaign = name,
                partition = data.partition_id,
                "No such partition for campaign. Discarding."
            );
            return Err(StreamError::StreamNotFound);
        };

        let metadata = RecordMetadata {
            num_signals: data.num_signals,
            trigger_time_ms: data.trigger_time_ms,
        };
        partition
            .log
            .append(&data.payload, metadata)
            .map_err(|e| {
                Metrics::increment(&self.metrics.stream_store_errors);
                warn!(campaign = name, partition = partition.id, error = %e, "Failed to append to stream");
                StreamError::Io(e.to_string())
            })?;
        if partition.max_size_bytes > 0 {
            if let Ok(dropped) = partition.log.enforce_max_bytes(partition.max_size_bytes) {
                if dropped > 0 {
                    Metrics::add(&self.metrics.stream_expired_bytes, dropped);
                }
            }
        }

        Metrics::increment(&self.metrics.stream_records_stored);
        Metrics::add(&self.metrics.stream_bytes_stored, data.payload.len() as u64);
        Ok(())
    }

    /// Read the oldest unacknowledged record of a partition.
    pub fn read(
        &self,
        campaign_id: &str,
        partition_id: PartitionId,
    ) -> Result<StreamRecord, StreamError> {
        let (log, checkpoint_store) = {
            let campaigns = self.lock_campaigns();
            let name = crate::types::campaign_name(campaign_id);
            let Some(entry) = campaigns.get(name) else {
                return Err(StreamError::StreamNotFound);
            };
            let Some(partition) = entry
                .partitions
                .iter()
                .find(|partition| partition.id == partition_id)
            else {
                return Err(StreamError::StreamNotFound);
            };
            (Arc::clone(&partition.log), partition.checkpoint.clone())
        };

        let start_sequence = checkpoint_store.read().unwrap_or(0);
        match log.read_from(start_sequence) {
            Ok(Some((sequence, metadata, payload))) => {
                let campaign_id = campaign_id.to_string();
                let checkpoint = Box::new(move || {
                    if let Err(e) = checkpoint_store.write(sequence + 1) {
                        error!(
                            campaign = %campaign_id,
                            partition = partition_id,
                            sequence,
                            error = %e,
                            "Unable to checkpoint stream"
                        );
                    }
                });
                Ok(StreamRecord {
                    payload,
                    metadata,
                    checkpoint,
                })
            }
            Ok(None) => Err(StreamError::EndOfStream),
            Err(e) => {
                warn!(campaign = campaign_id, partition = partition_id, error = %e, "Unable to read stream record");
                Err(StreamError::Io(e.to_string()))
            }
        }
    }

    pub fn has_campaign(&self, campaign_id: &str) -> bool {
        self.lock_campaigns()
            .contains_key(crate::types::campaign_name(campaign_id))
    }

    pub fn partition_ids(&self, campaign_id: &str) -> BTreeSet<PartitionId> {
        self.lock_campaigns()
            .get(crate::types::campaign_name(campaign_id))
            .map(|entry| entry.partitions.iter().map(|partition| partition.id).collect())
            .unwrap_or_default()
    }

    /// Remove stream files belonging to campaigns this engine does not
    /// know, e.g. removed while the agent was not running. Only files that
    /// look like stream files (`*.log`, the kv store name) are touched;
    /// emptied directories are removed afterwards.
    fn cleanup_stray_files(&self, campaigns: &HashMap<String, CampaignStreams>) {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for campaign_entry in entries.filter_map(|entry| entry.ok()) {
            let campaign_dir = campaign_entry.path();
            let Some(dir_name) = campaign_dir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !campaign_dir.is_dir()
                || dir_name == PERSISTENCY_WORKSPACE
                || campaigns.contains_key(dir_name)
            {
                continue;
            }

            if let Ok(partition_entries) = std::fs::read_dir(&campaign_dir) {
                for partition_entry in partition_entries.filter_map(|entry| entry.ok()) {
                    let partition_dir = partition_entry.path();
                    if !partition_dir.is_dir() {
                        continue;
                    }
                    if let Ok(file_entries) = std::fs::read_dir(&partition_dir) {
                        for file_entry in file_entries.filter_map(|entry| entry.ok()) {
                            let file_path = file_entry.path();
                            if !file_path.is_file() {
                                continue;
                            }
                            let is_stream_file = file_path
                                .extension()
                                .and_then(|ext| ext.to_str())
                                == Some("log")
                                || file_path.file_name().and_then(|name| name.to_str())
                                    == Some(KV_STORE_FILENAME);
                            if is_stream_file && std::fs::remove_file(&file_path).is_ok() {
                                debug!(campaign = dir_name, "Removed stray stream file");
                            }
                        }
                    }
                    if directory_is_empty(&partition_dir) {
                        let _ = std::fs::remove_dir(&partition_dir);
                    }
                }
            }
            if directory_is_empty(&campaign_dir) {
                let _ = std::fs::remove_dir(&campaign_dir);
            }
        }
    }

    /// TTL pruning over every partition that configured one. Best effort;
    /// appenders are never blocked on it.
    fn remove_older_records(&self, campaigns: &HashMap<String, CampaignStreams>) {
        let now_ms = self.clock.system_time_ms();
        for (name, entry) in campaigns {
            for partition in &entry.partitions {
                if partition.min_ttl_seconds == 0 {
                    continue;
                }
                let cutoff = now_ms.saturating_sub(partition.min_ttl_seconds * 1000);
                info!(
                    campaign = %name,
                    partition = partition.id,
                    cutoff,
                    "Cleaning up records older than the partition TTL"
                );
                match partition.log.prune_older_than(cutoff) {
                    Ok(pruned) => {
                        if pruned > 0 {
                            Metrics::add(&self.metrics.stream_expired_bytes, pruned);
                        }
                    }
                    Err(e) => {
                        warn!(campaign = %name, partition = partition.id, error = %e, "TTL pruning failed");
                    }
                }
            }
        }
    }

    fn lock_campaigns(&self) -> MutexGuard<'_, HashMap<String, CampaignStreams>> {
        self.campaigns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn directory_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
