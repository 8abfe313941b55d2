//! Campaign & decoder lifecycle
//!
//! Receives cloud payloads, compiles campaigns (validation, expression
//! arena, partial-signal ids), drives the enable/expire timeline against a
//! monotonic clock, and publishes the decoder dictionary and inspection
//! matrix to consumers.

pub mod description;
pub mod expression;
pub mod manager;
pub mod matrix;

pub use manager::{CampaignManager, CheckinSink};

use crate::types::{SignalId, SignalPath, SyncId, INTERNAL_SIGNAL_ID_MASK};
use description::{CampaignDescription, CollectionSchemeType, ConditionNodeDescription};
use expression::{
    count_nodes, ExpressionArena, ExpressionCompiler, NodeIdx, MAX_EQUATION_DEPTH,
};
use matrix::SignalCollectionInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a campaign failed to build. Failures are local to the campaign.
#[derive(Debug, thiserror::Error)]
pub enum CampaignBuildError {
    #[error("campaign is missing its sync id or decoder sync id")]
    MissingIds,
    #[error("campaign expiry time comes before its start time")]
    EndBeforeStart,
    #[error("campaign condition tree is invalid or too deep")]
    InvalidCondition,
}

/// A validated, compiled campaign. Shared immutably; the stream engine
/// compares instances by pointer to detect genuine replacements.
pub struct BuiltCampaign {
    pub description: Arc<CampaignDescription>,
    pub arena: Arc<ExpressionArena>,
    /// Root of the collection condition; time-based campaigns compile to a
    /// constant-true root.
    pub condition_root: NodeIdx,
    /// Per store-and-forward partition: the compiled upload condition, if
    /// the partition has one and it compiled.
    pub partition_upload_roots: Vec<Option<NodeIdx>>,
    /// Signals with partial-signal references resolved to internal ids.
    pub signals: Vec<SignalCollectionInfo>,
    /// internal id -> (external id, field path)
    pub partial_signal_lookup: HashMap<SignalId, (SignalId, SignalPath)>,
}

impl BuiltCampaign {
    /// Validate and compile one campaign description. `partial_counter`
    /// mints internal signal ids; it is shared across campaigns so ids stay
    /// unique manager-wide.
    pub fn build(
        description: Arc<CampaignDescription>,
        partial_counter: &AtomicU32,
    ) -> Result<Self, CampaignBuildError> {
        if description.campaign_sync_id.is_empty() || description.decoder_manifest_sync_id.is_empty()
        {
            return Err(CampaignBuildError::MissingIds);
        }
        if description.expiry_time_ms_epoch < description.start_time_ms_epoch {
            return Err(CampaignBuildError::EndBeforeStart);
        }
        debug!(sync_id = %description.campaign_sync_id, "Building campaign");

        let mut partial_signal_lookup: HashMap<SignalId, (SignalId, SignalPath)> = HashMap::new();
        let mut resolve_partial = |external_id: SignalId, path: &SignalPath| -> SignalId {
            for (internal_id, (known_external, known_path)) in &partial_signal_lookup {
                if *known_external == external_id && known_path == path {
                    return *internal_id;
                }
            }
            let internal_id =
                partial_counter.fetch_add(1, Ordering::SeqCst) | INTERNAL_SIGNAL_ID_MASK;
            partial_signal_lookup.insert(internal_id, (external_id, path.clone()));
            internal_id
        };

        // Resolve the signal list before compiling conditions so references
        // to the same nested field share one internal id.
        let mut signals = Vec::with_capacity(description.signals.len());
        for signal in &description.signals {
            let signal_id = if signal.signal_path.is_empty() {
                signal.signal_id
            } else {
                resolve_partial(signal.signal_id, &signal.signal_path)
            };
            signals.push(SignalCollectionInfo {
                signal_id,
                sample_buffer_size: signal.sample_buffer_size,
                minimum_sample_interval_ms: signal.minimum_sample_period_ms,
                fixed_window_period_ms: signal.fixed_window_period_ms,
                is_condition_only_signal: signal.condition_only_signal,
                data_partition_id: signal.data_partition_id,
            });
        }

        // Size the arena for every tree it will hold; it must not grow once
        // compilation starts.
        let condition_count = match &description.collection_scheme {
            CollectionSchemeType::ConditionBased { condition, .. } => {
                count_nodes(condition, MAX_EQUATION_DEPTH)
            }
            CollectionSchemeType::TimeBased { .. } => 1,
        };
        let forward_count: u32 = description
            .store_and_forward_configuration
            .iter()
            .filter_map(|partition| partition.upload_options.as_ref())
            .map(|options| count_nodes(&options.condition_tree, MAX_EQUATION_DEPTH))
            .sum();

        let mut compiler = ExpressionCompiler::new(
            condition_count + forward_count,
            description.campaign_sync_id.clone(),
            &mut resolve_partial,
        );

        let condition_root = match &description.collection_scheme {
            CollectionSchemeType::ConditionBased { condition, .. } => compiler
                .compile(condition)
                .ok_or(CampaignBuildError::InvalidCondition)?,
            CollectionSchemeType::TimeBased { period_ms } => {
                debug!(
                    sync_id = %description.campaign_sync_id,
                    period_ms,
                    "Campaign is time based, compiling constant-true condition"
                );
                compiler
                    .compile(&ConditionNodeDescription::Bool { value: true })
                    .ok_or(CampaignBuildError::InvalidCondition)?
            }
        };

        let mut partition_upload_roots =
            Vec::with_capacity(description.store_and_forward_configuration.len());
        for (partition_id, partition) in
            description.store_and_forward_configuration.iter().enumerate()
        {
            let root = match &partition.upload_options {
                Some(options) => {
                    let root = compiler.compile(&options.condition_tree);
                    if root.is_none() {
                        warn!(
                            sync_id = %description.campaign_sync_id,
                            partition_id,
                            "Partition upload condition is invalid, uploads will not be gated"
                        );
                    }
                    root
                }
                None => None,
            };
            partition_upload_roots.push(root);
        }

        let arena = Arc::new(compiler.finish());
        debug!(
            sync_id = %description.campaign_sync_id,
            nodes = arena.len(),
            signals = signals.len(),
            "Campaign built"
        );

        Ok(Self {
            description,
            arena,
            condition_root,
            partition_upload_roots,
            signals,
            partial_signal_lookup,
        })
    }

    pub fn sync_id(&self) -> &SyncId {
        &self.description.campaign_sync_id
    }

    pub fn arn(&self) -> &str {
        self.description.arn()
    }

    /// Directory-safe campaign name: ARN suffix after the last '/'.
    pub fn name(&self) -> &str {
        crate::types::campaign_name(self.description.arn())
    }

    pub fn start_time_ms(&self) -> u64 {
        self.description.start_time_ms_epoch
    }

    pub fn expiry_time_ms(&self) -> u64 {
        self.description.expiry_time_ms_epoch
    }

    /// Map an internal signal id back to its external root signal for
    /// decoder lookup; external ids map to themselves.
    pub fn external_signal_id(&self, signal_id: SignalId) -> SignalId {
        if signal_id & INTERNAL_SIGNAL_ID_MASK == 0 {
            return signal_id;
        }
        self.partial_signal_lookup
            .get(&signal_id)
            .map(|(external_id, _path)| *external_id)
            .unwrap_or(signal_id)
    }
}

/// The enabled campaign set, published to the stream engine and other
/// subscribers whenever it changes.
#[derive(Clone, Default)]
pub struct ActiveCampaigns {
    pub campaigns: Vec<Arc<BuiltCampaign>>,
}
