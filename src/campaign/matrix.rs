//! Inspection matrix
//!
//! The compiled, per-campaign view the inspection engine consumes: one
//! condition (expression root plus arena) and the sampling configuration of
//! every referenced signal. Extracted from the enabled campaign set and
//! published as an immutable snapshot.

use super::description::S3UploadMetadataDescription;
use super::expression::{ExpressionArena, NodeIdx};
use super::BuiltCampaign;
use crate::types::{CampaignArn, PartitionId, SignalId, SyncId};
use std::sync::Arc;

/// Sampling configuration of one signal inside one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalCollectionInfo {
    pub signal_id: SignalId,
    /// Ring-buffer capacity the inspection engine keeps for this signal.
    pub sample_buffer_size: u32,
    pub minimum_sample_interval_ms: u32,
    pub fixed_window_period_ms: u32,
    /// Used in the condition but not forwarded to the cloud.
    pub is_condition_only_signal: bool,
    pub data_partition_id: PartitionId,
}

/// One enabled campaign's compiled condition and collection parameters.
#[derive(Clone)]
pub struct CampaignCondition {
    pub campaign_sync_id: SyncId,
    pub campaign_arn: CampaignArn,
    pub arena: Arc<ExpressionArena>,
    pub condition_root: NodeIdx,
    pub signals: Vec<SignalCollectionInfo>,
    pub minimum_publish_interval_ms: u32,
    pub after_duration_ms: u32,
    pub include_active_dtcs: bool,
    pub trigger_only_on_rising_edge: bool,
    pub priority: u32,
    pub persist_needed: bool,
    pub compression_needed: bool,
    pub s3_upload_metadata: Option<S3UploadMetadataDescription>,
}

/// The matrix: all enabled campaigns' conditions, rebuilt copy-on-write.
#[derive(Clone, Default)]
pub struct InspectionMatrix {
    pub conditions: Vec<CampaignCondition>,
}

impl InspectionMatrix {
    /// Build the matrix for the given enabled campaigns.
    pub fn extract<'a>(enabled: impl Iterator<Item = &'a Arc<BuiltCampaign>>) -> Self {
        let conditions = enabled
            .map(|campaign| CampaignCondition {
                campaign_sync_id: campaign.description.campaign_sync_id.clone(),
                campaign_arn: campaign.description.arn().to_string(),
                arena: Arc::clone(&campaign.arena),
                condition_root: campaign.condition_root,
                signals: campaign.signals.clone(),
                minimum_publish_interval_ms: campaign.description.minimum_publish_interval_ms(),
                after_duration_ms: campaign.description.after_duration_ms,
                include_active_dtcs: campaign.description.include_active_dtcs,
                trigger_only_on_rising_edge: campaign.description.trigger_only_on_rising_edge(),
                priority: campaign.description.priority,
                persist_needed: campaign.description.persist_all_collected_data,
                compression_needed: campaign.description.compress_collected_data,
                s3_upload_metadata: campaign.description.s3_upload_metadata.clone(),
            })
            .collect();
        Self { conditions }
    }
}
