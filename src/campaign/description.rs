//! Cloud payload descriptions
//!
//! Serde shapes for the two documents the cloud sends — the decoder
//! description and the campaign list — plus the checkin document sent back.
//! Receivers are byte-array callbacks; the payloads decode from JSON here
//! and the compiled in-memory shapes live in the sibling modules.

use crate::types::{
    CampaignArn, InterfaceId, PartitionId, SignalId, SignalPath, SignalValueType, SyncId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    #[error("could not decode payload: {0}")]
    Decode(String),
}

// ============================================================================
// Decoder description
// ============================================================================

/// One primitive signal inside a CAN message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanSignalDescription {
    pub signal_id: SignalId,
    pub first_bit_position: u16,
    pub size_in_bits: u16,
    #[serde(default)]
    pub is_big_endian: bool,
    #[serde(default)]
    pub is_signed: bool,
    pub factor: f64,
    pub offset: f64,
    #[serde(default)]
    pub value_type: SignalValueType,
}

/// One CAN message row: where it arrives, its layout, and optionally the
/// signal that owns the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanMessageDescription {
    pub interface_id: InterfaceId,
    pub message_id: u32,
    pub size_in_bytes: u8,
    #[serde(default)]
    pub signals: Vec<CanSignalDescription>,
    /// Set when the message payload itself is collectable as an opaque blob
    /// (camera frames, point clouds).
    #[serde(default)]
    pub raw_signal_id: Option<SignalId>,
}

/// One OBD PID-carried signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidSignalDescription {
    pub signal_id: SignalId,
    pub mode: u8,
    pub pid: u8,
    pub start_byte: usize,
    pub byte_length: usize,
    #[serde(default)]
    pub bit_right_shift: u8,
    #[serde(default)]
    pub bit_mask_length: u8,
    pub scaling: f64,
    pub offset: f64,
    #[serde(default)]
    pub value_type: SignalValueType,
}

/// The decoder description document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecoderManifestDescription {
    pub sync_id: SyncId,
    #[serde(default)]
    pub can_messages: Vec<CanMessageDescription>,
    #[serde(default)]
    pub obd_pid_signals: Vec<PidSignalDescription>,
}

/// Where a signal's decode rule lives in the description.
pub enum SignalDecoderRow<'a> {
    Can {
        message: &'a CanMessageDescription,
        signal: &'a CanSignalDescription,
    },
    RawPayload {
        message: &'a CanMessageDescription,
    },
    Obd(&'a PidSignalDescription),
}

impl DecoderManifestDescription {
    /// Find the decode rule for one signal id, if the description has one.
    pub fn signal_row(&self, signal_id: SignalId) -> Option<SignalDecoderRow<'_>> {
        for message in &self.can_messages {
            if message.raw_signal_id == Some(signal_id) {
                return Some(SignalDecoderRow::RawPayload { message });
            }
            if let Some(signal) = message.signals.iter().find(|s| s.signal_id == signal_id) {
                return Some(SignalDecoderRow::Can { message, signal });
            }
        }
        self.obd_pid_signals
            .iter()
            .find(|pid| pid.signal_id == signal_id)
            .map(SignalDecoderRow::Obd)
    }
}

/// Decode a decoder description payload.
pub fn decode_decoder_manifest(bytes: &[u8]) -> Result<DecoderManifestDescription, DescriptionError> {
    serde_json::from_slice(bytes).map_err(|e| DescriptionError::Decode(e.to_string()))
}

// ============================================================================
// Campaign list
// ============================================================================

/// Condition tree as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ConditionNodeDescription {
    Signal {
        signal_id: SignalId,
    },
    Double {
        value: f64,
    },
    Bool {
        value: bool,
    },
    String {
        value: String,
    },
    Operator {
        op: OperatorDescription,
        left: Option<Box<ConditionNodeDescription>>,
        #[serde(default)]
        right: Option<Box<ConditionNodeDescription>>,
    },
    WindowFunction {
        signal_id: SignalId,
        #[serde(default)]
        signal_path: SignalPath,
        window_type: WindowTypeDescription,
    },
    CustomFunction {
        function_name: String,
        #[serde(default)]
        params: Vec<ConditionNodeDescription>,
    },
    IsNull {
        expression: Option<Box<ConditionNodeDescription>>,
    },
    /// A primitive field nested inside a complex signal, addressed by the
    /// external signal id plus a field path.
    PrimitiveTypeInSignal {
        signal_id: SignalId,
        #[serde(default)]
        signal_path: SignalPath,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorDescription {
    Smaller,
    Bigger,
    SmallerEqual,
    BiggerEqual,
    Equal,
    NotEqual,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    Plus,
    Minus,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowTypeDescription {
    LastMin,
    LastMax,
    LastAvg,
    PrevMin,
    PrevMax,
    PrevAvg,
}

/// When a condition-based campaign triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTriggerMode {
    #[default]
    Always,
    RisingEdge,
}

/// Collection scheme: fixed-period or condition-driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectionSchemeType {
    TimeBased {
        period_ms: u32,
    },
    ConditionBased {
        condition: ConditionNodeDescription,
        #[serde(default)]
        minimum_trigger_interval_ms: u32,
        #[serde(default)]
        trigger_mode: ConditionTriggerMode,
    },
}

/// One signal referenced by a campaign, with its sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInformationDescription {
    pub signal_id: SignalId,
    /// Non-empty when the reference selects one primitive field nested
    /// inside a complex signal.
    #[serde(default)]
    pub signal_path: SignalPath,
    pub sample_buffer_size: u32,
    pub minimum_sample_period_ms: u32,
    pub fixed_window_period_ms: u32,
    #[serde(default)]
    pub condition_only_signal: bool,
    #[serde(default)]
    pub data_partition_id: PartitionId,
}

/// Where campaign uploads land in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3UploadMetadataDescription {
    pub bucket_name: String,
    #[serde(default)]
    pub prefix: String,
    pub region: String,
    #[serde(default)]
    pub bucket_owner_account_id: String,
}

/// Store-and-forward partition storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOptionsDescription {
    pub storage_location: String,
    pub maximum_size_in_bytes: u64,
    #[serde(default)]
    pub minimum_time_to_live_in_seconds: u64,
}

/// Store-and-forward partition upload settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOptionsDescription {
    pub condition_tree: ConditionNodeDescription,
}

/// One store-and-forward partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDescription {
    pub storage_options: StorageOptionsDescription,
    #[serde(default)]
    pub upload_options: Option<UploadOptionsDescription>,
}

/// One campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDescription {
    pub campaign_sync_id: SyncId,
    #[serde(default)]
    pub campaign_arn: CampaignArn,
    pub decoder_manifest_sync_id: SyncId,
    pub start_time_ms_epoch: u64,
    pub expiry_time_ms_epoch: u64,
    #[serde(default)]
    pub after_duration_ms: u32,
    #[serde(default)]
    pub include_active_dtcs: bool,
    #[serde(default)]
    pub persist_all_collected_data: bool,
    #[serde(default)]
    pub compress_collected_data: bool,
    #[serde(default)]
    pub priority: u32,
    pub collection_scheme: CollectionSchemeType,
    #[serde(default)]
    pub signals: Vec<SignalInformationDescription>,
    #[serde(default)]
    pub s3_upload_metadata: Option<S3UploadMetadataDescription>,
    #[serde(default)]
    pub store_and_forward_configuration: Vec<PartitionDescription>,
}

impl CampaignDescription {
    /// The ARN when the cloud sent one, otherwise the sync id.
    pub fn arn(&self) -> &str {
        if self.campaign_arn.is_empty() {
            &self.campaign_sync_id
        } else {
            &self.campaign_arn
        }
    }

    /// Minimum interval between publishes: the period for time-based
    /// campaigns, the trigger backoff for condition-based ones.
    pub fn minimum_publish_interval_ms(&self) -> u32 {
        match &self.collection_scheme {
            CollectionSchemeType::TimeBased { period_ms } => *period_ms,
            CollectionSchemeType::ConditionBased {
                minimum_trigger_interval_ms,
                ..
            } => *minimum_trigger_interval_ms,
        }
    }

    pub fn trigger_only_on_rising_edge(&self) -> bool {
        matches!(
            &self.collection_scheme,
            CollectionSchemeType::ConditionBased {
                trigger_mode: ConditionTriggerMode::RisingEdge,
                ..
            }
        )
    }
}

/// The campaign list document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CampaignListDescription {
    #[serde(default)]
    pub campaigns: Vec<CampaignDescription>,
}

/// Decode a campaign list payload.
pub fn decode_campaign_list(bytes: &[u8]) -> Result<CampaignListDescription, DescriptionError> {
    serde_json::from_slice(bytes).map_err(|e| DescriptionError::Decode(e.to_string()))
}

// ============================================================================
// Checkin
// ============================================================================

/// Periodic checkin document: everything this agent currently holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinDescription {
    pub timestamp_ms_epoch: u64,
    pub document_sync_ids: Vec<SyncId>,
}

/// Encode a checkin document for the external sender.
pub fn encode_checkin(checkin: &CheckinDescription) -> Vec<u8> {
    // a struct of strings and integers cannot fail to serialize
    serde_json::to_vec(checkin).unwrap_or_default()
}
