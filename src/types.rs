//! Shared identifier and signal value types
//!
//! Core vocabulary used across the agent:
//! - signal / campaign / partition identifiers and their invariants
//! - raw-data buffer handles
//! - decoded signal values delivered to the inspection side

use serde::{Deserialize, Serialize};

/// Cloud-assigned (or internally minted) signal identifier.
pub type SignalId = u32;

/// The top bit distinguishes internally minted ids (for primitive fields
/// nested inside complex signals) from cloud-assigned external ids.
pub const INTERNAL_SIGNAL_ID_MASK: SignalId = 0x8000_0000;

/// Partition identifier; unique only within one campaign.
pub type PartitionId = u32;

/// Wall-clock milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Campaign/decoder sync id assigned by the cloud.
pub type SyncId = String;

/// Full campaign ARN.
pub type CampaignArn = String;

/// Name of an in-vehicle network interface, as the cloud references it.
pub type InterfaceId = String;

/// Path of field indices into a complex signal, selecting one nested
/// primitive.
pub type SignalPath = Vec<u32>;

/// Opaque ticket into the raw-data buffer.
///
/// Layout: low 8 bits are a rolling per-manager counter, the high 56 bits
/// the wall-clock ingestion timestamp. Handles are unique within one buffer
/// lifetime and never reused once returned. At sustained rates above 8
/// pushes per millisecond for one signal the counter can wrap within a
/// timestamp; the layout is fixed for cloud compatibility.
pub type BufferHandle = u64;

/// Sentinel for "no frame".
pub const INVALID_BUFFER_HANDLE: BufferHandle = 0;

/// The campaign name is the suffix of the ARN after the last '/'.
pub fn campaign_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Primitive type of a decoded signal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalValueType {
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float,
    #[default]
    Double,
}

/// One decoded primitive signal sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    pub signal_id: SignalId,
    pub timestamp: Timestamp,
    pub value: f64,
    pub value_type: SignalValueType,
}

/// Reference to a raw payload stored in the raw-data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameRef {
    pub signal_id: SignalId,
    pub handle: BufferHandle,
    pub timestamp: Timestamp,
}

/// Output of decoding one inbound message: zero or more primitive signals
/// plus, for raw-collected signals, a handle into the raw-data buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectedFrame {
    pub signals: Vec<DecodedSignal>,
    pub raw_frame: Option<RawFrameRef>,
}

impl CollectedFrame {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.raw_frame.is_none()
    }
}

/// Sink for decoded frames; the inspection engine implements this.
pub trait CollectedFrameSink: Send + Sync {
    fn push(&self, frame: CollectedFrame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_name_from_arn() {
        assert_eq!(
            campaign_name("arn:aws:iotfleetwise:us-east-1:123:campaign/my-campaign"),
            "my-campaign"
        );
        assert_eq!(campaign_name("plain-name"), "plain-name");
        assert_eq!(campaign_name("trailing/"), "");
    }

    #[test]
    fn test_internal_id_mask_is_top_bit() {
        assert_eq!(INTERNAL_SIGNAL_ID_MASK, 1 << 31);
        assert_eq!(7 | INTERNAL_SIGNAL_ID_MASK, 0x8000_0007);
    }
}
