//! Decoder dictionary
//!
//! Read-only lookup from transport addresses to decode rules, rebuilt by the
//! campaign manager whenever the enabled campaign set or the decoder
//! description changes and published as an immutable snapshot.

pub mod can;
pub mod obd;

use crate::types::{InterfaceId, SignalId};
use std::collections::{HashMap, HashSet};

/// 29-bit extended CAN id mask.
pub const CAN_EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// What to do with a matched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectKind {
    /// Store the whole payload in the raw-data buffer.
    Raw,
    /// Decode primitive signals out of the payload.
    Decode,
    /// Both.
    RawAndDecode,
}

impl CollectKind {
    pub fn wants_raw(self) -> bool {
        matches!(self, CollectKind::Raw | CollectKind::RawAndDecode)
    }

    pub fn wants_decode(self) -> bool {
        matches!(self, CollectKind::Decode | CollectKind::RawAndDecode)
    }
}

/// Decode rule for one message on one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct CanMessageDecoderMethod {
    pub collect_kind: CollectKind,
    pub format: can::CanMessageFormat,
    /// Signal that owns the raw payload when `collect_kind` wants raw.
    pub raw_signal_id: Option<SignalId>,
}

/// Compiled decoder dictionary. Immutable once published.
#[derive(Debug, Clone, Default)]
pub struct DecoderDictionary {
    /// interface -> message id -> decode rule
    pub can_decoder_methods: HashMap<InterfaceId, HashMap<u32, CanMessageDecoderMethod>>,
    /// OBD-decoded signals by signal id.
    pub obd_pid_formats: HashMap<SignalId, obd::PidDecoderFormat>,
    /// Signals the enabled campaigns actually collect (condition-only
    /// signals are decoded but not in this set).
    pub signals_to_collect: HashSet<SignalId>,
}

impl DecoderDictionary {
    /// Look up the decode rule for an inbound frame.
    ///
    /// If the exact message id misses, the lookup is retried with the id
    /// masked down to the 29-bit extended-id range. The cloud does not
    /// describe extended ids yet, so descriptions carry the masked id; this
    /// fallback stays until the upstream schema supports extended ids.
    /// Returns the id under which the rule was found.
    pub fn can_decoder_method(
        &self,
        interface_id: &str,
        message_id: u32,
    ) -> Option<(u32, &CanMessageDecoderMethod)> {
        let methods = self.can_decoder_methods.get(interface_id)?;
        if let Some(method) = methods.get(&message_id) {
            return Some((message_id, method));
        }
        let masked = message_id & CAN_EXTENDED_ID_MASK;
        methods.get(&masked).map(|method| (masked, method))
    }

    pub fn is_empty(&self) -> bool {
        self.can_decoder_methods.is_empty() && self.obd_pid_formats.is_empty()
    }
}
