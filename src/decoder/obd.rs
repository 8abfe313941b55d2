//! OBD-II PID response decoding
//!
//! A PID signal is a byte slice out of the response payload, optionally
//! shifted and masked, then scaled to its physical value.

use crate::types::{SignalId, SignalValueType};
use tracing::warn;

/// Decode rule for one PID-carried signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PidDecoderFormat {
    pub signal_id: SignalId,
    /// OBD service mode (e.g. 1 for current data).
    pub mode: u8,
    pub pid: u8,
    /// First payload byte of this signal within the PID response.
    pub start_byte: usize,
    pub byte_length: usize,
    /// Right shift applied to the assembled big-endian integer.
    pub bit_right_shift: u8,
    /// Width of the mask applied after shifting; 0 means no mask.
    pub bit_mask_length: u8,
    pub scaling: f64,
    pub offset: f64,
    pub value_type: SignalValueType,
}

/// Decode one signal from a PID response payload. `None` when the described
/// slice does not fit the payload.
pub fn decode_pid(data: &[u8], format: &PidDecoderFormat) -> Option<f64> {
    if format.byte_length == 0 || format.byte_length > 8 {
        warn!(
            signal_id = format.signal_id,
            byte_length = format.byte_length,
            "Unsupported PID byte length"
        );
        return None;
    }
    let end = format.start_byte.checked_add(format.byte_length)?;
    if end > data.len() {
        warn!(
            signal_id = format.signal_id,
            pid = format.pid,
            payload_len = data.len(),
            "PID response shorter than described layout"
        );
        return None;
    }

    let mut raw: u64 = 0;
    for &byte in &data[format.start_byte..end] {
        raw = (raw << 8) | u64::from(byte);
    }
    raw >>= format.bit_right_shift;
    if format.bit_mask_length > 0 && format.bit_mask_length < 64 {
        raw &= (1u64 << format.bit_mask_length) - 1;
    }

    Some(raw as f64 * format.scaling + format.offset)
}
