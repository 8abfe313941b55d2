//! Raw-data buffer limit resolution
//!
//! Validates the configured ceilings once at startup and resolves the
//! effective limits for each signal, applying per-(interface, message)
//! overrides where the operator configured them.

use crate::config::{RawBufferConfig, SignalBufferOverride};
use crate::types::{InterfaceId, SignalId};
use std::collections::HashMap;
use tracing::debug;

/// Effective limits for one signal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalConfig {
    pub signal_id: SignalId,
    /// Bytes counted against the system ceiling as soon as the buffer exists.
    pub reserved_bytes: u64,
    pub max_samples: u64,
    pub max_bytes_per_sample: u64,
    pub max_overall_bytes: u64,
}

/// How a signal is addressed when looking up a buffer override: the same
/// interface/message pair the decoder description uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalUpdateConfig {
    pub signal_id: SignalId,
    pub interface_id: InterfaceId,
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferConfigError {
    #[error("invalid buffer config: {0}")]
    Invalid(String),
}

/// Validated buffer limits plus the override table.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    max_bytes: u64,
    reserved_bytes_per_signal: u64,
    max_samples_per_signal: u64,
    max_bytes_per_sample: u64,
    max_bytes_per_signal: u64,
    overrides: HashMap<(InterfaceId, String), SignalBufferOverride>,
}

impl BufferConfig {
    /// Validate the raw TOML values. Every limit must be non-zero and the
    /// per-sample / per-signal / overall ordering must hold, for the
    /// defaults and for every override.
    pub fn new(raw: &RawBufferConfig) -> Result<Self, BufferConfigError> {
        let max_bytes = raw.max_bytes;
        if max_bytes == 0 {
            return Err(BufferConfigError::Invalid(
                "max overall buffer size can't be zero".to_string(),
            ));
        }

        let max_samples_per_signal = raw.max_samples_per_signal.unwrap_or(u64::MAX);
        if max_samples_per_signal == 0 {
            return Err(BufferConfigError::Invalid(
                "max number of samples per signal can't be zero".to_string(),
            ));
        }

        let max_bytes_per_signal = raw.max_bytes_per_signal.unwrap_or(max_bytes);
        if max_bytes_per_signal == 0 {
            return Err(BufferConfigError::Invalid(
                "max bytes per signal can't be zero".to_string(),
            ));
        }
        if max_bytes_per_signal > max_bytes {
            return Err(BufferConfigError::Invalid(format!(
                "max bytes per signal {max_bytes_per_signal} can't be larger than max overall buffer size {max_bytes}"
            )));
        }

        let max_bytes_per_sample = raw.max_bytes_per_sample.unwrap_or(max_bytes_per_signal);
        if max_bytes_per_sample == 0 {
            return Err(BufferConfigError::Invalid(
                "max bytes per sample can't be zero".to_string(),
            ));
        }
        if max_bytes_per_sample > max_bytes_per_signal {
            return Err(BufferConfigError::Invalid(format!(
                "max bytes per sample {max_bytes_per_sample} can't be larger than max bytes per signal {max_bytes_per_signal}"
            )));
        }

        let reserved_bytes_per_signal = raw.reserved_bytes_per_signal;
        if reserved_bytes_per_signal > max_bytes_per_signal {
            return Err(BufferConfigError::Invalid(format!(
                "reserved bytes per signal {reserved_bytes_per_signal} can't be larger than max bytes per signal {max_bytes_per_signal}"
            )));
        }

        let mut overrides = HashMap::new();
        for signal_override in &raw.overrides {
            let key = (
                signal_override.interface_id.clone(),
                signal_override.message_id.clone(),
            );
            if overrides.contains_key(&key) {
                return Err(BufferConfigError::Invalid(format!(
                    "duplicate buffer override for interface '{}' message '{}'",
                    key.0, key.1
                )));
            }

            let mut signal_override = signal_override.clone();
            let max_bytes_cur = signal_override.max_bytes.unwrap_or(max_bytes);
            if max_bytes_cur > max_bytes {
                return Err(BufferConfigError::Invalid(format!(
                    "override for interface '{}' message '{}': max bytes {max_bytes_cur} can't be larger than max overall buffer size {max_bytes}",
                    key.0, key.1
                )));
            }
            // If the per-signal cap is overridden but the per-sample cap is
            // not, cap samples at the signal's own limit.
            if signal_override.max_bytes.is_some() && signal_override.max_bytes_per_sample.is_none()
            {
                signal_override.max_bytes_per_sample = Some(max_bytes_cur);
            }

            if signal_override.max_samples.unwrap_or(u64::MAX) == 0 {
                return Err(BufferConfigError::Invalid(format!(
                    "override for interface '{}' message '{}': max number of samples can't be zero",
                    key.0, key.1
                )));
            }

            let max_bytes_per_sample_cur = signal_override
                .max_bytes_per_sample
                .unwrap_or(max_bytes_per_sample);
            if max_bytes_per_sample_cur == 0 {
                return Err(BufferConfigError::Invalid(format!(
                    "override for interface '{}' message '{}': max bytes per sample can't be zero",
                    key.0, key.1
                )));
            }
            if max_bytes_per_sample_cur > max_bytes_cur {
                return Err(BufferConfigError::Invalid(format!(
                    "override for interface '{}' message '{}': max bytes per sample {max_bytes_per_sample_cur} can't be larger than max bytes {max_bytes_cur}",
                    key.0, key.1
                )));
            }

            let reserved = signal_override
                .reserved_bytes
                .unwrap_or(reserved_bytes_per_signal);
            if reserved > max_bytes_cur {
                return Err(BufferConfigError::Invalid(format!(
                    "override for interface '{}' message '{}': reserved bytes {reserved} can't be larger than max bytes {max_bytes_cur}",
                    key.0, key.1
                )));
            }

            debug!(interface = %key.0, message = %key.1, "Adding raw buffer override");
            overrides.insert(key, signal_override);
        }

        Ok(Self {
            max_bytes,
            reserved_bytes_per_signal,
            max_samples_per_signal,
            max_bytes_per_sample,
            max_bytes_per_signal,
            overrides,
        })
    }

    /// System-wide ceiling.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Resolve the effective limits for one signal: defaults, then any
    /// override addressed by its interface/message pair.
    pub fn signal_config(
        &self,
        signal_id: SignalId,
        interface_id: &str,
        message_id: &str,
    ) -> SignalConfig {
        let mut config = SignalConfig {
            signal_id,
            reserved_bytes: self.reserved_bytes_per_signal,
            max_samples: self.max_samples_per_signal,
            max_bytes_per_sample: self.max_bytes_per_sample,
            max_overall_bytes: self.max_bytes_per_signal,
        };

        let key = (interface_id.to_string(), message_id.to_string());
        if let Some(signal_override) = self.overrides.get(&key) {
            debug!(interface = interface_id, message = message_id, "Using raw buffer override");
            config.reserved_bytes = signal_override.reserved_bytes.unwrap_or(config.reserved_bytes);
            config.max_samples = signal_override.max_samples.unwrap_or(config.max_samples);
            config.max_bytes_per_sample = signal_override
                .max_bytes_per_sample
                .unwrap_or(config.max_bytes_per_sample);
            config.max_overall_bytes = signal_override.max_bytes.unwrap_or(config.max_overall_bytes);
        }

        config
    }
}
