//! Ingestion front-end
//!
//! Entry point for the external bus readers. Looks inbound frames up in
//! the published decoder dictionary, decodes primitive signals, stores raw
//! payloads in the raw-data buffer, and hands the result to the collected-
//! frame sink. Frames with no decode rule (after the extended-id-mask
//! fallback) are dropped silently — the bus carries far more traffic than
//! any campaign collects.

use crate::decoder::{can::decode_can_message, obd::decode_pid, DecoderDictionary};
use crate::metrics::Metrics;
use crate::rawdata::{BufferError, BufferManager};
use crate::time::Clock;
use crate::types::{
    CollectedFrame, CollectedFrameSink, DecodedSignal, InterfaceId, RawFrameRef, SignalId,
    Timestamp,
};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub struct IngestionFrontEnd {
    dictionary: Arc<ArcSwap<DecoderDictionary>>,
    raw_buffer: Arc<BufferManager>,
    sink: Arc<dyn CollectedFrameSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    last_timestamps: Mutex<HashMap<InterfaceId, Timestamp>>,
}

impl IngestionFrontEnd {
    pub fn new(
        dictionary: Arc<ArcSwap<DecoderDictionary>>,
        raw_buffer: Arc<BufferManager>,
        sink: Arc<dyn CollectedFrameSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            dictionary,
            raw_buffer,
            sink,
            clock,
            metrics,
            last_timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one frame from a bus reader. A zero timestamp means "use the
    /// local wall clock"; either way the effective timestamp is forced
    /// strictly monotonic per interface.
    pub fn ingest(
        &self,
        interface_id: &str,
        timestamp_ms_or_zero: u64,
        message_id: u32,
        data: &[u8],
    ) {
        let timestamp = self.monotonic_timestamp(interface_id, timestamp_ms_or_zero);

        let dictionary = self.dictionary.load();
        let Some((effective_id, method)) = dictionary.can_decoder_method(interface_id, message_id)
        else {
            return;
        };

        let mut frame = CollectedFrame::default();
        if method.collect_kind.wants_decode() {
            if method.format.is_valid() {
                frame.signals = decode_can_message(
                    data,
                    &method.format,
                    &dictionary.signals_to_collect,
                    timestamp,
                );
            } else {
                warn!(
                    interface = interface_id,
                    message_id = effective_id,
                    "Message format invalid, cannot decode"
                );
            }
        }
        if method.collect_kind.wants_raw() {
            if let Some(signal_id) = method.raw_signal_id {
                match self.raw_buffer.push(signal_id, data, timestamp) {
                    Ok(handle) => {
                        frame.raw_frame = Some(RawFrameRef {
                            signal_id,
                            handle,
                            timestamp,
                        });
                    }
                    Err(BufferError::NoCapacity(_)) => {
                        Metrics::increment(&self.metrics.raw_data_overflow);
                        warn!(signal_id, "Raw frame dropped, buffer full");
                    }
                    Err(e) => {
                        debug!(signal_id, error = %e, "Raw frame not stored");
                    }
                }
            }
        }

        if !frame.is_empty() {
            self.sink.push(frame);
        }
    }

    /// Ingest one OBD PID response for a signal the dictionary describes.
    pub fn ingest_pid_response(
        &self,
        signal_id: SignalId,
        timestamp_ms_or_zero: u64,
        data: &[u8],
    ) {
        let dictionary = self.dictionary.load();
        let Some(format) = dictionary.obd_pid_formats.get(&signal_id) else {
            return;
        };
        let Some(value) = decode_pid(data, format) else {
            return;
        };
        let timestamp = self.monotonic_timestamp("obd", timestamp_ms_or_zero);
        self.sink.push(CollectedFrame {
            signals: vec![DecodedSignal {
                signal_id,
                timestamp,
                value,
                value_type: format.value_type,
            }],
            raw_frame: None,
        });
    }

    fn monotonic_timestamp(&self, interface_id: &str, timestamp_ms_or_zero: u64) -> Timestamp {
        let proposed = if timestamp_ms_or_zero == 0 {
            self.clock.system_time_ms()
        } else {
            timestamp_ms_or_zero
        };
        let mut last_timestamps = self.lock_timestamps();
        let last = last_timestamps.get(interface_id).copied().unwrap_or(0);
        let effective = if proposed > last { proposed } else { last + 1 };
        last_timestamps.insert(interface_id.to_string(), effective);
        effective
    }

    fn lock_timestamps(&self) -> MutexGuard<'_, HashMap<InterfaceId, Timestamp>> {
        self.last_timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawBufferConfig;
    use crate::decoder::can::{CanMessageFormat, CanSignalFormat};
    use crate::decoder::{CanMessageDecoderMethod, CollectKind};
    use crate::rawdata::{BufferConfig, SignalUpdateConfig};
    use crate::time::ManualClock;
    use crate::types::SignalValueType;

    struct RecordingSink {
        frames: Mutex<Vec<CollectedFrame>>,
    }

    impl CollectedFrameSink for RecordingSink {
        fn push(&self, frame: CollectedFrame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn dictionary() -> DecoderDictionary {
        let mut dictionary = DecoderDictionary::default();
        dictionary
            .can_decoder_methods
            .entry("can0".to_string())
            .or_default()
            .insert(
                0x100,
                CanMessageDecoderMethod {
                    collect_kind: CollectKind::Decode,
                    format: CanMessageFormat {
                        message_id: 0x100,
                        size_in_bytes: 8,
                        signals: vec![CanSignalFormat {
                            signal_id: 1,
                            first_bit_position: 0,
                            size_in_bits: 8,
                            is_big_endian: false,
                            is_signed: false,
                            factor: 1.0,
                            offset: 0.0,
                            value_type: SignalValueType::Double,
                        }],
                    },
                    raw_signal_id: None,
                },
            );
        dictionary
            .can_decoder_methods
            .entry("can0".to_string())
            .or_default()
            .insert(
                0x200,
                CanMessageDecoderMethod {
                    collect_kind: CollectKind::Raw,
                    format: CanMessageFormat {
                        message_id: 0x200,
                        size_in_bytes: 64,
                        signals: Vec::new(),
                    },
                    raw_signal_id: Some(99),
                },
            );
        dictionary.signals_to_collect.insert(1);
        dictionary.signals_to_collect.insert(99);
        dictionary
    }

    struct Fixture {
        frontend: IngestionFrontEnd,
        sink: Arc<RecordingSink>,
        raw_buffer: Arc<BufferManager>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(5_000);
        let metrics = Arc::new(Metrics::default());
        let raw_buffer = BufferManager::new(
            BufferConfig::new(&RawBufferConfig::default()).unwrap(),
            clock.clone(),
            Arc::clone(&metrics),
        );
        let mut signals = HashMap::new();
        signals.insert(
            99,
            SignalUpdateConfig {
                signal_id: 99,
                interface_id: "can0".to_string(),
                message_id: "512".to_string(),
            },
        );
        raw_buffer.update_config(&signals).unwrap();

        let sink = Arc::new(RecordingSink {
            frames: Mutex::new(Vec::new()),
        });
        let frontend = IngestionFrontEnd::new(
            Arc::new(ArcSwap::from_pointee(dictionary())),
            Arc::clone(&raw_buffer),
            sink.clone(),
            clock.clone(),
            metrics,
        );
        Fixture {
            frontend,
            sink,
            raw_buffer,
            clock,
        }
    }

    #[test]
    fn test_decode_path_delivers_signals() {
        let fixture = fixture();
        fixture.frontend.ingest("can0", 1_000, 0x100, &[0x2A, 0, 0, 0, 0, 0, 0, 0]);

        let frames = fixture.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].signals[0].signal_id, 1);
        assert_eq!(frames[0].signals[0].value, 42.0);
        assert_eq!(frames[0].signals[0].timestamp, 1_000);
    }

    #[test]
    fn test_unknown_message_dropped_silently() {
        let fixture = fixture();
        fixture.frontend.ingest("can0", 1_000, 0x300, &[0; 8]);
        fixture.frontend.ingest("can9", 1_000, 0x100, &[0; 8]);
        assert!(fixture.sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_raw_path_stores_payload() {
        let fixture = fixture();
        fixture.frontend.ingest("can0", 2_000, 0x200, b"opaque-payload");

        let frames = fixture.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let raw = frames[0].raw_frame.unwrap();
        assert_eq!(raw.signal_id, 99);
        let loan = fixture.raw_buffer.borrow(99, raw.handle).unwrap();
        assert_eq!(loan.bytes(), b"opaque-payload");
    }

    #[test]
    fn test_timestamps_forced_monotonic_per_interface() {
        let fixture = fixture();
        fixture.frontend.ingest("can0", 1_000, 0x100, &[1; 8]);
        // stale timestamp gets bumped to last + 1
        fixture.frontend.ingest("can0", 900, 0x100, &[2; 8]);
        // zero means wall clock
        fixture.frontend.ingest("can0", 0, 0x100, &[3; 8]);

        let frames = fixture.sink.frames.lock().unwrap();
        let timestamps: Vec<u64> = frames.iter().map(|f| f.signals[0].timestamp).collect();
        assert_eq!(timestamps[0], 1_000);
        assert_eq!(timestamps[1], 1_001);
        assert_eq!(timestamps[2], fixture.clock.system_time_ms());
    }

    #[test]
    fn test_extended_id_flag_falls_back_to_masked_rule() {
        let fixture = fixture();
        fixture
            .frontend
            .ingest("can0", 1_000, 0x100 | 0x8000_0000, &[0x07, 0, 0, 0, 0, 0, 0, 0]);
        let frames = fixture.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].signals[0].value, 7.0);
    }
}
