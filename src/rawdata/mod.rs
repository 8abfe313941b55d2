//! Raw-Data Buffer Manager
//!
//! Reference-counted, per-signal arena for variable-size opaque payloads
//! (images, point clouds, video keyframes). Producers `push` bytes and get
//! back an opaque handle; consumers `borrow` a frame through a RAII loan or
//! keep it alive across pipeline stages with usage hints. Frames are evicted
//! FIFO once nothing references them, or earlier when the space budget
//! forces it.
//!
//! One mutex guards the whole index. Operations are O(log n) in the signal
//! count plus O(frames) for the handle lookup; buffers are short by
//! configuration so the linear scan is acceptable.

mod config;

pub use config::{BufferConfig, BufferConfigError, SignalConfig, SignalUpdateConfig};

use crate::metrics::Metrics;
use crate::time::Clock;
use crate::types::{BufferHandle, SignalId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

/// Pipeline stages that can pin a frame with a usage hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStage {
    /// The inspection engine still needs the frame for condition evaluation.
    Inspection = 0,
    /// The frame is referenced by a queued or in-flight upload.
    Uploading = 1,
}

/// Number of usage-hint slots per frame.
pub const STAGE_COUNT: usize = 2;

impl UsageStage {
    fn index(self) -> usize {
        self as usize
    }
}

/// Errors surfaced by the buffer manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("signal {0} is not assigned for raw data collection")]
    UnknownSignal(SignalId),
    #[error("signal {0} buffer is being torn down")]
    Deleting(SignalId),
    #[error("payload of {size} bytes exceeds the {limit}-byte limit for signal {signal_id}")]
    TooBig {
        signal_id: SignalId,
        size: u64,
        limit: u64,
    },
    #[error("no eviction could free enough room for signal {0}")]
    NoCapacity(SignalId),
    #[error("memory ceiling reached while reserving {requested} bytes for signal {signal_id}")]
    MemoryFull {
        signal_id: SignalId,
        requested: u64,
    },
}

/// Usage counters for one signal buffer or the whole manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatistics {
    pub received: u64,
    pub in_memory: u64,
    pub borrowed_by_sender: u64,
    pub max_time_in_memory_ms: u64,
    pub avg_time_in_memory_ms: u64,
    pub min_time_in_memory_ms: u64,
}

/// One stored payload.
struct Frame {
    handle: BufferHandle,
    timestamp: Timestamp,
    /// Shared so outstanding loans stay readable without holding the index
    /// lock; the accounting still charges the frame until eviction.
    payload: Arc<Vec<u8>>,
    borrow_count: u8,
    usage_hints: [u8; STAGE_COUNT],
}

impl Frame {
    fn has_usage_hints(&self) -> bool {
        self.usage_hints.iter().any(|&hint| hint != 0)
    }
}

/// Per-signal frame list plus its limits and local accounting.
struct Buffer {
    signal_id: SignalId,
    max_samples: u64,
    max_bytes_per_sample: u64,
    max_overall_bytes: u64,
    reserved_bytes: u64,
    /// FIFO: new frames at the back, eviction scans from the front.
    frames: Vec<Frame>,
    bytes_in_use: u64,
    samples_received: u64,
    borrowed_by_sender: u64,
    deleting: bool,
}

enum AddError {
    TooBig { limit: u64 },
    NoCapacity,
}

impl Buffer {
    fn new(config: SignalConfig) -> Self {
        Self {
            signal_id: config.signal_id,
            max_samples: config.max_samples,
            max_bytes_per_sample: config.max_bytes_per_sample,
            max_overall_bytes: config.max_overall_bytes,
            reserved_bytes: config.reserved_bytes,
            frames: Vec::new(),
            bytes_in_use: 0,
            samples_received: 0,
            borrowed_by_sender: 0,
            deleting: false,
        }
    }

    fn frame(&self, handle: BufferHandle) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.handle == handle)
    }

    fn frame_mut(&mut self, handle: BufferHandle) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|frame| frame.handle == handle)
    }

    /// Copy a payload into a new frame, evicting as needed. Mirrors the
    /// space checks in order: per-sample/per-signal size limits, sample
    /// count, per-signal byte budget, then the system-wide budget handed in
    /// as `bytes_available`.
    fn add_frame(
        &mut self,
        data: &[u8],
        timestamp: Timestamp,
        handle: BufferHandle,
        available_free_memory: u64,
        metrics: &Metrics,
    ) -> Result<(), AddError> {
        let mut bytes_available = available_free_memory;
        // The reservation guarantees this buffer its headroom even when the
        // rest of the system is full.
        if self.bytes_in_use < self.reserved_bytes {
            bytes_available += self.reserved_bytes - self.bytes_in_use;
        }

        let required = data.len() as u64;
        if required > self.max_bytes_per_sample || required > self.max_overall_bytes {
            return Err(AddError::TooBig {
                limit: self.max_bytes_per_sample.min(self.max_overall_bytes),
            });
        }

        if self.frames.len() as u64 == self.max_samples {
            if !self.evict_one(metrics) {
                return Err(AddError::NoCapacity);
            }
        }

        while self.bytes_in_use + required > self.max_overall_bytes {
            if !self.evict_one(metrics) {
                return Err(AddError::NoCapacity);
            }
        }

        while required > bytes_available {
            let bytes_in_use_before = self.bytes_in_use;
            if !self.evict_one(metrics) {
                return Err(AddError::NoCapacity);
            }
            bytes_available += bytes_in_use_before - self.bytes_in_use;
        }

        self.frames.push(Frame {
            handle,
            timestamp,
            payload: Arc::new(data.to_vec()),
            borrow_count: 0,
            usage_hints: [0; STAGE_COUNT],
        });
        self.samples_received += 1;
        self.bytes_in_use += required;
        Ok(())
    }

    /// Evict the oldest eligible frame.
    ///
    /// Tier one: no loans and no usage hints. Tier two: no loans and no
    /// UPLOADING hint — the holder of such a handle will find the data
    /// missing on its next borrow, which is counted for observability.
    fn evict_one(&mut self, metrics: &Metrics) -> bool {
        let mut used_handle = false;
        let mut index = self
            .frames
            .iter()
            .position(|frame| frame.borrow_count == 0 && !frame.has_usage_hints());
        if index.is_none() {
            index = self.frames.iter().position(|frame| {
                frame.borrow_count == 0 && frame.usage_hints[UsageStage::Uploading.index()] == 0
            });
            if index.is_some() {
                used_handle = true;
                Metrics::increment(&metrics.raw_data_overwritten_with_used_handle);
            }
        }
        let Some(index) = index else {
            warn!(signal_id = self.signal_id, "Could not find any unused frame to evict");
            return false;
        };

        let frame = self.frames.remove(index);
        trace!(
            signal_id = self.signal_id,
            handle = frame.handle,
            used_handle,
            "Evicting frame"
        );
        self.bytes_in_use -= frame.payload.len() as u64;
        true
    }

    /// Remove one frame by handle; returns the freed byte count (0 if the
    /// handle is unknown).
    fn remove_frame(&mut self, handle: BufferHandle) -> u64 {
        let Some(index) = self.frames.iter().position(|frame| frame.handle == handle) else {
            trace!(signal_id = self.signal_id, handle, "No frame to remove for handle");
            return 0;
        };
        let frame = self.frames.remove(index);
        let freed = frame.payload.len() as u64;
        self.bytes_in_use -= freed;
        freed
    }

    /// Teardown path: free every frame that is not currently loaned,
    /// regardless of usage hints.
    fn free_unloaned(&mut self) {
        let mut freed = 0u64;
        self.frames.retain(|frame| {
            if frame.borrow_count == 0 {
                freed += frame.payload.len() as u64;
                false
            } else {
                true
            }
        });
        self.bytes_in_use -= freed;
    }

    fn statistics(&self, now_ms: Timestamp) -> BufferStatistics {
        let mut max_time = 0u64;
        let mut min_time = u64::MAX;
        let mut sum_time = 0u64;
        for frame in &self.frames {
            let resident = now_ms.saturating_sub(frame.timestamp);
            max_time = max_time.max(resident);
            min_time = min_time.min(resident);
            sum_time += resident;
        }
        let count = self.frames.len() as u64;
        BufferStatistics {
            received: self.samples_received,
            in_memory: count,
            borrowed_by_sender: self.borrowed_by_sender,
            max_time_in_memory_ms: max_time,
            avg_time_in_memory_ms: if count == 0 { 0 } else { sum_time / count },
            min_time_in_memory_ms: if count == 0 { 0 } else { min_time },
        }
    }
}

#[derive(Clone, Copy)]
struct StatsContribution {
    bytes_in_use: u64,
    reserved_bytes: u64,
    bytes_in_use_and_reserved: u64,
    samples_in_memory: u64,
}

struct ManagerState {
    buffers: BTreeMap<SignalId, Buffer>,
    bytes_in_use: u64,
    bytes_reserved: u64,
    bytes_in_use_and_reserved: u64,
    overall_samples_received: u64,
    samples_in_memory: u64,
    borrowed_by_sender: u64,
    handle_counter: u8,
}

impl ManagerState {
    fn contribution(&self, signal_id: SignalId) -> Option<StatsContribution> {
        self.buffers.get(&signal_id).map(|buffer| StatsContribution {
            bytes_in_use: buffer.bytes_in_use,
            reserved_bytes: buffer.reserved_bytes,
            bytes_in_use_and_reserved: buffer.bytes_in_use.max(buffer.reserved_bytes),
            samples_in_memory: buffer.frames.len() as u64,
        })
    }

    /// Take a buffer's contribution out of the global accounting before
    /// mutating it; [`add_to_stats`] puts the new contribution back. The
    /// asserts are programmer-error checks, not recoverable conditions.
    fn remove_from_stats(&mut self, signal_id: SignalId, max_overall_memory: u64) {
        let Some(contribution) = self.contribution(signal_id) else {
            return;
        };
        self.check_accounting(max_overall_memory);
        crate::fatal_assert!(
            self.bytes_in_use >= contribution.bytes_in_use,
            "buffer bytes exceed global bytes"
        );
        crate::fatal_assert!(
            self.bytes_in_use_and_reserved >= contribution.bytes_in_use_and_reserved,
            "buffer accounted bytes exceed global accounted bytes"
        );
        crate::fatal_assert!(
            self.samples_in_memory >= contribution.samples_in_memory,
            "buffer sample count exceeds global sample count"
        );
        self.bytes_in_use -= contribution.bytes_in_use;
        self.bytes_in_use_and_reserved -= contribution.bytes_in_use_and_reserved;
        self.bytes_reserved -= contribution.reserved_bytes;
        self.samples_in_memory -= contribution.samples_in_memory;
        self.check_accounting(max_overall_memory);
    }

    fn add_to_stats(&mut self, signal_id: SignalId, max_overall_memory: u64) {
        let Some(contribution) = self.contribution(signal_id) else {
            return;
        };
        self.check_accounting(max_overall_memory);
        self.bytes_in_use += contribution.bytes_in_use;
        self.bytes_in_use_and_reserved += contribution.bytes_in_use_and_reserved;
        self.bytes_reserved += contribution.reserved_bytes;
        self.samples_in_memory += contribution.samples_in_memory;
        self.check_accounting(max_overall_memory);
    }

    fn check_accounting(&self, max_overall_memory: u64) {
        crate::fatal_assert!(
            self.bytes_in_use <= self.bytes_in_use_and_reserved,
            "bytes in use exceed accounted bytes"
        );
        crate::fatal_assert!(
            self.bytes_reserved <= self.bytes_in_use_and_reserved,
            "reserved bytes exceed accounted bytes"
        );
        crate::fatal_assert!(
            self.bytes_in_use_and_reserved <= max_overall_memory,
            "accounted bytes exceed the memory ceiling"
        );
    }

    fn check_memory_limit(&self, requested: u64, max_overall_memory: u64) -> bool {
        if requested > max_overall_memory {
            return false;
        }
        self.bytes_reserved + requested <= max_overall_memory
    }

    /// Handle = rolling 8-bit counter in the low byte, ingestion wall-clock
    /// in the upper 56 bits.
    fn generate_handle(&mut self, timestamp: Timestamp) -> BufferHandle {
        self.handle_counter = self.handle_counter.wrapping_add(1);
        u64::from(self.handle_counter) | (timestamp << 8)
    }
}

/// The manager. Shared as `Arc<BufferManager>`; loans keep the manager alive
/// and release themselves from any thread.
pub struct BufferManager {
    config: BufferConfig,
    max_overall_memory: u64,
    state: Mutex<ManagerState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl BufferManager {
    pub fn new(config: BufferConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Arc<Self> {
        let max_overall_memory = config.max_bytes();
        Arc::new(Self {
            config,
            max_overall_memory,
            state: Mutex::new(ManagerState {
                buffers: BTreeMap::new(),
                bytes_in_use: 0,
                bytes_reserved: 0,
                bytes_in_use_and_reserved: 0,
                overall_samples_received: 0,
                samples_in_memory: 0,
                borrowed_by_sender: 0,
                handle_counter: 0,
            }),
            clock,
            metrics,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new per-signal configuration.
    ///
    /// Signals absent from the new set are torn down: frames without loans
    /// are freed immediately, the rest as their loans drop; an emptied
    /// buffer leaves the index. New signals allocate an empty buffer if the
    /// system-wide reserved total still fits under the ceiling, otherwise
    /// the call fails with `MemoryFull`.
    pub fn update_config(
        &self,
        updated_signals: &HashMap<SignalId, SignalUpdateConfig>,
    ) -> Result<(), BufferError> {
        let mut state = self.lock();

        let removed: Vec<SignalId> = state
            .buffers
            .keys()
            .filter(|signal_id| !updated_signals.contains_key(*signal_id))
            .copied()
            .collect();

        for signal_id in removed {
            state.remove_from_stats(signal_id, self.max_overall_memory);
            let Some(buffer) = state.buffers.get_mut(&signal_id) else {
                continue;
            };
            buffer.free_unloaned();
            if buffer.frames.is_empty() {
                debug!(signal_id, "Deleting raw data buffer");
                state.buffers.remove(&signal_id);
            } else {
                // At least one frame is still loaned out; finish the
                // teardown as the loans drop.
                buffer.deleting = true;
                state.add_to_stats(signal_id, self.max_overall_memory);
            }
        }

        for (signal_id, update) in updated_signals {
            let signal_config = self.config.signal_config(
                update.signal_id,
                &update.interface_id,
                &update.message_id,
            );
            if let Some(buffer) = state.buffers.get_mut(signal_id) {
                // The limits for a signal never change while it exists; a
                // re-add only needs to cancel a pending teardown.
                buffer.deleting = false;
                continue;
            }
            if !state.check_memory_limit(signal_config.reserved_bytes, self.max_overall_memory) {
                error!(
                    signal_id,
                    requested = signal_config.reserved_bytes,
                    reserved = state.bytes_reserved,
                    ceiling = self.max_overall_memory,
                    "Memory ceiling reached while adding signal"
                );
                return Err(BufferError::MemoryFull {
                    signal_id: *signal_id,
                    requested: signal_config.reserved_bytes,
                });
            }
            debug!(
                signal_id,
                max_samples = signal_config.max_samples,
                reserved_bytes = signal_config.reserved_bytes,
                max_overall_bytes = signal_config.max_overall_bytes,
                max_bytes_per_sample = signal_config.max_bytes_per_sample,
                "Adding signal for raw data collection"
            );
            state.buffers.insert(*signal_id, Buffer::new(signal_config));
            state.add_to_stats(*signal_id, self.max_overall_memory);
        }

        Ok(())
    }

    /// Copy bytes into a new frame and return its handle.
    pub fn push(
        &self,
        signal_id: SignalId,
        data: &[u8],
        timestamp: Timestamp,
    ) -> Result<BufferHandle, BufferError> {
        let mut state = self.lock();

        let Some(buffer) = state.buffers.get(&signal_id) else {
            warn!(signal_id, "Push requested for signal not assigned for collection");
            return Err(BufferError::UnknownSignal(signal_id));
        };
        if buffer.deleting {
            warn!(signal_id, "Push requested for signal whose buffer is being torn down");
            return Err(BufferError::Deleting(signal_id));
        }

        state.overall_samples_received += 1;
        let handle = state.generate_handle(timestamp);

        let available_free_memory = self.max_overall_memory - state.bytes_in_use_and_reserved;
        state.remove_from_stats(signal_id, self.max_overall_memory);
        let result = state
            .buffers
            .get_mut(&signal_id)
            .map(|buffer| {
                buffer.add_frame(data, timestamp, handle, available_free_memory, &self.metrics)
            })
            .unwrap_or(Err(AddError::NoCapacity));
        state.add_to_stats(signal_id, self.max_overall_memory);
        Metrics::set(&self.metrics.raw_data_bytes_in_use, state.bytes_in_use);

        match result {
            Ok(()) => Ok(handle),
            Err(AddError::TooBig { limit }) => Err(BufferError::TooBig {
                signal_id,
                size: data.len() as u64,
                limit,
            }),
            Err(AddError::NoCapacity) => Err(BufferError::NoCapacity(signal_id)),
        }
    }

    /// Borrow a frame for reading. Fails (returns `None`) for unknown
    /// handles, zero-size payloads (the data was evicted under a kept
    /// handle) and when the loan counter is saturated.
    pub fn borrow(
        self: &Arc<Self>,
        signal_id: SignalId,
        handle: BufferHandle,
    ) -> Option<LoanedFrame> {
        let mut state = self.lock();

        let Some(buffer) = state.buffers.get_mut(&signal_id) else {
            warn!(signal_id, "Borrow requested for unknown signal");
            return None;
        };
        let Some(frame) = buffer.frame_mut(handle) else {
            warn!(signal_id, handle, "No frame for handle");
            return None;
        };
        if frame.payload.is_empty() {
            error!(signal_id, handle, "Requested frame has no data; treating handle as stale");
            return None;
        }
        if frame.borrow_count == u8::MAX {
            error!(signal_id, handle, "Too many outstanding loans for frame");
            return None;
        }

        frame.borrow_count += 1;
        let payload = Arc::clone(&frame.payload);
        buffer.borrowed_by_sender += 1;
        state.borrowed_by_sender += 1;

        Some(LoanedFrame {
            manager: Arc::clone(self),
            signal_id,
            handle,
            payload,
        })
    }

    fn return_loaned(&self, signal_id: SignalId, handle: BufferHandle) {
        let mut state = self.lock();

        let Some(buffer) = state.buffers.get_mut(&signal_id) else {
            error!(signal_id, handle, "Loan returned for unknown signal");
            return;
        };
        let Some(frame) = buffer.frame_mut(handle) else {
            error!(signal_id, handle, "Loan returned for unknown handle");
            return;
        };
        if frame.borrow_count == 0 {
            error!(signal_id, handle, "Loan counter underflow on return");
        } else {
            frame.borrow_count -= 1;
        }
        buffer.borrowed_by_sender = buffer.borrowed_by_sender.saturating_sub(1);
        state.borrowed_by_sender = state.borrowed_by_sender.saturating_sub(1);

        self.delete_unused(&mut state, signal_id, handle);
    }

    /// Pin a frame for a pipeline stage. Saturated counters fail without
    /// incrementing.
    pub fn increase_usage_hint(
        &self,
        signal_id: SignalId,
        handle: BufferHandle,
        stage: UsageStage,
    ) -> bool {
        let mut state = self.lock();
        let Some(frame) = state
            .buffers
            .get_mut(&signal_id)
            .and_then(|buffer| buffer.frame_mut(handle))
        else {
            warn!(signal_id, handle, stage = stage.index(), "Usage hint target not found");
            return false;
        };
        if frame.usage_hints[stage.index()] == u8::MAX {
            error!(signal_id, handle, stage = stage.index(), "Usage hint already at max");
            return false;
        }
        frame.usage_hints[stage.index()] += 1;
        true
    }

    /// Release a stage pin; a counter reaching zero triggers an eviction
    /// attempt for the frame.
    pub fn decrease_usage_hint(
        &self,
        signal_id: SignalId,
        handle: BufferHandle,
        stage: UsageStage,
    ) -> bool {
        let mut state = self.lock();
        let Some(frame) = state
            .buffers
            .get_mut(&signal_id)
            .and_then(|buffer| buffer.frame_mut(handle))
        else {
            warn!(signal_id, handle, stage = stage.index(), "Usage hint target not found");
            return false;
        };
        if frame.usage_hints[stage.index()] == 0 {
            error!(signal_id, handle, stage = stage.index(), "Usage hint already zero");
            return false;
        }
        frame.usage_hints[stage.index()] -= 1;

        self.delete_unused(&mut state, signal_id, handle);
        true
    }

    /// Clear one stage's counter on every frame and evict the newly
    /// eligible ones. Used on campaign deactivation.
    pub fn reset_usage_hints(&self, stage: UsageStage) {
        let mut state = self.lock();
        let signal_ids: Vec<SignalId> = state.buffers.keys().copied().collect();
        for signal_id in signal_ids {
            let handles: Vec<BufferHandle> = match state.buffers.get(&signal_id) {
                Some(buffer) => buffer.frames.iter().map(|frame| frame.handle).collect(),
                None => continue,
            };
            for handle in handles {
                if let Some(frame) = state
                    .buffers
                    .get_mut(&signal_id)
                    .and_then(|buffer| buffer.frame_mut(handle))
                {
                    frame.usage_hints[stage.index()] = 0;
                }
                self.delete_unused(&mut state, signal_id, handle);
            }
        }
    }

    /// Evict a frame nothing references any more; finishes a pending buffer
    /// teardown when the last frame goes.
    fn delete_unused(&self, state: &mut ManagerState, signal_id: SignalId, handle: BufferHandle) {
        let Some(buffer) = state.buffers.get(&signal_id) else {
            return;
        };
        let Some(frame) = buffer.frame(handle) else {
            return;
        };
        if frame.borrow_count != 0 || frame.has_usage_hints() {
            return;
        }

        state.remove_from_stats(signal_id, self.max_overall_memory);
        let freed = state
            .buffers
            .get_mut(&signal_id)
            .map(|buffer| buffer.remove_frame(handle))
            .unwrap_or(0);
        state.add_to_stats(signal_id, self.max_overall_memory);
        Metrics::set(&self.metrics.raw_data_bytes_in_use, state.bytes_in_use);
        if freed == 0 {
            error!(signal_id, handle, "Could not delete frame data");
        }

        let finished_teardown = state
            .buffers
            .get(&signal_id)
            .map(|buffer| buffer.deleting && buffer.frames.is_empty())
            .unwrap_or(false);
        if finished_teardown {
            debug!(signal_id, "Deleting raw data buffer");
            state.remove_from_stats(signal_id, self.max_overall_memory);
            state.buffers.remove(&signal_id);
        }
    }

    /// Manager-wide counters. Residency times are only meaningful per
    /// signal and report zero here.
    pub fn statistics(&self) -> BufferStatistics {
        let state = self.lock();
        BufferStatistics {
            received: state.overall_samples_received,
            in_memory: state.samples_in_memory,
            borrowed_by_sender: state.borrowed_by_sender,
            ..BufferStatistics::default()
        }
    }

    /// Counters for one signal, `None` if it has no buffer.
    pub fn signal_statistics(&self, signal_id: SignalId) -> Option<BufferStatistics> {
        let state = self.lock();
        let now_ms = self.clock.system_time_ms();
        state.buffers.get(&signal_id).map(|buffer| buffer.statistics(now_ms))
    }
}

/// RAII read loan on a frame. `Send + Sync`; dropping from any thread
/// releases the loan and may trigger the frame's eviction.
pub struct LoanedFrame {
    manager: Arc<BufferManager>,
    signal_id: SignalId,
    handle: BufferHandle,
    payload: Arc<Vec<u8>>,
}

impl LoanedFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn signal_id(&self) -> SignalId {
        self.signal_id
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }
}

impl Drop for LoanedFrame {
    fn drop(&mut self) {
        self.manager.return_loaned(self.signal_id, self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawBufferConfig;
    use crate::time::ManualClock;

    fn manager_with(raw: RawBufferConfig) -> Arc<BufferManager> {
        let config = BufferConfig::new(&raw).unwrap();
        BufferManager::new(config, ManualClock::new(1_000_000), Arc::new(Metrics::default()))
    }

    fn signal_update(signal_id: SignalId) -> (SignalId, SignalUpdateConfig) {
        (
            signal_id,
            SignalUpdateConfig {
                signal_id,
                interface_id: "can0".to_string(),
                message_id: format!("0x{signal_id:x}"),
            },
        )
    }

    fn install(manager: &Arc<BufferManager>, signal_ids: &[SignalId]) {
        let updated: HashMap<_, _> = signal_ids.iter().map(|&id| signal_update(id)).collect();
        manager.update_config(&updated).unwrap();
    }

    #[test]
    fn test_push_unknown_signal() {
        let manager = manager_with(RawBufferConfig::default());
        assert_eq!(
            manager.push(9, b"data", 1),
            Err(BufferError::UnknownSignal(9))
        );
    }

    #[test]
    fn test_push_and_borrow_roundtrip() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);

        let handle = manager.push(1, b"payload", 42).unwrap();
        assert_ne!(handle, crate::types::INVALID_BUFFER_HANDLE);
        // low byte is the rolling counter, upper bits the timestamp
        assert_eq!(handle >> 8, 42);

        let loan = manager.borrow(1, handle).unwrap();
        assert_eq!(loan.bytes(), b"payload");
        let stats = manager.signal_statistics(1).unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.in_memory, 1);
        assert_eq!(stats.borrowed_by_sender, 1);

        // the last loan dropping with no usage hints releases the frame
        drop(loan);
        let stats = manager.signal_statistics(1).unwrap();
        assert_eq!(stats.in_memory, 0);
        assert_eq!(stats.borrowed_by_sender, 0);
    }

    #[test]
    fn test_handles_are_unique_within_one_millisecond() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);
        let first = manager.push(1, b"a", 7).unwrap();
        let second = manager.push(1, b"b", 7).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_too_big_boundary() {
        let manager = manager_with(RawBufferConfig {
            max_bytes: 1024,
            max_bytes_per_sample: Some(8),
            ..RawBufferConfig::default()
        });
        install(&manager, &[1]);

        // exactly the per-sample limit fits
        manager.push(1, &[0u8; 8], 1).unwrap();
        // one more byte is rejected
        assert!(matches!(
            manager.push(1, &[0u8; 9], 2),
            Err(BufferError::TooBig { size: 9, limit: 8, .. })
        ));
    }

    #[test]
    fn test_full_buffer_evicts_oldest() {
        let manager = manager_with(RawBufferConfig {
            max_bytes: 1024,
            max_samples_per_signal: Some(2),
            ..RawBufferConfig::default()
        });
        install(&manager, &[1]);

        let first = manager.push(1, b"one", 1).unwrap();
        let second = manager.push(1, b"two", 2).unwrap();
        let third = manager.push(1, b"three", 3).unwrap();

        assert!(manager.borrow(1, first).is_none());
        assert!(manager.borrow(1, second).is_some());
        assert!(manager.borrow(1, third).is_some());
        assert_eq!(manager.signal_statistics(1).unwrap().in_memory, 2);
    }

    #[test]
    fn test_no_capacity_when_all_frames_loaned() {
        let manager = manager_with(RawBufferConfig {
            max_bytes: 1024,
            max_samples_per_signal: Some(1),
            ..RawBufferConfig::default()
        });
        install(&manager, &[1]);

        let handle = manager.push(1, b"pinned", 1).unwrap();
        let _loan = manager.borrow(1, handle).unwrap();
        assert_eq!(manager.push(1, b"more", 2), Err(BufferError::NoCapacity(1)));
    }

    #[test]
    fn test_eviction_respects_usage_hints() {
        // max one sample so the second push must evict the first
        let metrics = Arc::new(Metrics::default());
        let config = BufferConfig::new(&RawBufferConfig {
            max_bytes: 1024,
            max_samples_per_signal: Some(1),
            ..RawBufferConfig::default()
        })
        .unwrap();
        let manager = BufferManager::new(config, ManualClock::new(0), Arc::clone(&metrics));
        install(&manager, &[1]);

        let first = manager.push(1, b"first", 1).unwrap();
        assert!(manager.increase_usage_hint(1, first, UsageStage::Uploading));

        // F1 is pinned for upload: not evictable, push fails; the overflow
        // counter belongs to the ingestion layer and stays untouched here
        assert_eq!(manager.push(1, b"second", 2), Err(BufferError::NoCapacity(1)));
        assert_eq!(Metrics::get(&metrics.raw_data_overflow), 0);

        assert!(manager.decrease_usage_hint(1, first, UsageStage::Uploading));
        // hint dropped to zero, F1 is evicted; now the push succeeds
        let second = manager.push(1, b"second", 3).unwrap();
        assert!(manager.borrow(1, first).is_none());
        assert!(manager.borrow(1, second).is_some());
    }

    #[test]
    fn test_tier_two_eviction_counts_overwritten_handles() {
        let metrics = Arc::new(Metrics::default());
        let config = BufferConfig::new(&RawBufferConfig {
            max_bytes: 1024,
            max_samples_per_signal: Some(1),
            ..RawBufferConfig::default()
        })
        .unwrap();
        let manager = BufferManager::new(config, ManualClock::new(0), Arc::clone(&metrics));
        install(&manager, &[1]);

        let first = manager.push(1, b"first", 1).unwrap();
        // pinned for inspection only: tier one skips it, tier two evicts it
        assert!(manager.increase_usage_hint(1, first, UsageStage::Inspection));
        manager.push(1, b"second", 2).unwrap();

        assert!(manager.borrow(1, first).is_none());
        assert_eq!(
            Metrics::get(&metrics.raw_data_overwritten_with_used_handle),
            1
        );
    }

    #[test]
    fn test_borrow_saturates_at_255() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);
        let handle = manager.push(1, b"data", 1).unwrap();

        let mut loans = Vec::new();
        for _ in 0..254 {
            loans.push(manager.borrow(1, handle).unwrap());
        }
        // 254 -> 255 succeeds
        loans.push(manager.borrow(1, handle).unwrap());
        // a further borrow fails without mutating state
        assert!(manager.borrow(1, handle).is_none());
        assert_eq!(
            manager.signal_statistics(1).unwrap().borrowed_by_sender,
            255
        );

        drop(loans);
        assert_eq!(manager.signal_statistics(1).unwrap().borrowed_by_sender, 0);
    }

    #[test]
    fn test_loan_released_from_other_thread() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);
        let handle = manager.push(1, b"data", 1).unwrap();
        let loan = manager.borrow(1, handle).unwrap();

        std::thread::spawn(move || drop(loan)).join().unwrap();
        assert_eq!(manager.signal_statistics(1).unwrap().borrowed_by_sender, 0);
    }

    #[test]
    fn test_update_config_tears_down_removed_signals() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1, 2]);
        let kept = manager.push(2, b"kept", 1).unwrap();
        let handle = manager.push(1, b"going away", 1).unwrap();
        let loan = manager.borrow(1, handle).unwrap();

        // signal 1 removed while one loan is out
        install(&manager, &[2]);

        // frame survives until the loan drops, but no new pushes
        assert_eq!(manager.push(1, b"x", 2), Err(BufferError::Deleting(1)));
        drop(loan);
        assert!(manager.signal_statistics(1).is_none());
        assert!(manager.borrow(2, kept).is_some());
    }

    #[test]
    fn test_update_config_reinstall_cancels_teardown() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);
        let handle = manager.push(1, b"data", 1).unwrap();
        let loan = manager.borrow(1, handle).unwrap();

        install(&manager, &[]);
        install(&manager, &[1]);
        drop(loan);

        // teardown was cancelled: buffer still accepts pushes
        manager.push(1, b"more", 2).unwrap();
    }

    #[test]
    fn test_update_config_respects_reservation_ceiling() {
        let manager = manager_with(RawBufferConfig {
            max_bytes: 100,
            reserved_bytes_per_signal: 40,
            ..RawBufferConfig::default()
        });
        install(&manager, &[1, 2]);

        let updated: HashMap<_, _> = [1, 2, 3].iter().map(|&id| signal_update(id)).collect();
        assert!(matches!(
            manager.update_config(&updated),
            Err(BufferError::MemoryFull { signal_id: 3, requested: 40 })
        ));
    }

    #[test]
    fn test_reset_hints_evicts_unpinned_frames() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1]);
        let first = manager.push(1, b"first", 1).unwrap();
        let second = manager.push(1, b"second", 2).unwrap();
        manager.increase_usage_hint(1, first, UsageStage::Inspection);
        manager.increase_usage_hint(1, second, UsageStage::Inspection);
        manager.increase_usage_hint(1, second, UsageStage::Uploading);

        manager.reset_usage_hints(UsageStage::Inspection);

        // first lost its only pin, second is still held by the upload stage
        assert!(manager.borrow(1, first).is_none());
        assert!(manager.borrow(1, second).is_some());
    }

    #[test]
    fn test_accounting_matches_resident_payloads() {
        let manager = manager_with(RawBufferConfig::default());
        install(&manager, &[1, 2]);
        manager.push(1, &[0u8; 10], 1).unwrap();
        manager.push(1, &[0u8; 20], 2).unwrap();
        manager.push(2, &[0u8; 5], 3).unwrap();

        let state = manager.lock();
        let per_buffer: u64 = state
            .buffers
            .values()
            .map(|buffer| {
                let frame_bytes: u64 =
                    buffer.frames.iter().map(|f| f.payload.len() as u64).sum();
                assert_eq!(frame_bytes, buffer.bytes_in_use);
                frame_bytes
            })
            .sum();
        assert_eq!(per_buffer, state.bytes_in_use);
        assert_eq!(state.bytes_in_use, 35);
        assert!(state.bytes_in_use <= state.bytes_in_use_and_reserved);
    }
}
