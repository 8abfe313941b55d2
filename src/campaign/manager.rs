//! Campaign manager
//!
//! Owns the campaign lifecycle: accepts decoder/campaign payloads from the
//! cloud receivers, compiles them, keeps Idle and Enabled sets, and walks a
//! monotonic timeline of enable/expire/checkin events. Whenever the enabled
//! set or the decoder description changes it re-extracts the decoder
//! dictionary and the inspection matrix, publishes both as immutable
//! snapshots, reconfigures the raw-data buffer, and notifies the
//! campaigns-changed subscribers (stream engine).
//!
//! The manager runs as one long-lived task; `drive` performs one wakeup's
//! worth of work and returns the next timeline deadline, so the scheduling
//! loop stays trivial and the logic stays synchronously testable.

use super::description::{
    decode_campaign_list, decode_decoder_manifest, encode_checkin, CampaignListDescription,
    CheckinDescription, DecoderManifestDescription, DescriptionError, SignalDecoderRow,
};
use super::matrix::InspectionMatrix;
use super::{ActiveCampaigns, BuiltCampaign};
use crate::decoder::{can::CanMessageFormat, CanMessageDecoderMethod, CollectKind, DecoderDictionary};
use crate::persistency::{DataType, PersistencyWorkspace};
use crate::rawdata::{BufferManager, SignalUpdateConfig, UsageStage};
use crate::time::{Clock, TimePoint};
use crate::types::{SignalId, SyncId};
use arc_swap::ArcSwap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeline id used for the periodic checkin event.
const CHECKIN_ID: &str = "Checkin";

/// Interval to retry a failed checkin.
const CHECKIN_RETRY_INTERVAL_MS: u64 = 5_000;

/// Wait when the timeline is empty; new payloads interrupt it anyway.
const IDLE_WAIT_MS: u64 = 60_000;

/// External checkin transport (the MQTT sender implements this).
pub trait CheckinSink: Send + Sync {
    /// Deliver one encoded checkin document; `false` requests a retry.
    fn send_checkin(&self, payload: &[u8]) -> bool;
}

/// Fallback sink when no uplink is wired: logs and accepts.
pub struct LoggingCheckinSink;

impl CheckinSink for LoggingCheckinSink {
    fn send_checkin(&self, payload: &[u8]) -> bool {
        debug!(bytes = payload.len(), "Checkin (no uplink configured)");
        true
    }
}

/// One timeline entry: fire `id` at `time_ms` on the monotonic clock.
/// Ordered by time, then id, so simultaneous events fire deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimeData {
    time_ms: u64,
    id: SyncId,
}

/// Task-local lifecycle state, owned by the scheduling loop.
#[derive(Default)]
pub struct RunState {
    manifest: Option<Arc<DecoderManifestDescription>>,
    idle: BTreeMap<SyncId, Arc<BuiltCampaign>>,
    enabled: BTreeMap<SyncId, Arc<BuiltCampaign>>,
    timeline: BinaryHeap<Reverse<TimeData>>,
    checkin_armed: bool,
}

#[derive(Default)]
struct PendingInput {
    decoder_manifest: Option<(Arc<DecoderManifestDescription>, Option<Vec<u8>>)>,
    campaign_list: Option<(Arc<CampaignListDescription>, Option<Vec<u8>>)>,
}

type CampaignsListener = Box<dyn Fn(&ActiveCampaigns) + Send + Sync>;

pub struct CampaignManager {
    clock: Arc<dyn Clock>,
    persistency: Option<Arc<PersistencyWorkspace>>,
    raw_buffer: Arc<BufferManager>,
    checkin_sink: Arc<dyn CheckinSink>,
    checkin_interval_ms: u64,
    dictionary: Arc<ArcSwap<DecoderDictionary>>,
    matrix: Arc<ArcSwap<InspectionMatrix>>,
    campaigns_listeners: Mutex<Vec<CampaignsListener>>,
    pending: Mutex<PendingInput>,
    notify: Notify,
    partial_signal_counter: AtomicU32,
}

impl CampaignManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        raw_buffer: Arc<BufferManager>,
        persistency: Option<Arc<PersistencyWorkspace>>,
        checkin_sink: Arc<dyn CheckinSink>,
        checkin_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            persistency,
            raw_buffer,
            checkin_sink,
            checkin_interval_ms,
            dictionary: Arc::new(ArcSwap::from_pointee(DecoderDictionary::default())),
            matrix: Arc::new(ArcSwap::from_pointee(InspectionMatrix::default())),
            campaigns_listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(PendingInput::default()),
            notify: Notify::new(),
            partial_signal_counter: AtomicU32::new(0),
        })
    }

    /// Shared handle to the published decoder dictionary.
    pub fn dictionary(&self) -> Arc<ArcSwap<DecoderDictionary>> {
        Arc::clone(&self.dictionary)
    }

    /// Owned snapshot of the current decoder dictionary.
    pub fn dictionary_snapshot(&self) -> Arc<DecoderDictionary> {
        self.dictionary.load_full()
    }

    /// Shared handle to the published inspection matrix.
    pub fn matrix(&self) -> Arc<ArcSwap<InspectionMatrix>> {
        Arc::clone(&self.matrix)
    }

    /// Owned snapshot of the current inspection matrix.
    pub fn matrix_snapshot(&self) -> Arc<InspectionMatrix> {
        self.matrix.load_full()
    }

    /// Register for enabled-set changes (the stream engine subscribes here).
    pub fn subscribe_campaigns_changed(
        &self,
        listener: impl Fn(&ActiveCampaigns) + Send + Sync + 'static,
    ) {
        self.lock_listeners().push(Box::new(listener));
    }

    /// Byte-array receiver for the decoder description payload. Runs in the
    /// transport's context; the heavy processing happens on the manager
    /// task.
    pub fn receive_decoder_manifest(&self, payload: &[u8]) -> Result<(), DescriptionError> {
        let manifest = decode_decoder_manifest(payload)?;
        info!(sync_id = %manifest.sync_id, "Received decoder description");
        self.lock_pending().decoder_manifest = Some((Arc::new(manifest), Some(payload.to_vec())));
        self.notify.notify_one();
        Ok(())
    }

    /// Byte-array receiver for the campaign list payload.
    pub fn receive_campaign_list(&self, payload: &[u8]) -> Result<(), DescriptionError> {
        let list = decode_campaign_list(payload)?;
        info!(campaigns = list.campaigns.len(), "Received campaign list");
        self.lock_pending().campaign_list = Some((Arc::new(list), Some(payload.to_vec())));
        self.notify.notify_one();
        Ok(())
    }

    /// Replay payloads persisted by an earlier run. Invalid or missing
    /// blobs are skipped; the cloud will send fresh copies.
    pub fn restore_persisted(&self) {
        let Some(persistency) = &self.persistency else {
            return;
        };
        match persistency.read_blob(DataType::DecoderManifest) {
            Ok(bytes) => match decode_decoder_manifest(&bytes) {
                Ok(manifest) => {
                    info!(sync_id = %manifest.sync_id, "Restored persisted decoder description");
                    self.lock_pending().decoder_manifest = Some((Arc::new(manifest), None));
                }
                Err(e) => warn!(error = %e, "Persisted decoder description does not decode"),
            },
            Err(e) => debug!(error = %e, "No persisted decoder description"),
        }
        match persistency.read_blob(DataType::CampaignList) {
            Ok(bytes) => match decode_campaign_list(&bytes) {
                Ok(list) => {
                    info!(campaigns = list.campaigns.len(), "Restored persisted campaign list");
                    self.lock_pending().campaign_list = Some((Arc::new(list), None));
                }
                Err(e) => warn!(error = %e, "Persisted campaign list does not decode"),
            },
            Err(e) => debug!(error = %e, "No persisted campaign list"),
        }
        self.notify.notify_one();
    }

    /// Scheduling loop: apply pending input, walk the timeline, sleep until
    /// the next event or the next payload. The sleep is against the
    /// monotonic clock; early wakeups just recompute the remaining time.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut state = RunState::default();
        info!("Campaign manager started");
        loop {
            let next_event_ms = self.drive(&mut state);
            let now_ms = self.clock.monotonic_time_ms();
            let wait_ms = next_event_ms
                .map(|deadline| deadline.saturating_sub(now_ms))
                .unwrap_or(IDLE_WAIT_MS);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms)) => {}
            }
        }
        info!("Campaign manager stopped");
    }

    /// One wakeup's worth of work; returns the monotonic deadline of the
    /// next timeline event.
    pub fn drive(&self, state: &mut RunState) -> Option<u64> {
        let now = self.clock.time_point();

        if !state.checkin_armed {
            state.checkin_armed = true;
            self.arm_checkin(state, now.monotonic_time_ms + self.checkin_interval_ms);
        }

        let (manifest_update, campaigns_update) = {
            let mut pending = self.lock_pending();
            (pending.decoder_manifest.take(), pending.campaign_list.take())
        };

        let enabled_before: Vec<SyncId> = state.enabled.keys().cloned().collect();
        let mut changed = false;

        if let Some((manifest, payload)) = manifest_update {
            self.persist(DataType::DecoderManifest, payload);
            info!(sync_id = %manifest.sync_id, "Activating decoder description");
            state.manifest = Some(manifest);
            changed = true;
        }
        if let Some((list, payload)) = campaigns_update {
            self.persist(DataType::CampaignList, payload);
            changed |= self.process_campaign_list(state, &list, now);
        }

        changed |= self.check_timeline(state, now);

        if changed {
            let any_disabled = enabled_before
                .iter()
                .any(|sync_id| !state.enabled.contains_key(sync_id));
            if any_disabled {
                // frames pinned only by a now-dead campaign's inspection
                // stage must not linger
                self.raw_buffer.reset_usage_hints(UsageStage::Inspection);
            }
            self.rebuild(state);
        }

        state.timeline.peek().map(|Reverse(event)| event.time_ms)
    }

    fn persist(&self, data_type: DataType, payload: Option<Vec<u8>>) {
        let (Some(persistency), Some(payload)) = (&self.persistency, payload) else {
            return;
        };
        if let Err(e) = persistency.write_blob(data_type, &payload) {
            warn!(error = %e, ?data_type, "Could not persist cloud payload");
        }
    }

    /// Diff the received list against the known campaigns. Identical
    /// re-receives keep the existing built instance so downstream pointer
    /// comparisons see a no-op; a changed description replaces it.
    fn process_campaign_list(
        &self,
        state: &mut RunState,
        list: &CampaignListDescription,
        now: TimePoint,
    ) -> bool {
        let mut changed = false;

        let incoming: HashSet<&SyncId> = list
            .campaigns
            .iter()
            .map(|campaign| &campaign.campaign_sync_id)
            .collect();
        let known: Vec<SyncId> = state.idle.keys().chain(state.enabled.keys()).cloned().collect();
        for sync_id in known {
            if !incoming.contains(&sync_id) {
                info!(sync_id = %sync_id, "Campaign removed by cloud");
                state.idle.remove(&sync_id);
                state.enabled.remove(&sync_id);
                changed = true;
            }
        }

        for description in &list.campaigns {
            let sync_id = &description.campaign_sync_id;
            let existing = state
                .idle
                .get(sync_id)
                .or_else(|| state.enabled.get(sync_id));
            if let Some(existing) = existing {
                if *existing.description == *description {
                    continue;
                }
                info!(sync_id = %sync_id, "Campaign replaced by newer version");
                state.idle.remove(sync_id);
                state.enabled.remove(sync_id);
                changed = true;
            }

            let built = match BuiltCampaign::build(
                Arc::new(description.clone()),
                &self.partial_signal_counter,
            ) {
                Ok(built) => Arc::new(built),
                Err(e) => {
                    warn!(sync_id = %sync_id, error = %e, "Campaign build failed, dropping it");
                    continue;
                }
            };

            if now.system_time_ms >= built.expiry_time_ms() {
                info!(sync_id = %sync_id, "Campaign already expired, not installing");
                changed = true;
                continue;
            }
            if now.system_time_ms >= built.start_time_ms() {
                debug!(sync_id = %sync_id, "Campaign starts immediately");
                state
                    .timeline
                    .push(Reverse(TimeData {
                        time_ms: now.monotonic_for(built.expiry_time_ms()),
                        id: sync_id.clone(),
                    }));
                state.enabled.insert(sync_id.clone(), built);
            } else {
                debug!(
                    sync_id = %sync_id,
                    start_time = built.start_time_ms(),
                    "Campaign installed as idle"
                );
                state
                    .timeline
                    .push(Reverse(TimeData {
                        time_ms: now.monotonic_for(built.start_time_ms()),
                        id: sync_id.clone(),
                    }));
                state.idle.insert(sync_id.clone(), built);
            }
            changed = true;
        }

        changed
    }

    /// Drain all timeline events due at `now`. Enable/expiry decisions are
    /// re-verified against the wall clock at fire time, so a wall-clock
    /// jump only shifts transitions, never drops them.
    fn check_timeline(&self, state: &mut RunState, now: TimePoint) -> bool {
        let mut changed = false;
        while let Some(Reverse(event)) = state.timeline.peek() {
            if event.time_ms > now.monotonic_time_ms {
                break;
            }
            let Some(Reverse(event)) = state.timeline.pop() else {
                break;
            };

            if event.id == CHECKIN_ID {
                let ok = self.send_checkin(state, now);
                let next = if ok {
                    self.checkin_interval_ms
                } else {
                    CHECKIN_RETRY_INTERVAL_MS
                };
                self.arm_checkin(state, now.monotonic_time_ms + next);
                continue;
            }

            if let Some(campaign) = state.idle.get(&event.id) {
                if now.system_time_ms >= campaign.expiry_time_ms() {
                    info!(sync_id = %event.id, "Campaign expired before it was enabled");
                    state.idle.remove(&event.id);
                    changed = true;
                } else if now.system_time_ms >= campaign.start_time_ms() {
                    info!(
                        sync_id = %event.id,
                        start_time = campaign.start_time_ms(),
                        expiry_time = campaign.expiry_time_ms(),
                        "Enabling campaign"
                    );
                    let expiry_event = TimeData {
                        time_ms: now.monotonic_for(campaign.expiry_time_ms()),
                        id: event.id.clone(),
                    };
                    if let Some(campaign) = state.idle.remove(&event.id) {
                        state.enabled.insert(event.id.clone(), campaign);
                    }
                    state.timeline.push(Reverse(expiry_event));
                    changed = true;
                } else {
                    // early wakeup (wall clock moved backwards); the re-armed
                    // time is strictly in the future, so this cannot spin
                    state.timeline.push(Reverse(TimeData {
                        time_ms: now.monotonic_for(campaign.start_time_ms()),
                        id: event.id.clone(),
                    }));
                    continue;
                }
            } else if let Some(campaign) = state.enabled.get(&event.id) {
                if now.system_time_ms >= campaign.expiry_time_ms() {
                    info!(sync_id = %event.id, "Campaign expired, deleting it");
                    state.enabled.remove(&event.id);
                    changed = true;
                } else {
                    state.timeline.push(Reverse(TimeData {
                        time_ms: now.monotonic_for(campaign.expiry_time_ms()),
                        id: event.id.clone(),
                    }));
                    continue;
                }
            }
            // events for campaigns that were removed meanwhile are stale;
            // drop them silently
        }
        changed
    }

    fn arm_checkin(&self, state: &mut RunState, time_ms: u64) {
        state.timeline.push(Reverse(TimeData {
            time_ms,
            id: CHECKIN_ID.to_string(),
        }));
    }

    /// Emit the list of documents this agent currently holds.
    fn send_checkin(&self, state: &RunState, now: TimePoint) -> bool {
        let mut document_sync_ids: Vec<SyncId> = Vec::new();
        if let Some(manifest) = &state.manifest {
            document_sync_ids.push(manifest.sync_id.clone());
        }
        document_sync_ids.extend(state.enabled.keys().cloned());
        document_sync_ids.extend(state.idle.keys().cloned());

        let payload = encode_checkin(&CheckinDescription {
            timestamp_ms_epoch: now.system_time_ms,
            document_sync_ids,
        });
        let ok = self.checkin_sink.send_checkin(&payload);
        if !ok {
            warn!("Checkin could not be sent, will retry");
        }
        ok
    }

    /// Re-extract and publish the dictionary and the matrix, reconfigure
    /// the raw-data buffer, and fan out the enabled set.
    fn rebuild(&self, state: &RunState) {
        let (dictionary, raw_signals) = self.extract_dictionary(state);
        if let Err(e) = self.raw_buffer.update_config(&raw_signals) {
            warn!(error = %e, "Raw buffer reconfiguration failed");
        }
        info!(
            can_interfaces = dictionary.can_decoder_methods.len(),
            obd_signals = dictionary.obd_pid_formats.len(),
            signals_to_collect = dictionary.signals_to_collect.len(),
            enabled_campaigns = state.enabled.len(),
            idle_campaigns = state.idle.len(),
            "Publishing decoder dictionary and inspection matrix"
        );
        self.dictionary.store(Arc::new(dictionary));
        self.matrix
            .store(Arc::new(InspectionMatrix::extract(state.enabled.values())));

        let active = ActiveCampaigns {
            campaigns: state.enabled.values().map(Arc::clone).collect(),
        };
        for listener in self.lock_listeners().iter() {
            listener(&active);
        }
    }

    /// Walk the enabled campaigns' signal references and resolve each to a
    /// decode rule in the active decoder description.
    fn extract_dictionary(
        &self,
        state: &RunState,
    ) -> (DecoderDictionary, HashMap<SignalId, SignalUpdateConfig>) {
        let mut dictionary = DecoderDictionary::default();
        let mut raw_signals: HashMap<SignalId, SignalUpdateConfig> = HashMap::new();
        let Some(manifest) = &state.manifest else {
            return (dictionary, raw_signals);
        };

        for campaign in state.enabled.values() {
            if campaign.description.decoder_manifest_sync_id != manifest.sync_id {
                warn!(
                    sync_id = %campaign.sync_id(),
                    wants = %campaign.description.decoder_manifest_sync_id,
                    active = %manifest.sync_id,
                    "Campaign references a different decoder description, its signals are not decodable"
                );
                continue;
            }

            for signal_info in &campaign.signals {
                let external_id = campaign.external_signal_id(signal_info.signal_id);
                match manifest.signal_row(external_id) {
                    Some(SignalDecoderRow::Can { message, signal: _ }) => {
                        let format = CanMessageFormat {
                            message_id: message.message_id,
                            size_in_bytes: message.size_in_bytes,
                            signals: message
                                .signals
                                .iter()
                                .map(|s| crate::decoder::can::CanSignalFormat {
                                    signal_id: s.signal_id,
                                    first_bit_position: s.first_bit_position,
                                    size_in_bits: s.size_in_bits,
                                    is_big_endian: s.is_big_endian,
                                    is_signed: s.is_signed,
                                    factor: s.factor,
                                    offset: s.offset,
                                    value_type: s.value_type,
                                })
                                .collect(),
                        };
                        let methods = dictionary
                            .can_decoder_methods
                            .entry(message.interface_id.clone())
                            .or_default();
                        match methods.get_mut(&message.message_id) {
                            None => {
                                methods.insert(
                                    message.message_id,
                                    CanMessageDecoderMethod {
                                        collect_kind: CollectKind::Decode,
                                        format,
                                        raw_signal_id: None,
                                    },
                                );
                            }
                            Some(method) if method.format == format => {
                                if method.collect_kind == CollectKind::Raw {
                                    method.collect_kind = CollectKind::RawAndDecode;
                                }
                            }
                            Some(_) => {
                                warn!(
                                    sync_id = %campaign.sync_id(),
                                    interface = %message.interface_id,
                                    message_id = message.message_id,
                                    signal_id = external_id,
                                    "Conflicting message formats, ignoring this signal"
                                );
                                continue;
                            }
                        }
                        dictionary.signals_to_collect.insert(external_id);
                    }
                    Some(SignalDecoderRow::RawPayload { message }) => {
                        let methods = dictionary
                            .can_decoder_methods
                            .entry(message.interface_id.clone())
                            .or_default();
                        let method =
                            methods.entry(message.message_id).or_insert_with(|| {
                                CanMessageDecoderMethod {
                                    collect_kind: CollectKind::Raw,
                                    format: CanMessageFormat {
                                        message_id: message.message_id,
                                        size_in_bytes: message.size_in_bytes,
                                        signals: Vec::new(),
                                    },
                                    raw_signal_id: Some(external_id),
                                }
                            });
                        if method.collect_kind == CollectKind::Decode {
                            method.collect_kind = CollectKind::RawAndDecode;
                        }
                        method.raw_signal_id = Some(external_id);
                        raw_signals.insert(
                            external_id,
                            SignalUpdateConfig {
                                signal_id: external_id,
                                interface_id: message.interface_id.clone(),
                                message_id: message.message_id.to_string(),
                            },
                        );
                        dictionary.signals_to_collect.insert(external_id);
                        dictionary.signals_to_collect.insert(signal_info.signal_id);
                    }
                    Some(SignalDecoderRow::Obd(pid)) => {
                        dictionary.obd_pid_formats.insert(
                            external_id,
                            crate::decoder::obd::PidDecoderFormat {
                                signal_id: pid.signal_id,
                                mode: pid.mode,
                                pid: pid.pid,
                                start_byte: pid.start_byte,
                                byte_length: pid.byte_length,
                                bit_right_shift: pid.bit_right_shift,
                                bit_mask_length: pid.bit_mask_length,
                                scaling: pid.scaling,
                                offset: pid.offset,
                                value_type: pid.value_type,
                            },
                        );
                        dictionary.signals_to_collect.insert(external_id);
                    }
                    None => {
                        warn!(
                            sync_id = %campaign.sync_id(),
                            signal_id = external_id,
                            "No decoder rule for referenced signal, dropping the reference"
                        );
                    }
                }
            }
        }

        (dictionary, raw_signals)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingInput> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<CampaignsListener>> {
        self.campaigns_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawBufferConfig;
    use crate::metrics::Metrics;
    use crate::rawdata::BufferConfig;
    use crate::time::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        calls: Mutex<Vec<Vec<u8>>>,
        accept: bool,
    }

    impl RecordingSink {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                accept,
            })
        }
    }

    impl CheckinSink for RecordingSink {
        fn send_checkin(&self, payload: &[u8]) -> bool {
            self.calls.lock().unwrap().push(payload.to_vec());
            self.accept
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        manager: Arc<CampaignManager>,
        raw_buffer: Arc<BufferManager>,
        sink: Arc<RecordingSink>,
        state: RunState,
    }

    fn fixture() -> Fixture {
        fixture_with_interval(300_000)
    }

    fn fixture_with_interval(checkin_interval_ms: u64) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let raw_buffer = BufferManager::new(
            BufferConfig::new(&RawBufferConfig::default()).unwrap(),
            clock.clone(),
            Arc::new(Metrics::default()),
        );
        let sink = RecordingSink::new(true);
        let manager = CampaignManager::new(
            clock.clone(),
            Arc::clone(&raw_buffer),
            None,
            sink.clone(),
            checkin_interval_ms,
        );
        Fixture {
            clock,
            manager,
            raw_buffer,
            sink,
            state: RunState::default(),
        }
    }

    fn manifest_payload() -> Vec<u8> {
        json!({
            "sync_id": "dm-1",
            "can_messages": [{
                "interface_id": "can0",
                "message_id": 256,
                "size_in_bytes": 8,
                "signals": [{
                    "signal_id": 1,
                    "first_bit_position": 0,
                    "size_in_bits": 8,
                    "factor": 1.0,
                    "offset": 0.0
                }]
            }, {
                "interface_id": "can0",
                "message_id": 512,
                "size_in_bytes": 64,
                "raw_signal_id": 99
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn campaign_payload(sync_id: &str, start: u64, expiry: u64) -> Vec<u8> {
        json!({
            "campaigns": [{
                "campaign_sync_id": sync_id,
                "campaign_arn": format!("arn:aws:iotfleetwise:eu-west-1:1:campaign/{sync_id}"),
                "decoder_manifest_sync_id": "dm-1",
                "start_time_ms_epoch": start,
                "expiry_time_ms_epoch": expiry,
                "collection_scheme": {"type": "time_based", "period_ms": 1000},
                "signals": [
                    {"signal_id": 1, "sample_buffer_size": 100,
                     "minimum_sample_period_ms": 10, "fixed_window_period_ms": 1000},
                    {"signal_id": 99, "sample_buffer_size": 4,
                     "minimum_sample_period_ms": 0, "fixed_window_period_ms": 0}
                ]
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_campaign_lifecycle_idle_enabled_expired() {
        let mut fixture = fixture();
        let changes = Arc::new(AtomicUsize::new(0));
        let last_count = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let changes = changes.clone();
            let last_count = last_count.clone();
            fixture.manager.subscribe_campaigns_changed(move |active| {
                changes.fetch_add(1, Ordering::SeqCst);
                last_count.store(active.campaigns.len(), Ordering::SeqCst);
            });
        }

        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        fixture
            .manager
            .receive_campaign_list(&campaign_payload("c-1", 1_002_000, 1_005_000))
            .unwrap();

        // now = 1_000_000: campaign is idle, matrix empty
        let next = fixture.manager.drive(&mut fixture.state);
        assert_eq!(fixture.state.idle.len(), 1);
        assert!(fixture.state.enabled.is_empty());
        assert!(fixture.manager.matrix_snapshot().conditions.is_empty());
        assert_eq!(last_count.load(Ordering::SeqCst), 0);
        // next wakeup is the start event, 2s out on the monotonic clock
        assert_eq!(next, Some(2_000));

        // reach start time: enabled, published
        fixture.clock.advance(2_000);
        let next = fixture.manager.drive(&mut fixture.state);
        assert!(fixture.state.idle.is_empty());
        assert_eq!(fixture.state.enabled.len(), 1);
        assert_eq!(fixture.manager.matrix_snapshot().conditions.len(), 1);
        assert_eq!(last_count.load(Ordering::SeqCst), 1);
        // dictionary now decodes message 256 and knows the raw signal
        let dictionary = fixture.manager.dictionary_snapshot();
        assert!(dictionary.can_decoder_method("can0", 256).is_some());
        let (_, raw_method) = dictionary.can_decoder_method("can0", 512).unwrap();
        assert_eq!(raw_method.raw_signal_id, Some(99));
        assert!(dictionary.signals_to_collect.contains(&1));
        // raw buffer allocated a buffer for the raw signal
        fixture.raw_buffer.push(99, b"blob", 1).unwrap();
        // expiry event pending, 3s out
        assert_eq!(next, Some(5_000));

        // reach expiry: removed, everything unpublished
        fixture.clock.advance(3_000);
        fixture.manager.drive(&mut fixture.state);
        assert!(fixture.state.enabled.is_empty());
        assert!(fixture.manager.matrix_snapshot().conditions.is_empty());
        assert!(fixture.manager.dictionary_snapshot().is_empty());
        assert_eq!(last_count.load(Ordering::SeqCst), 0);
        assert!(changes.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_identical_reconfigure_is_noop() {
        let mut fixture = fixture();
        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        let payload = campaign_payload("c-1", 900_000, 2_000_000);
        fixture.manager.receive_campaign_list(&payload).unwrap();
        fixture.manager.drive(&mut fixture.state);
        let first = Arc::clone(fixture.state.enabled.get("c-1").unwrap());

        let changes = Arc::new(AtomicUsize::new(0));
        {
            let changes = changes.clone();
            fixture
                .manager
                .subscribe_campaigns_changed(move |_| {
                    changes.fetch_add(1, Ordering::SeqCst);
                });
        }

        // same list again: same built instance, no publication
        fixture.manager.receive_campaign_list(&payload).unwrap();
        fixture.manager.drive(&mut fixture.state);
        assert!(Arc::ptr_eq(
            &first,
            fixture.state.enabled.get("c-1").unwrap()
        ));
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        // a modified version replaces the instance
        fixture
            .manager
            .receive_campaign_list(&campaign_payload("c-1", 900_000, 3_000_000))
            .unwrap();
        fixture.manager.drive(&mut fixture.state);
        assert!(!Arc::ptr_eq(
            &first,
            fixture.state.enabled.get("c-1").unwrap()
        ));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_list_removes_campaigns() {
        let mut fixture = fixture();
        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        fixture
            .manager
            .receive_campaign_list(&campaign_payload("c-1", 900_000, 2_000_000))
            .unwrap();
        fixture.manager.drive(&mut fixture.state);
        assert_eq!(fixture.state.enabled.len(), 1);

        fixture
            .manager
            .receive_campaign_list(b"{\"campaigns\": []}")
            .unwrap();
        fixture.manager.drive(&mut fixture.state);
        assert!(fixture.state.enabled.is_empty());
        assert!(fixture.state.idle.is_empty());
    }

    #[test]
    fn test_build_failure_is_local_to_campaign() {
        let mut fixture = fixture();
        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        let payload = json!({
            "campaigns": [
                // expiry before start: dropped
                {
                    "campaign_sync_id": "bad",
                    "decoder_manifest_sync_id": "dm-1",
                    "start_time_ms_epoch": 2_000_000u64,
                    "expiry_time_ms_epoch": 1_500_000u64,
                    "collection_scheme": {"type": "time_based", "period_ms": 1000},
                    "signals": []
                },
                {
                    "campaign_sync_id": "good",
                    "decoder_manifest_sync_id": "dm-1",
                    "start_time_ms_epoch": 900_000u64,
                    "expiry_time_ms_epoch": 2_000_000u64,
                    "collection_scheme": {"type": "time_based", "period_ms": 1000},
                    "signals": [{"signal_id": 1, "sample_buffer_size": 1,
                                 "minimum_sample_period_ms": 0, "fixed_window_period_ms": 0}]
                }
            ]
        })
        .to_string()
        .into_bytes();
        fixture.manager.receive_campaign_list(&payload).unwrap();
        fixture.manager.drive(&mut fixture.state);
        assert!(fixture.state.enabled.contains_key("good"));
        assert!(!fixture.state.enabled.contains_key("bad"));
        assert!(!fixture.state.idle.contains_key("bad"));
    }

    #[test]
    fn test_missing_decoder_rule_drops_reference_not_campaign() {
        let mut fixture = fixture();
        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        let payload = json!({
            "campaigns": [{
                "campaign_sync_id": "c-1",
                "decoder_manifest_sync_id": "dm-1",
                "start_time_ms_epoch": 900_000u64,
                "expiry_time_ms_epoch": 2_000_000u64,
                "collection_scheme": {"type": "time_based", "period_ms": 1000},
                "signals": [
                    {"signal_id": 1, "sample_buffer_size": 1,
                     "minimum_sample_period_ms": 0, "fixed_window_period_ms": 0},
                    {"signal_id": 777, "sample_buffer_size": 1,
                     "minimum_sample_period_ms": 0, "fixed_window_period_ms": 0}
                ]
            }]
        })
        .to_string()
        .into_bytes();
        fixture.manager.receive_campaign_list(&payload).unwrap();
        fixture.manager.drive(&mut fixture.state);

        assert_eq!(fixture.state.enabled.len(), 1);
        let dictionary = fixture.manager.dictionary_snapshot();
        assert!(dictionary.signals_to_collect.contains(&1));
        assert!(!dictionary.signals_to_collect.contains(&777));
    }

    #[test]
    fn test_checkin_fires_and_retries() {
        let mut fixture = fixture_with_interval(10_000);
        fixture.manager.receive_decoder_manifest(&manifest_payload()).unwrap();
        fixture
            .manager
            .receive_campaign_list(&campaign_payload("c-1", 900_000, 9_000_000))
            .unwrap();
        let next = fixture.manager.drive(&mut fixture.state);
        // first checkin armed one interval out
        assert_eq!(next, Some(10_000));

        fixture.clock.advance(10_000);
        fixture.manager.drive(&mut fixture.state);
        let calls = fixture.sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let checkin: CheckinDescription = serde_json::from_slice(&calls[0]).unwrap();
        assert!(checkin.document_sync_ids.contains(&"dm-1".to_string()));
        assert!(checkin.document_sync_ids.contains(&"c-1".to_string()));
        drop(calls);

        // a failing sink re-arms at the retry interval
        let mut failing = fixture_with_interval(10_000);
        failing.sink = RecordingSink::new(false);
        let manager = CampaignManager::new(
            failing.clock.clone(),
            Arc::clone(&failing.raw_buffer),
            None,
            failing.sink.clone(),
            10_000,
        );
        let mut state = RunState::default();
        manager.drive(&mut state);
        failing.clock.advance(10_000);
        let next = manager.drive(&mut state);
        assert_eq!(failing.sink.calls.lock().unwrap().len(), 1);
        // retry is 5s out, not a full interval
        assert_eq!(next, Some(failing.clock.monotonic_time_ms() + 5_000));
    }
}
