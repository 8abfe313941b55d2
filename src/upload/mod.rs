//! S3 Streaming Sender
//!
//! Bounded-concurrency uploader. `send_stream` queues a deferred payload
//! builder; the sender drains the queue while fewer than the configured
//! number of uploads are in flight, materializing each payload at start.
//! Every upload gets one retry; a final failure hands the retained payload
//! back to the caller so a higher-level persistence path can keep the
//! data. `disconnect` drops the queue, cancels everything in flight, and
//! waits for the transport to confirm completion.

pub mod streambuf;
pub mod transfer;

pub use streambuf::{
    LoanedFrameStreambufBuilder, OwnedStreambufBuilder, Streambuf, StreambufBuilder,
};
pub use transfer::{
    CreateTransferClient, HttpTransferClient, TransferClient, TransferClientConfig,
    TransferStatus, TransferStatusCallback,
};

use crate::metrics::Metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{error, info, warn};

/// Retry budget per upload (first attempt included).
const MAX_ATTEMPTS: u8 = 2;

/// Outcome delivered to the result callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Success,
    /// The builder produced no data (expired upstream) or the metadata is
    /// unusable.
    WrongInputData,
    /// Failed after the retry budget, or canceled.
    TransmissionError,
    /// Bucket or region missing.
    NotConfigured,
}

/// Invoked exactly once per accepted upload. On failure the retained
/// payload rides along so callers can persist it.
pub type ResultCallback = Box<dyn FnOnce(UploadResult, Option<Streambuf>) + Send>;

/// Where an upload goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct S3UploadMetadata {
    pub bucket_name: String,
    pub prefix: String,
    pub region: String,
    pub bucket_owner: String,
}

/// Sender tuning, from the agent config.
#[derive(Debug, Clone)]
pub struct S3SenderConfig {
    pub max_simultaneous_uploads: usize,
    pub part_size_bytes: u64,
    pub connect_timeout_ms: u64,
}

/// Object key for one upload: `<prefix><event_id>-<trigger_time><ext>`.
/// A single leading slash in the configured prefix is dropped; S3 keys do
/// not start with one.
pub fn object_key(
    metadata: &S3UploadMetadata,
    event_id: u64,
    trigger_time_ms: u64,
    extension: &str,
) -> String {
    let prefix = metadata
        .prefix
        .strip_prefix('/')
        .unwrap_or(metadata.prefix.as_str());
    format!("{prefix}{event_id}-{trigger_time_ms}{extension}")
}

struct QueuedUpload {
    builder: Box<dyn StreambufBuilder>,
    metadata: S3UploadMetadata,
    object_key: String,
    callback: ResultCallback,
}

struct OngoingUpload {
    streambuf: Streambuf,
    metadata: S3UploadMetadata,
    callback: Option<ResultCallback>,
    client: Arc<dyn TransferClient>,
    attempts: u8,
}

#[derive(Default)]
struct SenderState {
    queued: VecDeque<QueuedUpload>,
    ongoing: HashMap<String, OngoingUpload>,
    clients_by_region: HashMap<String, Arc<dyn TransferClient>>,
}

pub struct S3Sender {
    config: S3SenderConfig,
    create_client: CreateTransferClient,
    metrics: Arc<Metrics>,
    state: Mutex<SenderState>,
    weak_self: Weak<S3Sender>,
}

enum QueueAction {
    Start {
        client: Arc<dyn TransferClient>,
        data: Streambuf,
        bucket: String,
        object_key: String,
    },
    Reject {
        object_key: String,
        callback: ResultCallback,
    },
}

impl S3Sender {
    pub fn new(
        create_client: CreateTransferClient,
        config: S3SenderConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            create_client,
            metrics,
            state: Mutex::new(SenderState::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// Queue one upload and start it as soon as a slot frees up.
    pub fn send_stream(
        &self,
        builder: Box<dyn StreambufBuilder>,
        metadata: S3UploadMetadata,
        object_key: String,
        callback: ResultCallback,
    ) {
        if metadata.bucket_name.is_empty() || metadata.region.is_empty() {
            warn!(key = %object_key, "Upload has no bucket or region configured");
            callback(UploadResult::NotConfigured, None);
            return;
        }

        {
            let mut state = self.lock();
            info!(
                key = %object_key,
                bucket = %metadata.bucket_name,
                queue_len = state.queued.len(),
                "Queuing upload"
            );
            state.queued.push_back(QueuedUpload {
                builder,
                metadata,
                object_key,
                callback,
            });
            Metrics::set(&self.metrics.queued_uploads, state.queued.len() as u64);
        }

        self.submit_queued_uploads();
    }

    /// Drop all queued uploads, cancel every ongoing one, and block until
    /// the transport confirms completion. After this returns, no upload is
    /// ongoing and every accepted upload has seen its callback exactly
    /// once.
    pub async fn disconnect(&self) {
        info!("Disconnecting the upload sender");
        let clients: Vec<Arc<dyn TransferClient>> = {
            let mut state = self.lock();
            let dropped = state.queued.len();
            if dropped > 0 {
                warn!(dropped, "Dropping queued uploads on disconnect");
            }
            state.queued.clear();
            Metrics::set(&self.metrics.queued_uploads, 0);
            state
                .ongoing
                .values()
                .map(|upload| Arc::clone(&upload.client))
                .collect()
        };

        for client in clients {
            info!("Cancelling ongoing uploads and waiting for them to finish");
            client.cancel_all();
            client.wait_until_all_finished().await;
        }

        // A transport that failed to deliver terminal statuses must not
        // leave uploads dangling; surface them as failed exactly once.
        let leftovers: Vec<OngoingUpload> = {
            let mut state = self.lock();
            state.ongoing.drain().map(|(_, upload)| upload).collect()
        };
        for mut upload in leftovers {
            if let Some(callback) = upload.callback.take() {
                callback(UploadResult::TransmissionError, Some(upload.streambuf));
            }
        }
        info!("Upload sender disconnected");
    }

    /// Start queued uploads while slots are free. Callbacks and transport
    /// calls happen outside the lock.
    fn submit_queued_uploads(&self) {
        loop {
            let action = {
                let mut state = self.lock();
                if state.ongoing.len() >= self.config.max_simultaneous_uploads {
                    None
                } else {
                    self.next_action(&mut state)
                }
            };
            match action {
                None => break,
                Some(QueueAction::Reject {
                    object_key,
                    callback,
                }) => {
                    warn!(
                        key = %object_key,
                        "Skipping upload, its data is not available anymore"
                    );
                    callback(UploadResult::WrongInputData, None);
                }
                Some(QueueAction::Start {
                    client,
                    data,
                    bucket,
                    object_key,
                }) => {
                    info!(key = %object_key, bucket = %bucket, "Starting upload");
                    client.upload(data, &bucket, &object_key);
                }
            }
        }
    }

    fn next_action(&self, state: &mut SenderState) -> Option<QueueAction> {
        let mut queued = state.queued.pop_front()?;
        Metrics::set(&self.metrics.queued_uploads, state.queued.len() as u64);

        let Some(streambuf) = queued.builder.build() else {
            return Some(QueueAction::Reject {
                object_key: queued.object_key,
                callback: queued.callback,
            });
        };

        let client = self.client_for_region(state, &queued.metadata);
        state.ongoing.insert(
            queued.object_key.clone(),
            OngoingUpload {
                streambuf: streambuf.clone(),
                metadata: queued.metadata.clone(),
                callback: Some(queued.callback),
                client: Arc::clone(&client),
                attempts: 1,
            },
        );
        Some(QueueAction::Start {
            client,
            data: streambuf,
            bucket: queued.metadata.bucket_name,
            object_key: queued.object_key,
        })
    }

    fn client_for_region(
        &self,
        state: &mut SenderState,
        metadata: &S3UploadMetadata,
    ) -> Arc<dyn TransferClient> {
        if let Some(client) = state.clients_by_region.get(&metadata.region) {
            return Arc::clone(client);
        }

        let weak = self.weak_self.clone();
        let status_callback: TransferStatusCallback = Arc::new(move |object_key, status| {
            if let Some(sender) = weak.upgrade() {
                sender.transfer_status_updated(object_key, status);
            }
        });
        let client = (self.create_client)(
            &TransferClientConfig {
                region: metadata.region.clone(),
                bucket_owner: metadata.bucket_owner.clone(),
                connect_timeout_ms: self.config.connect_timeout_ms,
                part_size_bytes: self.config.part_size_bytes,
            },
            status_callback,
        );
        state
            .clients_by_region
            .insert(metadata.region.clone(), Arc::clone(&client));
        client
    }

    /// Transport status pump. Runs on the transport's threads and re-enters
    /// the sender state under the mutex.
    fn transfer_status_updated(&self, object_key: &str, status: TransferStatus) {
        if matches!(status, TransferStatus::NotStarted | TransferStatus::InProgress) {
            return;
        }

        if status == TransferStatus::Failed {
            let retry = {
                let mut state = self.lock();
                match state.ongoing.get_mut(object_key) {
                    Some(upload) if upload.attempts < MAX_ATTEMPTS => {
                        upload.attempts += 1;
                        Some((
                            Arc::clone(&upload.client),
                            upload.streambuf.clone(),
                            upload.metadata.bucket_name.clone(),
                        ))
                    }
                    _ => None,
                }
            };
            if let Some((client, data, bucket)) = retry {
                info!(key = object_key, "Retrying upload");
                client.retry_upload(data, &bucket, object_key);
                return;
            }
        }

        let finished = {
            let mut state = self.lock();
            state.ongoing.remove(object_key)
        };
        let Some(mut finished) = finished else {
            error!(key = object_key, status = %status, "Status for unknown upload");
            return;
        };

        self.submit_queued_uploads();

        let result = if status == TransferStatus::Completed {
            info!(key = object_key, "Finished upload");
            UploadResult::Success
        } else {
            error!(key = object_key, status = %status, "Upload did not complete");
            Metrics::increment(&self.metrics.failed_uploads);
            UploadResult::TransmissionError
        };
        if let Some(callback) = finished.callback.take() {
            callback(result, Some(finished.streambuf));
        }
    }

    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Test transport: records calls, lets the test deliver statuses.
    struct MockTransferClient {
        status_callback: TransferStatusCallback,
        uploads: StdMutex<Vec<(String, Vec<u8>)>>,
        retries: StdMutex<Vec<(String, Vec<u8>)>>,
        outstanding: StdMutex<Vec<String>>,
        canceled: AtomicBool,
    }

    impl MockTransferClient {
        fn complete(&self, key: &str) {
            self.finish(key, TransferStatus::Completed);
        }

        fn fail(&self, key: &str) {
            (self.status_callback)(key, TransferStatus::Failed);
        }

        fn finish(&self, key: &str, status: TransferStatus) {
            self.outstanding.lock().unwrap().retain(|k| k != key);
            (self.status_callback)(key, status);
        }

        fn upload_keys(&self) -> Vec<String> {
            self.uploads.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl TransferClient for MockTransferClient {
        fn upload(&self, data: Streambuf, _bucket: &str, object_key: &str) {
            self.uploads
                .lock()
                .unwrap()
                .push((object_key.to_string(), data.bytes().to_vec()));
            self.outstanding.lock().unwrap().push(object_key.to_string());
        }

        fn retry_upload(&self, data: Streambuf, _bucket: &str, object_key: &str) {
            self.retries
                .lock()
                .unwrap()
                .push((object_key.to_string(), data.bytes().to_vec()));
        }

        fn cancel_all(&self) {
            self.canceled.store(true, Ordering::SeqCst);
        }

        async fn wait_until_all_finished(&self) {
            // deliver a terminal status for everything still outstanding
            let outstanding: Vec<String> =
                self.outstanding.lock().unwrap().drain(..).collect();
            for key in outstanding {
                (self.status_callback)(&key, TransferStatus::Canceled);
            }
        }
    }

    struct Harness {
        sender: Arc<S3Sender>,
        client: Arc<StdMutex<Option<Arc<MockTransferClient>>>>,
        results: Arc<StdMutex<Vec<(String, UploadResult, Option<Vec<u8>>)>>>,
    }

    impl Harness {
        fn new(max_simultaneous_uploads: usize) -> Self {
            let client: Arc<StdMutex<Option<Arc<MockTransferClient>>>> =
                Arc::new(StdMutex::new(None));
            let client_slot = Arc::clone(&client);
            let create_client: CreateTransferClient =
                Box::new(move |_config, status_callback| {
                    let mock = Arc::new(MockTransferClient {
                        status_callback,
                        uploads: StdMutex::new(Vec::new()),
                        retries: StdMutex::new(Vec::new()),
                        outstanding: StdMutex::new(Vec::new()),
                        canceled: AtomicBool::new(false),
                    });
                    *client_slot.lock().unwrap() = Some(Arc::clone(&mock));
                    mock
                });
            let sender = S3Sender::new(
                create_client,
                S3SenderConfig {
                    max_simultaneous_uploads,
                    part_size_bytes: 5 * 1024 * 1024,
                    connect_timeout_ms: 1000,
                },
                Arc::new(Metrics::default()),
            );
            Self {
                sender,
                client,
                results: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn send(&self, key: &str, payload: &[u8]) {
            let results = Arc::clone(&self.results);
            let key_owned = key.to_string();
            self.sender.send_stream(
                OwnedStreambufBuilder::new(payload.to_vec()),
                metadata(),
                key.to_string(),
                Box::new(move |result, streambuf| {
                    results.lock().unwrap().push((
                        key_owned,
                        result,
                        streambuf.map(|s| s.bytes().to_vec()),
                    ));
                }),
            );
        }

        fn client(&self) -> Arc<MockTransferClient> {
            Arc::clone(self.client.lock().unwrap().as_ref().unwrap())
        }
    }

    fn metadata() -> S3UploadMetadata {
        S3UploadMetadata {
            bucket_name: "bucket".to_string(),
            prefix: "prefix/".to_string(),
            region: "eu-west-1".to_string(),
            bucket_owner: "123456789012".to_string(),
        }
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key(&metadata(), 7, 1234, ".10n"), "prefix/7-1234.10n");
        let mut slashed = metadata();
        slashed.prefix = "/deep/prefix/".to_string();
        assert_eq!(
            object_key(&slashed, 7, 1234, ".10n"),
            "deep/prefix/7-1234.10n"
        );
    }

    #[test]
    fn test_uploads_are_serialized_one_at_a_time() {
        let harness = Harness::new(1);
        harness.send("k1", b"one");
        harness.send("k2", b"two");
        harness.send("k3", b"three");

        let client = harness.client();
        // exactly one upload in flight
        assert_eq!(client.upload_keys(), vec!["k1"]);

        client.complete("k1");
        assert_eq!(client.upload_keys(), vec!["k1", "k2"]);
        client.complete("k2");
        assert_eq!(client.upload_keys(), vec!["k1", "k2", "k3"]);
        client.complete("k3");

        let results = harness.results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|(_, result, _)| *result == UploadResult::Success));
        // each callback fired exactly once, in completion order
        let keys: Vec<&str> = results.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_retry_once_then_surface_failure_with_data() {
        let harness = Harness::new(1);
        harness.send("k1", b"payload-bytes");
        let client = harness.client();

        // first failure triggers exactly one retry with the retained bytes
        client.fail("k1");
        {
            let retries = client.retries.lock().unwrap();
            assert_eq!(retries.len(), 1);
            assert_eq!(retries[0].1, b"payload-bytes");
        }
        assert!(harness.results.lock().unwrap().is_empty());

        // second failure exhausts the budget
        client.fail("k1");
        let results = harness.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        let (key, result, streambuf) = &results[0];
        assert_eq!(key, "k1");
        assert_eq!(*result, UploadResult::TransmissionError);
        // the payload is handed back for persistence
        assert_eq!(streambuf.as_deref(), Some(&b"payload-bytes"[..]));
        // no further retry happened
        assert_eq!(client.retries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_builder_reports_wrong_input_and_continues() {
        let harness = Harness::new(1);
        let results = Arc::clone(&harness.results);
        harness.sender.send_stream(
            OwnedStreambufBuilder::expired(),
            metadata(),
            "gone".to_string(),
            Box::new(move |result, streambuf| {
                results.lock().unwrap().push((
                    "gone".to_string(),
                    result,
                    streambuf.map(|s| s.bytes().to_vec()),
                ));
            }),
        );
        harness.send("k2", b"ok");

        let results = harness.results.lock().unwrap();
        assert_eq!(results[0].1, UploadResult::WrongInputData);
        // the queue kept draining past the expired entry
        assert_eq!(harness.client().upload_keys(), vec!["k2"]);
    }

    #[test]
    fn test_missing_bucket_reports_not_configured() {
        let harness = Harness::new(1);
        let results = Arc::clone(&harness.results);
        harness.sender.send_stream(
            OwnedStreambufBuilder::new(b"data".to_vec()),
            S3UploadMetadata::default(),
            "k".to_string(),
            Box::new(move |result, _| {
                results.lock().unwrap().push(("k".to_string(), result, None));
            }),
        );
        assert_eq!(
            harness.results.lock().unwrap()[0].1,
            UploadResult::NotConfigured
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_drains() {
        let harness = Harness::new(1);
        harness.send("k1", b"in-flight");
        harness.send("k2", b"queued");

        harness.sender.disconnect().await;

        let client = harness.client();
        assert!(client.canceled.load(Ordering::SeqCst));
        let results = harness.results.lock().unwrap();
        // the in-flight upload failed exactly once; the queued one was
        // dropped without a callback
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "k1");
        assert_eq!(results[0].1, UploadResult::TransmissionError);
        // nothing is ongoing afterwards
        assert!(harness.sender.lock().ongoing.is_empty());
        assert!(harness.sender.lock().queued.is_empty());
    }
}
