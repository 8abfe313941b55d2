//! Transfer client seam
//!
//! The sender core drives uploads through this trait so the concrete
//! transport stays swappable (and mockable in tests). The production
//! implementation performs object PUTs over reqwest, carrying the
//! expected-bucket-owner guard on every request, and delivers status
//! transitions through the callback registered at construction.

use super::streambuf::Streambuf;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of one transfer, delivered through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Canceled,
    Aborted,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::NotStarted => "not started",
            TransferStatus::InProgress => "in progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
            TransferStatus::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Receives `(object_key, status)` transitions; may be invoked from the
/// client's own tasks.
pub type TransferStatusCallback = Arc<dyn Fn(&str, TransferStatus) + Send + Sync>;

/// Per-region client settings.
#[derive(Debug, Clone)]
pub struct TransferClientConfig {
    pub region: String,
    pub bucket_owner: String,
    pub connect_timeout_ms: u64,
    pub part_size_bytes: u64,
}

/// One upload transport. Implementations deliver a terminal status for
/// every started upload, including canceled ones.
#[async_trait]
pub trait TransferClient: Send + Sync {
    fn upload(&self, data: Streambuf, bucket: &str, object_key: &str);

    /// Re-drive a failed upload with the retained payload.
    fn retry_upload(&self, data: Streambuf, bucket: &str, object_key: &str);

    fn cancel_all(&self);

    /// Resolve once every started upload has reached a terminal status.
    async fn wait_until_all_finished(&self);
}

/// Factory for per-region clients, created lazily by the sender.
pub type CreateTransferClient =
    Box<dyn Fn(&TransferClientConfig, TransferStatusCallback) -> Arc<dyn TransferClient> + Send + Sync>;

/// Production transfer client: object PUT per upload.
pub struct HttpTransferClient {
    http: reqwest::Client,
    config: TransferClientConfig,
    status_callback: TransferStatusCallback,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTransferClient {
    pub fn create(
        config: &TransferClientConfig,
        status_callback: TransferStatusCallback,
    ) -> Arc<dyn TransferClient> {
        info!(region = %config.region, "Creating object storage client");
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(config.connect_timeout_ms))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            http,
            config: config.clone(),
            status_callback,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn object_url(&self, bucket: &str, object_key: &str) -> String {
        format!(
            "https://{bucket}.s3.{region}.amazonaws.com/{object_key}",
            region = self.config.region
        )
    }

    fn start(&self, data: Streambuf, bucket: &str, object_key: &str) {
        if data.len() as u64 >= self.config.part_size_bytes {
            debug!(
                key = object_key,
                size = data.len(),
                threshold = self.config.part_size_bytes,
                "Payload exceeds the multipart threshold, uploading as one stream"
            );
        }
        let url = self.object_url(bucket, object_key);
        let request = self
            .http
            .put(url)
            .header("x-amz-expected-bucket-owner", &self.config.bucket_owner)
            .header("content-type", "application/octet-stream")
            .body(data.bytes().to_vec());

        let status_callback = Arc::clone(&self.status_callback);
        let cancel = self.cancel.clone();
        let key = object_key.to_string();
        let task = tokio::spawn(async move {
            status_callback(&key, TransferStatus::InProgress);
            let status = tokio::select! {
                _ = cancel.cancelled() => TransferStatus::Canceled,
                result = request.send() => match result {
                    Ok(response) if response.status().is_success() => TransferStatus::Completed,
                    Ok(response) => {
                        warn!(key = %key, status = %response.status(), "Upload rejected");
                        TransferStatus::Failed
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Upload failed");
                        TransferStatus::Failed
                    }
                },
            };
            status_callback(&key, status);
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    fn upload(&self, data: Streambuf, bucket: &str, object_key: &str) {
        self.start(data, bucket, object_key);
    }

    fn retry_upload(&self, data: Streambuf, bucket: &str, object_key: &str) {
        self.start(data, bucket, object_key);
    }

    fn cancel_all(&self) {
        self.cancel.cancel();
    }

    async fn wait_until_all_finished(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        let _ = futures::future::join_all(tasks).await;
    }
}
