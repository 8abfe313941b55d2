//! Deferred upload payloads
//!
//! A `StreambufBuilder` materializes the bytes of an upload only when the
//! upload actually starts, not when it is queued. Queued uploads therefore
//! tolerate upstream eviction gracefully: if the source data is gone by the
//! time the queue drains, `build` returns `None` and the upload is skipped
//! instead of shipping garbage.

use crate::rawdata::{BufferManager, UsageStage};
use crate::types::{BufferHandle, SignalId};
use std::sync::Arc;
use tracing::warn;

/// A re-readable upload payload. Cloning is cheap; retries re-read the same
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streambuf {
    data: Arc<Vec<u8>>,
}

impl Streambuf {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Deferred byte-stream construction; `None` means the data is not
/// available any more.
pub trait StreambufBuilder: Send {
    fn build(&mut self) -> Option<Streambuf>;
}

/// Builder over bytes that already exist (persisted payloads, tests).
pub struct OwnedStreambufBuilder {
    data: Option<Vec<u8>>,
}

impl OwnedStreambufBuilder {
    pub fn new(data: Vec<u8>) -> Box<Self> {
        Box::new(Self { data: Some(data) })
    }

    /// A builder that always fails, standing in for expired data.
    pub fn expired() -> Box<Self> {
        Box::new(Self { data: None })
    }
}

impl StreambufBuilder for OwnedStreambufBuilder {
    fn build(&mut self) -> Option<Streambuf> {
        self.data.take().map(Streambuf::new)
    }
}

/// Builder that borrows a raw-data frame at upload start. Holds an
/// UPLOADING usage hint from construction until `build` runs, then trades
/// it for a copy of the payload; if the frame was evicted anyway (tier-two
/// eviction under memory pressure), `build` reports the data as gone.
pub struct LoanedFrameStreambufBuilder {
    manager: Arc<BufferManager>,
    signal_id: SignalId,
    handle: BufferHandle,
    hint_held: bool,
}

impl LoanedFrameStreambufBuilder {
    pub fn new(
        manager: Arc<BufferManager>,
        signal_id: SignalId,
        handle: BufferHandle,
    ) -> Box<Self> {
        let hint_held = manager.increase_usage_hint(signal_id, handle, UsageStage::Uploading);
        if !hint_held {
            warn!(signal_id, handle, "Could not pin frame for upload");
        }
        Box::new(Self {
            manager,
            signal_id,
            handle,
            hint_held,
        })
    }

    fn release_hint(&mut self) {
        if self.hint_held {
            self.hint_held = false;
            self.manager
                .decrease_usage_hint(self.signal_id, self.handle, UsageStage::Uploading);
        }
    }
}

impl StreambufBuilder for LoanedFrameStreambufBuilder {
    fn build(&mut self) -> Option<Streambuf> {
        let loan = self.manager.borrow(self.signal_id, self.handle);
        let streambuf = loan.map(|loan| Streambuf::new(loan.bytes().to_vec()));
        self.release_hint();
        streambuf
    }
}

impl Drop for LoanedFrameStreambufBuilder {
    fn drop(&mut self) {
        self.release_hint();
    }
}
