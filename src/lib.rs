//! fleet-edge: on-vehicle telemetry edge agent
//!
//! Ingests signal frames from in-vehicle networks according to a
//! cloud-supplied decoder description, evaluates cloud-supplied collection
//! campaigns against the live signal stream, persists selected data to
//! partitioned on-disk streams, and forwards it to object storage with
//! at-least-once delivery.
//!
//! ## Architecture
//!
//! - **RawDataBuffer**: reference-counted per-signal arena for large opaque
//!   payloads with loans, usage hints, and budgeted eviction
//! - **CampaignManager**: compiles cloud campaigns, drives the
//!   enable/expire timeline, publishes the decoder dictionary and the
//!   inspection matrix
//! - **StreamEngine**: append-only per-partition logs with checkpointed
//!   readers and TTL pruning
//! - **S3Sender**: bounded-concurrency uploader with deferred payload
//!   materialization and a one-retry budget

pub mod agent;
pub mod campaign;
pub mod config;
pub mod decoder;
pub mod fatal;
pub mod ingest;
pub mod metrics;
pub mod persistency;
pub mod rawdata;
pub mod streams;
pub mod time;
pub mod types;
pub mod upload;

// Re-export the assembled runtime
pub use agent::Agent;
pub use config::AgentConfig;

// Re-export the core subsystem entry points
pub use campaign::{ActiveCampaigns, BuiltCampaign, CampaignManager};
pub use decoder::DecoderDictionary;
pub use rawdata::{BufferError, BufferManager, LoanedFrame};
pub use streams::{DataToPersist, StreamEngine, StreamError};
pub use upload::{S3Sender, S3UploadMetadata, UploadResult};
