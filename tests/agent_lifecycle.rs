//! End-to-end agent lifecycle: cloud payload ingestion, stream creation,
//! decode path, persisted replay across restarts.

use fleet_edge::agent::{Agent, NullFrameSink};
use fleet_edge::config::AgentConfig;
use fleet_edge::streams::{DataToPersist, StreamError};
use fleet_edge::types::{CollectedFrame, CollectedFrameSink};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAMPAIGN_ARN: &str = "arn:aws:iotfleetwise:eu-west-1:1:campaign/itest-campaign";

fn config_for(root: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.persistency.root_dir = root.to_path_buf();
    config
}

fn manifest_payload() -> Vec<u8> {
    json!({
        "sync_id": "dm-itest",
        "can_messages": [{
            "interface_id": "can0",
            "message_id": 256,
            "size_in_bytes": 8,
            "signals": [{
                "signal_id": 1,
                "first_bit_position": 0,
                "size_in_bits": 16,
                "factor": 0.1,
                "offset": -10.0
            }]
        }]
    })
    .to_string()
    .into_bytes()
}

fn campaign_payload() -> Vec<u8> {
    json!({
        "campaigns": [{
            "campaign_sync_id": "itest-campaign",
            "campaign_arn": CAMPAIGN_ARN,
            "decoder_manifest_sync_id": "dm-itest",
            "start_time_ms_epoch": 0,
            "expiry_time_ms_epoch": u64::MAX,
            "collection_scheme": {"type": "time_based", "period_ms": 1000},
            "signals": [{
                "signal_id": 1,
                "sample_buffer_size": 100,
                "minimum_sample_period_ms": 0,
                "fixed_window_period_ms": 0,
                "data_partition_id": 0
            }],
            "store_and_forward_configuration": [{
                "storage_options": {
                    "storage_location": "partition-0",
                    "maximum_size_in_bytes": 1048576,
                    "minimum_time_to_live_in_seconds": 0
                }
            }]
        }]
    })
    .to_string()
    .into_bytes()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within two seconds");
}

struct RecordingSink {
    frames: Mutex<Vec<CollectedFrame>>,
}

impl CollectedFrameSink for RecordingSink {
    fn push(&self, frame: CollectedFrame) {
        self.frames.lock().unwrap().push(frame);
    }
}

#[tokio::test]
async fn campaign_activation_decode_and_store() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink {
        frames: Mutex::new(Vec::new()),
    });
    let agent = Agent::start(&config_for(tmp.path()), sink.clone(), None).unwrap();

    agent
        .campaign_manager
        .receive_decoder_manifest(&manifest_payload())
        .unwrap();
    agent
        .campaign_manager
        .receive_campaign_list(&campaign_payload())
        .unwrap();

    // the manager task picks the payloads up and creates the stream
    let stream_engine = Arc::clone(&agent.stream_engine);
    wait_until(move || stream_engine.has_campaign(CAMPAIGN_ARN)).await;
    assert_eq!(
        agent.stream_engine.partition_ids(CAMPAIGN_ARN).len(),
        1
    );

    // the published dictionary decodes bus traffic now
    agent
        .ingestion
        .ingest("can0", 0, 256, &[0xE8, 0x03, 0, 0, 0, 0, 0, 0]);
    {
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        // 1000 raw * 0.1 - 10.0
        assert_eq!(frames[0].signals[0].value, 90.0);
    }

    // selected data goes to the partition log and reads back
    agent
        .stream_engine
        .append(&DataToPersist {
            campaign_arn: CAMPAIGN_ARN.to_string(),
            partition_id: 0,
            payload: b"selected".to_vec(),
            num_signals: 1,
            trigger_time_ms: 42,
        })
        .unwrap();
    let read = agent.stream_engine.read(CAMPAIGN_ARN, 0).unwrap();
    assert_eq!(read.payload, b"selected");
    (read.checkpoint)();
    assert!(matches!(
        agent.stream_engine.read(CAMPAIGN_ARN, 0),
        Err(StreamError::EndOfStream)
    ));

    agent.shutdown().await;
}

#[tokio::test]
async fn persisted_payloads_replay_after_restart() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let agent = Agent::start(&config_for(tmp.path()), Arc::new(NullFrameSink), None).unwrap();
        agent
            .campaign_manager
            .receive_decoder_manifest(&manifest_payload())
            .unwrap();
        agent
            .campaign_manager
            .receive_campaign_list(&campaign_payload())
            .unwrap();
        let stream_engine = Arc::clone(&agent.stream_engine);
        wait_until(move || stream_engine.has_campaign(CAMPAIGN_ARN)).await;
        agent
            .stream_engine
            .append(&DataToPersist {
                campaign_arn: CAMPAIGN_ARN.to_string(),
                partition_id: 0,
                payload: b"survives".to_vec(),
                num_signals: 1,
                trigger_time_ms: 7,
            })
            .unwrap();
        agent.shutdown().await;
    }

    // a fresh agent restores the persisted schema documents and re-opens
    // the same streams, data intact
    let agent = Agent::start(&config_for(tmp.path()), Arc::new(NullFrameSink), None).unwrap();
    let stream_engine = Arc::clone(&agent.stream_engine);
    wait_until(move || stream_engine.has_campaign(CAMPAIGN_ARN)).await;

    let read = agent.stream_engine.read(CAMPAIGN_ARN, 0).unwrap();
    assert_eq!(read.payload, b"survives");

    agent.shutdown().await;
}
