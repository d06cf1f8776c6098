//! Requests that end in something other than COMPLETED.
//!
//! Covers:
//! - CANCELED when the transport goes away with slices still queued
//! - TIMEOUT against a peer that never answers
//! - descriptors whose ranges overflow are rejected, not trusted

mod common;

use std::{net::TcpListener, time::Duration};

use segflow_transfer::{
    EngineConfig, TransferConfig, TransferEngine, TransferError, TransferRequest, TransferState,
    TransportConfig,
    metadata::{BufferDesc, RpcEndpoint, SegmentDesc},
};

use common::{TestBuffer, publish_descriptor, test_tuning, unique_metadata_uri};

fn engine(
    name: &str,
    uri: &str,
    transport: TransportConfig,
    tuning: TransferConfig,
) -> TransferEngine {
    let config = EngineConfig::new(name, uri)
        .with_transport(transport)
        .with_tuning(tuning);
    TransferEngine::create(config).expect("engine should start")
}

fn peer_descriptor(name: &str, tcp_port: u16, buffer: BufferDesc) -> SegmentDesc {
    let endpoint = RpcEndpoint {
        host: "127.0.0.1".to_string(),
        port: tcp_port,
    };
    let mut desc = SegmentDesc::new(name, endpoint.clone());
    desc.protocols.push("tcp".to_string());
    desc.tcp = Some(endpoint);
    desc.buffers.push(buffer);
    desc
}

#[test]
fn uninstalling_transport_cancels_queued_slices() {
    let uri = unique_metadata_uri("outcome-cancel");
    let tuning = TransferConfig {
        slice_size: 1,
        workers_per_transport: 1,
        transfer_timeout: Duration::from_secs(60),
        ..test_tuning()
    };
    let engine = engine("self:1", &uri, TransportConfig::local(), tuning);

    let len = 2 << 20;
    let source = TestBuffer::random(len);
    let target = TestBuffer::zeroed(len);
    engine
        .register_memory_ext(source.addr(), source.len(), "cpu:0", false)
        .expect("register source");
    engine
        .register_memory(target.addr(), target.len(), "cpu:0")
        .expect("register target");

    let segment = engine.open_segment("self:1").expect("open");
    let batch = engine.allocate_batch(1).expect("allocate");
    engine
        .submit_transfer(
            batch,
            &[TransferRequest::write(source.addr(), segment, source.len(), target.len())],
        )
        .expect("submit");
    engine.uninstall_transport("local").expect("uninstall");

    let status = engine.get_transfer_status(batch, 0).expect("status");
    assert_eq!(status.state, TransferState::Canceled, "{status:?}");
    assert!(status.transferred_bytes < len as u64);

    engine.free_batch(batch).expect("free");
    engine.close_segment(segment).expect("close");
}

#[test]
fn silent_peer_times_out() {
    let uri = unique_metadata_uri("outcome-timeout");
    // Connections complete in the backlog but nobody ever answers.
    let silent = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = silent.local_addr().expect("addr").port();
    let _store = publish_descriptor(
        &uri,
        &peer_descriptor(
            "silent:1",
            port,
            BufferDesc {
                offset: 0,
                addr: 0x1000,
                length: 4096,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
        ),
    );

    let tuning = TransferConfig {
        transfer_timeout: Duration::from_millis(200),
        ..test_tuning()
    };
    let engine = engine("127.0.0.1:17051", &uri, TransportConfig::tcp(r#"{"port": 0}"#), tuning);
    let source = TestBuffer::random(4096);
    engine
        .register_memory(source.addr(), source.len(), "cpu:0")
        .expect("register source");

    let segment = engine.open_segment("silent:1").expect("open");
    let status = engine
        .transfer_sync(TransferRequest::write(source.addr(), segment, 0, 4096))
        .expect("submit");
    assert_eq!(status.state, TransferState::Timeout, "{status:?}");
    assert_eq!(status.transferred_bytes, 0);
    drop(silent);
}

#[test]
fn overflowing_descriptor_ranges_are_not_covered() {
    let uri = unique_metadata_uri("outcome-overflow");
    let _store = publish_descriptor(
        &uri,
        &peer_descriptor(
            "overflow:1",
            1,
            BufferDesc {
                offset: u64::MAX - 10,
                addr: 0x1000,
                length: 100,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
        ),
    );

    let engine = engine(
        "127.0.0.1:17061",
        &uri,
        TransportConfig::tcp(r#"{"port": 0}"#),
        test_tuning(),
    );
    let source = TestBuffer::random(64);
    engine
        .register_memory(source.addr(), source.len(), "cpu:0")
        .expect("register source");

    let segment = engine.open_segment("overflow:1").expect("open");
    let batch = engine.allocate_batch(1).expect("allocate");
    let err = engine
        .submit_transfer(
            batch,
            &[TransferRequest::write(source.addr(), segment, u64::MAX - 5, 1)],
        )
        .expect_err("range wraps around");
    assert!(matches!(err, TransferError::Submission(_)), "{err}");
}
