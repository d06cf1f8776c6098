//! Batch allocation, submission capacity and status polling over the
//! loopback transport.

mod common;

use std::{collections::HashMap, time::Instant};

use segflow_transfer::{
    BatchId, EngineConfig, OpCode, TransferConfig, TransferEngine, TransferError,
    TransferRequest, TransferState, TransportConfig,
};

use common::{
    TRANSFER_DEADLINE, TestBuffer, local_engine, test_tuning, unique_metadata_uri, wait_terminal,
};

struct Loopback {
    engine: TransferEngine,
    source: TestBuffer,
    target: TestBuffer,
}

/// Engine with a 64 KiB source and a 64 KiB published target, both in its
/// own segment. The source is local-only, so the target starts at segment
/// offset 64 KiB.
fn loopback(tag: &str) -> Loopback {
    let uri = unique_metadata_uri(tag);
    let engine = local_engine("self:1", &uri);
    let source = TestBuffer::random(64 * 1024);
    let target = TestBuffer::zeroed(64 * 1024);
    engine
        .register_memory_ext(source.addr(), source.len(), "cpu:0", false)
        .expect("register source");
    engine
        .register_memory(target.addr(), target.len(), "cpu:0")
        .expect("register target");
    Loopback {
        engine,
        source,
        target,
    }
}

const TARGET_BASE: u64 = 64 * 1024;

#[test]
fn capacity_is_enforced_per_batch() {
    let lb = loopback("capacity");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let batch = lb.engine.allocate_batch(3).expect("allocate");
    let request = |i: u64| {
        TransferRequest::write(
            lb.source.addr() + i * 1024,
            segment,
            TARGET_BASE + i * 1024,
            1024,
        )
    };

    lb.engine
        .submit_transfer(batch, &[request(0), request(1), request(2)])
        .expect("N requests fit");
    let err = lb
        .engine
        .submit_transfer(batch, &[request(3)])
        .expect_err("N+1 must fail");
    assert!(matches!(err, TransferError::Submission(_)), "{err}");

    let other = lb.engine.allocate_batch(3).expect("allocate");
    let err = lb
        .engine
        .submit_transfer(other, &[request(0), request(1), request(2), request(3)])
        .expect_err("N+1 in one call must fail");
    assert!(matches!(err, TransferError::Submission(_)), "{err}");

    for index in 0..3 {
        assert_eq!(
            wait_terminal(&lb.engine, batch, index).state,
            TransferState::Completed
        );
    }
    lb.engine.free_batch(batch).expect("free");
    lb.engine.free_batch(other).expect("free empty batch");
}

#[test]
fn submissions_append_to_the_batch() {
    let lb = loopback("append");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let batch = lb.engine.allocate_batch(4).expect("allocate");

    for i in 0..4_u64 {
        lb.engine
            .submit_transfer(
                batch,
                &[TransferRequest::write(
                    lb.source.addr() + i * 4096,
                    segment,
                    TARGET_BASE + i * 4096,
                    4096,
                )],
            )
            .expect("submit");
    }
    for index in 0..4 {
        let status = wait_terminal(&lb.engine, batch, index);
        assert_eq!(status.state, TransferState::Completed);
        assert_eq!(status.transferred_bytes, 4096);
    }
    assert_eq!(lb.target.snapshot()[..16 * 1024], lb.source.snapshot()[..16 * 1024]);
}

#[test]
fn polled_states_never_move_backwards() {
    let lb = loopback("monotonic");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let batch = lb.engine.allocate_batch(16).expect("allocate");
    let requests: Vec<TransferRequest> = (0..16_u64)
        .map(|i| {
            TransferRequest::write(
                lb.source.addr() + i * 4096,
                segment,
                TARGET_BASE + i * 4096,
                4096,
            )
        })
        .collect();
    lb.engine.submit_transfer(batch, &requests).expect("submit");

    fn rank(state: TransferState) -> u8 {
        match state {
            TransferState::Waiting => 0,
            TransferState::Pending => 1,
            _ => 2,
        }
    }

    let deadline = Instant::now() + TRANSFER_DEADLINE;
    let mut last: HashMap<usize, TransferState> = HashMap::new();
    let mut done = 0;
    while done < requests.len() {
        assert!(Instant::now() < deadline, "requests did not finish");
        done = 0;
        for index in 0..requests.len() {
            let state = lb
                .engine
                .get_transfer_status(batch, index)
                .expect("status")
                .state;
            assert_ne!(state, TransferState::Invalid);
            if let Some(prev) = last.get(&index) {
                assert!(rank(*prev) <= rank(state), "{prev} -> {state}");
                if prev.is_terminal() {
                    assert_eq!(*prev, state, "terminal state changed");
                }
            }
            last.insert(index, state);
            if state.is_terminal() {
                done += 1;
            }
        }
    }
    assert!(last.values().all(|state| *state == TransferState::Completed));
    assert_eq!(lb.target.snapshot(), lb.source.snapshot());
}

#[test]
fn freed_or_unsubmitted_indices_are_unknown() {
    let lb = loopback("unknown");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let batch = lb.engine.allocate_batch(2).expect("allocate");

    let err = lb.engine.get_transfer_status(batch, 0).expect_err("unsubmitted");
    assert_eq!(
        err,
        TransferError::UnknownTask {
            batch: batch.as_raw() as u64,
            index: 0
        }
    );

    lb.engine
        .submit_transfer(
            batch,
            &[TransferRequest::write(lb.source.addr(), segment, TARGET_BASE, 128)],
        )
        .expect("submit");
    wait_terminal(&lb.engine, batch, 0);
    assert!(matches!(
        lb.engine.get_transfer_status(batch, 1),
        Err(TransferError::UnknownTask { index: 1, .. })
    ));

    lb.engine.free_batch(batch).expect("free");
    assert!(matches!(
        lb.engine.get_transfer_status(batch, 0),
        Err(TransferError::UnknownTask { .. })
    ));
    assert!(matches!(
        lb.engine.free_batch(batch),
        Err(TransferError::BatchTeardown(_))
    ));
    assert!(matches!(
        lb.engine.get_transfer_status(BatchId::from_raw(9999).expect("id"), 0),
        Err(TransferError::UnknownTask { .. })
    ));
}

#[test]
fn read_pulls_bytes_into_the_source() {
    let lb = loopback("read");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let reader = TestBuffer::zeroed(8192);
    lb.engine
        .register_memory_ext(reader.addr(), reader.len(), "cpu:0", false)
        .expect("register");

    // Fill the published target first, then read it back.
    let status = lb
        .engine
        .transfer_sync(TransferRequest::write(lb.source.addr(), segment, TARGET_BASE, 8192))
        .expect("write");
    assert_eq!(status.state, TransferState::Completed);

    let request = TransferRequest::read(reader.addr(), segment, TARGET_BASE, 8192);
    assert_eq!(request.opcode, OpCode::Read);
    let status = lb.engine.transfer_sync(request).expect("read");
    assert_eq!(status.state, TransferState::Completed);
    assert_eq!(status.transferred_bytes, 8192);
    assert_eq!(reader.snapshot(), lb.source.snapshot()[..8192]);
}

#[test]
fn closing_a_segment_waits_for_its_requests() {
    let lb = loopback("close-busy");
    let segment = lb.engine.open_segment("self:1").expect("open");
    let batch = lb.engine.allocate_batch(1).expect("allocate");
    lb.engine
        .submit_transfer(
            batch,
            &[TransferRequest::write(lb.source.addr(), segment, TARGET_BASE, 64 * 1024)],
        )
        .expect("submit");

    // Either the request is still running and close is refused, or it has
    // already finished and close succeeds.
    match lb.engine.close_segment(segment) {
        Ok(()) => assert!(lb.engine.get_transfer_status(batch, 0).expect("status").is_terminal()),
        Err(err) => {
            assert!(matches!(err, TransferError::SegmentResolution(_)));
            wait_terminal(&lb.engine, batch, 0);
            lb.engine.close_segment(segment).expect("close after completion");
        }
    }
}

#[test]
fn batch_limits_are_enforced() {
    let uri = unique_metadata_uri("limits");
    let tuning = TransferConfig {
        max_batches: 2,
        max_batch_size: 8,
        ..test_tuning()
    };
    let engine = TransferEngine::create(
        EngineConfig::new("self:1", &uri)
            .with_transport(TransportConfig::local())
            .with_tuning(tuning),
    )
    .expect("create");

    for capacity in [0, 9] {
        assert!(matches!(
            engine.allocate_batch(capacity),
            Err(TransferError::BatchExhaustion(_))
        ));
    }
    let a = engine.allocate_batch(8).expect("first");
    let _b = engine.allocate_batch(1).expect("second");
    assert!(matches!(
        engine.allocate_batch(1),
        Err(TransferError::BatchExhaustion(_))
    ));
    engine.free_batch(a).expect("free");
    engine.allocate_batch(1).expect("slot released");
}
