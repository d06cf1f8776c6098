//! Common test utilities for segflow-transfer integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use segflow_transfer::{
    BatchId, EngineConfig, TransferConfig, TransferEngine, TransferStatus, TransportConfig,
    metadata::{self, MemoryStore, MetadataStore, SegmentDesc},
};

/// Upper bound for any single transfer in these tests.
pub const TRANSFER_DEADLINE: Duration = Duration::from_secs(10);

/// Fresh `memory://` discovery namespace, private to one test.
pub fn unique_metadata_uri(tag: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "memory://segflow-it-{tag}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// Tunables that keep tests quick: small slices, short timeouts.
pub fn test_tuning() -> TransferConfig {
    TransferConfig {
        slice_size: 1024,
        workers_per_transport: 2,
        transfer_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        ..TransferConfig::default()
    }
}

/// Engine with only the loopback transport.
pub fn local_engine(name: &str, metadata_uri: &str) -> TransferEngine {
    let config = EngineConfig::new(name, metadata_uri)
        .with_transport(TransportConfig::local())
        .with_tuning(test_tuning());
    TransferEngine::create(config).expect("engine should start")
}

/// Engine with only the TCP transport on an ephemeral port.
pub fn tcp_engine(name: &str, metadata_uri: &str) -> TransferEngine {
    let config = EngineConfig::new(name, metadata_uri)
        .with_transport(TransportConfig::tcp(r#"{"port": 0}"#))
        .with_tuning(test_tuning());
    TransferEngine::create(config).expect("engine should start")
}

/// Publishes `desc` as if its owner had, bypassing any engine. The returned
/// store keeps the namespace alive.
pub fn publish_descriptor(metadata_uri: &str, desc: &SegmentDesc) -> Arc<MemoryStore> {
    let name = metadata_uri
        .strip_prefix("memory://")
        .expect("memory:// namespace");
    let store = MemoryStore::shared(name);
    let raw = serde_json::to_vec(desc).expect("encode descriptor");
    store
        .set(&metadata::segment_key(&desc.name), raw.into())
        .expect("publish descriptor");
    store
}

/// Heap buffer whose address is handed to the engine.
pub struct TestBuffer {
    bytes: Vec<u8>,
}

impl TestBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0_u8; len];
        rand::thread_rng().fill(&mut bytes[..]);
        Self { bytes }
    }

    pub fn addr(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Current contents. Only meaningful once no request touching this
    /// buffer is in flight.
    pub fn snapshot(&self) -> Vec<u8> {
        // SAFETY: the pointer covers `len` initialized bytes owned by `self`.
        unsafe { std::slice::from_raw_parts(self.bytes.as_ptr(), self.bytes.len()).to_vec() }
    }
}

/// Polls until terminal, failing the test after [`TRANSFER_DEADLINE`].
pub fn wait_terminal(engine: &TransferEngine, batch: BatchId, index: usize) -> TransferStatus {
    let status = engine
        .wait_for_completion(batch, index, TRANSFER_DEADLINE)
        .expect("status should be readable");
    assert!(
        status.is_terminal(),
        "{batch} index {index} not terminal after {TRANSFER_DEADLINE:?}: {status:?}"
    );
    status
}

/// Spins until `cond` holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Barrier helper for coordinating multiple threads.
pub struct TestBarrier {
    barrier: std::sync::Barrier,
}

impl TestBarrier {
    pub fn new(n: usize) -> Self {
        Self {
            barrier: std::sync::Barrier::new(n),
        }
    }

    pub fn wait(&self) {
        self.barrier.wait();
    }
}

/// Runs `f(thread_index, barrier)` on `num_threads` threads and collects
/// the results in thread order.
pub fn run_concurrent<T, F>(num_threads: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &TestBarrier) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = Arc::new(TestBarrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || f(i, &barrier))
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
