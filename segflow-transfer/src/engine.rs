use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    api::{BatchId, BufferEntry, SegmentId, TransferRequest, TransferState, TransferStatus},
    batch::{BatchManager, TaskSlot},
    config::{EngineConfig, LocalIdentity, MetadataUri, TransferConfig},
    error::{Result, TransferError},
    memory::{MemoryRegion, MemoryRegistry},
    metadata::{self, BufferDesc, MetadataError, MetadataStore, RpcEndpoint, SegmentDesc},
    segment::SegmentDirectory,
    transport::{self, TransferTask, Transport, TransportContext},
};

const POLL_BACKOFF_MIN: Duration = Duration::from_micros(10);
const POLL_BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Segment-addressed transfer engine.
///
/// One value owns the memory registry, the segment directory, the batch
/// table and the installed transports. Every method takes `&self` and is
/// safe to call from many threads at once.
pub struct TransferEngine {
    identity: LocalIdentity,
    tuning: TransferConfig,
    store: Arc<dyn MetadataStore>,
    registry: Arc<MemoryRegistry>,
    segments: SegmentDirectory,
    batches: BatchManager,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    publish_lock: Mutex<()>,
    torn_down: AtomicBool,
}

impl TransferEngine {
    /// Connects to the discovery service named by `config.metadata_uri` and
    /// brings the engine up.
    pub fn create(config: EngineConfig) -> Result<Self> {
        let uri = MetadataUri::parse(&config.metadata_uri);
        let store = metadata::connect(&uri, config.tuning.connect_timeout).map_err(|error| {
            TransferError::EngineInit(format!("metadata `{}`: {error}", config.metadata_uri))
        })?;
        Self::create_with_metadata(config, store)
    }

    /// Like [`Self::create`] with a caller-supplied discovery store;
    /// `config.metadata_uri` is ignored.
    pub fn create_with_metadata(
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        let identity = LocalIdentity::parse(&config.local_server_name);
        let tuning = config.tuning.sanitized();
        let engine = Self {
            segments: SegmentDirectory::new(Arc::clone(&store)),
            batches: BatchManager::new(tuning.max_batches, tuning.max_batch_size),
            registry: Arc::new(MemoryRegistry::new()),
            transports: RwLock::new(Vec::new()),
            publish_lock: Mutex::new(()),
            torn_down: AtomicBool::new(false),
            identity,
            tuning,
            store,
        };

        for transport in config.transports.iter().filter(|t| t.is_enabled()) {
            if let Err(error) = engine.install(&transport.name, &transport.params) {
                engine.rollback_create();
                return Err(TransferError::EngineInit(error.to_string()));
            }
        }
        let published = engine.publish(&engine.transports.read());
        if let Err(error) = published {
            engine.rollback_create();
            return Err(TransferError::EngineInit(format!(
                "cannot publish segment `{}`: {error}",
                engine.identity.server_name
            )));
        }

        info!(
            "transfer engine `{}` up: rpc={}:{}, metadata={}, transports=[{}]",
            engine.identity.server_name,
            engine.identity.host,
            engine.identity.rpc_port,
            config.metadata_uri,
            engine.installed_transports().join(",")
        );
        Ok(engine)
    }

    pub fn local_segment_name(&self) -> &str {
        &self.identity.server_name
    }

    pub fn rpc_port(&self) -> u16 {
        self.identity.rpc_port
    }

    pub fn tuning(&self) -> &TransferConfig {
        &self.tuning
    }

    pub fn installed_transports(&self) -> Vec<&'static str> {
        self.transports.read().iter().map(|t| t.name()).collect()
    }

    // ---------------------------------------------------------------------
    // Transports
    // ---------------------------------------------------------------------

    /// Installs the transport `name`. Regions registered so far are
    /// registered with it before it becomes routable.
    pub fn install_transport(&self, name: &str, params: &str) -> Result<()> {
        self.install(name, params)?;
        let published = self.publish(&self.transports.read());
        if let Err(error) = published {
            warn!("transport `{name}` installed but segment republish failed: {error}");
        }
        Ok(())
    }

    fn install(&self, name: &str, params: &str) -> Result<()> {
        let mut transports = self.transports.write();
        if transports.iter().any(|t| t.name() == name) {
            return Err(TransferError::EngineInit(format!(
                "transport `{name}` is already installed"
            )));
        }

        let ctx = TransportContext {
            identity: self.identity.clone(),
            registry: Arc::clone(&self.registry),
            tuning: self.tuning.clone(),
        };
        let transport = transport::create(name, params, &ctx)
            .map_err(|error| TransferError::EngineInit(format!("install `{name}`: {error}")))?;

        let regions = self.registry.snapshot();
        for (idx, region) in regions.iter().enumerate() {
            if let Err(error) = transport.register_memory(region) {
                for registered in &regions[..idx] {
                    if let Err(error) = transport.unregister_memory(registered) {
                        warn!("{name}: rollback of {:#x} failed: {error}", registered.addr);
                    }
                }
                transport.shutdown();
                return Err(TransferError::EngineInit(format!("install `{name}`: {error}")));
            }
        }

        info!(
            "installed transport `{name}` ({} region(s) registered)",
            regions.len()
        );
        transports.push(transport);
        Ok(())
    }

    /// Stops and removes the transport `name`. Its queued slices end as
    /// canceled.
    pub fn uninstall_transport(&self, name: &str) -> Result<()> {
        let mut transports = self.transports.write();
        let Some(pos) = transports.iter().position(|t| t.name() == name) else {
            return Err(TransferError::EngineTeardown(format!(
                "transport `{name}` is not installed"
            )));
        };
        let transport = transports.remove(pos);
        let failures = Self::release_transport(&self.registry, transport.as_ref());
        if let Err(error) = self.publish(&transports) {
            warn!("transport `{name}` uninstalled but segment republish failed: {error}");
        }
        drop(transports);

        info!("uninstalled transport `{name}`");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransferError::EngineTeardown(failures.join("; ")))
        }
    }

    fn release_transport(registry: &MemoryRegistry, transport: &dyn Transport) -> Vec<String> {
        transport.shutdown();
        registry
            .snapshot()
            .iter()
            .filter_map(|region| transport.unregister_memory(region).err())
            .map(|error| error.to_string())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    /// Registers `[addr, addr + length)` as a remote-accessible buffer.
    pub fn register_memory(&self, addr: u64, length: u64, location: &str) -> Result<()> {
        self.register_memory_ext(addr, length, location, true)
    }

    /// Registers a buffer. Only remote-accessible buffers are published to
    /// peers; the others can only be used as local sources.
    pub fn register_memory_ext(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
    ) -> Result<()> {
        let transports = self.transports.read();
        let region = self.attach(&transports, addr, length, location, remote_accessible)?;
        if let Err(error) = self.publish(&transports) {
            self.detach(&transports, &region);
            return Err(TransferError::registration(format!(
                "cannot publish segment: {error}"
            )));
        }
        debug!(
            "registered {addr:#x}+{length} at {} (segment offset {})",
            region.location, region.segment_offset
        );
        Ok(())
    }

    pub fn unregister_memory(&self, addr: u64) -> Result<()> {
        self.batch_unregister_memory(&[addr])
    }

    /// Registers every entry or none of them.
    pub fn batch_register_memory(&self, entries: &[BufferEntry], location: &str) -> Result<()> {
        let transports = self.transports.read();
        let mut attached = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.attach(&transports, entry.addr, entry.length as u64, location, true) {
                Ok(region) => attached.push(region),
                Err(error) => {
                    for region in attached.iter().rev() {
                        self.detach(&transports, region);
                    }
                    return Err(error);
                }
            }
        }

        if let Err(error) = self.publish(&transports) {
            for region in attached.iter().rev() {
                self.detach(&transports, region);
            }
            return Err(TransferError::registration(format!(
                "cannot publish segment: {error}"
            )));
        }
        debug!("registered {} buffer(s) at {location}", attached.len());
        Ok(())
    }

    /// Unregisters every address or none of them.
    pub fn batch_unregister_memory(&self, addrs: &[u64]) -> Result<()> {
        let transports = self.transports.read();
        if let Some(missing) = addrs.iter().find(|addr| self.registry.get(**addr).is_none()) {
            return Err(TransferError::registration(format!(
                "addr {missing:#x} is not registered"
            )));
        }

        let mut removed = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match self.registry.unregister(*addr) {
                Ok(region) => removed.push(region),
                Err(error) => {
                    for region in removed {
                        self.registry.restore(region);
                    }
                    return Err(error);
                }
            }
        }

        if let Err(error) = self.publish(&transports) {
            for region in removed {
                self.registry.restore(region);
            }
            return Err(TransferError::registration(format!(
                "cannot publish segment: {error}"
            )));
        }

        for region in &removed {
            for transport in transports.iter() {
                if let Err(error) = transport.unregister_memory(region) {
                    warn!("{}: {error}", transport.name());
                }
            }
            debug!("unregistered {:#x}+{}", region.addr, region.length);
        }
        Ok(())
    }

    fn attach(
        &self,
        transports: &[Arc<dyn Transport>],
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
    ) -> Result<Arc<MemoryRegion>> {
        let region = self
            .registry
            .register(addr, length, location, remote_accessible)?;
        for (idx, transport) in transports.iter().enumerate() {
            if let Err(error) = transport.register_memory(&region) {
                for registered in &transports[..idx] {
                    if let Err(error) = registered.unregister_memory(&region) {
                        warn!("{}: {error}", registered.name());
                    }
                }
                let _ = self.registry.unregister(addr);
                return Err(TransferError::registration(error.to_string()));
            }
        }
        Ok(region)
    }

    fn detach(&self, transports: &[Arc<dyn Transport>], region: &MemoryRegion) {
        for transport in transports {
            if let Err(error) = transport.unregister_memory(region) {
                warn!("{}: {error}", transport.name());
            }
        }
        let _ = self.registry.unregister(region.addr);
    }

    // ---------------------------------------------------------------------
    // Segments
    // ---------------------------------------------------------------------

    pub fn open_segment(&self, name: &str) -> Result<SegmentId> {
        self.segments.open(name)
    }

    pub fn close_segment(&self, id: SegmentId) -> Result<()> {
        self.segments.close(id)
    }

    /// Drops cached descriptors and re-resolves every open segment.
    pub fn sync_segment_cache(&self) -> Result<()> {
        self.segments.sync_cache()
    }

    // ---------------------------------------------------------------------
    // Batches
    // ---------------------------------------------------------------------

    pub fn allocate_batch(&self, capacity: usize) -> Result<BatchId> {
        self.batches.allocate(capacity)
    }

    /// Releases a batch whose requests have all reached a terminal state.
    pub fn free_batch(&self, id: BatchId) -> Result<()> {
        self.batches.free(id)
    }

    /// Non-blocking status of request `index` of `batch`.
    pub fn get_transfer_status(&self, batch: BatchId, index: usize) -> Result<TransferStatus> {
        self.batches.status(batch, index)
    }

    /// Validates `requests` and hands them to the transports. Returns once
    /// they are accepted; outcomes are read with [`Self::get_transfer_status`]
    /// at indices following the batch's previously submitted requests.
    pub fn submit_transfer(&self, batch_id: BatchId, requests: &[TransferRequest]) -> Result<()> {
        let batch = self
            .batches
            .get(batch_id)
            .ok_or_else(|| TransferError::submission(format!("{batch_id} is not allocated")))?;
        if requests.len() > batch.remaining() {
            return Err(TransferError::submission(format!(
                "{batch_id} has room for {} more request(s), got {}",
                batch.remaining(),
                requests.len()
            )));
        }
        if requests.is_empty() {
            return Ok(());
        }

        let transports = self.transports.read();
        if transports.is_empty() {
            return Err(TransferError::submission("no transport is installed"));
        }

        let deadline = Instant::now() + self.tuning.transfer_timeout;
        let mut planned = Vec::with_capacity(requests.len());
        for (pos, request) in requests.iter().enumerate() {
            planned.push(
                self.plan(&transports, request, deadline)
                    .map_err(|reason| {
                        warn!("{batch_id}: rejecting request {pos}: {reason}");
                        TransferError::submission(format!("request {pos}: {reason}"))
                    })?,
            );
        }

        let slots: Vec<Arc<TaskSlot>> = planned.iter().map(|_| TaskSlot::new()).collect();
        let first = batch.admit(&slots)?;

        let mut per_transport: Vec<Vec<TransferTask>> =
            (0..transports.len()).map(|_| Vec::new()).collect();
        for (pos, (route, mut task)) in planned.into_iter().enumerate() {
            task.batch = batch_id;
            task.index = first + pos;
            task.slot = Arc::clone(&slots[pos]);
            per_transport[route].push(task);
        }

        for (route, tasks) in per_transport.into_iter().enumerate() {
            if tasks.is_empty() {
                continue;
            }
            let transport = &transports[route];
            let doomed: Vec<(usize, Arc<TaskSlot>)> = tasks
                .iter()
                .map(|task| (task.index, Arc::clone(&task.slot)))
                .collect();
            if let Err(error) = transport.submit(tasks) {
                error!(
                    "{batch_id}: {} refused {} request(s): {error}",
                    transport.name(),
                    doomed.len()
                );
                for (index, slot) in doomed {
                    slot.finish(TransferState::Failed, 0);
                    debug!("{batch_id} index {index}: FAILED at dispatch");
                }
            }
        }
        Ok(())
    }

    /// Resolves one request into a task and the index of the transport
    /// that will carry it. The returned task's batch coordinates and slot
    /// are filled in once the batch admits it.
    fn plan(
        &self,
        transports: &[Arc<dyn Transport>],
        request: &TransferRequest,
        deadline: Instant,
    ) -> std::result::Result<(usize, TransferTask), String> {
        if request.length == 0 {
            return Err("length must be non-zero".to_string());
        }
        let region = self
            .registry
            .find(request.source, request.length)
            .ok_or_else(|| {
                format!(
                    "source {:#x}+{} is not registered",
                    request.source, request.length
                )
            })?;
        let (target, lease) = self
            .segments
            .acquire(request.target_id)
            .ok_or_else(|| format!("{} is not open", request.target_id))?;
        let (buffer_index, _, target_addr) = target
            .locate(request.target_offset, request.length)
            .ok_or_else(|| {
                format!(
                    "range {}+{} is outside every buffer of `{}`",
                    request.target_offset, request.length, target.name
                )
            })?;
        let route = transports
            .iter()
            .enumerate()
            .filter(|(_, t)| t.can_route(&region, &target))
            .min_by_key(|(_, t)| t.priority())
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                format!(
                    "no installed transport reaches `{}` from {}",
                    target.name, region.location
                )
            })?;

        Ok((
            route,
            TransferTask {
                batch: BatchId(0),
                index: 0,
                opcode: request.opcode,
                source: request.source,
                length: request.length,
                location: region.location.clone(),
                target,
                buffer_index,
                target_addr,
                deadline,
                slot: TaskSlot::new(),
                lease: Some(lease),
            },
        ))
    }

    /// Polls until the request is terminal or `timeout` elapses, returning
    /// the latest status either way.
    pub fn wait_for_completion(
        &self,
        batch: BatchId,
        index: usize,
        timeout: Duration,
    ) -> Result<TransferStatus> {
        let deadline = Instant::now() + timeout;
        let mut backoff = POLL_BACKOFF_MIN;
        loop {
            let status = self.get_transfer_status(batch, index)?;
            if status.is_terminal() || Instant::now() >= deadline {
                return Ok(status);
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
        }
    }

    /// Runs one request to completion in a private batch.
    pub fn transfer_sync(&self, request: TransferRequest) -> Result<TransferStatus> {
        let batch = self.allocate_batch(1)?;
        if let Err(error) = self.submit_transfer(batch, &[request]) {
            let _ = self.free_batch(batch);
            return Err(error);
        }

        // Transports bound every request by the transfer timeout, so this
        // ends once the request does.
        let status = loop {
            let status = self.wait_for_completion(batch, 0, self.tuning.transfer_timeout)?;
            if status.is_terminal() {
                break status;
            }
        };
        self.free_batch(batch)?;
        Ok(status)
    }

    // ---------------------------------------------------------------------
    // Publication and teardown
    // ---------------------------------------------------------------------

    fn describe(&self, transports: &[Arc<dyn Transport>]) -> SegmentDesc {
        let mut desc = SegmentDesc::new(
            self.identity.server_name.clone(),
            RpcEndpoint {
                host: self.identity.host.clone(),
                port: self.identity.rpc_port,
            },
        );
        desc.protocols = transports.iter().map(|t| t.name().to_string()).collect();
        desc.buffers = self
            .registry
            .snapshot()
            .iter()
            .filter(|region| region.remote_accessible)
            .map(|region| BufferDesc {
                offset: region.segment_offset,
                addr: region.addr,
                length: region.length,
                location: region.location.clone(),
                rkeys: Vec::new(),
            })
            .collect();
        for transport in transports {
            transport.describe(&mut desc);
        }
        desc
    }

    fn publish(&self, transports: &[Arc<dyn Transport>]) -> std::result::Result<(), MetadataError> {
        let _guard = self.publish_lock.lock();
        let desc = self.describe(transports);
        metadata::publish_segment(self.store.as_ref(), &desc)
    }

    fn rollback_create(&self) {
        if let Err(error) = self.teardown() {
            warn!("rollback of engine `{}`: {error}", self.identity.server_name);
        }
    }

    fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(
            "tearing down `{}`: {} open segment handle(s), {} live batch(es)",
            self.identity.server_name,
            self.segments.open_handles(),
            self.batches.live()
        );

        let transports: Vec<Arc<dyn Transport>> = self.transports.write().drain(..).collect();
        let mut failures = Vec::new();
        for transport in transports.iter().rev() {
            failures.extend(Self::release_transport(&self.registry, transport.as_ref()));
            debug!("released transport `{}`", transport.name());
        }

        let key = metadata::segment_key(&self.identity.server_name);
        if let Err(error) = self.store.remove(&key) {
            failures.push(format!("cannot withdraw `{key}`: {error}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TransferError::EngineTeardown(failures.join("; ")))
        }
    }

    /// Uninstalls every transport and withdraws the local segment. Teardown
    /// continues past individual failures; the error lists all of them.
    pub fn destroy(self) -> Result<()> {
        let result = self.teardown();
        match &result {
            Ok(()) => info!("transfer engine `{}` destroyed", self.identity.server_name),
            Err(error) => error!("{error}"),
        }
        result
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Err(error) = self.teardown() {
            error!("{error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::TransferEngine;
    use crate::{
        api::{BatchId, BufferEntry, SegmentId, TransferRequest, TransferState},
        config::{EngineConfig, TransferConfig, TransportConfig},
        error::TransferError,
        metadata::{self, MemoryStore, MetadataStore},
    };

    fn engine(name: &str, store: &Arc<MemoryStore>) -> TransferEngine {
        let config = EngineConfig::new(name, "memory://unused")
            .with_transport(TransportConfig::local())
            .with_tuning(TransferConfig::default());
        TransferEngine::create_with_metadata(config, store.clone()).expect("create")
    }

    #[test]
    fn create_publishes_and_destroy_withdraws() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7000", &store);
        let key = metadata::segment_key("self:7000");
        assert!(store.get(&key).expect("get").is_some());
        assert_eq!(engine.installed_transports(), vec!["local"]);

        engine.destroy().expect("destroy");
        assert!(store.get(&key).expect("get").is_none());
    }

    #[test]
    fn create_fails_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_online(false);
        let err = TransferEngine::create_with_metadata(
            EngineConfig::new("self:7001", "memory://unused"),
            store,
        )
        .err()
        .expect("must fail");
        assert!(matches!(err, TransferError::EngineInit(_)));
    }

    #[test]
    fn failed_transport_install_rolls_back_create() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig::new("self:7002", "memory://unused")
            .with_transport(TransportConfig::local())
            .with_transport(TransportConfig::new("carrier-pigeon", "{}"));
        let err = TransferEngine::create_with_metadata(config, store.clone())
            .err()
            .expect("must fail");
        assert!(matches!(err, TransferError::EngineInit(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_install_and_unknown_uninstall_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7003", &store);
        assert!(matches!(
            engine.install_transport("local", "{}"),
            Err(TransferError::EngineInit(_))
        ));
        assert!(matches!(
            engine.uninstall_transport("tcp"),
            Err(TransferError::EngineTeardown(_))
        ));
        engine.uninstall_transport("local").expect("uninstall");
        assert!(engine.installed_transports().is_empty());
    }

    #[test]
    fn publish_failure_rolls_back_registration() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7004", &store);
        let buf = vec![0_u8; 64];

        store.set_online(false);
        let err = engine
            .register_memory(buf.as_ptr() as u64, 64, "cpu:0")
            .expect_err("must fail");
        assert!(matches!(err, TransferError::Registration(_)));

        store.set_online(true);
        engine
            .register_memory(buf.as_ptr() as u64, 64, "cpu:0")
            .expect("register after recovery");
    }

    #[test]
    fn batch_registration_is_all_or_nothing() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7005", &store);
        let buf = vec![0_u8; 256];
        let base = buf.as_ptr() as u64;

        let err = engine
            .batch_register_memory(
                &[
                    BufferEntry {
                        addr: base,
                        length: 128,
                    },
                    BufferEntry {
                        addr: base + 64,
                        length: 128,
                    },
                ],
                "cpu:0",
            )
            .expect_err("overlap must fail");
        assert!(matches!(err, TransferError::Registration(_)));
        assert!(engine.registry.is_empty());

        engine
            .batch_register_memory(
                &[
                    BufferEntry {
                        addr: base,
                        length: 128,
                    },
                    BufferEntry {
                        addr: base + 128,
                        length: 128,
                    },
                ],
                "cpu:0",
            )
            .expect("register");
        assert!(engine.batch_unregister_memory(&[base, base + 1]).is_err());
        assert_eq!(engine.registry.len(), 2);
        engine
            .batch_unregister_memory(&[base, base + 128])
            .expect("unregister");
        assert!(engine.registry.is_empty());
    }

    #[test]
    fn submit_validates_every_request_before_admitting_any() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7006", &store);
        let mut buf = vec![0_u8; 128];
        let addr = buf.as_mut_ptr() as u64;
        engine.register_memory(addr, 128, "cpu:0").expect("register");
        let target = engine.open_segment("self:7006").expect("open");
        let batch = engine.allocate_batch(4).expect("allocate");

        let cases = [
            TransferRequest::write(addr, target, 0, 0),
            TransferRequest::write(addr + 4096, target, 0, 8),
            TransferRequest::write(addr, SegmentId(999), 0, 8),
            TransferRequest::write(addr, target, 120, 16),
        ];
        for bad in cases {
            let err = engine
                .submit_transfer(batch, &[TransferRequest::write(addr, target, 64, 8), bad])
                .expect_err("must fail");
            assert!(matches!(err, TransferError::Submission(_)), "{err}");
        }
        assert!(matches!(
            engine.get_transfer_status(batch, 0),
            Err(TransferError::UnknownTask { .. })
        ));
        assert!(matches!(
            engine.submit_transfer(BatchId(12345), &[]),
            Err(TransferError::Submission(_))
        ));
    }

    #[test]
    fn loopback_transfer_sync_copies_bytes() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine("self:7007", &store);
        let src: Vec<u8> = (0..64).collect();
        let mut dst = vec![0_u8; 64];
        engine
            .register_memory_ext(src.as_ptr() as u64, 64, "cpu:0", false)
            .expect("register src");
        engine
            .register_memory(dst.as_mut_ptr() as u64, 64, "cpu:0")
            .expect("register dst");
        let target = engine.open_segment("self:7007").expect("open");

        // Only `dst` is published, so it starts at offset 64 after `src`.
        let status = engine
            .transfer_sync(TransferRequest::write(src.as_ptr() as u64, target, 64, 64))
            .expect("transfer");
        assert_eq!(status.state, TransferState::Completed);
        assert_eq!(status.transferred_bytes, 64);
        assert_eq!(dst, src);

        engine.close_segment(target).expect("close");
        assert!(
            engine
                .wait_for_completion(BatchId(0), 0, Duration::ZERO)
                .is_err()
        );
    }
}
