//! One-sided RDMA transport built on `sideway` verbs.
//!
//! Every NIC named in the priority matrix is opened as an [`RdmaContext`].
//! Peers learn each device's UD control address and the per-buffer rkeys
//! from the published segment descriptor, connect an RC queue pair on first
//! use, and then read or write remote memory without involving the target's
//! CPU.

mod completion;
mod context;
mod control_protocol;
mod domain_address;

use std::{sync::Arc, time::Instant};

use log::{info, warn};
use thiserror::Error;

use self::{context::RdmaContext, domain_address::DomainAddress};
use super::{
    RDMA, TransferTask, Transport, TransportContext, TransportError,
    topology::Topology,
    worker_pool::{SliceError, SliceExecutor, WorkerPool},
};
use crate::{
    memory::{MemoryRegion, MemoryRegistry},
    metadata::SegmentDesc,
};

/// Attempts per slice, each on the next device the matrix offers.
const MAX_SLICE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub(crate) enum VerbsError {
    #[error("RDMA device `{0}` not found")]
    DeviceNotFound(String),
    #[error("verbs call failed: {0}")]
    Verbs(String),
    #[error("peer {0} rejected the connection")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

pub(crate) struct RdmaTransport {
    topology: Topology,
    contexts: Arc<Vec<Arc<RdmaContext>>>,
    pool: WorkerPool,
}

impl RdmaTransport {
    pub(crate) fn start(ctx: &TransportContext, params: &str) -> Result<Self, TransportError> {
        let mut topology = Topology::parse(params)?;

        let mut contexts = Vec::new();
        for device in topology.devices() {
            match RdmaContext::open(&device, ctx.tuning.connect_timeout) {
                Ok(context) => contexts.push(context),
                Err(error) => {
                    warn!("disabling RDMA device {device}: {error}");
                    topology.disable_device(&device);
                }
            }
        }
        if contexts.is_empty() {
            return Err(TransportError::Setup {
                transport: RDMA,
                reason: "no usable RDMA device in the priority matrix".to_string(),
            });
        }

        let contexts = Arc::new(contexts);
        let executor = Arc::new(RdmaExecutor {
            registry: Arc::clone(&ctx.registry),
            topology: topology.clone(),
            contexts: Arc::clone(&contexts),
        });
        let pool = WorkerPool::start(
            RDMA,
            ctx.tuning.workers_per_transport,
            ctx.tuning.slice_size,
            executor,
        )?;
        info!(
            "rdma transport ready on {} device(s): {}",
            contexts.len(),
            topology.to_json()
        );
        Ok(Self {
            topology,
            contexts,
            pool,
        })
    }
}

impl Transport for RdmaTransport {
    fn name(&self) -> &'static str {
        RDMA
    }

    fn priority(&self) -> u8 {
        1
    }

    fn describe(&self, desc: &mut SegmentDesc) {
        desc.devices = self.contexts.iter().map(|ctx| ctx.device_desc()).collect();
        desc.topology = Some(self.topology.clone());
        for buffer in &mut desc.buffers {
            buffer.rkeys = self
                .contexts
                .iter()
                .map(|ctx| ctx.rkey(buffer.addr).unwrap_or_default())
                .collect();
        }
    }

    fn register_memory(&self, region: &MemoryRegion) -> Result<(), TransportError> {
        for (idx, ctx) in self.contexts.iter().enumerate() {
            if let Err(error) = ctx.register(region.addr, region.length) {
                for registered in &self.contexts[..idx] {
                    registered.unregister(region.addr);
                }
                return Err(TransportError::Memory {
                    transport: RDMA,
                    addr: region.addr,
                    reason: format!("{}: {error}", ctx.name()),
                });
            }
        }
        Ok(())
    }

    fn unregister_memory(&self, region: &MemoryRegion) -> Result<(), TransportError> {
        for ctx in self.contexts.iter() {
            ctx.unregister(region.addr);
        }
        Ok(())
    }

    fn can_route(&self, _source: &MemoryRegion, target: &SegmentDesc) -> bool {
        target.supports(RDMA) && !target.devices.is_empty()
    }

    fn submit(&self, tasks: Vec<TransferTask>) -> Result<(), TransportError> {
        self.pool.submit(tasks)
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct RdmaExecutor {
    registry: Arc<MemoryRegistry>,
    topology: Topology,
    contexts: Arc<Vec<Arc<RdmaContext>>>,
}

impl RdmaExecutor {
    fn context(&self, name: &str) -> Option<&Arc<RdmaContext>> {
        self.contexts.iter().find(|ctx| ctx.name() == name)
    }

    fn attempt(
        &self,
        task: &TransferTask,
        offset: u64,
        len: u64,
        retry: usize,
    ) -> Result<(), SliceError> {
        let source = task.source + offset;
        let region = self.registry.find(source, len).ok_or_else(|| {
            SliceError::Failed(format!("source {source:#x}+{len} is no longer registered"))
        })?;

        let device = self
            .topology
            .select_device(&task.location, retry)
            .ok_or_else(|| {
                SliceError::Failed(format!("no RDMA device serves location {}", task.location))
            })?;
        let ctx = self
            .context(device)
            .ok_or_else(|| SliceError::Failed(format!("RDMA device {device} is not open")))?;
        let lkey = ctx
            .lkey(region.addr)
            .ok_or_else(|| SliceError::Failed(format!("{device} has no lkey for {source:#x}")))?;

        let target = &task.target;
        let buffer = target.buffers.get(task.buffer_index).ok_or_else(|| {
            SliceError::Failed(format!("{} has no buffer {}", target.name, task.buffer_index))
        })?;
        let remote_idx = target
            .topology
            .as_ref()
            .and_then(|topology| topology.select_device(&buffer.location, retry))
            .and_then(|name| target.devices.iter().position(|dev| dev.name == name))
            .unwrap_or(0);
        let remote = target.devices.get(remote_idx).ok_or_else(|| {
            SliceError::Failed(format!("{} publishes no RDMA device", target.name))
        })?;
        let rkey = buffer.rkeys.get(remote_idx).copied().ok_or_else(|| {
            SliceError::Failed(format!("{} publishes no rkey for {}", target.name, remote.name))
        })?;
        let peer = DomainAddress::from_hex(&remote.control_addr).ok_or_else(|| {
            SliceError::Failed(format!("bad control address for {}", remote.name))
        })?;

        let session = ctx.session(peer).map_err(slice_error)?;
        let remaining = task.deadline.saturating_duration_since(Instant::now());
        ctx.post(
            &session,
            task.opcode,
            lkey,
            source,
            rkey,
            task.target_addr + offset,
            len,
            remaining,
        )
        .map_err(|error| {
            ctx.reset_session(peer);
            slice_error(error)
        })
    }
}

impl SliceExecutor for RdmaExecutor {
    fn execute(&self, task: &TransferTask, offset: u64, len: u64) -> Result<(), SliceError> {
        let mut last = None;
        for retry in 0..MAX_SLICE_ATTEMPTS {
            if Instant::now() >= task.deadline {
                break;
            }
            match self.attempt(task, offset, len, retry) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        "{} index {}: rdma attempt {retry} failed: {error:?}",
                        task.batch, task.index
                    );
                    last = Some(error);
                }
            }
        }
        Err(last.unwrap_or_else(|| SliceError::Timeout("deadline passed before posting".into())))
    }
}

fn slice_error(error: VerbsError) -> SliceError {
    match error {
        VerbsError::Timeout(_) => SliceError::Timeout(error.to_string()),
        other => SliceError::Failed(other.to_string()),
    }
}
