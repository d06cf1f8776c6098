//! Data-path backends.
//!
//! A transport moves bytes for requests the engine has already validated.
//! Each one owns a worker pool that splits requests into slices; per-request
//! outcomes are reported through the request's [`TaskSlot`], never as call
//! errors.

mod local;
#[cfg(feature = "rdma")]
mod rdma;
mod tcp;
mod tcp_protocol;
pub mod topology;
mod worker_pool;

use std::{sync::Arc, time::Instant};

use thiserror::Error;

use crate::{
    api::{BatchId, OpCode},
    batch::TaskSlot,
    config::{LocalIdentity, TransferConfig},
    memory::{MemoryRegion, MemoryRegistry},
    metadata::SegmentDesc,
    segment::SegmentLease,
};

use self::topology::TopologyError;

pub(crate) use local::LocalTransport;
#[cfg(feature = "rdma")]
pub(crate) use rdma::RdmaTransport;
pub(crate) use tcp::TcpTransport;

pub(crate) const LOCAL: &str = "local";
pub(crate) const RDMA: &str = "rdma";
pub(crate) const TCP: &str = "tcp";

#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("unknown transport `{0}`")]
    Unknown(String),
    #[error("transport `{0}` is not compiled into this build")]
    NotCompiled(&'static str),
    #[error("invalid {transport} parameters: {reason}")]
    InvalidParams {
        transport: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("{transport} setup failed: {reason}")]
    Setup {
        transport: &'static str,
        reason: String,
    },
    #[error("{transport} cannot register {addr:#x}: {reason}")]
    Memory {
        transport: &'static str,
        addr: u64,
        reason: String,
    },
    #[error("transport `{0}` is shut down")]
    Closed(&'static str),
}

/// What every transport of one engine shares.
#[derive(Clone)]
pub(crate) struct TransportContext {
    pub(crate) identity: LocalIdentity,
    pub(crate) registry: Arc<MemoryRegistry>,
    pub(crate) tuning: TransferConfig,
}

/// One admitted request, resolved against its target segment.
pub(crate) struct TransferTask {
    pub(crate) batch: BatchId,
    pub(crate) index: usize,
    pub(crate) opcode: OpCode,
    pub(crate) source: u64,
    pub(crate) length: u64,
    /// Location of the local region holding `source`.
    #[cfg_attr(not(feature = "rdma"), allow(dead_code))]
    pub(crate) location: String,
    pub(crate) target: Arc<SegmentDesc>,
    /// Index into `target.buffers`.
    #[cfg_attr(not(feature = "rdma"), allow(dead_code))]
    pub(crate) buffer_index: usize,
    /// Remote virtual address of the first target byte.
    pub(crate) target_addr: u64,
    pub(crate) deadline: Instant,
    pub(crate) slot: Arc<TaskSlot>,
    pub(crate) lease: Option<SegmentLease>,
}

pub(crate) trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower wins when several transports can route a request.
    fn priority(&self) -> u8;

    /// Adds whatever peers need to reach this transport to the local
    /// segment descriptor.
    fn describe(&self, desc: &mut SegmentDesc);

    fn register_memory(&self, region: &MemoryRegion) -> Result<(), TransportError>;

    fn unregister_memory(&self, region: &MemoryRegion) -> Result<(), TransportError>;

    fn can_route(&self, source: &MemoryRegion, target: &SegmentDesc) -> bool;

    /// Queues `tasks` for execution. On error none of them were accepted.
    fn submit(&self, tasks: Vec<TransferTask>) -> Result<(), TransportError>;

    /// Stops the workers. Queued slices end their requests as canceled.
    fn shutdown(&self);
}

/// Builds and starts the transport called `name`.
pub(crate) fn create(
    name: &str,
    params: &str,
    ctx: &TransportContext,
) -> Result<Arc<dyn Transport>, TransportError> {
    match name {
        LOCAL => Ok(Arc::new(LocalTransport::start(ctx, params)?)),
        TCP => Ok(Arc::new(TcpTransport::start(ctx, params)?)),
        #[cfg(feature = "rdma")]
        RDMA => Ok(Arc::new(RdmaTransport::start(ctx, params)?)),
        #[cfg(not(feature = "rdma"))]
        RDMA => {
            topology::Topology::parse(params)?;
            Err(TransportError::NotCompiled(RDMA))
        }
        other => Err(TransportError::Unknown(other.to_string())),
    }
}

/// Parses a JSON option object; blank input means defaults.
pub(crate) fn parse_params<T>(transport: &'static str, params: &str) -> Result<T, TransportError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if params.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(params).map_err(|error| TransportError::InvalidParams {
        transport,
        reason: error.to_string(),
    })
}
