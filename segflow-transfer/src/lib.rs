mod api;
mod batch;
mod config;
mod engine;
mod error;
mod logging;
mod memory;
pub mod metadata;
mod segment;
mod transport;

pub use api::{
    BatchId, BufferEntry, OpCode, SegmentId, TransferRequest, TransferState, TransferStatus,
};
pub use config::{
    DEFAULT_METADATA_PROTOCOL, DEFAULT_RPC_PORT, EngineConfig, LocalIdentity, MetadataUri,
    TransferConfig, TransportConfig,
};
pub use engine::TransferEngine;
pub use error::{Result, TransferError};
pub use memory::{DEFAULT_LOCATION, MemoryRegion, MemoryRegistry};
pub use transport::topology::{Topology, TopologyEntry, TopologyError, WILDCARD_LOCATION};

pub fn init_logging() {
    logging::ensure_initialized();
}
