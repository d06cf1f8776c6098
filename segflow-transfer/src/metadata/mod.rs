//! Discovery service access.
//!
//! The engine publishes its own segment descriptor under
//! [`segment_key`] and resolves peers by reading theirs. The storage backend is
//! chosen by the metadata URI protocol:
//!
//! - `memory://<name>`: process-wide in-memory store shared by every engine
//!   using the same name (tests, single-host deployments)
//! - `file://<dir>`: one JSON document per key under a shared directory
//! - `etcd://<host:port>[,<host:port>...]`: etcd cluster (feature `etcd`)

mod descriptor;
#[cfg(feature = "etcd")]
mod etcd_store;
mod file_store;
mod memory_store;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::config::MetadataUri;

pub use descriptor::{BufferDesc, DeviceDesc, RpcEndpoint, SegmentDesc};
#[cfg(feature = "etcd")]
pub use etcd_store::EtcdStore;
pub use file_store::FileStore;
pub use memory_store::MemoryStore;

const SEGMENT_KEY_PREFIX: &str = "segflow/segments/";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed metadata entry `{key}`: {reason}")]
    Malformed { key: String, reason: String },
    #[error("unsupported metadata protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid metadata key: {0}")]
    InvalidKey(String),
}

/// Key/value access to the discovery service.
pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError>;
    fn set(&self, key: &str, value: Bytes) -> Result<(), MetadataError>;
    fn remove(&self, key: &str) -> Result<(), MetadataError>;
}

pub fn segment_key(segment_name: &str) -> String {
    format!("{SEGMENT_KEY_PREFIX}{segment_name}")
}

/// Opens the store named by `uri`. Network-backed stores connect lazily, so
/// an unreachable service surfaces on first use rather than here.
pub fn connect(
    uri: &MetadataUri,
    #[cfg_attr(not(feature = "etcd"), allow(unused_variables))] connect_timeout: Duration,
) -> Result<Arc<dyn MetadataStore>, MetadataError> {
    match uri.protocol.as_str() {
        "memory" => Ok(MemoryStore::shared(&uri.domain)),
        "file" => Ok(Arc::new(FileStore::open(&uri.domain)?)),
        #[cfg(feature = "etcd")]
        "etcd" => Ok(Arc::new(EtcdStore::new(&uri.domain, connect_timeout)?)),
        other => Err(MetadataError::UnsupportedProtocol(other.to_string())),
    }
}

pub(crate) fn load_segment(
    store: &dyn MetadataStore,
    segment_name: &str,
) -> Result<Option<SegmentDesc>, MetadataError> {
    let key = segment_key(segment_name);
    match store.get(&key)? {
        Some(raw) => SegmentDesc::from_json(&key, &raw).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn publish_segment(
    store: &dyn MetadataStore,
    desc: &SegmentDesc,
) -> Result<(), MetadataError> {
    let key = segment_key(&desc.name);
    store.set(&key, desc.to_json(&key)?)
}
