//! Locally registered memory regions.
//!
//! Every region gets a stable offset in the local segment's address space
//! when it is registered. Offsets are never reused, so peers addressing a
//! region by offset cannot land in a different region after churn.

use std::sync::Arc;

use hashlink::LinkedHashMap;
use parking_lot::RwLock;

use crate::error::{Result, TransferError};

pub const DEFAULT_LOCATION: &str = "cpu:0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub length: u64,
    /// Placement hint such as `cpu:0` or `cuda:1`, matched against NIC topology.
    pub location: String,
    pub remote_accessible: bool,
    /// Start of this region in the local segment's address space.
    pub segment_offset: u64,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.addr + self.length
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.addr && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, addr: u64, end: u64) -> bool {
        addr < self.end() && self.addr < end
    }
}

#[derive(Default)]
struct RegistryState {
    regions: LinkedHashMap<u64, Arc<MemoryRegion>>,
    next_offset: u64,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        addr: u64,
        length: u64,
        location: &str,
        remote_accessible: bool,
    ) -> Result<Arc<MemoryRegion>> {
        if addr == 0 {
            return Err(TransferError::registration("addr must be non-zero"));
        }
        if length == 0 {
            return Err(TransferError::registration("length must be non-zero"));
        }
        let Some(end) = addr.checked_add(length) else {
            return Err(TransferError::registration(format!(
                "region {addr:#x}+{length} overflows the address space"
            )));
        };
        let location = match location.trim() {
            "" => DEFAULT_LOCATION,
            other => other,
        };

        let mut state = self.state.write();
        if let Some(existing) = state
            .regions
            .values()
            .find(|region| region.overlaps(addr, end))
        {
            return Err(TransferError::registration(format!(
                "region {addr:#x}+{length} overlaps registered region {:#x}+{}",
                existing.addr, existing.length
            )));
        }

        let region = Arc::new(MemoryRegion {
            addr,
            length,
            location: location.to_string(),
            remote_accessible,
            segment_offset: state.next_offset,
        });
        state.next_offset += length;
        state.regions.insert(addr, Arc::clone(&region));
        Ok(region)
    }

    pub fn unregister(&self, addr: u64) -> Result<Arc<MemoryRegion>> {
        self.state
            .write()
            .regions
            .remove(&addr)
            .ok_or_else(|| TransferError::registration(format!("addr {addr:#x} is not registered")))
    }

    /// Puts back a region removed by [`Self::unregister`], keeping its offset.
    pub(crate) fn restore(&self, region: Arc<MemoryRegion>) {
        self.state.write().regions.insert(region.addr, region);
    }

    /// Region fully covering `[addr, addr + len)`.
    pub fn find(&self, addr: u64, len: u64) -> Option<Arc<MemoryRegion>> {
        self.state
            .read()
            .regions
            .values()
            .find(|region| region.contains(addr, len))
            .cloned()
    }

    /// Like [`Self::find`] but only for regions peers are allowed to touch.
    pub fn find_remote_accessible(&self, addr: u64, len: u64) -> Option<Arc<MemoryRegion>> {
        self.find(addr, len).filter(|region| region.remote_accessible)
    }

    pub fn get(&self, addr: u64) -> Option<Arc<MemoryRegion>> {
        self.state.read().regions.get(&addr).cloned()
    }

    /// Regions in registration order.
    pub fn snapshot(&self) -> Vec<Arc<MemoryRegion>> {
        self.state.read().regions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().regions.is_empty()
    }
}
