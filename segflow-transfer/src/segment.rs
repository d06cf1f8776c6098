//! Segment handles and the resolved-descriptor cache.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::{
    api::SegmentId,
    error::{Result, TransferError},
    metadata::{self, MetadataStore, SegmentDesc},
};

struct OpenSegment {
    name: String,
    desc: RwLock<Arc<SegmentDesc>>,
    in_flight: Arc<AtomicUsize>,
}

/// Keeps a segment handle busy while a request targeting it is in flight.
#[derive(Debug)]
pub(crate) struct SegmentLease {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct SegmentDirectory {
    store: Arc<dyn MetadataStore>,
    cache: DashMap<String, Arc<SegmentDesc>>,
    handles: DashMap<u64, Arc<OpenSegment>>,
    next_id: AtomicU64,
}

impl SegmentDirectory {
    pub(crate) fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            handles: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn resolve(&self, name: &str) -> Result<Arc<SegmentDesc>> {
        match metadata::load_segment(self.store.as_ref(), name) {
            Ok(Some(desc)) => Ok(Arc::new(desc)),
            Ok(None) => Err(TransferError::segment(format!(
                "segment `{name}` is not published"
            ))),
            Err(error) => Err(TransferError::segment(format!(
                "cannot resolve `{name}`: {error}"
            ))),
        }
    }

    /// Every call yields a fresh handle, even for a name that is already open.
    pub(crate) fn open(&self, name: &str) -> Result<SegmentId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TransferError::segment("segment name is empty"));
        }

        let desc = match self.cache.get(name) {
            Some(cached) => Arc::clone(cached.value()),
            None => {
                let desc = self.resolve(name)?;
                self.cache.insert(name.to_string(), Arc::clone(&desc));
                desc
            }
        };

        let id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(
            id.0,
            Arc::new(OpenSegment {
                name: name.to_string(),
                desc: RwLock::new(desc),
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        );
        debug!("opened {id} for `{name}`");
        Ok(id)
    }

    pub(crate) fn close(&self, id: SegmentId) -> Result<()> {
        if let Some((_, segment)) = self
            .handles
            .remove_if(&id.0, |_, segment| segment.in_flight.load(Ordering::Acquire) == 0)
        {
            debug!("closed {id} for `{}`", segment.name);
            return Ok(());
        }
        if self.handles.contains_key(&id.0) {
            Err(TransferError::segment(format!(
                "{id} still has requests in flight"
            )))
        } else {
            Err(TransferError::segment(format!(
                "{id} is unknown or already closed"
            )))
        }
    }

    /// Current descriptor of an open handle plus a lease that blocks
    /// [`Self::close`] until dropped.
    pub(crate) fn acquire(&self, id: SegmentId) -> Option<(Arc<SegmentDesc>, SegmentLease)> {
        let entry = self.handles.get(&id.0)?;
        let segment = entry.value();
        segment.in_flight.fetch_add(1, Ordering::AcqRel);
        Some((
            Arc::clone(&segment.desc.read()),
            SegmentLease {
                in_flight: Arc::clone(&segment.in_flight),
            },
        ))
    }

    /// Drops every cached descriptor and re-reads the ones behind open
    /// handles. Handles stay valid; a handle whose segment cannot be
    /// re-read keeps its previous descriptor.
    pub(crate) fn sync_cache(&self) -> Result<()> {
        self.cache.clear();

        let open: Vec<(u64, Arc<OpenSegment>)> = self
            .handles
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut first_error = None;
        for (id, segment) in open {
            let desc = match self.cache.get(&segment.name) {
                Some(cached) => Ok(Arc::clone(cached.value())),
                None => self.resolve(&segment.name),
            };
            match desc {
                Ok(desc) => {
                    self.cache
                        .insert(segment.name.clone(), Arc::clone(&desc));
                    *segment.desc.write() = desc;
                }
                Err(error) => {
                    warn!("segment#{id}: keeping stale descriptor: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                info!("segment cache synced");
                Ok(())
            }
        }
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.handles.len()
    }
}
