//! Batch table and per-request completion slots.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;

use crate::{
    api::{BatchId, TransferState, TransferStatus},
    error::{Result, TransferError},
};

const STATE_SHIFT: u32 = 56;
const BYTES_MASK: u64 = (1 << STATE_SHIFT) - 1;

fn pack(state: TransferState, bytes: u64) -> u64 {
    ((state.as_raw() as u64) << STATE_SHIFT) | (bytes & BYTES_MASK)
}

fn unpack(raw: u64) -> TransferStatus {
    let state =
        TransferState::from_raw((raw >> STATE_SHIFT) as i32).unwrap_or(TransferState::Invalid);
    TransferStatus {
        state,
        transferred_bytes: raw & BYTES_MASK,
    }
}

/// Completion slot of one request. State and byte count live in a single
/// word so pollers never see a terminal state with a stale count.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    word: AtomicU64,
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self {
            word: AtomicU64::new(pack(TransferState::Waiting, 0)),
        }
    }
}

impl TaskSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn status(&self) -> TransferStatus {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// Advances to `state` unless the slot is already at or past its rank.
    pub(crate) fn advance(&self, state: TransferState, bytes: u64) -> bool {
        let next = pack(state, bytes);
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (unpack(current).state.rank() < state.rank()).then_some(next)
            })
            .is_ok()
    }

    pub(crate) fn mark_pending(&self) -> bool {
        self.advance(TransferState::Pending, 0)
    }

    pub(crate) fn finish(&self, state: TransferState, bytes: u64) -> bool {
        debug_assert!(state.is_terminal());
        self.advance(state, bytes)
    }
}

pub(crate) struct Batch {
    id: BatchId,
    capacity: usize,
    slots: RwLock<Vec<Arc<TaskSlot>>>,
}

impl Batch {
    fn new(id: BatchId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            slots: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.slots.read().len()
    }

    /// Appends `slots` as one unit. Returns the index of the first one.
    pub(crate) fn admit(&self, slots: &[Arc<TaskSlot>]) -> Result<usize> {
        let mut guard = self.slots.write();
        let used = guard.len();
        if slots.len() > self.capacity - used {
            return Err(TransferError::submission(format!(
                "{} requests exceed remaining capacity {} of {}",
                slots.len(),
                self.capacity - used,
                self.id
            )));
        }
        guard.extend(slots.iter().cloned());
        Ok(used)
    }

    fn slot(&self, index: usize) -> Option<Arc<TaskSlot>> {
        self.slots.read().get(index).cloned()
    }

    fn is_idle(&self) -> bool {
        self.slots
            .read()
            .iter()
            .all(|slot| slot.status().is_terminal())
    }
}

/// Allocated batches, keyed by id. Ids are never reused.
pub(crate) struct BatchManager {
    batches: DashMap<u64, Arc<Batch>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    max_batches: usize,
    max_batch_size: usize,
}

impl BatchManager {
    pub(crate) fn new(max_batches: usize, max_batch_size: usize) -> Self {
        Self {
            batches: DashMap::new(),
            next_id: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            max_batches,
            max_batch_size,
        }
    }

    pub(crate) fn allocate(&self, capacity: usize) -> Result<BatchId> {
        if capacity == 0 {
            return Err(TransferError::BatchExhaustion(
                "batch capacity must be non-zero".to_string(),
            ));
        }
        if capacity > self.max_batch_size {
            return Err(TransferError::BatchExhaustion(format!(
                "batch capacity {capacity} exceeds limit {}",
                self.max_batch_size
            )));
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_batches).then_some(live + 1)
            })
            .map_err(|live| {
                TransferError::BatchExhaustion(format!("{live} batches already allocated"))
            })?;

        let id = BatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.batches.insert(id.0, Arc::new(Batch::new(id, capacity)));
        debug!("allocated {id} with capacity {capacity}");
        Ok(id)
    }

    pub(crate) fn get(&self, id: BatchId) -> Option<Arc<Batch>> {
        self.batches.get(&id.0).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn status(&self, id: BatchId, index: usize) -> Result<TransferStatus> {
        self.get(id)
            .and_then(|batch| batch.slot(index))
            .map(|slot| slot.status())
            .ok_or(TransferError::UnknownTask {
                batch: id.0,
                index,
            })
    }

    pub(crate) fn free(&self, id: BatchId) -> Result<()> {
        if self
            .batches
            .remove_if(&id.0, |_, batch| batch.is_idle())
            .is_some()
        {
            self.live.fetch_sub(1, Ordering::AcqRel);
            debug!("freed {id}");
            return Ok(());
        }
        if self.batches.contains_key(&id.0) {
            Err(TransferError::BatchTeardown(format!(
                "{id} still has requests in flight"
            )))
        } else {
            Err(TransferError::BatchTeardown(format!(
                "{id} is unknown or already freed"
            )))
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
