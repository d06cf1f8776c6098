use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;

use super::{TransferTask, TransportError};
use crate::{api::TransferState, segment::SegmentLease};

/// Why a slice did not complete.
#[derive(Debug)]
pub(crate) enum SliceError {
    Timeout(String),
    Failed(String),
}

/// Moves the bytes of one slice: `len` bytes starting `offset` bytes into
/// the request.
pub(crate) trait SliceExecutor: Send + Sync + 'static {
    fn execute(&self, task: &TransferTask, offset: u64, len: u64) -> Result<(), SliceError>;
}

// Worst outcome seen across a request's slices, in increasing severity.
const OUTCOME_OK: u8 = 0;
const OUTCOME_CANCELED: u8 = 1;
const OUTCOME_TIMEOUT: u8 = 2;
const OUTCOME_FAILED: u8 = 3;

struct TaskProgress {
    task: TransferTask,
    lease: Mutex<Option<SegmentLease>>,
    remaining: AtomicUsize,
    bytes: AtomicU64,
    outcome: AtomicU8,
}

impl TaskProgress {
    fn new(mut task: TransferTask, slices: usize) -> Self {
        let lease = task.lease.take();
        Self {
            task,
            lease: Mutex::new(lease),
            remaining: AtomicUsize::new(slices),
            bytes: AtomicU64::new(0),
            outcome: AtomicU8::new(OUTCOME_OK),
        }
    }

    fn record(&self, outcome: u8, len: u64) {
        if outcome == OUTCOME_OK {
            self.bytes.fetch_add(len, Ordering::AcqRel);
        }
        self.outcome.fetch_max(outcome, Ordering::AcqRel);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        // The target segment becomes closable before the caller can observe
        // the terminal state.
        drop(self.lease.lock().take());

        let state = match self.outcome.load(Ordering::Acquire) {
            OUTCOME_OK => TransferState::Completed,
            OUTCOME_CANCELED => TransferState::Canceled,
            OUTCOME_TIMEOUT => TransferState::Timeout,
            _ => TransferState::Failed,
        };
        let bytes = self.bytes.load(Ordering::Acquire);
        self.task.slot.finish(state, bytes);
        debug!(
            "{} index {}: {state} after {bytes}/{} bytes",
            self.task.batch, self.task.index, self.task.length
        );
    }
}

struct SliceJob {
    progress: Arc<TaskProgress>,
    offset: u64,
    len: u64,
}

/// Fixed set of threads executing slices for one transport.
pub(crate) struct WorkerPool {
    name: &'static str,
    slice_size: u64,
    sender: Mutex<Option<Sender<SliceJob>>>,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn start(
        name: &'static str,
        workers: usize,
        slice_size: u64,
        executor: Arc<dyn SliceExecutor>,
    ) -> Result<Self, TransportError> {
        let (sender, receiver) = channel::unbounded::<SliceJob>();
        let stopping = Arc::new(AtomicBool::new(false));

        let pool = Self {
            name,
            slice_size: slice_size.max(1),
            sender: Mutex::new(Some(sender)),
            stopping: Arc::clone(&stopping),
            workers: Mutex::new(Vec::with_capacity(workers)),
        };

        for idx in 0..workers.max(1) {
            let receiver = receiver.clone();
            let executor = Arc::clone(&executor);
            let stopping = Arc::clone(&stopping);
            let handle = thread::Builder::new()
                .name(format!("segflow-{name}-{idx}"))
                .spawn(move || worker_loop(receiver, executor, stopping))
                .map_err(|error| TransportError::Setup {
                    transport: name,
                    reason: format!("spawn worker: {error}"),
                })?;
            pool.workers.lock().push(handle);
        }
        Ok(pool)
    }

    pub(crate) fn submit(&self, tasks: Vec<TransferTask>) -> Result<(), TransportError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(TransportError::Closed(self.name));
        };

        for task in tasks {
            let slices = task.length.div_ceil(self.slice_size);
            let progress = Arc::new(TaskProgress::new(task, slices as usize));
            if slices == 0 {
                progress.finish();
                continue;
            }
            let mut offset = 0;
            while offset < progress.task.length {
                let len = self.slice_size.min(progress.task.length - offset);
                let job = SliceJob {
                    progress: Arc::clone(&progress),
                    offset,
                    len,
                };
                if sender.send(job).is_err() {
                    // Only possible if every worker died; nothing will ever
                    // run the remaining slices.
                    error!("{}: all workers are gone", self.name);
                    progress.outcome.store(OUTCOME_FAILED, Ordering::Release);
                    progress.finish();
                    break;
                }
                offset += len;
            }
        }
        Ok(())
    }

    /// Idempotent. Waits for the workers, which drain the queue first.
    pub(crate) fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        drop(self.sender.lock().take());

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(error) = handle.join() {
                error!("{}: worker panicked: {error:?}", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    receiver: Receiver<SliceJob>,
    executor: Arc<dyn SliceExecutor>,
    stopping: Arc<AtomicBool>,
) {
    while let Ok(job) = receiver.recv() {
        let task = &job.progress.task;
        let outcome = if stopping.load(Ordering::Acquire) {
            OUTCOME_CANCELED
        } else if Instant::now() >= task.deadline {
            OUTCOME_TIMEOUT
        } else {
            task.slot.mark_pending();
            match executor.execute(task, job.offset, job.len) {
                Ok(()) => OUTCOME_OK,
                Err(SliceError::Timeout(reason)) => {
                    warn!(
                        "{} index {} slice @{}+{} timed out: {reason}",
                        task.batch, task.index, job.offset, job.len
                    );
                    OUTCOME_TIMEOUT
                }
                Err(SliceError::Failed(reason)) => {
                    warn!(
                        "{} index {} slice @{}+{} failed: {reason}",
                        task.batch, task.index, job.offset, job.len
                    );
                    OUTCOME_FAILED
                }
            }
        };
        job.progress.record(outcome, job.len);
    }
}
