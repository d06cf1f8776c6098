use std::{ptr, sync::Arc};

use log::info;

use super::{
    LOCAL, TransferTask, Transport, TransportContext, TransportError,
    worker_pool::{SliceError, SliceExecutor, WorkerPool},
};
use crate::{
    api::OpCode,
    memory::{MemoryRegion, MemoryRegistry},
    metadata::SegmentDesc,
};

/// Loopback transport for requests whose target is this engine's own
/// segment.
pub(crate) struct LocalTransport {
    segment_name: String,
    pool: WorkerPool,
}

impl LocalTransport {
    pub(crate) fn start(ctx: &TransportContext, params: &str) -> Result<Self, TransportError> {
        let _: serde_json::Map<String, serde_json::Value> = super::parse_params(LOCAL, params)?;
        let executor = Arc::new(LocalCopy {
            registry: Arc::clone(&ctx.registry),
        });
        let pool = WorkerPool::start(
            LOCAL,
            ctx.tuning.workers_per_transport,
            ctx.tuning.slice_size,
            executor,
        )?;
        info!("local transport ready for `{}`", ctx.identity.server_name);
        Ok(Self {
            segment_name: ctx.identity.server_name.clone(),
            pool,
        })
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        LOCAL
    }

    fn priority(&self) -> u8 {
        0
    }

    fn describe(&self, _desc: &mut SegmentDesc) {}

    fn register_memory(&self, _region: &MemoryRegion) -> Result<(), TransportError> {
        Ok(())
    }

    fn unregister_memory(&self, _region: &MemoryRegion) -> Result<(), TransportError> {
        Ok(())
    }

    fn can_route(&self, _source: &MemoryRegion, target: &SegmentDesc) -> bool {
        target.name == self.segment_name
    }

    fn submit(&self, tasks: Vec<TransferTask>) -> Result<(), TransportError> {
        self.pool.submit(tasks)
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct LocalCopy {
    registry: Arc<MemoryRegistry>,
}

impl SliceExecutor for LocalCopy {
    fn execute(&self, task: &TransferTask, offset: u64, len: u64) -> Result<(), SliceError> {
        let source = task.source + offset;
        let target = task.target_addr + offset;
        if self.registry.find(source, len).is_none() {
            return Err(SliceError::Failed(format!(
                "source {source:#x}+{len} is no longer registered"
            )));
        }
        if self.registry.find_remote_accessible(target, len).is_none() {
            return Err(SliceError::Failed(format!(
                "target {target:#x}+{len} is no longer registered"
            )));
        }

        let (from, to) = match task.opcode {
            OpCode::Write => (source, target),
            OpCode::Read => (target, source),
        };
        // SAFETY: both ranges lie inside regions the owner registered with
        // this engine; `ptr::copy` tolerates overlap.
        unsafe {
            ptr::copy(from as *const u8, to as *mut u8, len as usize);
        }
        Ok(())
    }
}
