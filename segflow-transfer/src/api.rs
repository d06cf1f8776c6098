//! Value types shared by the engine facade and its callers.

use std::fmt::{Display, Formatter};

/// Direction of a transfer relative to the local source buffer.
///
/// `Read` pulls bytes from the remote segment into the local source address,
/// `Write` pushes bytes from the local source address into the segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Read,
    Write,
}

impl OpCode {
    pub const fn as_raw(self) -> i32 {
        match self {
            OpCode::Read => 0,
            OpCode::Write => 1,
        }
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(OpCode::Read),
            1 => Some(OpCode::Write),
            _ => None,
        }
    }
}

/// Lifecycle of a single submitted request.
///
/// `Waiting -> Pending -> {Completed, Timeout, Failed, Canceled}`. `Invalid`
/// only exists for raw-code parity with bindings; the engine never stores it
/// as a request state and reports unknown tasks as an error instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    Waiting,
    Pending,
    Invalid,
    Canceled,
    Completed,
    Timeout,
    Failed,
}

impl TransferState {
    pub const fn as_raw(self) -> i32 {
        match self {
            TransferState::Waiting => 0,
            TransferState::Pending => 1,
            TransferState::Invalid => 2,
            TransferState::Canceled => 3,
            TransferState::Completed => 4,
            TransferState::Timeout => 5,
            TransferState::Failed => 6,
        }
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TransferState::Waiting),
            1 => Some(TransferState::Pending),
            2 => Some(TransferState::Invalid),
            3 => Some(TransferState::Canceled),
            4 => Some(TransferState::Completed),
            5 => Some(TransferState::Timeout),
            6 => Some(TransferState::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Canceled
                | TransferState::Completed
                | TransferState::Timeout
                | TransferState::Failed
        )
    }

    /// Position in the lifecycle; a request's rank never decreases.
    pub(crate) const fn rank(self) -> u8 {
        match self {
            TransferState::Waiting => 0,
            TransferState::Pending => 1,
            TransferState::Canceled
            | TransferState::Completed
            | TransferState::Timeout
            | TransferState::Failed => 2,
            TransferState::Invalid => u8::MAX,
        }
    }
}

impl Display for TransferState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::Waiting => "WAITING",
            TransferState::Pending => "PENDING",
            TransferState::Invalid => "INVALID",
            TransferState::Canceled => "CANCELED",
            TransferState::Completed => "COMPLETED",
            TransferState::Timeout => "TIMEOUT",
            TransferState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Latest known outcome of one request. `transferred_bytes` is only
/// meaningful once `state` is terminal and not a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferStatus {
    pub state: TransferState,
    pub transferred_bytes: u64,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Handle of an opened remote segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub(crate) u64);

impl SegmentId {
    /// Raw handle for bindings; `-1` is reserved for "open failed".
    pub fn as_raw(self) -> i64 {
        self.0 as i64
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().map(Self)
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "segment#{}", self.0)
    }
}

/// Handle of an allocated batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub(crate) u64);

impl BatchId {
    /// Raw handle for bindings; `-1` is reserved for "allocation failed".
    pub fn as_raw(self) -> i64 {
        self.0 as i64
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().map(Self)
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub opcode: OpCode,
    pub source: u64,
    pub target_id: SegmentId,
    pub target_offset: u64,
    pub length: u64,
}

impl TransferRequest {
    pub fn read(source: u64, target_id: SegmentId, target_offset: u64, length: u64) -> Self {
        Self {
            opcode: OpCode::Read,
            source,
            target_id,
            target_offset,
            length,
        }
    }

    pub fn write(source: u64, target_id: SegmentId, target_offset: u64, length: u64) -> Self {
        Self {
            opcode: OpCode::Write,
            source,
            target_id,
            target_offset,
            length,
        }
    }
}

/// One local buffer for batch registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferEntry {
    pub addr: u64,
    pub length: usize,
}

#[cfg(test)]
mod tests {
    use super::{BatchId, OpCode, SegmentId, TransferState};

    #[test]
    fn raw_codes_match_binding_constants() {
        assert_eq!(OpCode::Read.as_raw(), 0);
        assert_eq!(OpCode::Write.as_raw(), 1);
        assert_eq!(TransferState::Waiting.as_raw(), 0);
        assert_eq!(TransferState::Pending.as_raw(), 1);
        assert_eq!(TransferState::Invalid.as_raw(), 2);
        assert_eq!(TransferState::Canceled.as_raw(), 3);
        assert_eq!(TransferState::Completed.as_raw(), 4);
        assert_eq!(TransferState::Timeout.as_raw(), 5);
        assert_eq!(TransferState::Failed.as_raw(), 6);
        assert_eq!(TransferState::from_raw(7), None);
        assert_eq!(OpCode::from_raw(2), None);
    }

    #[test]
    fn terminal_partition() {
        let terminal: Vec<_> = (0..7)
            .filter_map(TransferState::from_raw)
            .filter(|state| state.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                TransferState::Canceled,
                TransferState::Completed,
                TransferState::Timeout,
                TransferState::Failed
            ]
        );
        assert!(TransferState::Waiting.rank() < TransferState::Pending.rank());
        assert!(TransferState::Pending.rank() < TransferState::Failed.rank());
    }

    #[test]
    fn negative_raw_handles_are_rejected() {
        assert_eq!(SegmentId::from_raw(-1), None);
        assert_eq!(BatchId::from_raw(-1), None);
        assert_eq!(BatchId::from_raw(5).map(BatchId::as_raw), Some(5));
    }
}
