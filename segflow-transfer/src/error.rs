use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Control-plane failures. Per-request outcomes (failed, timed out, canceled)
/// are never reported here; they are terminal states read through polling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("engine init failed: {0}")]
    EngineInit(String),
    #[error("engine teardown failed: {0}")]
    EngineTeardown(String),
    #[error("memory registration failed: {0}")]
    Registration(String),
    #[error("segment resolution failed: {0}")]
    SegmentResolution(String),
    #[error("batch allocation failed: {0}")]
    BatchExhaustion(String),
    #[error("submission rejected: {0}")]
    Submission(String),
    #[error("unknown task: batch={batch}, index={index}")]
    UnknownTask { batch: u64, index: usize },
    #[error("batch teardown failed: {0}")]
    BatchTeardown(String),
}

impl TransferError {
    pub(crate) fn registration(reason: impl Into<String>) -> Self {
        Self::Registration(reason.into())
    }

    pub(crate) fn segment(reason: impl Into<String>) -> Self {
        Self::SegmentResolution(reason.into())
    }

    pub(crate) fn submission(reason: impl Into<String>) -> Self {
        Self::Submission(reason.into())
    }
}
