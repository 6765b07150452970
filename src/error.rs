use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the viewer core.
///
/// Every variant is scoped to the operation that produced it. A failed load or a
/// rejected request leaves the previously installed buffers untouched.
#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read recording {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no recording data loaded")]
    NoData,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("segment of {len} samples is too short for zero-phase filtering (need more than {min})")]
    SegmentTooShort { len: usize, min: usize },

    #[error("invalid filter design: {0}")]
    InvalidDesign(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("accelerator failure: {0}")]
    Accelerator(String),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

pub type ViewerResult<T> = Result<T, ViewerError>;
