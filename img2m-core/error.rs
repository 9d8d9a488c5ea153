use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Invalid view pair: ({i}, {j}) (requires i < j)")]
    InvalidViewPair { i: u32, j: u32 },
    #[error("View id {view_id} out of range (collection holds {len} views)")]
    ViewOutOfRange { view_id: usize, len: usize },
    #[error("Descriptor data length mismatch: {rows}x{cols} expects {expected}, got {actual}")]
    DescriptorShape { rows: usize, cols: usize, expected: usize, actual: usize },
    #[error("Descriptor row has {actual} columns, matrix has {expected}")]
    RowLength { expected: usize, actual: usize },
    #[error("Cannot read image directory {path}: {reason}")]
    ImageDirectory { path: String, reason: String },
    #[error("Invalid thread count: {0} (must be 1-64)")]
    InvalidThreadCount(usize),
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
