use img2m_core::{CoreError, DescriptorType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("{backend} matcher requires {required} descriptors, got {found}")]
    IncompatibleDescriptors { backend: &'static str, required: DescriptorType, found: DescriptorType },
    #[error("Descriptor dimension mismatch: query has {query} columns, train has {train}")]
    DimensionMismatch { query: usize, train: usize },
    #[error("Empty descriptor set")]
    EmptyDescriptors,
    #[error("Invalid matcher parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("LightGlue needs images, keypoints and descriptors of both views")]
    MissingPairData,
    #[error("External process failed: {0}")]
    ExternalProcess(String),
    #[error("Malformed matcher output: {0}")]
    MalformedOutput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type MatchResult<T> = Result<T, MatchError>;
