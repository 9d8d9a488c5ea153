use img2m_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Invalid image dimensions: {width}x{height} (must be > 0)")]
    InvalidImageSize { width: u32, height: u32 },
    #[error("Image {width}x{height} too small (minimum {min_size}x{min_size})")]
    ImageTooSmall { width: u32, height: u32, min_size: u32 },
    #[error("Invalid {detector} parameter {name}: {reason}")]
    InvalidParameter { detector: &'static str, name: &'static str, reason: String },
    #[error("Invalid first_octave: {0} (must be -1, 0 or 1)")]
    InvalidFirstOctave(i32),
    #[error("Descriptor computation on existing keypoints is not supported for {0}")]
    ComputeUnsupported(String),
    #[error("External process failed: {0}")]
    ExternalProcess(String),
    #[error("Malformed feature file: {0}")]
    MalformedFeatureFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type FeatureResult<T> = Result<T, FeatureError>;
