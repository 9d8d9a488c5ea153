use img2m_core::CoreError;
use img2m_features::FeatureError;
use img2m_matching::MatchError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration option {key}: {reason}")]
    Config { key: String, reason: String },
    #[error("Invalid input data: {0}")]
    InputData(String),
    #[error("Export to {path} failed: {reason}")]
    Export { path: PathBuf, reason: String },
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
    #[error("Viewer cancelled")]
    ViewerCancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl PipelineError {
    pub(crate) fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Config { key: key.into(), reason: reason.into() }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
