use crate::redraw::JobPanicked;
use thiserror::Error;

/// Failure of a single icon paint. Only ever reported through the
/// completion of the redraw job that produced it.
#[derive(Debug, Error)]
pub enum PaintError {
    #[error("failed to encode icon: {0}")]
    Encode(#[from] image::ImageError),

    #[error("failed to write icon: {0}")]
    Io(#[from] std::io::Error),

    #[error("icon task failed: {0}")]
    Task(String),

    #[error("icon job panicked: {0}")]
    Panicked(String),
}

impl From<JobPanicked> for PaintError {
    fn from(panic: JobPanicked) -> Self {
        PaintError::Panicked(panic.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("download {0} not found")]
    NotFound(String),

    #[error("download {0} is not in progress")]
    NotInProgress(String),
}
