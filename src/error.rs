//! Typed errors for process launch, model conversion, and upscale runs
//!
//! The wrapped tools do not set reliable exit codes, so tool failure is
//! detected from classified output lines and carried here as the exact
//! line the tool printed. Scale-probe failures never appear in this
//! taxonomy at all; the probe falls back to a default and logs instead.

use thiserror::Error;

/// A process could not be started at all (missing executable, bad
/// permissions). Fatal for the current operation, never retried.
#[derive(Debug, Error)]
#[error("failed to launch '{program}': {source}")]
pub struct LaunchError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Failure of a single `ensure_converted` call.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The converter printed a recognized error marker. The payload is
    /// the first classified error line, verbatim.
    #[error("model converter reported: {0}")]
    ToolReported(String),

    #[error("conversion filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// The tool-reported message, if this error carries one.
    pub fn tool_message(&self) -> Option<&str> {
        match self {
            ConvertError::ToolReported(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Failure of a full upscale run.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The backend only handles 4x models; anything else is rejected
    /// before the backend is launched.
    #[error("unsupported model scale {0}x, this backend only supports 4x models")]
    UnsupportedScale(u32),

    /// The upscaler backend printed a recognized error marker.
    #[error("upscaler reported: {0}")]
    ToolReported(String),
}

pub type ConvertResult<T> = Result<T, ConvertError>;
pub type UpscaleResult<T> = Result<T, UpscaleError>;
