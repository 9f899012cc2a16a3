//! NCNN Manager - upscaler backend and model-conversion orchestrator
//!
//! A lightweight Rust library (plus CLI) that wraps NCNN image-upscaling
//! binaries and the pth2ncnn model converter: non-blocking process launch
//! with live output classification, an on-disk converted-model cache, and
//! typed propagation of tool failure.

pub mod artifact;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod process;
pub mod scale;
pub mod upscale;

pub use config::ManagerConfig;
pub use convert::{ConvertedModel, ModelConverter};
pub use error::{ConvertError, LaunchError, UpscaleError};
pub use output::{Classification, ProcessKind, ProgressSink, TracingProgressSink, UpscaleMode};
pub use process::{
    ActiveProcess, ExitOutcome, ProcessHandle, ProcessRunner, SpawnSpec, SystemProcessRunner,
};
pub use scale::{DEFAULT_SCALE, ScaleProbe};
pub use upscale::{RunStats, Upscaler};
