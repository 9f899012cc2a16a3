//! Upscale run orchestration
//!
//! Composes the whole flow for one logical operation: ensure the model is
//! converted, probe its scale, reject incompatible models, then drive the
//! NCNN upscaler backend with live per-line classification. Progress is
//! forwarded to the sink per display mode; batch runs report one coarse
//! post-processing status instead of per-tile updates.

use crate::config::ManagerConfig;
use crate::convert::{ConvertedModel, ModelConverter};
use crate::error::{UpscaleError, UpscaleResult};
use crate::output::{Classification, ProcessKind, ProgressSink, UpscaleMode, classify};
use crate::process::{ActiveProcess, OutputLine, ProcessRunner, SpawnSpec};
use crate::scale::ScaleProbe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Filename pattern applied to converted artifacts; `*` is the model's
/// embedded index, which for this backend is its scale.
pub const FILENAME_PATTERN: &str = "esrgan-x*";

/// The wrapped backend only ships 4x weights handling.
pub const REQUIRED_SCALE: u32 = 4;

/// Counters and timestamps for one finished run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunStats {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub scale: u32,
    pub lines_seen: u64,
    pub last_progress: Option<f32>,
}

/// One-backend-at-a-time upscaler front end.
pub struct Upscaler {
    config: ManagerConfig,
    runner: Arc<dyn ProcessRunner>,
    converter: ModelConverter,
    probe: ScaleProbe,
    sink: Arc<dyn ProgressSink>,
    /// Live wrapped process of the current phase, shared with the
    /// converter and the scale probe so `abort` reaches all three.
    active: ActiveProcess,
    /// One logical operation at a time; a second `run` waits its turn.
    run_lock: Mutex<()>,
}

impl Upscaler {
    pub fn new(
        config: ManagerConfig,
        runner: Arc<dyn ProcessRunner>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let active = ActiveProcess::default();
        let converter = ModelConverter::new(
            runner.clone(),
            config.model_root.clone(),
            config.converter_dir(),
            config.python_cmd.clone(),
            config.hidden(),
            active.clone(),
        );
        let probe = ScaleProbe::new(
            runner.clone(),
            config.converter_dir(),
            config.python_cmd.clone(),
            active.clone(),
        );
        Self {
            config,
            runner,
            converter,
            probe,
            sink,
            active,
            run_lock: Mutex::new(()),
        }
    }

    /// Run one upscale: `model` is the source ESRGAN model (or a
    /// pre-converted artifact directory), `input`/`output` the image
    /// paths handed to the backend.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        model: &Path,
        mode: UpscaleMode,
    ) -> UpscaleResult<RunStats> {
        let _guard = self.run_lock.lock().await;
        let started_at = chrono::Utc::now();

        self.sink.report(1.0, "Converting model...");
        let converted = self.converter.ensure_converted(model, FILENAME_PATTERN).await?;
        tracing::info!(component = "ESRGAN", model = %converted.dir.display(), "NCNN model is ready");

        self.sink.report(3.0, "Loading RealESRGAN (NCNN)...");
        let scale = self.probe.determine_scale(&converted.dir).await;
        if scale != REQUIRED_SCALE {
            return Err(UpscaleError::UnsupportedScale(scale));
        }

        let (lines_seen, last_progress) =
            self.run_backend(input, output, &converted, scale, mode).await?;

        if mode == UpscaleMode::Batch {
            self.sink.report(100.0, "Post-Processing...");
        }

        Ok(RunStats {
            started_at,
            finished_at: chrono::Utc::now(),
            scale,
            lines_seen,
            last_progress,
        })
    }

    /// Kill the live wrapped process, whichever phase owns it: converter,
    /// scale probe, or backend. The pending `run` unblocks shortly after.
    pub async fn abort(&self) {
        if let Some(handle) = self.active.take().await {
            tracing::warn!("aborting live tool process");
            self.runner.kill(&handle).await;
        }
    }

    async fn run_backend(
        &self,
        input: &Path,
        output: &Path,
        converted: &ConvertedModel,
        scale: u32,
        mode: UpscaleMode,
    ) -> UpscaleResult<(u64, Option<f32>)> {
        let spec = SpawnSpec {
            program: self.config.upscaler_exe.clone(),
            args: self.backend_args(input, output, converted, scale),
            cwd: Some(self.config.upscaler_dir()),
            hidden: self.config.hidden(),
            component: "NCNN",
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = self.config.hidden().then_some(tx);

        let classifier = tokio::spawn(classify_stream(rx, mode, self.sink.clone()));

        let handle = self.runner.launch(spec, sender).await?;
        self.active.register(handle.clone()).await;
        self.runner.wait(&handle).await;
        self.active.clear().await;

        let (lines_seen, last_progress, first_error) =
            classifier.await.unwrap_or((0, None, None));

        if let Some(message) = first_error {
            return Err(UpscaleError::ToolReported(message));
        }
        Ok((lines_seen, last_progress))
    }

    fn backend_args(
        &self,
        input: &Path,
        output: &Path,
        converted: &ConvertedModel,
        scale: u32,
    ) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "-g".to_string(),
            self.config.gpus.clone(),
            "-m".to_string(),
            converted.dir.to_string_lossy().into_owned(),
            "-n".to_string(),
            format!("esrgan-x{scale}"),
            "-s".to_string(),
            scale.to_string(),
        ];
        if self.config.tta {
            args.push("-x".to_string());
        }
        if let Some(tile_size) = self.config.effective_tile_size() {
            args.push("-t".to_string());
            args.push(tile_size.to_string());
        }
        args
    }
}

/// Consume backend output until the streams close, classifying each line
/// and forwarding accepted progress. Returns line count, last progress
/// seen, and the first error signal if any.
async fn classify_stream(
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    mode: UpscaleMode,
    sink: Arc<dyn ProgressSink>,
) -> (u64, Option<f32>, Option<String>) {
    let mut lines_seen = 0u64;
    let mut last_progress = None;
    let mut first_error = None;

    while let Some(line) = rx.recv().await {
        lines_seen += 1;
        match classify(&line.text, ProcessKind::Upscaler) {
            Classification::Progress(percent) => {
                last_progress = Some(percent);
                if mode.shows_tile_progress() {
                    sink.report(percent, &format!("Upscaling Tiles ({percent}%)"));
                }
            }
            Classification::ErrorSignal(message) => {
                if first_error.is_none() {
                    first_error = Some(message);
                }
            }
            Classification::Informational => {}
        }
    }

    (lines_seen, last_progress, first_error)
}
