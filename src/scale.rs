//! Model scale probing
//!
//! Runs the get_scale helper against a converted artifact's weights and
//! parameter files and parses the upscale factor out of its output. The
//! probe never fails outward: scale only gates a downstream
//! compatibility check, and a wrong default fails safely there, whereas
//! propagating an error here would abort an otherwise recoverable run.

use crate::artifact::{PARAMS_EXT, WEIGHTS_EXT};
use crate::output::first_integer;
use crate::process::{ActiveProcess, ProcessRunner, SpawnSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Scale assumed when the probe cannot produce one.
pub const DEFAULT_SCALE: u32 = 4;

/// Python entry point of the probe, resolved relative to the converter
/// directory (it ships alongside pth2ncnn).
const PROBE_SCRIPT: &str = "get_scale.py";

pub struct ScaleProbe {
    runner: Arc<dyn ProcessRunner>,
    converter_dir: PathBuf,
    python_cmd: String,
    active: ActiveProcess,
}

impl ScaleProbe {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        converter_dir: PathBuf,
        python_cmd: String,
        active: ActiveProcess,
    ) -> Self {
        Self {
            runner,
            converter_dir,
            python_cmd,
            active,
        }
    }

    /// Upscale factor of the artifact at `model_dir`, or [`DEFAULT_SCALE`]
    /// with a logged notice when it cannot be determined.
    pub async fn determine_scale(&self, model_dir: &Path) -> u32 {
        match self.probe(model_dir).await {
            Ok(scale) => {
                tracing::info!(model_dir = %model_dir.display(), scale, "determined model scale");
                scale
            }
            Err(e) => {
                tracing::warn!(
                    model_dir = %model_dir.display(),
                    error = %e,
                    fallback = DEFAULT_SCALE,
                    "failed to determine model scale, using fallback"
                );
                DEFAULT_SCALE
            }
        }
    }

    async fn probe(&self, model_dir: &Path) -> anyhow::Result<u32> {
        let bin_file = find_file_with_ext(model_dir, WEIGHTS_EXT)?;
        let param_file = find_file_with_ext(model_dir, PARAMS_EXT)?;

        let spec = SpawnSpec {
            program: self.python_cmd.clone(),
            args: vec![
                PROBE_SCRIPT.to_string(),
                bin_file.to_string_lossy().into_owned(),
                param_file.to_string_lossy().into_owned(),
            ],
            cwd: Some(self.converter_dir.clone()),
            // Always hidden: the probe's whole point is captured output.
            hidden: true,
            component: "ScaleCheck",
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.runner.launch(spec, Some(tx)).await?;
        self.active.register(handle.clone()).await;
        self.runner.wait(&handle).await;
        self.active.clear().await;

        let mut accumulated = String::new();
        while let Some(line) = rx.recv().await {
            accumulated.push_str(&line.text);
            accumulated.push('\n');
        }

        let scale = first_integer(&accumulated)
            .ok_or_else(|| anyhow::anyhow!("no integer in probe output: {accumulated:?}"))?;
        anyhow::ensure!(scale > 0, "probe reported zero scale");
        Ok(scale)
    }
}

/// The single file with the given extension in `dir`.
fn find_file_with_ext(dir: &Path, ext: &str) -> anyhow::Result<PathBuf> {
    std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().and_then(|x| x.to_str()) == Some(ext))
        .ok_or_else(|| anyhow::anyhow!("no .{ext} file in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::{MockProcessRunner, ScriptedProcess};
    use std::fs::File;
    use tempfile::TempDir;

    fn artifact_dir() -> TempDir {
        let tmp = TempDir::new().unwrap();
        File::create(tmp.path().join("esrgan-x4.bin")).unwrap();
        File::create(tmp.path().join("esrgan-x4.param")).unwrap();
        tmp
    }

    fn probe_with(scripts: Vec<ScriptedProcess>) -> (ScaleProbe, Arc<MockProcessRunner>) {
        let runner = Arc::new(MockProcessRunner::new(scripts));
        let probe = ScaleProbe::new(
            runner.clone(),
            PathBuf::from("/opt/pth2ncnn"),
            "python".to_string(),
            ActiveProcess::default(),
        );
        (probe, runner)
    }

    #[tokio::test]
    async fn parses_scale_from_probe_output() {
        let tmp = artifact_dir();
        let (probe, runner) = probe_with(vec![ScriptedProcess::succeeding(vec!["Scale: 2"])]);

        assert_eq!(probe.determine_scale(tmp.path()).await, 2);

        let spec = &runner.launches().await[0];
        assert_eq!(spec.args[0], "get_scale.py");
        assert!(spec.hidden);
    }

    #[tokio::test]
    async fn unparseable_output_falls_back_to_default() {
        let tmp = artifact_dir();
        let (probe, _) = probe_with(vec![ScriptedProcess::succeeding(vec![
            "Traceback (most recent call last):",
            "something went wrong",
        ])]);

        assert_eq!(probe.determine_scale(tmp.path()).await, DEFAULT_SCALE);
    }

    #[tokio::test]
    async fn missing_artifact_files_fall_back_to_default() {
        let tmp = TempDir::new().unwrap();
        let (probe, runner) = probe_with(vec![]);

        assert_eq!(probe.determine_scale(tmp.path()).await, DEFAULT_SCALE);
        assert_eq!(runner.launch_count().await, 0);
    }

    #[tokio::test]
    async fn launch_failure_falls_back_to_default() {
        let tmp = artifact_dir();
        let (probe, _) = probe_with(vec![]);

        assert_eq!(probe.determine_scale(tmp.path()).await, DEFAULT_SCALE);
    }
}
