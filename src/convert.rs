//! ESRGAN-to-NCNN model conversion
//!
//! `ensure_converted` is the single entry point: it returns an on-disk
//! artifact directory for the requested model, converting through the
//! pth2ncnn helper only when no cached conversion exists. Conversion
//! failure is detected from the converter's output lines, not its exit
//! code, and surfaces as [`ConvertError::ToolReported`] with the first
//! error line verbatim.
//!
//! Conversions for the same output directory are serialized through a
//! per-path lock; callers elsewhere in the process can race
//! `ensure_converted` for the same model and the loser simply observes
//! the winner's cache hit.

use crate::artifact::{
    CACHE_DIR_NAME, PARAMS_EXT, WEIGHTS_EXT, count_model_files, is_valid_artifact,
};
use crate::error::{ConvertError, ConvertResult};
use crate::output::{Classification, ProcessKind, classify};
use crate::process::{ActiveProcess, OutputLine, ProcessRunner, SpawnSpec};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Python entry point of the converter, resolved relative to the
/// converter directory.
const CONVERTER_SCRIPT: &str = "pth2ncnn.py";

/// A successfully converted (or cache-hit) model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedModel {
    pub dir: PathBuf,
}

/// Coordinates cache check, converter invocation, output validation, and
/// artifact renaming.
pub struct ModelConverter {
    runner: Arc<dyn ProcessRunner>,
    model_root: PathBuf,
    converter_dir: PathBuf,
    python_cmd: String,
    hidden: bool,
    active: ActiveProcess,
    conversion_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ModelConverter {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        model_root: PathBuf,
        converter_dir: PathBuf,
        python_cmd: String,
        hidden: bool,
        active: ActiveProcess,
    ) -> Self {
        Self {
            runner,
            model_root,
            converter_dir,
            python_cmd,
            hidden,
            active,
            conversion_locks: DashMap::new(),
        }
    }

    /// Deterministic artifact directory for a source model, under the
    /// cache subdirectory of the model root.
    pub fn output_dir_for(&self, model_path: &Path) -> PathBuf {
        let stem = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        self.model_root.join(CACHE_DIR_NAME).join(stem)
    }

    /// Ensure `model_path` exists as an NCNN artifact, returning its
    /// directory. `pattern` is the filename pattern applied to the
    /// artifact files, with `*` standing for each file's embedded index
    /// (e.g. `esrgan-x*`).
    pub async fn ensure_converted(
        &self,
        model_path: &Path,
        pattern: &str,
    ) -> ConvertResult<ConvertedModel> {
        tracing::info!(model = %model_path.display(), "ensuring NCNN model");

        // Pre-converted source: a `.ncnn`-suffixed directory with the two
        // required files is used as-is, zero process launches.
        if is_valid_artifact(model_path, true, false) {
            apply_filename_pattern(model_path, pattern)?;
            return Ok(ConvertedModel {
                dir: model_path.to_path_buf(),
            });
        }

        let out_dir = self.output_dir_for(model_path);

        let lock = self
            .conversion_locks
            .entry(out_dir.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.convert_locked(model_path, &out_dir, pattern).await
        };
        drop(lock);
        // Evict the lock entry once no other caller holds it, so a
        // long-lived embedder does not accumulate one per model.
        self.conversion_locks
            .remove_if(&out_dir, |_, entry| Arc::strong_count(entry) == 1);
        result
    }

    async fn convert_locked(
        &self,
        model_path: &Path,
        out_dir: &Path,
        pattern: &str,
    ) -> ConvertResult<ConvertedModel> {
        std::fs::create_dir_all(out_dir)?;
        tracing::debug!(out_dir = %out_dir.display(), "checking for cached NCNN model");

        if count_model_files(out_dir) >= 2 {
            tracing::info!(out_dir = %out_dir.display(), "NCNN model is cached, skipping conversion");
        } else {
            self.run_converter(model_path, out_dir).await?;
        }

        apply_filename_pattern(out_dir, pattern)?;
        Ok(ConvertedModel {
            dir: out_dir.to_path_buf(),
        })
    }

    async fn run_converter(&self, model_path: &Path, out_dir: &Path) -> ConvertResult<()> {
        tracing::info!(model = %model_path.display(), "running model converter");

        let spec = SpawnSpec {
            program: self.python_cmd.clone(),
            args: vec![
                CONVERTER_SCRIPT.to_string(),
                model_path.to_string_lossy().into_owned(),
                "--outpath".to_string(),
                out_dir.to_string_lossy().into_owned(),
            ],
            cwd: Some(self.converter_dir.clone()),
            hidden: self.hidden,
            component: "ModelConverter",
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        // Visible mode inherits the console; there is nothing to stream,
        // and dropping the sender ends the drain loop immediately.
        let sender = self.hidden.then_some(tx);

        let handle = self.runner.launch(spec, sender).await?;
        self.active.register(handle.clone()).await;
        self.runner.wait(&handle).await;
        self.active.clear().await;

        // All senders drop once the output streams hit EOF, so this loop
        // terminates shortly after exit with the complete output.
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.text);
        }

        if let Some(error_line) = first_error_line(&lines) {
            return Err(ConvertError::ToolReported(error_line));
        }
        Ok(())
    }
}

/// First line of converter output that classifies as an error signal.
fn first_error_line(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        match classify(line, ProcessKind::Converter) {
            Classification::ErrorSignal(msg) => Some(msg),
            _ => None,
        }
    })
}

/// Rename the artifact's `.bin`/`.param` files to `pattern` with `*`
/// replaced by the integer index embedded in each source filename.
///
/// Pairing by embedded index (not directory enumeration order) keeps each
/// weights file matched with its parameter file; enumeration order is not
/// stable across platforms. Files carrying no index are left untouched.
pub fn apply_filename_pattern(dir: &Path, pattern: &str) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e @ (WEIGHTS_EXT | PARAMS_EXT)) => e,
            _ => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = artifact_index(&name) else {
            tracing::warn!(file = %name, "artifact file has no embedded index, leaving name as-is");
            continue;
        };

        let new_name = format!("{}.{ext}", pattern.replace('*', &index.to_string()));
        let target = dir.join(&new_name);
        if target == path {
            continue;
        }
        tracing::debug!(from = %name, to = %new_name, "renaming artifact file");
        std::fs::rename(&path, &target)?;
    }
    Ok(())
}

/// Integer embedded in an artifact filename: the first contiguous digit
/// run, so `model_0002.bin` yields 2 and `esrgan-x4.param` yields 4.
fn artifact_index(name: &str) -> Option<u32> {
    crate::output::first_integer(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::{MockProcessRunner, ScriptedProcess};
    use std::fs::File;
    use tempfile::TempDir;

    fn converter_with(
        scripts: Vec<ScriptedProcess>,
        model_root: &Path,
    ) -> (ModelConverter, Arc<MockProcessRunner>) {
        let runner = Arc::new(MockProcessRunner::new(scripts));
        let converter = ModelConverter::new(
            runner.clone(),
            model_root.to_path_buf(),
            PathBuf::from("/opt/pth2ncnn"),
            "python".to_string(),
            true,
            ActiveProcess::default(),
        );
        (converter, runner)
    }

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    /// A "conversion" whose side effect is creating the artifact files,
    /// since the mock launches nothing.
    fn seed_artifact(dir: &Path, index: u32) {
        touch(dir, &format!("model_{index:04}.bin"));
        touch(dir, &format!("model_{index:04}.param"));
    }

    #[tokio::test]
    async fn preconverted_source_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("manga.ncnn");
        std::fs::create_dir(&src).unwrap();
        seed_artifact(&src, 4);

        let (converter, runner) = converter_with(vec![], tmp.path());
        let converted = converter.ensure_converted(&src, "esrgan-x*").await.unwrap();

        assert_eq!(converted.dir, src);
        assert_eq!(runner.launch_count().await, 0);
        assert!(src.join("esrgan-x4.bin").exists());
        assert!(src.join("esrgan-x4.param").exists());
    }

    #[tokio::test]
    async fn cache_hit_skips_conversion() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("manga.pth");
        touch(tmp.path(), "manga.pth");

        let (converter, runner) = converter_with(vec![], tmp.path());
        let out_dir = converter.output_dir_for(&model);
        std::fs::create_dir_all(&out_dir).unwrap();
        seed_artifact(&out_dir, 4);

        let converted = converter.ensure_converted(&model, "esrgan-x*").await.unwrap();
        assert_eq!(converted.dir, out_dir);
        assert_eq!(runner.launch_count().await, 0);
    }

    #[tokio::test]
    async fn cold_cache_launches_converter_once() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("manga.pth");
        touch(tmp.path(), "manga.pth");

        let (converter, runner) = converter_with(
            vec![ScriptedProcess::succeeding(vec!["converting...", "done."])],
            tmp.path(),
        );

        converter.ensure_converted(&model, "esrgan-x*").await.unwrap();

        assert_eq!(runner.launch_count().await, 1);
        let spec = &runner.launches().await[0];
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args[0], "pth2ncnn.py");
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/opt/pth2ncnn")));
    }

    #[tokio::test]
    async fn repeated_calls_with_cached_artifact_launch_nothing() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("manga.pth");
        touch(tmp.path(), "manga.pth");

        let (converter, runner) = converter_with(vec![], tmp.path());
        let out_dir = converter.output_dir_for(&model);
        std::fs::create_dir_all(&out_dir).unwrap();
        seed_artifact(&out_dir, 4);

        let first = converter.ensure_converted(&model, "esrgan-x*").await.unwrap();
        let second = converter.ensure_converted(&model, "esrgan-x*").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runner.launch_count().await, 0);
        assert!(out_dir.join("esrgan-x4.bin").exists());
        assert!(out_dir.join("esrgan-x4.param").exists());
    }

    #[tokio::test]
    async fn per_model_lock_is_evicted_when_idle() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("manga.pth");
        touch(tmp.path(), "manga.pth");

        let (converter, _runner) = converter_with(vec![], tmp.path());
        let out_dir = converter.output_dir_for(&model);
        std::fs::create_dir_all(&out_dir).unwrap();
        seed_artifact(&out_dir, 4);

        converter.ensure_converted(&model, "esrgan-x*").await.unwrap();
        assert!(converter.conversion_locks.is_empty());
    }

    #[tokio::test]
    async fn converter_error_line_fails_with_that_message() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("broken.pth");
        touch(tmp.path(), "broken.pth");

        let (converter, _runner) = converter_with(
            vec![
                ScriptedProcess::succeeding(vec!["loading model..."])
                    .with_stderr(vec!["Error: unsupported layer type"]),
            ],
            tmp.path(),
        );

        let err = converter
            .ensure_converted(&model, "esrgan-x*")
            .await
            .unwrap_err();
        assert_eq!(err.tool_message(), Some("Error: unsupported layer type"));

        // No rename happened in the (empty) output dir.
        let out_dir = converter.output_dir_for(&model);
        assert_eq!(count_model_files(&out_dir), 0);
    }

    #[tokio::test]
    async fn launch_failure_surfaces_as_convert_error() {
        let tmp = TempDir::new().unwrap();
        let model = tmp.path().join("m.pth");
        touch(tmp.path(), "m.pth");

        let (converter, _runner) = converter_with(vec![], tmp.path());
        let err = converter.ensure_converted(&model, "x*").await.unwrap_err();
        assert!(matches!(err, ConvertError::Launch(_)));
    }

    #[test]
    fn rename_pairs_by_embedded_index() {
        let tmp = TempDir::new().unwrap();
        for name in [
            "model_0001.bin",
            "model_0001.param",
            "model_0002.bin",
            "model_0002.param",
        ] {
            touch(tmp.path(), name);
        }

        apply_filename_pattern(tmp.path(), "esrgan-x*").unwrap();

        for name in [
            "esrgan-x1.bin",
            "esrgan-x1.param",
            "esrgan-x2.bin",
            "esrgan-x2.param",
        ] {
            assert!(tmp.path().join(name).exists(), "missing {name}");
        }
    }

    #[test]
    fn rename_is_stable_when_already_patterned() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "esrgan-x4.bin");
        touch(tmp.path(), "esrgan-x4.param");

        apply_filename_pattern(tmp.path(), "esrgan-x*").unwrap();

        assert!(tmp.path().join("esrgan-x4.bin").exists());
        assert!(tmp.path().join("esrgan-x4.param").exists());
    }

    #[test]
    fn rename_skips_unrelated_and_indexless_files() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "notes.txt");
        touch(tmp.path(), "model.bin");

        apply_filename_pattern(tmp.path(), "esrgan-x*").unwrap();

        assert!(tmp.path().join("notes.txt").exists());
        assert!(tmp.path().join("model.bin").exists());
    }

    #[test]
    fn artifact_index_extraction() {
        assert_eq!(artifact_index("model_0002.bin"), Some(2));
        assert_eq!(artifact_index("esrgan-x4.param"), Some(4));
        assert_eq!(artifact_index("model.bin"), None);
    }
}
