//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root directory of the user's model collection; converted models
    /// are cached under `.ncnn-models` inside it.
    pub model_root: PathBuf,

    /// Directory holding the wrapped tool installs (pth2ncnn, backends).
    pub bin_root: PathBuf,

    /// Python interpreter used for the converter and scale-probe scripts.
    pub python_cmd: String,

    /// Upscaler backend executable name.
    pub upscaler_exe: String,

    /// Directory name of the upscaler backend under `bin_root`.
    pub upscaler_dir: String,

    /// GPU selection passed to the backend: `auto` or a device index.
    pub gpus: String,

    /// Backend tile size; values below 32 mean "let the tool decide".
    pub tile_size: u32,

    /// Test-time augmentation flag for the backend.
    pub tta: bool,

    /// 0 = hidden with captured output, 1 = visible console,
    /// 2 = visible and kept open. Anything visible forfeits progress
    /// tracking.
    pub cmd_debug_mode: u8,

    /// Process-exit poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            model_root: default_model_root(),
            bin_root: PathBuf::from("bin"),
            python_cmd: default_python_cmd(),
            upscaler_exe: default_upscaler_exe(),
            upscaler_dir: default_upscaler_dir(),
            gpus: "auto".to_string(),
            tile_size: 0,
            tta: false,
            cmd_debug_mode: 0,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(model_root) = std::env::var("NCNN_MANAGER_MODEL_ROOT") {
            config.model_root = PathBuf::from(model_root);
        }
        if let Ok(bin_root) = std::env::var("NCNN_MANAGER_BIN_ROOT") {
            config.bin_root = PathBuf::from(bin_root);
        }
        if let Ok(python) = std::env::var("NCNN_MANAGER_PYTHON") {
            config.python_cmd = python;
        }
        if let Ok(debug_mode) = std::env::var("NCNN_MANAGER_DEBUG_MODE") {
            config.cmd_debug_mode = debug_mode
                .parse()
                .context("Invalid NCNN_MANAGER_DEBUG_MODE value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cmd_debug_mode > 2 {
            anyhow::bail!(
                "cmd_debug_mode must be 0, 1, or 2 (got {})",
                self.cmd_debug_mode
            );
        }

        if self.gpus != "auto" && self.gpus.parse::<u32>().is_err() {
            anyhow::bail!("gpus must be 'auto' or a device index (got '{}')", self.gpus);
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be nonzero");
        }

        if self.python_cmd.is_empty() {
            anyhow::bail!("python_cmd cannot be empty");
        }
        if self.upscaler_exe.is_empty() {
            anyhow::bail!("upscaler_exe cannot be empty");
        }

        Ok(())
    }

    /// Directory of the converter and scale-probe scripts.
    pub fn converter_dir(&self) -> PathBuf {
        self.bin_root.join("pth2ncnn")
    }

    /// Working directory of the upscaler backend; the wrapped executable
    /// expects to run from its own install directory.
    pub fn upscaler_dir(&self) -> PathBuf {
        self.bin_root.join(&self.upscaler_dir)
    }

    /// Whether wrapped tools run hidden with captured output.
    pub fn hidden(&self) -> bool {
        self.cmd_debug_mode == 0
    }

    /// Tile-size argument value, when large enough to be meaningful.
    pub fn effective_tile_size(&self) -> Option<u32> {
        (self.tile_size >= 32).then_some(self.tile_size)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// Default functions
fn default_model_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ncnn-manager/models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}
fn default_python_cmd() -> String {
    "python".to_string()
}
fn default_upscaler_exe() -> String {
    "realesrgan-ncnn-vulkan".to_string()
}
fn default_upscaler_dir() -> String {
    "realesrgan-ncnn".to_string()
}
fn default_poll_interval_ms() -> u64 {
    100
}
