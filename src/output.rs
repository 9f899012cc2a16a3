//! Output line classification
//!
//! Maps raw stdout/stderr lines from the wrapped tools to semantic events:
//! a tile-progress percentage, an error signal, or plain informational
//! noise. Classification is a pure function of the line and the kind of
//! process that produced it; logging and progress-sink invocation are the
//! caller's job, which keeps this trivially testable.
//!
//! The grammar is deliberately string-based (trailing `%`, literal
//! `Error:` marker) because the wrapped executables expose nothing more
//! structured. Exit codes are not trusted as failure signals; the error
//! marker is.

/// Lines shorter than this are treated as garbage from partial reads.
/// Short enough that a bare `12%` tile update still classifies.
pub const MIN_LINE_LEN: usize = 3;

/// Literal marker the wrapped tools print on failure.
pub const ERROR_MARKER: &str = "Error:";

/// Which wrapped tool produced a line. Each kind has its own grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// NCNN upscaler backend: per-tile `NN.NN%` progress plus error marker.
    Upscaler,
    /// pth2ncnn model converter: error marker only.
    Converter,
    /// get_scale helper: free text, parsed elsewhere as first-digit-run.
    ScaleProbe,
}

/// Display mode of the current logical operation. Controls whether
/// classified progress is surfaced to the progress sink at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpscaleMode {
    #[default]
    Single,
    Preview,
    Batch,
}

impl UpscaleMode {
    /// Per-tile progress is only surfaced in single-image and preview
    /// mode. Batch mode suppresses it to avoid UI thrash and reports one
    /// coarse post-processing status after the whole batch instead.
    pub fn shows_tile_progress(&self) -> bool {
        matches!(self, UpscaleMode::Single | UpscaleMode::Preview)
    }
}

/// Semantic category of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Tile progress in percent, guaranteed finite and within [0, 100].
    Progress(f32),
    /// The tool reported a failure; payload is the trimmed line.
    ErrorSignal(String),
    Informational,
}

/// Classify a single output line.
///
/// Empty, whitespace-only, or too-short lines are always informational.
/// Error detection wins over progress detection so a line like
/// `Error: failed at 50%` is never mistaken for progress. Parse failures
/// degrade to `Informational` rather than erroring.
pub fn classify(line: &str, kind: ProcessKind) -> Classification {
    let trimmed = line.trim();
    if trimmed.len() < MIN_LINE_LEN {
        return Classification::Informational;
    }

    match kind {
        ProcessKind::ScaleProbe => Classification::Informational,
        ProcessKind::Converter | ProcessKind::Upscaler => {
            if trimmed.contains(ERROR_MARKER) {
                return Classification::ErrorSignal(trimmed.to_string());
            }
            if let Some(percent) = parse_trailing_percent(trimmed) {
                return Classification::Progress(percent);
            }
            Classification::Informational
        }
    }
}

/// Parse a trimmed line of the shape `NN.NN%` into a percentage.
/// Returns `None` unless the value is finite and within [0, 100].
fn parse_trailing_percent(trimmed: &str) -> Option<f32> {
    let number = trimmed.strip_suffix('%')?.trim();
    let percent: f32 = number.parse().ok()?;
    if percent.is_finite() && (0.0..=100.0).contains(&percent) {
        Some(percent)
    } else {
        None
    }
}

/// First contiguous run of ASCII digits in `text`, parsed as an integer.
/// This is the whole grammar of the scale-probe helper, which prints
/// `Scale: N`.
pub fn first_integer(text: &str) -> Option<u32> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Receiver of accepted progress updates. The GUI (or the CLI's log
/// output) sits behind this; no component in this crate touches UI state
/// directly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f32, label: &str);
}

/// Sink that forwards progress to the structured log.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, percent: f32, label: &str) {
        tracing::info!(percent, label, "progress");
    }
}
