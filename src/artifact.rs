//! Converted-model artifact inspection
//!
//! An artifact is a directory produced by the pth2ncnn converter holding
//! exactly one weights file (`*.bin`) and one parameter file (`*.param`).
//! The filesystem is the source of truth: nothing here is cached in
//! memory beyond the result of the current check, and nothing here ever
//! deletes an artifact.
//!
//! Every filesystem error during a check is swallowed into a negative
//! answer. A spurious "invalid" only costs a reconversion; a propagated
//! error would abort an otherwise recoverable operation.

use std::path::Path;

/// Extension of the primary weights file.
pub const WEIGHTS_EXT: &str = "bin";

/// Extension of the parameter/metadata file.
pub const PARAMS_EXT: &str = "param";

/// Directory-name suffix marking a pre-converted model.
pub const CONVERTED_SUFFIX: &str = ".ncnn";

/// Cache subdirectory under the model root where conversions land.
pub const CACHE_DIR_NAME: &str = ".ncnn-models";

/// Whether `path` is a valid converted-model artifact: a directory with
/// exactly one `.bin` and exactly one `.param` file.
///
/// With `require_suffix`, the directory name must additionally end in
/// [`CONVERTED_SUFFIX`]. With `strict_file_count`, any file beyond the
/// two required ones invalidates the artifact.
pub fn is_valid_artifact(path: &Path, require_suffix: bool, strict_file_count: bool) -> bool {
    match check_artifact(path, require_suffix, strict_file_count) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "artifact check failed, treating as invalid");
            false
        }
    }
}

fn check_artifact(
    path: &Path,
    require_suffix: bool,
    strict_file_count: bool,
) -> std::io::Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }

    if require_suffix {
        let suffix_ok = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(CONVERTED_SUFFIX));
        if !suffix_ok {
            return Ok(false);
        }
    }

    let mut weights = 0usize;
    let mut params = 0usize;
    let mut total = 0usize;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        total += 1;
        match entry.path().extension().and_then(|e| e.to_str()) {
            Some(WEIGHTS_EXT) => weights += 1,
            Some(PARAMS_EXT) => params += 1,
            _ => {}
        }
    }

    let mut valid = weights == 1 && params == 1;
    if strict_file_count && total > 2 {
        valid = false;
    }
    Ok(valid)
}

/// Number of model files (`.bin` or `.param`) at `path`. Used as a cheap
/// cache-hit heuristic: fewer than two means no cached conversion exists.
/// Errors (missing directory included) count as zero.
pub fn count_model_files(path: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|x| x.to_str()),
                Some(WEIGHTS_EXT) | Some(PARAMS_EXT)
            )
        })
        .count()
}
