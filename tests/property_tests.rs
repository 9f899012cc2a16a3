//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use ncnn_manager::config::ManagerConfig;
use ncnn_manager::output::{Classification, ProcessKind, classify, first_integer};
use proptest::prelude::*;

// =============================================================================
// Classifier Properties
// =============================================================================

proptest! {
    /// Any in-range percentage rendered with a trailing percent sign
    /// classifies as progress with that value.
    #[test]
    fn valid_percent_lines_classify_as_progress(value in 0.0f32..=100.0) {
        let line = format!("{value:.2}%");
        match classify(&line, ProcessKind::Upscaler) {
            Classification::Progress(p) => {
                prop_assert!((p - value).abs() < 0.01, "parsed {p} from {line}");
            }
            other => prop_assert!(line.trim().len() < 3, "got {other:?} for {line}"),
        }
    }

    /// Progress percentages never leave [0, 100], whatever the input.
    #[test]
    fn progress_is_always_in_range(line in ".{0,40}") {
        if let Classification::Progress(p) = classify(&line, ProcessKind::Upscaler) {
            prop_assert!((0.0..=100.0).contains(&p));
            prop_assert!(p.is_finite());
        }
    }

    /// Any sufficiently long line containing the error marker classifies
    /// as an error signal, with whitespace padding stripped.
    #[test]
    fn error_marker_always_wins(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{1,20}") {
        let line = format!("  {prefix}Error:{suffix}  ");
        match classify(&line, ProcessKind::Converter) {
            Classification::ErrorSignal(msg) => {
                prop_assert_eq!(msg, line.trim());
            }
            other => prop_assert!(false, "got {:?} for {:?}", other, line),
        }
    }

    /// Scale-probe lines never classify as progress or error.
    #[test]
    fn scale_probe_grammar_is_informational(line in ".{0,40}") {
        prop_assert_eq!(
            classify(&line, ProcessKind::ScaleProbe),
            Classification::Informational
        );
    }

    /// first_integer finds the leading digit run wherever it sits.
    #[test]
    fn first_integer_finds_embedded_indices(prefix in "[a-z_-]{0,12}", n in 0u32..100_000) {
        let text = format!("{prefix}{n}.bin");
        prop_assert_eq!(first_integer(&text), Some(n));
    }
}

// =============================================================================
// Config Serialization Round-Trip Tests
// =============================================================================

fn arb_manager_config() -> impl Strategy<Value = ManagerConfig> {
    (
        "[a-zA-Z0-9/_-]{1,30}", // model_root
        "[a-zA-Z0-9/_-]{1,30}", // bin_root
        prop_oneof![Just("auto".to_string()), (0u32..8).prop_map(|g| g.to_string())],
        0u32..1024,  // tile_size
        any::<bool>(), // tta
        0u8..3,      // cmd_debug_mode
        10u64..1000, // poll_interval_ms
    )
        .prop_map(
            |(model_root, bin_root, gpus, tile_size, tta, cmd_debug_mode, poll_interval_ms)| {
                ManagerConfig {
                    model_root: model_root.into(),
                    bin_root: bin_root.into(),
                    gpus,
                    tile_size,
                    tta,
                    cmd_debug_mode,
                    poll_interval_ms,
                    ..Default::default()
                }
            },
        )
}

proptest! {
    /// ManagerConfig serializes to TOML and deserializes back to equal value
    #[test]
    fn manager_config_roundtrip(config in arb_manager_config()) {
        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: ManagerConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");
        prop_assert_eq!(config, parsed);
    }

    /// Every generated config passes validation.
    #[test]
    fn generated_configs_validate(config in arb_manager_config()) {
        prop_assert!(config.validate().is_ok());
    }
}
