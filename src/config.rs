//! Engine configuration (Ambient Stack: "Configuration").
//!
//! Mirrors the CLI options of §6 as plain struct fields, with a
//! `key=value,key=value` parser matching the original tool's own
//! Valgrind-style option grammar, since general CLI parsing is an
//! explicitly out-of-scope external collaborator (§1).

use crate::bigfloat::DEFAULT_PRECISION;
use crate::error::{EngineError, EngineResult};

/// The engine's tunable options, defaults matching §6 exactly.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Default shadow precision in bits.
    pub precision: u32,
    /// Whether to maintain per-site mean-error statistics.
    pub mean_error: bool,
    /// Filter out shadows/reports attributed to `.so`-matching sonames.
    pub ignore_libraries: bool,
    /// Filter out reports whose relative error is exactly zero.
    pub ignore_accurate: bool,
    /// Force shadow precision down to the original width (24/53 bits),
    /// reproducing the machine computation exactly.
    pub sim_original: bool,
    /// When `false`, analysis is gated by `BEGIN`/`END` client requests.
    pub analyze_all: bool,
    /// Whether to compute cancellation-badness estimates (§4.3 step 6).
    pub bad_cancellations: bool,
    /// When `true`, `END` client requests are ignored (analysis stays on).
    pub ignore_end: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            precision: DEFAULT_PRECISION,
            mean_error: true,
            ignore_libraries: false,
            ignore_accurate: false,
            sim_original: false,
            analyze_all: true,
            bad_cancellations: false,
            ignore_end: false,
        }
    }
}

impl EngineConfig {
    /// Parse the tool's `key=value,key=value` option grammar.
    ///
    /// Unknown keys and malformed values are reported as
    /// [`EngineError::Invariant`] rather than silently ignored, since a
    /// misconfigured run produces misleading reports.
    pub fn from_kv_str(input: &str) -> EngineResult<Self> {
        let mut config = EngineConfig::default();
        for pair in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| EngineError::invariant(format!("malformed option: {pair}")))?;
            match key.trim() {
                "precision" => {
                    config.precision = value.trim().parse().map_err(|_| {
                        EngineError::invariant(format!("bad precision value: {value}"))
                    })?;
                }
                "mean-error" => config.mean_error = parse_yes_no(value)?,
                "ignore-libraries" => config.ignore_libraries = parse_yes_no(value)?,
                "ignore-accurate" => config.ignore_accurate = parse_yes_no(value)?,
                "sim-original" => config.sim_original = parse_yes_no(value)?,
                "analyze-all" => config.analyze_all = parse_yes_no(value)?,
                "bad-cancellations" => config.bad_cancellations = parse_yes_no(value)?,
                "ignore-end" => config.ignore_end = parse_yes_no(value)?,
                other => {
                    return Err(EngineError::invariant(format!("unknown option: {other}")))
                }
            }
        }
        Ok(config)
    }
}

fn parse_yes_no(value: &str) -> EngineResult<bool> {
    match value.trim() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(EngineError::invariant(format!(
            "expected yes/no, got: {other}"
        ))),
    }
}
