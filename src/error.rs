//! Engine error types.
//!
//! Mirrors the teacher's `InterpreterError`/`RuntimeError` split: fatal,
//! assertion-style invariant breaches are the only errors that ever reach
//! the host (§7 of the spec says the engine "never throws control-flow
//! errors into the instrumented program" — everything else is swallowed
//! at the callback boundary and is not a [`EngineError`] at all).

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Fatal engine errors.
///
/// Every variant here corresponds to an "invariant breach" per §7: the
/// host is expected to abort after observing one. Recoverable situations
/// (missing shadow on lookup, unsupported opcode, sum overflow, output
/// file failures) are not represented here at all — they are handled in
/// place by the component that encounters them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A store/put was tagged active with neither f32 nor f64 width.
    #[error("invariant breach: {0}")]
    Invariant(String),

    /// A stage number was out of the configured `[0, MAX_STAGES)` range.
    #[error("stage index {index} out of range (max {max})")]
    StageOutOfRange {
        /// The offending stage index.
        index: usize,
        /// The configured maximum number of stages.
        max: usize,
    },

    /// A temp number exceeded the configured per-superblock temp budget.
    #[error("temp index {index} out of range (max {max})")]
    TempOutOfRange {
        /// The offending temp index.
        index: usize,
        /// The configured maximum number of temps.
        max: usize,
    },
}

impl EngineError {
    /// Build an [`EngineError::Invariant`] and emit the `tracing::error!`
    /// event the ambient logging section of the spec calls for,
    /// immediately before the assertion fires.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "engine invariant breach");
        EngineError::Invariant(message)
    }
}
