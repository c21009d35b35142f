//! Error types for clock and fabric operations.

use thiserror::Error;

use pal_common::memory::MemoryError;

/// Errors from clock mode/speed misuse.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    /// `set_speed` with a non-positive or non-finite factor.
    #[error("invalid clock speed: {detail}")]
    InvalidSpeed {
        /// What was wrong.
        detail: String,
    },

    /// `step` called outside `Stepped` mode.
    #[error("step() is only valid in Stepped mode (current: {mode})")]
    InvalidMode {
        /// Current mode name.
        mode: &'static str,
    },

    /// `step` with a negative or non-finite delta.
    #[error("invalid step delta: {dt}")]
    InvalidStep {
        /// Offending delta.
        dt: f64,
    },
}

/// Errors from state-fabric operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    /// Device name not registered.
    #[error("unknown device: {name}")]
    UnknownDevice {
        /// Requested name.
        name: String,
    },

    /// Registration with a name already taken.
    #[error("duplicate device: {name}")]
    DuplicateDevice {
        /// Conflicting name.
        name: String,
    },

    /// Memory-map error (unmapped address, type mismatch, unknown key).
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Result alias for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;
