//! Error types for tracenet

use thiserror::Error;

/// Tracenet error type
#[derive(Debug, Error)]
pub enum TracenetError {
    /// Input/target length does not match the registered variable count
    #[error("Shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Layer sizes disagree for a one-to-one or gating operation
    #[error("Layer size mismatch: {0} vs {1}")]
    LayerSizeMismatch(usize, usize),

    /// Deserialized bytecode or mapping refers outside the register file
    #[error("Register {register} out of range for memory of {memory_size}")]
    RegisterOutOfRange { register: u32, memory_size: usize },

    /// Serialization tree is missing or malformed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TracenetError>;
