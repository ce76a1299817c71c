use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable failures reported to the caller.
///
/// Broken graph invariants and allocator protocol misuse are programming
/// errors and panic instead of producing one of these.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
