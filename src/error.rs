/// Error kinds that can be raised while processing a profile
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GprError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("degenerate axis: {0}")]
    DegenerateAxis(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("nothing to undo: no operation has been applied since the profile was loaded")]
    NothingToUndo,
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("smoothing failed: {0}")]
    Smoothing(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GprError>;
