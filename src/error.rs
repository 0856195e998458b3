//! Error types shared by layers, networks and ensembles.

use thiserror::Error;

/// Every fallible operation in the crate reports one of these.
///
/// Configuration problems are raised when a layer or network is built,
/// the rest when it is used. None of them leaves stored parameters in a
/// half-updated state: shapes are checked before anything is mutated.
#[derive(Error, Debug)]
pub enum Error {
    /// Construction parameters out of bounds or an invalid layer chain
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation called at the wrong time (inactive network, backward
    /// without forward, untrained meta-learner, ...)
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Training data that cannot be used as given
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("numeric fault: {0}")]
    Numeric(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
