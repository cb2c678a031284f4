//! Crate-level error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parameter `{0}` was not assigned a learning-rate scale")]
    UntaggedParameter(String),

    #[error("Parameter `{0}` was assigned a learning-rate scale more than once")]
    DuplicateTag(String),

    #[error("`{component}` owns parameter #{index} of shape {shape:?} that is missing from the registry")]
    UnregisteredParameter {
        component: String,
        /// Position of the tensor in the component's parameter walk
        index: usize,
        shape: Vec<usize>,
    },

    #[error("lr-decay walk visited {visited} blocks, model has {expected}")]
    DepthMismatch { expected: usize, visited: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
