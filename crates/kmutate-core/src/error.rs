//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid JSON pointer '{path}': {reason}")]
    InvalidPointer { path: String, reason: String },

    #[error("cannot {op} at '{path}': {reason}")]
    PatchTarget {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(e: serde_yaml::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
