//! Error types for the telemetry data model and canonical codec.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TypesError {
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),

    #[error("canonical encode failed: {0}")]
    EncodeFailed(String),

    #[error("canonical decode failed: {0}")]
    DecodeFailed(String),

    #[error("envelope body too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, TypesError>;
