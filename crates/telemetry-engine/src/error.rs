//! Errors for the ingestor, correlation window, rule registry, and risk
//! store (§7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("rule registry load error: {0}")]
    RuleLoad(String),

    #[error("rule {name:?} rejected at load time: {reason}")]
    RuleInvalid { name: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("ingestor transport error: {0}")]
    Transport(String),

    #[error("cursor io error: {0}")]
    Cursor(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
