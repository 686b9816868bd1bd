//! Agent-side errors (§7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("wal error: {0}")]
    Wal(#[from] telemetry_wal::WalError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("collection deadline exceeded for source {0}")]
    CollectionTimeout(String),

    #[error("signing key error: {0}")]
    Signing(#[from] telemetry_crypto::CryptoError),

    #[error("wal full, source {source_name} shed under policy {policy:?}")]
    WalFullShed {
        source_name: String,
        policy: telemetry_config::OverflowPolicy,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;
