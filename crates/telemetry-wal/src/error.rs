//! WAL errors (§4.C, §7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(String),

    #[error("wal record corrupt: {0}")]
    Corrupt(String),

    #[error("duplicate idempotency_key: {0}")]
    DuplicateKey(String),

    #[error("wal full: {size} bytes exceeds limit of {limit}")]
    WalFull { size: u64, limit: u64 },

    #[error("no wal entry with seq {0}")]
    NotFound(u64),

    #[error("no wal entry with idempotency_key {0}")]
    KeyNotFound(String),
}

pub type Result<T> = std::result::Result<T, WalError>;

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        WalError::Io(e.to_string())
    }
}
