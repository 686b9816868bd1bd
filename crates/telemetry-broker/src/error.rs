//! Broker-internal errors (§7). Ack reason strings returned to agents over
//! the wire (`TOO_LARGE`, `SHEDDING`, `IDEMPOTENCY_CONFLICT`, ...) are plain
//! `&'static str`s on [`crate::ack::Ack`], not variants here — they are
//! normal admission outcomes, not Rust-level failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker log io error: {0}")]
    Io(String),

    #[error("broker log record corrupt: {0}")]
    Corrupt(String),

    #[error("tls configuration error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e.to_string())
    }
}
