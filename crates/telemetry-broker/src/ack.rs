//! The broker's response to `Publish` (§4.F, §6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Retry,
    Invalid,
    Unauthorized,
}

/// `Ack{status, reason, backoff_hint_ms}` (§6 "Wire protocol").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    pub reason: String,
    pub backoff_hint_ms: u64,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            reason: String::new(),
            backoff_hint_ms: 0,
        }
    }

    pub fn retry(reason: impl Into<String>, backoff_hint_ms: u64) -> Self {
        Self {
            status: AckStatus::Retry,
            reason: reason.into(),
            backoff_hint_ms,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Invalid,
            reason: reason.into(),
            backoff_hint_ms: 0,
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Unauthorized,
            reason: reason.into(),
            backoff_hint_ms: 0,
        }
    }
}
