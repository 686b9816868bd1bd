//! The agent's view of the broker's `Publish` response (§4.F, §6 "Wire
//! protocol"). This mirrors `telemetry_broker::Ack`'s JSON shape exactly but
//! is declared independently — the two processes share a wire contract, not
//! a Rust type, the same way any two services speaking the same schema
//! would.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Retry,
    Invalid,
    Unauthorized,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    pub reason: String,
    pub backoff_hint_ms: u64,
}
