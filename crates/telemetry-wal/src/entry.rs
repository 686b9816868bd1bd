//! WAL entry state (§3 "WAL Entry").

/// Lifecycle state of a WAL entry (§3 "Envelope" lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalState {
    Pending,
    Inflight,
    Acked,
}

impl WalState {
    pub(crate) fn tag(self) -> u8 {
        match self {
            WalState::Pending => 0,
            WalState::Inflight => 1,
            WalState::Acked => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(WalState::Pending),
            1 => Some(WalState::Inflight),
            2 => Some(WalState::Acked),
            _ => None,
        }
    }
}

/// A single WAL entry as handed back by [`crate::Wal::iter_pending`].
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub seq: u64,
    pub idempotency_key: String,
    pub timestamp_ns: i64,
    pub bytes: Vec<u8>,
    pub state: WalState,
}
