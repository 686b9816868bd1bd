//! Agent-local, crash-safe, append-only write-ahead log (§4.C).
//!
//! Provides at-least-once publish: an envelope is durable the moment
//! [`Wal::append`] returns, survives agent crashes (an INFLIGHT entry is
//! reverted to PENDING on the next [`Wal::open`]), and is never dropped
//! without an explicit terminal ACK.

mod entry;
mod error;
mod wal;

pub use entry::{WalEntry, WalState};
pub use error::{Result, WalError};
pub use wal::Wal;
