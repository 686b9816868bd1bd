//! Dedup cache: `idempotency_key -> {log_seq, first_seen_ns}` (§3 "Dedup
//! Cache", §4.F step 5).
//!
//! Backed by [`dashmap::DashMap`], which shards internally by key hash —
//! the same "shard by key hash, short-held lock per shard" strategy §5
//! calls for, without hand-rolling it.

use dashmap::DashMap;

struct DedupRecord {
    log_seq: u64,
    first_seen_ns: i64,
    canonical_bytes: Vec<u8>,
}

/// Outcome of probing the cache for an idempotency key (§4.F step 5).
pub enum DedupOutcome {
    /// Key not seen before (within retention).
    Novel,
    /// Key seen before with bit-identical canonical bytes: treat as a
    /// no-op ACK referencing the original `log_seq`.
    IdenticalReplay { log_seq: u64 },
    /// Key seen before with a *different* body: `IDEMPOTENCY_CONFLICT`.
    Conflict,
}

pub struct DedupCache {
    entries: DashMap<String, DedupRecord>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn probe(&self, idempotency_key: &str, canonical_bytes: &[u8]) -> DedupOutcome {
        match self.entries.get(idempotency_key) {
            None => DedupOutcome::Novel,
            Some(existing) => {
                if existing.canonical_bytes == canonical_bytes {
                    DedupOutcome::IdenticalReplay {
                        log_seq: existing.log_seq,
                    }
                } else {
                    DedupOutcome::Conflict
                }
            }
        }
    }

    pub fn insert(&self, idempotency_key: &str, log_seq: u64, canonical_bytes: Vec<u8>, now_ns: i64) {
        self.entries.insert(
            idempotency_key.to_string(),
            DedupRecord {
                log_seq,
                first_seen_ns: now_ns,
                canonical_bytes,
            },
        );
    }

    /// Evict entries older than `window_ns` relative to `now_ns`. Entries
    /// younger than the dedup window (default 5 minutes, §3) must never be
    /// evicted, since a replay inside the window must still resolve as an
    /// idempotent no-op rather than a fresh (and now un-deduped) insert.
    pub fn prune(&self, now_ns: i64, window_ns: i64) {
        self.entries
            .retain(|_, record| now_ns - record.first_seen_ns < window_ns);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
