//! Shared `tracing` initialization and in-process metrics counters.
//!
//! Library crates never call [`init_tracing`] themselves — only the three
//! binary entrypoints do, exactly once, at the top of `main()`.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a registry + fmt-layer + `EnvFilter` subscriber as the global
/// default, defaulting to `info` when `RUST_LOG` is unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// A single named counter, incremented from any thread without locking.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters common to every component: one terminal-error class per §7 plus
/// a generic `accepted`/`rejected` pair. Components embed this alongside
/// their own counters (`BrokerStats`, `AgentStats`, `EngineStats`) rather
/// than subclassing it.
#[derive(Debug, Default)]
pub struct CommonStats {
    pub accepted: Counter,
    pub rejected: Counter,
    pub errors: Counter,
}

impl CommonStats {
    pub const fn new() -> Self {
        Self {
            accepted: Counter::new(),
            rejected: Counter::new(),
            errors: Counter::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_across_clones_of_the_reference() {
        let c = Counter::new();
        c.inc();
        c.add(5);
        assert_eq!(c.get(), 6);
    }

    #[test]
    fn common_stats_starts_at_zero() {
        let s = CommonStats::new();
        assert_eq!(s.accepted.get(), 0);
        assert_eq!(s.rejected.get(), 0);
        assert_eq!(s.errors.get(), 0);
    }
}
