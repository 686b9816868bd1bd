//! Overload governor (§4.H): admission control driven by inflight RPC
//! count, with hysteretic state transitions so the system doesn't flap at
//! the boundary between states.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use telemetry_types::Severity;

/// Fraction of soft/hard thresholds below which the governor exits a
/// degraded state, separate from the entry threshold (§4.H "hysteretic").
const EXIT_HYSTERESIS: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Normal,
    SoftOverload,
    HardOverload,
    Shed,
}

impl GovernorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernorState::Normal => "NORMAL",
            GovernorState::SoftOverload => "SOFT_OVERLOAD",
            GovernorState::HardOverload => "HARD_OVERLOAD",
            GovernorState::Shed => "SHED",
        }
    }
}

/// An admission decision for one envelope (§4.F step 3).
pub enum GovernorDecision {
    Admit,
    Retry { backoff_hint_ms: u64 },
    Shed,
}

/// Tracks inflight load and exposes admission decisions. One instance per
/// broker process, shared across all connection handlers.
pub struct Governor {
    inflight: AtomicUsize,
    soft_inflight: usize,
    hard_inflight: usize,
    shed_cutoff: Severity,
    state: Mutex<GovernorState>,
    latency_ema_micros: AtomicI64,
}

impl Governor {
    pub fn new(soft_inflight: usize, hard_inflight: usize, shed_cutoff: Severity) -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            soft_inflight,
            hard_inflight,
            shed_cutoff,
            state: Mutex::new(GovernorState::Normal),
            latency_ema_micros: AtomicI64::new(0),
        }
    }

    /// Call once per admitted request at handler entry; the returned guard
    /// decrements inflight on drop, so a handler that returns early (e.g.
    /// after a rejection) never leaks a count.
    pub fn enter(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        InflightGuard { governor: self }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Fold a new log-append latency sample into the EMA (§4.H "Low-pass
    /// the inputs (EMA) to avoid flapping"). Exposed for observability but
    /// not currently consulted by `decide` — inflight count alone already
    /// captures admission pressure; latency is folded in for the exported
    /// state snapshot operators watch.
    pub fn record_log_latency(&self, micros: i64) {
        let prev = self.latency_ema_micros.load(Ordering::Relaxed);
        let next = if prev == 0 {
            micros
        } else {
            // alpha = 0.2
            (prev * 4 + micros) / 5
        };
        self.latency_ema_micros.store(next, Ordering::Relaxed);
    }

    pub fn latency_ema_micros(&self) -> i64 {
        self.latency_ema_micros.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> GovernorState {
        *self.state.lock()
    }

    /// Admission decision for an envelope of the given (max) severity
    /// (§4.F step 3, §4.H).
    pub fn decide(&self, severity: Severity) -> GovernorDecision {
        let inflight = self.inflight();
        let mut state = self.state.lock();
        *state = self.transition(*state, inflight);

        match *state {
            GovernorState::Normal => GovernorDecision::Admit,
            GovernorState::SoftOverload => {
                let overshoot = (inflight.saturating_sub(self.soft_inflight)) as f64
                    / (self.hard_inflight.saturating_sub(self.soft_inflight)).max(1) as f64;
                let overshoot = overshoot.clamp(0.0, 1.0);
                if rand::thread_rng().gen_bool(overshoot) {
                    GovernorDecision::Retry {
                        backoff_hint_ms: (500.0 * overshoot) as u64,
                    }
                } else {
                    GovernorDecision::Admit
                }
            }
            GovernorState::HardOverload => {
                if severity.rank() >= Severity::High.rank() {
                    GovernorDecision::Admit
                } else {
                    GovernorDecision::Retry {
                        backoff_hint_ms: 2_000,
                    }
                }
            }
            GovernorState::Shed => {
                if severity.rank() < self.shed_cutoff.rank() {
                    GovernorDecision::Shed
                } else if inflight > self.hard_inflight {
                    GovernorDecision::Retry {
                        backoff_hint_ms: 5_000,
                    }
                } else {
                    GovernorDecision::Admit
                }
            }
        }
    }

    fn transition(&self, current: GovernorState, inflight: usize) -> GovernorState {
        let soft_exit = (self.soft_inflight as f64 * EXIT_HYSTERESIS) as usize;
        let hard_exit = (self.hard_inflight as f64 * EXIT_HYSTERESIS) as usize;

        match current {
            GovernorState::Normal | GovernorState::SoftOverload => {
                if inflight > self.hard_inflight {
                    GovernorState::HardOverload
                } else if inflight > self.soft_inflight {
                    GovernorState::SoftOverload
                } else if inflight <= soft_exit {
                    GovernorState::Normal
                } else {
                    current
                }
            }
            GovernorState::HardOverload => {
                if inflight <= hard_exit {
                    if inflight > self.soft_inflight {
                        GovernorState::SoftOverload
                    } else {
                        GovernorState::Normal
                    }
                } else {
                    current
                }
            }
            // SHED is forced externally (CPU/memory watermark, operator
            // command), never entered via the inflight watermarks above, so
            // it never auto-exits on inflight dropping either.
            GovernorState::Shed => current,
        }
    }

    /// Force SHED regardless of inflight count — used by an operator
    /// command or a CPU/memory watermark breach the inflight counter alone
    /// wouldn't see.
    pub fn force_shed(&self) {
        *self.state.lock() = GovernorState::Shed;
    }
}

/// RAII inflight counter decrement.
pub struct InflightGuard<'a> {
    governor: &'a Governor,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.governor.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_under_soft_threshold() {
        let gov = Governor::new(10, 20, Severity::Low);
        assert!(matches!(gov.decide(Severity::Info), GovernorDecision::Admit));
    }

    #[test]
    fn enters_hard_overload_above_hard_threshold() {
        let gov = Governor::new(2, 4, Severity::Low);
        let _guards: Vec<_> = (0..5).map(|_| gov.enter()).collect();
        assert!(matches!(gov.state(), GovernorState::Normal));
        let decision = gov.decide(Severity::Info);
        assert!(matches!(gov.state(), GovernorState::HardOverload));
        assert!(matches!(decision, GovernorDecision::Retry { .. }));
    }

    #[test]
    fn hard_overload_still_admits_high_severity() {
        let gov = Governor::new(2, 4, Severity::Low);
        let _guards: Vec<_> = (0..5).map(|_| gov.enter()).collect();
        gov.decide(Severity::Info);
        let decision = gov.decide(Severity::Critical);
        assert!(matches!(decision, GovernorDecision::Admit));
    }

    #[test]
    fn shed_rejects_below_cutoff_severity() {
        let gov = Governor::new(10, 20, Severity::Medium);
        gov.force_shed();
        assert!(matches!(gov.decide(Severity::Low), GovernorDecision::Shed));
        assert!(matches!(gov.decide(Severity::High), GovernorDecision::Admit));
    }

    #[test]
    fn inflight_guard_decrements_on_drop() {
        let gov = Governor::new(10, 20, Severity::Low);
        {
            let _g = gov.enter();
            assert_eq!(gov.inflight(), 1);
        }
        assert_eq!(gov.inflight(), 0);
    }

    #[test]
    fn exits_hard_overload_once_inflight_drops_under_exit_threshold() {
        let gov = Governor::new(2, 4, Severity::Low);
        let guards: Vec<_> = (0..5).map(|_| gov.enter()).collect();
        gov.decide(Severity::Info);
        assert!(matches!(gov.state(), GovernorState::HardOverload));
        drop(guards);
        gov.decide(Severity::Info);
        assert!(matches!(gov.state(), GovernorState::Normal));
    }
}
