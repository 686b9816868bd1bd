//! The collection contract sources implement (§4.E step 2).
//!
//! Process/SNMP/log collection internals are out of scope (§1 "treated as
//! external collaborators") — this crate only defines the output contract a
//! collector must satisfy and a deterministic fake used by scheduler tests.

use async_trait::async_trait;
use telemetry_types::TelemetryEvent;

/// One telemetry source owned by the scheduler. `collect` must be
/// side-effect-bounded and safe to abort at the `timeout_ms` deadline the
/// scheduler wraps it in.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    async fn collect(&self) -> Vec<TelemetryEvent>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use telemetry_types::{MetricType, Payload, Severity};

    /// Emits one METRIC event per call with a monotonically increasing
    /// `event_id`; optionally sleeps past the scheduler's deadline to
    /// exercise the collection-timeout path.
    pub struct FakeCollector {
        name: String,
        calls: AtomicUsize,
        sleep: Option<Duration>,
    }

    impl FakeCollector {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                sleep: None,
            }
        }

        pub fn slow(name: &str, sleep: Duration) -> Self {
            Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                sleep: Some(sleep),
            }
        }

        #[allow(dead_code)]
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn collect(&self) -> Vec<TelemetryEvent> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sleep) = self.sleep {
                tokio::time::sleep(sleep).await;
            }
            vec![TelemetryEvent {
                event_id: format!("{}-{}", self.name, n),
                event_type: telemetry_types::EventType::Metric,
                severity: Severity::Info,
                timestamp_ns: 0,
                tags: Default::default(),
                payload: Payload::Metric {
                    name: "cpu".to_string(),
                    metric_type: MetricType::Gauge,
                    value: 1.0,
                    unit: "pct".to_string(),
                },
            }]
        }
    }
}
