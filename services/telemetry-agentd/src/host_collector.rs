//! A minimal built-in collector so the binary has at least one real
//! source to schedule. Process/SNMP/log collection proper is out of scope
//! (spec §1 "treated as external collaborators") — anything richer is a
//! separate collector crate implementing `telemetry_agent::Collector`.

use async_trait::async_trait;
use telemetry_agent::Collector;
use telemetry_types::{MetricType, Payload, Severity, TelemetryEvent};

pub struct LoadAverageCollector {
    name: String,
}

impl LoadAverageCollector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn read_load1() -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }
}

#[async_trait]
impl Collector for LoadAverageCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Vec<TelemetryEvent> {
        let Some(load1) = Self::read_load1() else {
            return Vec::new();
        };
        let timestamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos() as i64;
        vec![TelemetryEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: telemetry_types::EventType::Metric,
            severity: Severity::Info,
            timestamp_ns,
            tags: Default::default(),
            payload: Payload::Metric {
                name: "system.load1".to_string(),
                metric_type: MetricType::Gauge,
                value: load1,
                unit: "load".to_string(),
            },
        }]
    }
}
