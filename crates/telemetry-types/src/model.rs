//! Canonical types for the telemetry fabric.
//!
//! Field order within each struct is load-bearing: the canonical codec
//! encodes fields in declaration order, so reordering a field here changes
//! every signature computed over it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The current canonical encoding version. Bumping this is a breaking wire
/// change; see `telemetry_types::codec`.
pub const ENVELOPE_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Metric,
    Event,
    Alert,
    Audit,
    Security,
}

/// One normalized telemetry observation carried inside an envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub timestamp_ns: i64,
    pub tags: BTreeSet<String>,
    pub payload: Payload,
}

/// The typed payload of a `TelemetryEvent`, one variant per collector family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Metric {
        name: String,
        metric_type: MetricType,
        value: f64,
        unit: String,
    },
    Process {
        pid: u32,
        name: String,
        cmdline: String,
    },
    Audit {
        object_type: String,
        path: String,
        action: String,
    },
    Security {
        auth_method: String,
        principal: String,
        outcome: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    Gauge,
    Counter,
    Histogram,
}

/// The four closed body variants an envelope may carry. Deliberately a
/// tagged sum type rather than an open-ended `dyn Any` — see the dynamic
/// dispatch design note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    DeviceTelemetry {
        device_id: String,
        events: Vec<TelemetryEvent>,
    },
    ProcessTelemetry {
        device_id: String,
        events: Vec<TelemetryEvent>,
    },
    SecurityEvent {
        device_id: String,
        events: Vec<TelemetryEvent>,
    },
    AuditEvent {
        device_id: String,
        events: Vec<TelemetryEvent>,
    },
}

impl Body {
    pub fn device_id(&self) -> &str {
        match self {
            Body::DeviceTelemetry { device_id, .. }
            | Body::ProcessTelemetry { device_id, .. }
            | Body::SecurityEvent { device_id, .. }
            | Body::AuditEvent { device_id, .. } => device_id,
        }
    }

    pub fn events(&self) -> &[TelemetryEvent] {
        match self {
            Body::DeviceTelemetry { events, .. }
            | Body::ProcessTelemetry { events, .. }
            | Body::SecurityEvent { events, .. }
            | Body::AuditEvent { events, .. } => events,
        }
    }

    pub fn variant_tag(&self) -> u8 {
        match self {
            Body::DeviceTelemetry { .. } => 0,
            Body::ProcessTelemetry { .. } => 1,
            Body::SecurityEvent { .. } => 2,
            Body::AuditEvent { .. } => 3,
        }
    }
}

/// The transport unit: the only thing `telemetry-broker` accepts at ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub timestamp_ns: i64,
    pub idempotency_key: String,
    pub body: Body,
    /// Ed25519 signature (64 bytes) over `codec::canonical(self)` with this
    /// field cleared. `None` before signing; always `Some` once it leaves
    /// the agent.
    pub signature: Option<Vec<u8>>,
}

impl Envelope {
    pub fn unsigned(timestamp_ns: i64, idempotency_key: impl Into<String>, body: Body) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            timestamp_ns,
            idempotency_key: idempotency_key.into(),
            body,
            signature: None,
        }
    }

    pub fn device_id(&self) -> &str {
        self.body.device_id()
    }
}
