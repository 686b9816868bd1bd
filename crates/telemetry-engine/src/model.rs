//! The decoded, normalized view the engine operates on (§3 "CorrelationEvent",
//! §9 "tagged sum type with a closed set of variants... Ingestor pattern-matches
//! once, produces the normalized CorrelationEvent").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use telemetry_types::{Body, Envelope, EventType, Payload, Severity, TelemetryEvent};

/// A single structured-field value extracted from a payload, for rule
/// predicates to compare against (§4.J "structured-field comparisons").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Decoded, normalized event the window and rule engine operate on. Built
/// once per `TelemetryEvent` at ingest, never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEvent {
    pub event_id: String,
    pub entity_id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub timestamp_ns: i64,
    pub tags: std::collections::BTreeSet<String>,
    pub structured_fields: BTreeMap<String, FieldValue>,
}

fn structured_fields(payload: &Payload) -> BTreeMap<String, FieldValue> {
    let mut fields = BTreeMap::new();
    match payload {
        Payload::Metric {
            name,
            metric_type: _,
            value,
            unit,
        } => {
            fields.insert("name".to_string(), FieldValue::Str(name.clone()));
            fields.insert("value".to_string(), FieldValue::Float(*value));
            fields.insert("unit".to_string(), FieldValue::Str(unit.clone()));
        }
        Payload::Process { pid, name, cmdline } => {
            fields.insert("pid".to_string(), FieldValue::Int(*pid as i64));
            fields.insert("name".to_string(), FieldValue::Str(name.clone()));
            fields.insert("cmdline".to_string(), FieldValue::Str(cmdline.clone()));
        }
        Payload::Audit {
            object_type,
            path,
            action,
        } => {
            fields.insert("object_type".to_string(), FieldValue::Str(object_type.clone()));
            fields.insert("path".to_string(), FieldValue::Str(path.clone()));
            fields.insert("action".to_string(), FieldValue::Str(action.clone()));
        }
        Payload::Security {
            auth_method,
            principal,
            outcome,
        } => {
            fields.insert("auth_method".to_string(), FieldValue::Str(auth_method.clone()));
            fields.insert("principal".to_string(), FieldValue::Str(principal.clone()));
            fields.insert("outcome".to_string(), FieldValue::Str(outcome.clone()));
        }
    }
    fields
}

fn to_correlation_event(entity_id: &str, event: &TelemetryEvent) -> CorrelationEvent {
    CorrelationEvent {
        event_id: event.event_id.clone(),
        entity_id: entity_id.to_string(),
        event_type: event.event_type,
        severity: event.severity,
        timestamp_ns: event.timestamp_ns,
        tags: event.tags.clone(),
        structured_fields: structured_fields(&event.payload),
    }
}

/// Decode one envelope into its constituent `CorrelationEvent`s (§4.I "parse
/// envelope, build a CorrelationEvent view"). One envelope's `Body` always
/// shares a single `device_id`, which becomes `entity_id` for every event it
/// carries.
pub fn decode_envelope(envelope: &Envelope) -> Vec<CorrelationEvent> {
    let entity_id = envelope.device_id();
    match &envelope.body {
        Body::DeviceTelemetry { events, .. }
        | Body::ProcessTelemetry { events, .. }
        | Body::SecurityEvent { events, .. }
        | Body::AuditEvent { events, .. } => {
            events.iter().map(|e| to_correlation_event(entity_id, e)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::MetricType;

    fn sample_envelope() -> Envelope {
        Envelope::unsigned(
            100,
            "dev-1_100",
            Body::SecurityEvent {
                device_id: "dev-1".to_string(),
                events: vec![TelemetryEvent {
                    event_id: "e1".to_string(),
                    event_type: EventType::Security,
                    severity: Severity::High,
                    timestamp_ns: 100,
                    tags: Default::default(),
                    payload: Payload::Security {
                        auth_method: "password".to_string(),
                        principal: "root".to_string(),
                        outcome: "SUDO".to_string(),
                    },
                }],
            },
        )
    }

    #[test]
    fn decode_envelope_produces_one_event_per_telemetry_event() {
        let events = decode_envelope(&sample_envelope());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, "dev-1");
        assert_eq!(events[0].event_type, EventType::Security);
        assert_eq!(
            events[0].structured_fields.get("outcome"),
            Some(&FieldValue::Str("SUDO".to_string()))
        );
    }

    #[test]
    fn metric_payload_extracts_value_as_float() {
        let envelope = Envelope::unsigned(
            1,
            "k",
            Body::DeviceTelemetry {
                device_id: "dev-2".to_string(),
                events: vec![TelemetryEvent {
                    event_id: "e2".to_string(),
                    event_type: EventType::Metric,
                    severity: Severity::Info,
                    timestamp_ns: 1,
                    tags: Default::default(),
                    payload: Payload::Metric {
                        name: "cpu".to_string(),
                        metric_type: MetricType::Gauge,
                        value: 42.0,
                        unit: "pct".to_string(),
                    },
                }],
            },
        );
        let events = decode_envelope(&envelope);
        assert_eq!(
            events[0].structured_fields.get("value"),
            Some(&FieldValue::Float(42.0))
        );
    }
}
