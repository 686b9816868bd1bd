//! Deterministic canonical encoding used as the signing surface (§4.A).
//!
//! `canonical(x) == canonical(y)` iff `x` and `y` are semantically identical
//! ignoring `signature`. The encoding is a flat, explicitly-framed binary
//! format — fixed integer widths, length-prefixed strings/bytes, sorted tag
//! sets — rather than relying on an incidental ordering from a generic
//! serializer, so a future change to `serde_json`'s map ordering (or a new
//! field with a default) can never silently change what gets signed.
//!
//! The version field is itself part of the canonical bytes: introducing a
//! new wire shape means bumping [`crate::model::ENVELOPE_VERSION`], not
//! reusing the old tag with different framing.

use crate::error::{Result, TypesError};
use crate::model::{Body, Envelope, EventType, MetricType, Payload, TelemetryEvent};

/// Produce the canonical byte sequence for `envelope` with `signature`
/// cleared, over which `telemetry-crypto` computes/verifies the Ed25519
/// signature.
pub fn canonical(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    write_str(&mut buf, &envelope.version);
    write_i64(&mut buf, envelope.timestamp_ns);
    write_str(&mut buf, &envelope.idempotency_key);
    write_body(&mut buf, &envelope.body);
    buf
}

fn write_body(buf: &mut Vec<u8>, body: &Body) {
    buf.push(body.variant_tag());
    write_str(buf, body.device_id());
    let events = body.events();
    write_u32(buf, events.len() as u32);
    for event in events {
        write_event(buf, event);
    }
}

fn write_event(buf: &mut Vec<u8>, event: &TelemetryEvent) {
    write_str(buf, &event.event_id);
    buf.push(event_type_tag(event.event_type));
    buf.push(event.severity.rank());
    write_i64(buf, event.timestamp_ns);
    write_u32(buf, event.tags.len() as u32);
    // BTreeSet iterates in sorted order, so this is stable regardless of
    // insertion order on the producing side.
    for tag in &event.tags {
        write_str(buf, tag);
    }
    write_payload(buf, &event.payload);
}

fn event_type_tag(t: EventType) -> u8 {
    match t {
        EventType::Metric => 0,
        EventType::Event => 1,
        EventType::Alert => 2,
        EventType::Audit => 3,
        EventType::Security => 4,
    }
}

fn write_payload(buf: &mut Vec<u8>, payload: &Payload) {
    match payload {
        Payload::Metric {
            name,
            metric_type,
            value,
            unit,
        } => {
            buf.push(0);
            write_str(buf, name);
            buf.push(match metric_type {
                MetricType::Gauge => 0,
                MetricType::Counter => 1,
                MetricType::Histogram => 2,
            });
            buf.extend_from_slice(&value.to_bits().to_le_bytes());
            write_str(buf, unit);
        }
        Payload::Process { pid, name, cmdline } => {
            buf.push(1);
            write_u32(buf, *pid);
            write_str(buf, name);
            write_str(buf, cmdline);
        }
        Payload::Audit {
            object_type,
            path,
            action,
        } => {
            buf.push(2);
            write_str(buf, object_type);
            write_str(buf, path);
            write_str(buf, action);
        }
        Payload::Security {
            auth_method,
            principal,
            outcome,
        } => {
            buf.push(3);
            write_str(buf, auth_method);
            write_str(buf, principal);
            write_str(buf, outcome);
        }
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Enforce `max_envelope_bytes` (§4.F step 2) against the envelope's
/// serialized-for-transport size (JSON over the wire, not the canonical
/// signing bytes, which omit the signature).
pub fn check_size(envelope: &Envelope, max_bytes: usize) -> Result<()> {
    let size = serde_json::to_vec(envelope)
        .map_err(|e| TypesError::EncodeFailed(e.to_string()))?
        .len();
    if size > max_bytes {
        return Err(TypesError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(())
}
