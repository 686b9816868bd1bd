//! Broker ingress admission pipeline (§4.F).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use telemetry_crypto::{verify, TrustMap};
use telemetry_observability::CommonStats;
use telemetry_types::{codec, Envelope, Severity};

use crate::ack::Ack;
use crate::dedup::{DedupCache, DedupOutcome};
use crate::governor::{Governor, GovernorDecision};
use crate::log::BrokerLog;

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

fn max_severity(envelope: &Envelope) -> Severity {
    envelope
        .body
        .events()
        .iter()
        .map(|e| e.severity)
        .max()
        .unwrap_or(Severity::Info)
}

/// Counters specific to broker admission, in addition to [`CommonStats`].
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub common: CommonStats,
    pub too_large: telemetry_observability::Counter,
    pub shed: telemetry_observability::Counter,
    pub retried: telemetry_observability::Counter,
    pub bad_signature: telemetry_observability::Counter,
    pub unknown_identity: telemetry_observability::Counter,
    pub identity_mismatch: telemetry_observability::Counter,
    pub idempotency_conflict: telemetry_observability::Counter,
    pub replayed: telemetry_observability::Counter,
}

/// The broker ingress admission pipeline (§4.F steps 2-7). Transport auth
/// (step 1, mTLS handshake + CN extraction) happens upstream in
/// `crate::tls`/`crate::server` before an envelope ever reaches here.
pub struct AdmissionPipeline {
    pub trust_map: Arc<TrustMap>,
    pub dedup: Arc<DedupCache>,
    pub log: Arc<BrokerLog>,
    pub governor: Arc<Governor>,
    pub max_envelope_bytes: usize,
    pub stats: BrokerStats,
}

impl AdmissionPipeline {
    pub fn admit(&self, envelope: Envelope, peer_cn: &str) -> Ack {
        self.stats.common.accepted.inc();

        // Step 2: size check.
        if let Err(_e) = codec::check_size(&envelope, self.max_envelope_bytes) {
            self.stats.too_large.inc();
            self.stats.common.rejected.inc();
            return Ack::invalid("TOO_LARGE");
        }

        // Step 3: governor.
        let _inflight_guard = self.governor.enter();
        match self.governor.decide(max_severity(&envelope)) {
            GovernorDecision::Admit => {}
            GovernorDecision::Retry { backoff_hint_ms } => {
                self.stats.retried.inc();
                self.stats.common.rejected.inc();
                return Ack::retry("OVERLOADED", backoff_hint_ms);
            }
            GovernorDecision::Shed => {
                self.stats.shed.inc();
                self.stats.common.rejected.inc();
                return Ack::invalid("SHEDDING");
            }
        }

        // Step 4: verify.
        let trust = self.trust_map.snapshot();
        match verify(&envelope, peer_cn, &trust) {
            telemetry_crypto::VerifyOutcome::Ok => {}
            telemetry_crypto::VerifyOutcome::Invalid(reason) => {
                use telemetry_crypto::VerifyFailureReason::*;
                match reason {
                    BadSignature => self.stats.bad_signature.inc(),
                    UnknownIdentity => self.stats.unknown_identity.inc(),
                    IdentityMismatch => self.stats.identity_mismatch.inc(),
                }
                self.stats.common.rejected.inc();
                return Ack::invalid(reason.as_str());
            }
        }

        // Step 5: dedup.
        let canonical_bytes = codec::canonical(&envelope);
        match self.dedup.probe(&envelope.idempotency_key, &canonical_bytes) {
            DedupOutcome::IdenticalReplay { .. } => {
                self.stats.replayed.inc();
                return Ack::ok();
            }
            DedupOutcome::Conflict => {
                self.stats.idempotency_conflict.inc();
                self.stats.common.rejected.inc();
                return Ack::invalid("IDEMPOTENCY_CONFLICT");
            }
            DedupOutcome::Novel => {}
        }

        // Step 6: durability.
        let envelope_bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                self.stats.common.errors.inc();
                tracing::error!(error = %e, "failed to serialize accepted envelope");
                return Ack::retry("STORAGE_UNAVAILABLE", 1_000);
            }
        };
        let accepted_at_ns = now_ns();
        let append_started = std::time::Instant::now();
        let log_seq = match self.log.append(
            accepted_at_ns,
            &envelope.idempotency_key,
            envelope_bytes,
            peer_cn,
        ) {
            Ok(seq) => seq,
            Err(e) => {
                self.stats.common.errors.inc();
                tracing::error!(error = %e, cn = peer_cn, "broker log append failed");
                return Ack::retry("STORAGE_UNAVAILABLE", 1_000);
            }
        };
        self.governor
            .record_log_latency(append_started.elapsed().as_micros() as i64);

        self.dedup
            .insert(&envelope.idempotency_key, log_seq, canonical_bytes, accepted_at_ns);

        // Step 7.
        Ack::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_crypto::Signer;
    use telemetry_types::{Body, EventType, MetricType, Payload, TelemetryEvent};

    fn sample_envelope(device_id: &str, key: &str) -> Envelope {
        Envelope::unsigned(
            100,
            key,
            Body::DeviceTelemetry {
                device_id: device_id.to_string(),
                events: vec![TelemetryEvent {
                    event_id: "e1".to_string(),
                    event_type: EventType::Metric,
                    severity: Severity::Info,
                    timestamp_ns: 100,
                    tags: Default::default(),
                    payload: Payload::Metric {
                        name: "cpu".to_string(),
                        metric_type: MetricType::Gauge,
                        value: 1.0,
                        unit: "pct".to_string(),
                    },
                }],
            },
        )
    }

    fn build_pipeline(signer: &Signer, cn: &str) -> (tempfile::TempDir, AdmissionPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[[entries]]\ncn = \"{cn}\"\npublic_key_hex = \"{}\"\nallowed_device_id_prefix = \"dev-\"\n",
            signer.public_key_hex()
        );
        let trust_map = Arc::new(TrustMap::from_toml(&toml).unwrap());
        let log = Arc::new(BrokerLog::open(&dir.path().join("broker.log")).unwrap());
        let governor = Arc::new(Governor::new(1000, 2000, Severity::Low));
        let pipeline = AdmissionPipeline {
            trust_map,
            dedup: Arc::new(DedupCache::new()),
            log,
            governor,
            max_envelope_bytes: 131_072,
            stats: BrokerStats::default(),
        };
        (dir, pipeline)
    }

    #[test]
    fn valid_envelope_is_accepted() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let (_dir, pipeline) = build_pipeline(&signer, "agent-1");
        let envelope = signer.sign(sample_envelope("dev-1", "dev-1_100"));
        let ack = pipeline.admit(envelope, "agent-1");
        assert_eq!(ack.status, crate::ack::AckStatus::Ok);
        assert_eq!(pipeline.log.len(), 1);
    }

    #[test]
    fn unverified_identity_is_invalid() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let (_dir, pipeline) = build_pipeline(&signer, "agent-1");
        let envelope = signer.sign(sample_envelope("dev-1", "dev-1_100"));
        let ack = pipeline.admit(envelope, "agent-unknown");
        assert_eq!(ack.status, crate::ack::AckStatus::Invalid);
        assert_eq!(ack.reason, "UNKNOWN_IDENTITY");
    }

    #[test]
    fn replay_of_identical_envelope_is_idempotent_ok() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let (_dir, pipeline) = build_pipeline(&signer, "agent-1");
        let envelope = signer.sign(sample_envelope("dev-1", "dev-1_100"));
        pipeline.admit(envelope.clone(), "agent-1");
        let ack = pipeline.admit(envelope, "agent-1");
        assert_eq!(ack.status, crate::ack::AckStatus::Ok);
        assert_eq!(pipeline.log.len(), 1);
    }

    #[test]
    fn conflicting_replay_is_rejected() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let (_dir, pipeline) = build_pipeline(&signer, "agent-1");
        let envelope = signer.sign(sample_envelope("dev-1", "dev-1_100"));
        pipeline.admit(envelope, "agent-1");

        let mut conflicting = sample_envelope("dev-1", "dev-1_100");
        if let Body::DeviceTelemetry { events, .. } = &mut conflicting.body {
            events[0].payload = Payload::Metric {
                name: "mem".to_string(),
                metric_type: MetricType::Gauge,
                value: 2.0,
                unit: "pct".to_string(),
            };
        }
        let conflicting = signer.sign(conflicting);
        let ack = pipeline.admit(conflicting, "agent-1");
        assert_eq!(ack.status, crate::ack::AckStatus::Invalid);
        assert_eq!(ack.reason, "IDEMPOTENCY_CONFLICT");
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let signer = Signer::from_seed(&[1u8; 32]);
        let (_dir, mut pipeline) = build_pipeline(&signer, "agent-1");
        pipeline.max_envelope_bytes = 4;
        let envelope = signer.sign(sample_envelope("dev-1", "dev-1_100"));
        let ack = pipeline.admit(envelope, "agent-1");
        assert_eq!(ack.status, crate::ack::AckStatus::Invalid);
        assert_eq!(ack.reason, "TOO_LARGE");
    }
}
