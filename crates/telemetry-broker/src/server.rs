//! HTTP surface: `POST /v1/publish` over mTLS (§4.F, §6).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use telemetry_types::Envelope;
use tower_http::trace::TraceLayer;

use crate::ack::AckStatus;
use crate::ingress::AdmissionPipeline;
use crate::log::BrokerLogRecord;
use crate::tls::PeerCn;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AdmissionPipeline>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/publish", post(publish))
        .route("/v1/log", get(scan_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn publish(
    State(state): State<AppState>,
    Extension(PeerCn(cn)): Extension<PeerCn>,
    Json(envelope): Json<Envelope>,
) -> Response {
    let ack = state.pipeline.admit(envelope, &cn);
    let status = match ack.status {
        AckStatus::Ok => StatusCode::OK,
        AckStatus::Retry => StatusCode::SERVICE_UNAVAILABLE,
        AckStatus::Invalid => StatusCode::BAD_REQUEST,
        AckStatus::Unauthorized => StatusCode::UNAUTHORIZED,
    };
    (status, Json(ack)).into_response()
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    from_seq: u64,
    #[serde(default = "default_scan_limit")]
    limit: usize,
}

fn default_scan_limit() -> usize {
    256
}

/// Pull-based read path for consumers (§4.G, §4.I): the ingestor polls this
/// with its persisted cursor, advancing only on successful downstream
/// processing. Not part of the mTLS agent-publish surface; deliberately
/// left off the peer-CN extension requirement since any authenticated
/// consumer within the cluster may read the log.
async fn scan_log(State(state): State<AppState>, Query(q): Query<ScanQuery>) -> Json<Vec<BrokerLogRecord>> {
    Json(state.pipeline.log.scan(q.from_seq, q.limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc as StdArc;
    use tower::ServiceExt;

    use crate::dedup::DedupCache;
    use crate::governor::Governor;
    use crate::log::BrokerLog;
    use telemetry_crypto::{Signer, TrustMap};
    use telemetry_types::{Body as EnvelopeBody, EventType, MetricType, Payload, Severity, TelemetryEvent};

    fn sample_envelope(signer: &Signer) -> Envelope {
        signer.sign(Envelope::unsigned(
            100,
            "dev-1_100",
            EnvelopeBody::DeviceTelemetry {
                device_id: "dev-1".to_string(),
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
        ))
    }

    #[tokio::test]
    async fn publish_accepts_valid_signed_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let signer = Signer::from_seed(&[3u8; 32]);
        let toml = format!(
            "[[entries]]\ncn = \"agent-1\"\npublic_key_hex = \"{}\"\nallowed_device_id_prefix = \"dev-\"\n",
            signer.public_key_hex()
        );
        let pipeline = AdmissionPipeline {
            trust_map: StdArc::new(TrustMap::from_toml(&toml).unwrap()),
            dedup: StdArc::new(DedupCache::new()),
            log: StdArc::new(BrokerLog::open(&dir.path().join("broker.log")).unwrap()),
            governor: StdArc::new(Governor::new(1000, 2000, Severity::Low)),
            max_envelope_bytes: 131_072,
            stats: Default::default(),
        };
        let app = router(AppState {
            pipeline: StdArc::new(pipeline),
        });

        let envelope = sample_envelope(&signer);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/publish")
            .header("content-type", "application/json")
            .extension(PeerCn("agent-1".to_string()))
            .body(Body::from(serde_json::to_vec(&envelope).unwrap()))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
