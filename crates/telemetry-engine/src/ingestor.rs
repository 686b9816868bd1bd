//! Pulls records from the broker log and feeds the correlation engine
//! (§4.I "Ingestor").
//!
//! The broker's `GET /v1/log` endpoint is the wire contract; rather than
//! depending on `telemetry-broker` for its `BrokerLogRecord` type (the wrong
//! dependency direction — the engine is a consumer, not the broker's
//! server), this module declares a local, independently-defined
//! `ScannedRecord` matching the same JSON shape, the same pattern
//! `telemetry-agent::ack` uses for the agent side of the wire contract.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use telemetry_types::Envelope;

use crate::engine::CorrelationEngine;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ScannedRecord {
    pub log_seq: u64,
    pub accepted_at_ns: i64,
    pub idempotency_key: String,
    pub envelope_bytes: Vec<u8>,
    pub source_cn: String,
}

/// The read side of the broker log contract (§4.G "scan(from_seq, limit) ->
/// [records]"), abstracted so tests can feed a fixed record set without a
/// real broker process.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn scan(&self, from_seq: u64, limit: usize) -> Result<Vec<ScannedRecord>>;
}

/// Polls a running broker's `GET /v1/log?from_seq=&limit=` over HTTP.
pub struct HttpLogSource {
    client: reqwest::Client,
    broker_addr: String,
}

impl HttpLogSource {
    pub fn new(broker_addr: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker_addr,
        }
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn scan(&self, from_seq: u64, limit: usize) -> Result<Vec<ScannedRecord>> {
        let url = format!("http://{}/v1/log?from_seq={}&limit={}", self.broker_addr, from_seq, limit);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        response
            .json::<Vec<ScannedRecord>>()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

/// Externally persisted read cursor (§4.I "cursor advances only on
/// successful processing", "persisted at-least-once-after-processing").
/// Plain-text file holding the next `log_seq` to request; simpler than a
/// database row since it is the only piece of mutable state the ingestor
/// owns outside the engine itself.
pub struct Cursor {
    path: PathBuf,
}

impl Cursor {
    pub fn open(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn read(&self) -> Result<u64> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| EngineError::Cursor(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(EngineError::Cursor(e.to_string())),
        }
    }

    pub fn advance_to(&self, log_seq: u64) -> Result<()> {
        std::fs::write(&self.path, log_seq.to_string()).map_err(|e| EngineError::Cursor(e.to_string()))
    }
}

/// Drains the broker log into the correlation engine, advancing the cursor
/// only past records that were fully processed (§4.I "do not drop").
pub struct Ingestor<S: LogSource> {
    source: S,
    cursor: Cursor,
    engine: CorrelationEngine,
    scan_limit: usize,
}

impl<S: LogSource> Ingestor<S> {
    pub fn new(source: S, cursor_path: &Path, engine: CorrelationEngine, scan_limit: usize) -> Self {
        Self {
            source,
            cursor: Cursor::open(cursor_path),
            engine,
            scan_limit,
        }
    }

    /// Run one scan-and-process batch, returning the number of records
    /// processed. Stops at the first record that fails to decode or
    /// persist, leaving the cursor at the last successfully processed
    /// `log_seq` so the next call retries it (idempotent downstream, per
    /// §4.I).
    pub async fn run_once(&self) -> Result<usize> {
        let from_seq = self.cursor.read()?;
        let records = self.source.scan(from_seq, self.scan_limit).await?;
        let mut processed = 0;

        for record in &records {
            let envelope: Envelope = serde_json::from_slice(&record.envelope_bytes)
                .map_err(|e| EngineError::Transport(format!("malformed envelope bytes: {e}")))?;
            self.engine.process_envelope(&envelope).await?;
            self.cursor.advance_to(record.log_seq + 1)?;
            processed += 1;
        }

        Ok(processed)
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::DecayParams;
    use crate::rules::registry::RuleRegistry;
    use crate::window::WindowConfig;
    use parking_lot::Mutex;
    use telemetry_types::{Body, EventType, Payload, Severity, TelemetryEvent};

    struct FakeLogSource {
        records: Mutex<Vec<ScannedRecord>>,
    }

    #[async_trait]
    impl LogSource for FakeLogSource {
        async fn scan(&self, from_seq: u64, limit: usize) -> Result<Vec<ScannedRecord>> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.log_seq >= from_seq)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    fn sample_envelope_bytes() -> Vec<u8> {
        let envelope = Envelope::unsigned(
            0,
            "a1_0",
            Body::DeviceTelemetry {
                device_id: "a1".to_string(),
                events: vec![TelemetryEvent {
                    event_id: "e1".to_string(),
                    event_type: EventType::Metric,
                    severity: Severity::Info,
                    timestamp_ns: 0,
                    tags: Default::default(),
                    payload: Payload::Metric {
                        name: "cpu".to_string(),
                        metric_type: telemetry_types::MetricType::Gauge,
                        value: 1.0,
                        unit: "pct".to_string(),
                    },
                }],
            },
        );
        serde_json::to_vec(&envelope).unwrap()
    }

    async fn test_engine(dir: &Path) -> CorrelationEngine {
        std::fs::write(dir.join("rules.toml"), "").unwrap();
        let rules = RuleRegistry::load(&dir.join("rules.toml")).unwrap();
        let persistence = crate::persistence::PersistenceStore::connect(&dir.join("engine.db")).await.unwrap();
        CorrelationEngine::new(
            WindowConfig {
                horizon_ns: 300_000_000_000,
                max_events: 1000,
            },
            rules,
            DecayParams {
                start_ns: 60_000_000_000,
                full_ns: 3_600_000_000_000,
            },
            persistence,
        )
    }

    #[tokio::test]
    async fn run_once_processes_records_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;
        let source = FakeLogSource {
            records: Mutex::new(vec![ScannedRecord {
                log_seq: 0,
                accepted_at_ns: 0,
                idempotency_key: "a1_0".to_string(),
                envelope_bytes: sample_envelope_bytes(),
                source_cn: "agent-1".to_string(),
            }]),
        };
        let ingestor = Ingestor::new(source, &dir.path().join("cursor"), engine, 256);

        let processed = ingestor.run_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(ingestor.cursor.read().unwrap(), 1);
        assert_eq!(ingestor.engine().window_len(), 1);

        let processed_again = ingestor.run_once().await.unwrap();
        assert_eq!(processed_again, 0);
    }

    #[tokio::test]
    async fn cursor_defaults_to_zero_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = Cursor::open(&dir.path().join("missing-cursor"));
        assert_eq!(cursor.read().unwrap(), 0);
    }
}
