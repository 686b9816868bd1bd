//! Agent-side publish state machine (§4.D).
//!
//! A small explicit state machine with timers rather than a hidden await
//! chain (§9 "Coroutine-style publisher" design note) — recovery depends on
//! knowing exactly which WAL entry is INFLIGHT at crash time, and that falls
//! out for free here because `telemetry_wal::Wal` already tracks it on disk.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use telemetry_observability::{CommonStats, Counter};
use telemetry_wal::Wal;

use crate::ack::{Ack, AckStatus};

/// Outcome of one send attempt, collapsing HTTP transport failures into the
/// same two retriable kinds §7 names (`UNAVAILABLE`, `DEADLINE_EXCEEDED`).
#[derive(Debug)]
pub enum SendOutcome {
    Ack(Ack),
    Unavailable,
    DeadlineExceeded,
}

/// Seam between the publisher and the network. A fake implementation drives
/// the state machine's unit tests without a real broker process.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, envelope_bytes: Vec<u8>) -> SendOutcome;
}

/// `reqwest`-backed client speaking the broker's `POST /v1/publish` (§6).
pub struct HttpBrokerClient {
    client: reqwest::Client,
    publish_url: String,
}

impl HttpBrokerClient {
    /// `request_timeout` is the RPC deadline (§5: "5s default per publish").
    pub fn new(broker_addr: &str, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("reqwest client builder"),
            publish_url: format!("{}/v1/publish", broker_addr.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn publish(&self, envelope_bytes: Vec<u8>) -> SendOutcome {
        let resp = self
            .client
            .post(&self.publish_url)
            .header("content-type", "application/json")
            .body(envelope_bytes)
            .send()
            .await;

        match resp {
            Ok(r) => match r.json::<Ack>().await {
                Ok(ack) => SendOutcome::Ack(ack),
                Err(_) => SendOutcome::Unavailable,
            },
            Err(e) if e.is_timeout() => SendOutcome::DeadlineExceeded,
            Err(_) => SendOutcome::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Idle,
    Draining,
    /// Paused after `circuit_threshold` consecutive transport failures;
    /// resumes with a single half-open probe once the cooldown elapses
    /// (§2 "Circuit breaker cooldown and re-probe").
    CircuitOpen,
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub common: CommonStats,
    pub acked: Counter,
    pub retried: Counter,
    pub poisoned: Counter,
    pub circuit_opens: Counter,
}

/// Per-agent publisher, single instance (§4.D).
pub struct Publisher {
    wal: Arc<Wal>,
    client: Arc<dyn BrokerClient>,
    max_batch: usize,
    retry_min_ms: u64,
    retry_max_ms: u64,
    circuit_threshold: u32,
    circuit_cooldown: Duration,
    consecutive_failures: AtomicU32,
    circuit_opened_at_ms: AtomicU64,
    state: parking_lot::Mutex<PublisherState>,
    pub stats: PublisherStats,
}

fn full_jitter_backoff(attempt: u32, min_ms: u64, max_ms: u64) -> u64 {
    let factor = 1u64 << attempt.min(20);
    let exp = min_ms.saturating_mul(factor);
    let cap = exp.min(max_ms).max(min_ms);
    rand::thread_rng().gen_range(min_ms..=cap)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

impl Publisher {
    pub fn new(
        wal: Arc<Wal>,
        client: Arc<dyn BrokerClient>,
        max_batch: usize,
        retry_min_ms: u64,
        retry_max_ms: u64,
        circuit_threshold: u32,
    ) -> Self {
        Self {
            wal,
            client,
            max_batch,
            retry_min_ms,
            retry_max_ms,
            circuit_threshold,
            circuit_cooldown: Duration::from_secs(30),
            consecutive_failures: AtomicU32::new(0),
            circuit_opened_at_ms: AtomicU64::new(0),
            state: parking_lot::Mutex::new(PublisherState::Idle),
            stats: PublisherStats::default(),
        }
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock()
    }

    pub fn backlog_count(&self) -> usize {
        self.wal.backlog_count()
    }

    /// Run the drain loop until `shutdown` fires. On shutdown, an in-flight
    /// send is allowed to finish its current await point and the loop
    /// exits; the WAL entry it was sending stays INFLIGHT until the agent
    /// restarts and reverts it to PENDING (§4.D "Cancellation").
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = self.drain_once() => {}
            }
        }
    }

    /// One DRAIN cycle (§4.D state diagram): attempt to send up to
    /// `max_batch` PENDING entries in seq order, stopping at the first
    /// retriable outcome so ordering within the batch is preserved.
    pub async fn drain_once(&self) {
        if self.in_circuit_open_cooldown() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            return;
        }

        *self.state.lock() = PublisherState::Draining;
        let pending = self.wal.iter_pending(self.max_batch);
        if pending.is_empty() {
            *self.state.lock() = PublisherState::Idle;
            tokio::time::sleep(Duration::from_millis(200)).await;
            return;
        }

        for entry in pending {
            if let Err(e) = self.wal.mark_inflight(entry.seq) {
                tracing::error!(seq = entry.seq, error = %e, "failed to mark wal entry inflight");
                continue;
            }

            match self.client.publish(entry.bytes.clone()).await {
                SendOutcome::Ack(ack) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    match ack.status {
                        AckStatus::Ok => {
                            let _ = self.wal.mark_acked(&entry.idempotency_key);
                            self.stats.acked.inc();
                            self.stats.common.accepted.inc();
                        }
                        AckStatus::Invalid | AckStatus::Unauthorized => {
                            tracing::error!(
                                idempotency_key = %entry.idempotency_key,
                                reason = %ack.reason,
                                "envelope terminally rejected by broker"
                            );
                            let _ = self.wal.mark_acked(&entry.idempotency_key);
                            self.stats.poisoned.inc();
                            self.stats.common.rejected.inc();
                        }
                        AckStatus::Retry => {
                            self.stats.retried.inc();
                            let _ = self.wal.mark_pending(entry.seq);
                            let hint = ack.backoff_hint_ms.max(full_jitter_backoff(
                                0,
                                self.retry_min_ms,
                                self.retry_max_ms,
                            ));
                            tokio::time::sleep(Duration::from_millis(hint)).await;
                            break;
                        }
                    }
                }
                SendOutcome::Unavailable | SendOutcome::DeadlineExceeded => {
                    let _ = self.wal.mark_pending(entry.seq);
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.stats.common.errors.inc();
                    if failures >= self.circuit_threshold {
                        self.open_circuit();
                    }
                    let backoff =
                        full_jitter_backoff(failures, self.retry_min_ms, self.retry_max_ms);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        if *state != PublisherState::CircuitOpen {
            *state = PublisherState::Idle;
        }
    }

    fn open_circuit(&self) {
        let mut state = self.state.lock();
        if *state != PublisherState::CircuitOpen {
            self.stats.circuit_opens.inc();
            self.circuit_opened_at_ms.store(now_ms(), Ordering::SeqCst);
            *state = PublisherState::CircuitOpen;
        }
    }

    /// While the circuit is open, only a single half-open probe attempt is
    /// allowed once the cooldown has elapsed; until then every `drain_once`
    /// call is a no-op.
    fn in_circuit_open_cooldown(&self) -> bool {
        if self.state() != PublisherState::CircuitOpen {
            return false;
        }
        let opened_at = self.circuit_opened_at_ms.load(Ordering::SeqCst);
        let elapsed = now_ms().saturating_sub(opened_at);
        if elapsed < self.circuit_cooldown.as_millis() as u64 {
            return true;
        }
        // Cooldown elapsed: allow exactly one probe through by resetting to
        // Draining state for this call; a renewed failure re-opens it.
        self.consecutive_failures.store(self.circuit_threshold - 1, Ordering::SeqCst);
        *self.state.lock() = PublisherState::Idle;
        false
    }
}
