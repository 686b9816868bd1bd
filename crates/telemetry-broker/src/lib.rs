//! Broker: durable, deduplicated, overload-aware envelope ingestion.

mod ack;
mod dedup;
mod error;
mod governor;
mod ingress;
mod log;
mod server;
mod tls;

pub use ack::{Ack, AckStatus};
pub use dedup::{DedupCache, DedupOutcome};
pub use error::{BrokerError, Result};
pub use governor::{Governor, GovernorDecision, GovernorState, InflightGuard};
pub use ingress::{AdmissionPipeline, BrokerStats};
pub use log::{BrokerLog, BrokerLogRecord};
pub use server::{router, AppState};
pub use tls::{extract_peer_cn, load_server_config, server_config, PeerCn, PeerCnAcceptor};
