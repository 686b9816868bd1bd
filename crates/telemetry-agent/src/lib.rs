//! Agent-side collection and publish pipeline: the periodic
//! poll-sign-enqueue-publish state machine that bounds resource usage and
//! preserves per-agent ordering.

pub mod ack;
pub mod collector;
pub mod error;
pub mod publisher;
pub mod scheduler;

pub use ack::{Ack, AckStatus};
pub use collector::Collector;
pub use error::{AgentError, Result};
pub use publisher::{BrokerClient, HttpBrokerClient, Publisher, PublisherStats, SendOutcome};
pub use scheduler::{ScheduledSource, Scheduler, SourceStats};
