//! Ingestor, sliding-window correlation engine, rule registry, and risk
//! store (§4.I–§4.L).

pub mod engine;
pub mod error;
pub mod ingestor;
pub mod model;
pub mod persistence;
pub mod risk;
pub mod rules;
pub mod window;

pub use engine::CorrelationEngine;
pub use error::{EngineError, Result};
pub use ingestor::{Cursor, HttpLogSource, Ingestor, LogSource, ScannedRecord};
pub use model::{decode_envelope, CorrelationEvent, FieldValue};
pub use persistence::PersistenceStore;
pub use risk::{Contribution, DecayParams, EntityRisk, RiskLevel, RiskStore};
pub use rules::eval::{evaluate_insert, Incident, IncidentDeduplicator};
pub use rules::registry::{EventPredicate, RuleDefinition, RuleRegistry, RuleSet};
pub use window::{CorrelationWindow, WindowConfig};
