//! Ties the window, rule registry, risk store, and persistence together
//! into the single correlation engine the ingestor feeds (§4.J, §9 "a
//! single correlation engine fed by the single ingestor to avoid the
//! database-lock race").

use std::sync::atomic::{AtomicI64, Ordering};

use telemetry_types::Envelope;

use crate::error::Result;
use crate::model::decode_envelope;
use crate::persistence::PersistenceStore;
use crate::risk::{DecayParams, RiskStore};
use crate::rules::eval::{evaluate_insert, Incident, IncidentDeduplicator};
use crate::rules::registry::RuleRegistry;
use crate::window::{CorrelationWindow, WindowConfig};

const MAX_EVICT_PER_INSERT: usize = 64;

/// The correlation engine: a single writer over the window, rule registry,
/// and risk store, reachable from the ingestor's processing loop.
pub struct CorrelationEngine {
    window: CorrelationWindow,
    rules: RuleRegistry,
    risk: RiskStore,
    dedup: IncidentDeduplicator,
    persistence: PersistenceStore,
    clock_ns: AtomicI64,
}

impl CorrelationEngine {
    pub fn new(
        window_config: WindowConfig,
        rules: RuleRegistry,
        decay: DecayParams,
        persistence: PersistenceStore,
    ) -> Self {
        Self {
            window: CorrelationWindow::new(window_config),
            rules,
            risk: RiskStore::new(decay),
            dedup: IncidentDeduplicator::new(),
            persistence,
            clock_ns: AtomicI64::new(0),
        }
    }

    /// Decode one envelope, insert each event into the window, evaluate
    /// candidate rules, apply risk contributions, and persist any resulting
    /// incidents (§4.J step 1-2). Returns the incidents emitted so the
    /// ingestor can log/count them; the cursor should only advance once this
    /// returns `Ok` (§4.I "cursor advances only on successful processing").
    pub async fn process_envelope(&self, envelope: &Envelope) -> Result<Vec<Incident>> {
        let events = decode_envelope(envelope);
        let mut incidents = Vec::new();

        for event in events {
            let now_ns = event.timestamp_ns;
            self.clock_ns.fetch_max(now_ns, Ordering::Relaxed);
            self.window.insert(event.clone(), now_ns, MAX_EVICT_PER_INSERT);

            let rule_set = self.rules.current();
            let fired = evaluate_insert(&event, &self.window, &rule_set, &self.dedup);

            for (key, incident) in fired {
                self.persistence.insert_incident(&incident).await?;
                self.risk.contribute(
                    &incident.entity_id,
                    &incident.rule_name,
                    rule_weight(&rule_set, &incident.rule_name),
                    now_ns,
                );
                if let Some(risk) = self.risk.get(&incident.entity_id, now_ns) {
                    let new_contribution = risk.contributions.last().cloned().into_iter().collect::<Vec<_>>();
                    self.persistence.upsert_entity_risk(&risk, &new_contribution).await?;
                }
                // Only now that the incident and its risk contribution are
                // durable do we record the key as seen; marking it earlier
                // would permanently suppress the incident if a persistence
                // call above failed and the ingestor retried this record.
                self.dedup.mark_seen(key);
                incidents.push(incident);
            }
        }

        Ok(incidents)
    }

    pub fn poll_rule_reload(&self) -> Result<bool> {
        self.rules.poll_reload()
    }

    pub fn decay_tick(&self) {
        self.risk.decay_tick(self.clock_ns.load(Ordering::Relaxed));
    }

    pub fn entity_risk(&self, entity_id: &str) -> Option<crate::risk::EntityRisk> {
        self.risk.get(entity_id, self.clock_ns.load(Ordering::Relaxed))
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

fn rule_weight(rule_set: &crate::rules::registry::RuleSet, rule_name: &str) -> f64 {
    rule_set
        .rules()
        .iter()
        .find(|r| r.name == rule_name)
        .map(|r| r.risk_weight)
        .unwrap_or(0.0)
}
