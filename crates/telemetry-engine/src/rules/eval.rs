//! Temporal multi-clause rule evaluation and incident emission (§4.J
//! "Evaluation", "Deduplication of incidents", "Failure semantics").

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use telemetry_types::Severity;
use uuid::Uuid;

use crate::model::CorrelationEvent;
use crate::rules::registry::{RuleDefinition, RuleSet};
use crate::window::CorrelationWindow;

/// An emitted incident (§3 "Incident").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub rule_name: String,
    pub severity: Severity,
    pub entity_id: String,
    pub summary: String,
    pub mitre_tactics: BTreeSet<String>,
    pub mitre_techniques: BTreeSet<String>,
    pub contributing_events: Vec<String>,
    pub opened_at_ns: i64,
    pub closed_at_ns: Option<i64>,
}

pub type IncidentKey = (String, String, Vec<String>);

pub fn incident_key(rule_name: &str, entity_id: &str, chain: &[CorrelationEvent]) -> IncidentKey {
    (
        rule_name.to_string(),
        entity_id.to_string(),
        chain.iter().map(|e| e.event_id.clone()).collect(),
    )
}

/// Greedily find the earliest chain of events, one per clause in order,
/// satisfying the rule's temporal constraint, bounded to the rule's
/// `max_candidates` most recent events for the entity so a single insert's
/// evaluation work stays bounded regardless of window size (§4.J
/// "bounded in per-event work").
fn try_fire_rule(rule: &RuleDefinition, triggering: &CorrelationEvent, window: &CorrelationWindow) -> Option<Vec<CorrelationEvent>> {
    let mut candidates = window.by_entity(&triggering.entity_id);
    if candidates.len() > rule.max_candidates {
        candidates.sort_by_key(|e| e.timestamp_ns);
        let drop = candidates.len() - rule.max_candidates;
        candidates.drain(0..drop);
    }

    let mut chain = Vec::with_capacity(rule.clauses.len());
    let mut min_next_ts = i64::MIN;
    for clause in &rule.clauses {
        let next = candidates
            .iter()
            .filter(|e| e.timestamp_ns >= min_next_ts && clause.matches(e))
            .min_by_key(|e| e.timestamp_ns)?;
        min_next_ts = next.timestamp_ns + 1;
        chain.push(next.clone());
    }

    if !chain.iter().any(|e| e.event_id == triggering.event_id) {
        return None;
    }

    if let Some(max_delta) = rule.max_delta_ns {
        let first_ts = chain.first()?.timestamp_ns;
        let last_ts = chain.last()?.timestamp_ns;
        if last_ts - first_ts > max_delta {
            return None;
        }
    }

    Some(chain)
}

fn build_incident(rule: &RuleDefinition, entity_id: &str, chain: &[CorrelationEvent]) -> Incident {
    Incident {
        id: Uuid::new_v4(),
        rule_name: rule.name.clone(),
        severity: rule.severity,
        entity_id: entity_id.to_string(),
        summary: format!("rule {} matched for entity {}", rule.name, entity_id),
        mitre_tactics: rule.mitre_tactics.clone(),
        mitre_techniques: rule.mitre_techniques.clone(),
        contributing_events: chain.iter().map(|e| e.event_id.clone()).collect(),
        opened_at_ns: chain.last().expect("rule has at least one clause").timestamp_ns,
        closed_at_ns: None,
    }
}

/// Tracks which incident keys have already been emitted, so overlapping
/// re-evaluations of the same chain are suppressed (§4.J "Deduplication of
/// incidents"). Unbounded for the engine's lifetime is acceptable here: keys
/// are small strings and bounded by distinct `(rule, entity, event-tuple)`
/// combinations actually observed, not by window size.
pub struct IncidentDeduplicator {
    seen: Mutex<HashSet<IncidentKey>>,
}

impl IncidentDeduplicator {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// True if `key` has already been durably recorded via [`mark_seen`].
    ///
    /// [`mark_seen`]: IncidentDeduplicator::mark_seen
    pub fn contains(&self, key: &IncidentKey) -> bool {
        self.seen.lock().contains(key)
    }

    /// Record `key` as emitted. Callers must only call this once the
    /// incident (and any risk contribution derived from it) has been
    /// durably persisted — marking it seen before that point would suppress
    /// the incident on a retry after a persistence failure, losing it
    /// permanently.
    pub fn mark_seen(&self, key: IncidentKey) {
        self.seen.lock().insert(key);
    }
}

impl Default for IncidentDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate every rule the just-inserted `event` could plausibly satisfy
/// (§4.J "when an event is inserted, the engine looks up candidate rules via
/// predicate indexes"). `event` must already be present in `window`. A
/// panicking rule is isolated: its effect is dropped and the panic logged,
/// evaluation of other candidate rules continues (§4.J "Failure semantics").
///
/// Returns each fired incident alongside its dedup key, but does *not* mark
/// the key seen — a chain that matches a key already marked seen is
/// suppressed here, but the caller is responsible for calling
/// [`IncidentDeduplicator::mark_seen`] once the incident has been durably
/// persisted (§4.J "a persistence failure on incident write is retried").
/// Marking it seen any earlier would suppress the incident permanently on a
/// retry after a persistence failure.
pub fn evaluate_insert(
    event: &CorrelationEvent,
    window: &CorrelationWindow,
    rule_set: &RuleSet,
    dedup: &IncidentDeduplicator,
) -> Vec<(IncidentKey, Incident)> {
    let mut incidents = Vec::new();
    let mut seen_rules = BTreeSet::new();

    for (rule, _clause_idx) in rule_set.candidates(event) {
        if !seen_rules.insert(rule.name.clone()) {
            continue;
        }
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            try_fire_rule(rule, event, window)
        }));
        let chain = match outcome {
            Ok(chain) => chain,
            Err(_) => {
                tracing::error!(rule_name = %rule.name, "rule evaluation panicked; isolating and continuing");
                continue;
            }
        };
        let Some(chain) = chain else { continue };

        let key = incident_key(&rule.name, &event.entity_id, &chain);
        if dedup.contains(&key) {
            continue;
        }
        incidents.push((key, build_incident(rule, &event.entity_id, &chain)));
    }

    incidents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::registry::RuleSet;
    use crate::window::{CorrelationWindow, WindowConfig};
    use std::collections::BTreeMap;
    use telemetry_types::EventType;

    const PERSISTENCE_RULE: &str = r#"
[[rule]]
name = "persistence_after_auth"
severity = "CRITICAL"
risk_weight = 65.0
mitre_tactics = ["TA0003"]
mitre_techniques = ["T1543.001"]
max_candidates = 500

[[rule.clauses]]
event_type = "Security"
tag = "sudo"

[[rule.clauses]]
event_type = "Audit"
structured_field = "object_type"
structured_field_equals = "LAUNCH_AGENT"

[rule.temporal]
max_delta_ns = 300000000000
"#;

    fn sudo_event(id: &str, ts: i64) -> CorrelationEvent {
        CorrelationEvent {
            event_id: id.to_string(),
            entity_id: "a1".to_string(),
            event_type: EventType::Security,
            severity: Severity::High,
            timestamp_ns: ts,
            tags: ["sudo".to_string()].into_iter().collect(),
            structured_fields: BTreeMap::new(),
        }
    }

    fn launch_agent_event(id: &str, ts: i64) -> CorrelationEvent {
        let mut fields = BTreeMap::new();
        fields.insert(
            "object_type".to_string(),
            crate::model::FieldValue::Str("LAUNCH_AGENT".to_string()),
        );
        CorrelationEvent {
            event_id: id.to_string(),
            entity_id: "a1".to_string(),
            event_type: EventType::Audit,
            severity: Severity::Medium,
            timestamp_ns: ts,
            tags: Default::default(),
            structured_fields: fields,
        }
    }

    #[test]
    fn fires_incident_when_both_clauses_satisfied_within_delta() {
        let rule_set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let window = CorrelationWindow::new(WindowConfig {
            horizon_ns: 300_000_000_000,
            max_events: 1000,
        });
        let dedup = IncidentDeduplicator::new();

        let sudo = sudo_event("e1", 0);
        window.insert(sudo.clone(), 0, 10);
        let incidents = evaluate_insert(&sudo, &window, &rule_set, &dedup);
        assert!(incidents.is_empty());

        let launch = launch_agent_event("e2", 90_000_000_000);
        window.insert(launch.clone(), 90_000_000_000, 10);
        let incidents = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert_eq!(incidents.len(), 1);
        let (_, incident) = &incidents[0];
        assert_eq!(incident.rule_name, "persistence_after_auth");
        assert_eq!(incident.contributing_events, vec!["e1", "e2"]);
        assert_eq!(incident.severity, Severity::Critical);
        assert!(incident.mitre_techniques.contains("T1543.001"));
    }

    #[test]
    fn no_incident_when_delta_exceeded() {
        let rule_set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let window = CorrelationWindow::new(WindowConfig {
            horizon_ns: 1_000_000_000_000,
            max_events: 1000,
        });
        let dedup = IncidentDeduplicator::new();

        let sudo = sudo_event("e1", 0);
        window.insert(sudo, 0, 10);
        let launch = launch_agent_event("e2", 400_000_000_000);
        window.insert(launch.clone(), 400_000_000_000, 10);
        let incidents = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert!(incidents.is_empty());
    }

    #[test]
    fn duplicate_chain_suppressed_only_after_marked_seen() {
        let rule_set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let window = CorrelationWindow::new(WindowConfig {
            horizon_ns: 300_000_000_000,
            max_events: 1000,
        });
        let dedup = IncidentDeduplicator::new();

        let sudo = sudo_event("e1", 0);
        window.insert(sudo, 0, 10);
        let launch = launch_agent_event("e2", 90_000_000_000);
        window.insert(launch.clone(), 90_000_000_000, 10);

        let first = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert_eq!(first.len(), 1);

        // Re-evaluating before the caller marks the key seen (simulating a
        // persistence failure and retry) must reproduce the same incident,
        // not suppress it.
        let retry = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert_eq!(retry.len(), 1);

        let (key, _) = first.into_iter().next().unwrap();
        dedup.mark_seen(key);
        let third = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert!(third.is_empty());
    }

    #[test]
    fn no_match_without_a_prior_sudo_event() {
        let rule_set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let window = CorrelationWindow::new(WindowConfig {
            horizon_ns: 300_000_000_000,
            max_events: 1000,
        });
        let dedup = IncidentDeduplicator::new();

        let launch = launch_agent_event("e2", 0);
        window.insert(launch.clone(), 0, 10);
        let incidents = evaluate_insert(&launch, &window, &rule_set, &dedup);
        assert!(incidents.is_empty());
    }
}
