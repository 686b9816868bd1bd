//! Per-entity risk score with decay (§4.K "Risk Store").

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const MAX_CONTRIBUTIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Benign,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: f64) -> Self {
        match score {
            s if s <= 20.0 => RiskLevel::Benign,
            s if s <= 40.0 => RiskLevel::Low,
            s if s <= 60.0 => RiskLevel::Medium,
            s if s <= 80.0 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// One rule firing's effect on an entity's score (§3 "EntityRisk").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub rule_name: String,
    pub weight: f64,
    pub at_ns: i64,
}

fn decayed_weight(contribution: &Contribution, now_ns: i64, start_ns: i64, full_ns: i64) -> f64 {
    let age_ns = now_ns - contribution.at_ns;
    if age_ns <= start_ns {
        contribution.weight
    } else if age_ns >= full_ns {
        0.0
    } else {
        let span = (full_ns - start_ns) as f64;
        let decayed_fraction = (age_ns - start_ns) as f64 / span;
        contribution.weight * (1.0 - decayed_fraction)
    }
}

/// Snapshot of an entity's risk, recomputed from its contribution list at
/// read time (§4.K "the persisted truth is the contribution list").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRisk {
    pub entity_id: String,
    pub score: f64,
    pub level: RiskLevel,
    pub confidence: f64,
    pub contributions: Vec<Contribution>,
    pub last_updated_ns: i64,
}

fn confidence(distinct_rules: usize) -> f64 {
    const K: f64 = 0.5;
    1.0 - (-K * distinct_rules as f64).exp()
}

struct EntityState {
    contributions: Vec<Contribution>,
    last_updated_ns: i64,
}

/// Decay parameters (§6 `engine.decay.start_seconds` / `full_seconds`).
#[derive(Debug, Clone, Copy)]
pub struct DecayParams {
    pub start_ns: i64,
    pub full_ns: i64,
}

/// Per-entity contribution ledger plus decay-aware read path. Contributions
/// are appended, never rewritten; the score is always recomputed, not
/// cached, so decay never needs an explicit maintenance tick to stay correct
/// (though `decay_tick` below exists for eagerly dropping fully-decayed
/// entities).
pub struct RiskStore {
    entities: RwLock<HashMap<String, EntityState>>,
    decay: DecayParams,
}

impl RiskStore {
    pub fn new(decay: DecayParams) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            decay,
        }
    }

    /// Apply a rule's contribution to an entity's score (§4.J step 2).
    pub fn contribute(&self, entity_id: &str, rule_name: &str, weight: f64, at_ns: i64) {
        let mut entities = self.entities.write();
        let state = entities.entry(entity_id.to_string()).or_insert_with(|| EntityState {
            contributions: Vec::new(),
            last_updated_ns: at_ns,
        });
        state.contributions.push(Contribution {
            rule_name: rule_name.to_string(),
            weight,
            at_ns,
        });
        if state.contributions.len() > MAX_CONTRIBUTIONS {
            let drop = state.contributions.len() - MAX_CONTRIBUTIONS;
            state.contributions.drain(0..drop);
        }
        state.last_updated_ns = state.last_updated_ns.max(at_ns);
    }

    /// Current decayed score and level for `entity_id` as of `now_ns`.
    pub fn get(&self, entity_id: &str, now_ns: i64) -> Option<EntityRisk> {
        let entities = self.entities.read();
        let state = entities.get(entity_id)?;
        Some(self.snapshot(entity_id, state, now_ns))
    }

    fn snapshot(&self, entity_id: &str, state: &EntityState, now_ns: i64) -> EntityRisk {
        let mut score = 0.0;
        let mut distinct_rules = std::collections::BTreeSet::new();
        for c in &state.contributions {
            let decayed = decayed_weight(c, now_ns, self.decay.start_ns, self.decay.full_ns);
            if decayed > 0.0 {
                score += decayed;
                distinct_rules.insert(c.rule_name.clone());
            }
        }
        score = score.clamp(0.0, 100.0);
        EntityRisk {
            entity_id: entity_id.to_string(),
            score,
            level: RiskLevel::from_score(score),
            confidence: confidence(distinct_rules.len()),
            contributions: state.contributions.clone(),
            last_updated_ns: state.last_updated_ns,
        }
    }

    /// Drop entities whose score has fully decayed as of `now_ns`, keeping
    /// the map bounded to entities with live contributions (§3 "removed when
    /// score decays below a configured floor for the retention period").
    pub fn decay_tick(&self, now_ns: i64) {
        let mut entities = self.entities.write();
        entities.retain(|_, state| {
            state
                .contributions
                .iter()
                .any(|c| decayed_weight(c, now_ns, self.decay.start_ns, self.decay.full_ns) > 0.0)
        });
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }
}
