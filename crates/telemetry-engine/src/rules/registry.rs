//! Declarative rule registry (§4.L), loaded from TOML and hot-reloadable.
//!
//! Reload follows the same atomic-pointer-swap design as
//! `telemetry_crypto::TrustMap` (§9 "Trust map reload"): the compiled rule
//! set is an immutable snapshot; reload swaps the whole snapshot rather than
//! mutating a rule in place, so rule evaluation in flight always sees an
//! internally-consistent set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use telemetry_types::{EventType, Severity};

use crate::error::{EngineError, Result};

fn default_max_candidates() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
struct EventPredicateFile {
    event_type: Option<String>,
    severity_at_least: Option<String>,
    tag: Option<String>,
    structured_field: Option<String>,
    structured_field_equals: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TemporalFile {
    max_delta_ns: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    name: String,
    severity: String,
    risk_weight: f64,
    #[serde(default)]
    mitre_tactics: BTreeSet<String>,
    mitre_techniques: BTreeSet<String>,
    clauses: Vec<EventPredicateFile>,
    temporal: Option<TemporalFile>,
    #[serde(default = "default_max_candidates")]
    max_candidates: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleRegistryFile {
    #[serde(default)]
    rule: Vec<RuleFile>,
}

/// One predicate clause within a rule (§4.J "a conjunction/disjunction of
/// event filters"). All `Some` fields of a clause are ANDed; a rule's
/// `clauses` are evaluated as an ordered temporal sequence, not a
/// disjunction, mirroring the worked example in §8 scenario 7.
#[derive(Debug, Clone)]
pub struct EventPredicate {
    pub event_type: Option<EventType>,
    pub severity_at_least: Option<Severity>,
    pub tag: Option<String>,
    pub structured_field: Option<String>,
    pub structured_field_equals: Option<String>,
}

impl EventPredicate {
    pub fn matches(&self, event: &crate::model::CorrelationEvent) -> bool {
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if let Some(min) = self.severity_at_least {
            if event.severity.rank() < min.rank() {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !event.tags.contains(tag) {
                return false;
            }
        }
        if let Some(field) = &self.structured_field {
            match event.structured_fields.get(field) {
                Some(value) => {
                    if let Some(expected) = &self.structured_field_equals {
                        if value.as_str() != Some(expected.as_str()) {
                            return false;
                        }
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// A clause indexable for candidate lookup (§4.J "looks up candidate
    /// rules via predicate indexes, no full-table scan"). A clause that
    /// constrains neither `event_type` nor `tag` would force a scan of every
    /// event type and is rejected at load time instead.
    fn index_key(&self) -> Option<IndexKey> {
        if let Some(t) = self.event_type {
            Some(IndexKey::EventType(t))
        } else {
            self.tag.clone().map(IndexKey::Tag)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    EventType(EventType),
    Tag(String),
}

/// One correlation rule: predicates + temporal ordering + grouping +
/// outcome metadata (§4.J "Rule contract").
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub name: String,
    pub severity: Severity,
    pub risk_weight: f64,
    pub mitre_tactics: BTreeSet<String>,
    pub mitre_techniques: BTreeSet<String>,
    pub clauses: Vec<EventPredicate>,
    /// Maximum nanoseconds between the first and last clause's matching
    /// event (§4.J "max-delta between clauses"). `None` for single-clause
    /// rules, which have no temporal ordering to satisfy.
    pub max_delta_ns: Option<i64>,
    /// Upper bound on how many prior candidate events a single evaluation
    /// may examine; enforced at evaluation time, validated non-zero at load
    /// time (§4.J "rules with broad predicates... rejected at load time").
    pub max_candidates: usize,
}

fn parse_event_type(s: &str) -> Option<EventType> {
    match s {
        "Metric" => Some(EventType::Metric),
        "Event" => Some(EventType::Event),
        "Alert" => Some(EventType::Alert),
        "Audit" => Some(EventType::Audit),
        "Security" => Some(EventType::Security),
        _ => None,
    }
}

fn parse_severity(s: &str) -> Option<Severity> {
    match s {
        "INFO" => Some(Severity::Info),
        "LOW" => Some(Severity::Low),
        "MEDIUM" => Some(Severity::Medium),
        "HIGH" => Some(Severity::High),
        "CRITICAL" => Some(Severity::Critical),
        _ => None,
    }
}

fn compile_rule(file: RuleFile) -> Result<RuleDefinition> {
    let severity = parse_severity(&file.severity).ok_or_else(|| EngineError::RuleInvalid {
        name: file.name.clone(),
        reason: format!("unknown severity {:?}", file.severity),
    })?;
    if !(0.0..=100.0).contains(&file.risk_weight) {
        return Err(EngineError::RuleInvalid {
            name: file.name.clone(),
            reason: format!("risk_weight {} out of range [0,100]", file.risk_weight),
        });
    }
    if file.mitre_techniques.is_empty() {
        return Err(EngineError::RuleInvalid {
            name: file.name.clone(),
            reason: "missing MITRE technique mapping".to_string(),
        });
    }
    if file.clauses.is_empty() {
        return Err(EngineError::RuleInvalid {
            name: file.name.clone(),
            reason: "a rule must declare at least one clause".to_string(),
        });
    }
    if file.max_candidates == 0 {
        return Err(EngineError::RuleInvalid {
            name: file.name.clone(),
            reason: "max_candidates must be > 0".to_string(),
        });
    }

    let mut clauses = Vec::with_capacity(file.clauses.len());
    for clause in &file.clauses {
        let event_type = clause
            .event_type
            .as_deref()
            .map(|s| {
                parse_event_type(s).ok_or_else(|| EngineError::RuleInvalid {
                    name: file.name.clone(),
                    reason: format!("unknown event_type {s:?}"),
                })
            })
            .transpose()?;
        let severity_at_least = clause
            .severity_at_least
            .as_deref()
            .map(|s| {
                parse_severity(s).ok_or_else(|| EngineError::RuleInvalid {
                    name: file.name.clone(),
                    reason: format!("unknown severity_at_least {s:?}"),
                })
            })
            .transpose()?;
        let predicate = EventPredicate {
            event_type,
            severity_at_least,
            tag: clause.tag.clone(),
            structured_field: clause.structured_field.clone(),
            structured_field_equals: clause.structured_field_equals.clone(),
        };
        if predicate.index_key().is_none() {
            return Err(EngineError::RuleInvalid {
                name: file.name.clone(),
                reason: "every clause must constrain event_type or tag to be indexable".to_string(),
            });
        }
        clauses.push(predicate);
    }

    let max_delta_ns = if clauses.len() > 1 {
        let temporal = file.temporal.ok_or_else(|| EngineError::RuleInvalid {
            name: file.name.clone(),
            reason: "multi-clause rules must declare a temporal constraint".to_string(),
        })?;
        if temporal.max_delta_ns <= 0 {
            return Err(EngineError::RuleInvalid {
                name: file.name.clone(),
                reason: "temporal.max_delta_ns must be > 0".to_string(),
            });
        }
        Some(temporal.max_delta_ns)
    } else {
        None
    };

    Ok(RuleDefinition {
        name: file.name,
        severity,
        risk_weight: file.risk_weight,
        mitre_tactics: file.mitre_tactics,
        mitre_techniques: file.mitre_techniques,
        clauses,
        max_delta_ns,
        max_candidates: file.max_candidates,
    })
}

/// Immutable, validated compilation of a rule file, with the predicate
/// index built once at load time.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RuleDefinition>,
    /// rule index -> which clause index within it -> the index key, flattened
    /// so lookups by event are O(candidates) not O(rules).
    index: std::collections::HashMap<IndexKey, Vec<(usize, usize)>>,
}

impl RuleSet {
    pub fn parse(toml_source: &str) -> Result<Self> {
        let file: RuleRegistryFile =
            toml::from_str(toml_source).map_err(|e| EngineError::RuleLoad(e.to_string()))?;
        let mut rules = Vec::with_capacity(file.rule.len());
        let mut seen_names = BTreeSet::new();
        for rule_file in file.rule {
            if !seen_names.insert(rule_file.name.clone()) {
                return Err(EngineError::RuleInvalid {
                    name: rule_file.name,
                    reason: "duplicate rule name".to_string(),
                });
            }
            rules.push(compile_rule(rule_file)?);
        }

        let mut index: std::collections::HashMap<IndexKey, Vec<(usize, usize)>> =
            std::collections::HashMap::new();
        for (rule_idx, rule) in rules.iter().enumerate() {
            for (clause_idx, clause) in rule.clauses.iter().enumerate() {
                if let Some(key) = clause.index_key() {
                    index.entry(key).or_default().push((rule_idx, clause_idx));
                }
            }
        }

        Ok(Self { rules, index })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::RuleLoad(format!("{}: {}", path.display(), e)))?;
        Self::parse(&source)
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Candidate `(rule, clause_index)` pairs whose clause could match
    /// `event`, found via predicate index rather than scanning every rule
    /// (§4.J "looks up candidate rules via predicate indexes").
    pub fn candidates(&self, event: &crate::model::CorrelationEvent) -> Vec<(&RuleDefinition, usize)> {
        let mut keys = vec![IndexKey::EventType(event.event_type)];
        keys.extend(event.tags.iter().cloned().map(IndexKey::Tag));

        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for key in keys {
            let Some(entries) = self.index.get(&key) else {
                continue;
            };
            for &(rule_idx, clause_idx) in entries {
                let rule = &self.rules[rule_idx];
                if rule.clauses[clause_idx].matches(event) && seen.insert((rule_idx, clause_idx)) {
                    out.push((rule, clause_idx));
                }
            }
        }
        out
    }
}

/// Reloadable handle to the current rule set; mirrors `TrustMap`'s
/// atomic-pointer-swap reload (§2 "Rule registry hot-reload").
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
    source_path: PathBuf,
    last_reload_mtime: RwLock<Option<std::time::SystemTime>>,
    reload_count: AtomicUsize,
}

impl RuleRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let rule_set = RuleSet::load(path)?;
        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        Ok(Self {
            current: RwLock::new(Arc::new(rule_set)),
            source_path: path.to_path_buf(),
            last_reload_mtime: RwLock::new(mtime),
            reload_count: AtomicUsize::new(0),
        })
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Reload if the file's mtime advanced since the last load; a no-op
    /// otherwise. Intended to be called on a poll timer
    /// (`engine.rule_reload_poll_ms`) from the engine binary.
    pub fn poll_reload(&self) -> Result<bool> {
        let metadata = std::fs::metadata(&self.source_path)
            .map_err(|e| EngineError::RuleLoad(format!("{}: {}", self.source_path.display(), e)))?;
        let mtime = metadata.modified().ok();
        if mtime == *self.last_reload_mtime.read() {
            return Ok(false);
        }
        let rule_set = RuleSet::load(&self.source_path)?;
        *self.current.write() = Arc::new(rule_set);
        *self.last_reload_mtime.write() = mtime;
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn reload_count(&self) -> usize {
        self.reload_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrelationEvent, FieldValue};
    use std::collections::BTreeMap;

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

    fn security_event(id: &str, ts: i64) -> CorrelationEvent {
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

    #[test]
    fn parses_valid_rule_with_temporal_constraint() {
        let set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        assert_eq!(set.rule_names(), vec!["persistence_after_auth"]);
        assert_eq!(set.rules()[0].max_delta_ns, Some(300_000_000_000));
    }

    #[test]
    fn rejects_duplicate_rule_names() {
        let toml = format!("{PERSISTENCE_RULE}{PERSISTENCE_RULE}");
        let err = RuleSet::parse(&toml).unwrap_err();
        assert!(matches!(err, EngineError::RuleInvalid { .. }));
    }

    #[test]
    fn rejects_rule_with_no_mitre_technique() {
        let toml = r#"
[[rule]]
name = "bad"
severity = "HIGH"
risk_weight = 10.0
mitre_techniques = []

[[rule.clauses]]
event_type = "Security"
"#;
        let err = RuleSet::parse(toml).unwrap_err();
        assert!(matches!(err, EngineError::RuleInvalid { .. }));
    }

    #[test]
    fn rejects_unindexable_clause() {
        let toml = r#"
[[rule]]
name = "bad"
severity = "HIGH"
risk_weight = 10.0
mitre_techniques = ["T1000"]

[[rule.clauses]]
severity_at_least = "LOW"
"#;
        let err = RuleSet::parse(toml).unwrap_err();
        assert!(matches!(err, EngineError::RuleInvalid { .. }));
    }

    #[test]
    fn rejects_weight_out_of_range() {
        let toml = r#"
[[rule]]
name = "bad"
severity = "HIGH"
risk_weight = 150.0
mitre_techniques = ["T1000"]

[[rule.clauses]]
event_type = "Security"
"#;
        let err = RuleSet::parse(toml).unwrap_err();
        assert!(matches!(err, EngineError::RuleInvalid { .. }));
    }

    #[test]
    fn candidates_found_via_event_type_and_tag_index() {
        let set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let event = security_event("e1", 0);
        let candidates = set.candidates(&event);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name, "persistence_after_auth");
        assert_eq!(candidates[0].1, 0);
    }

    #[test]
    fn candidates_empty_for_non_matching_event_type() {
        let set = RuleSet::parse(PERSISTENCE_RULE).unwrap();
        let event = CorrelationEvent {
            event_id: "e1".to_string(),
            entity_id: "a1".to_string(),
            event_type: EventType::Metric,
            severity: Severity::Info,
            timestamp_ns: 0,
            tags: Default::default(),
            structured_fields: BTreeMap::new(),
        };
        assert!(set.candidates(&event).is_empty());
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, PERSISTENCE_RULE).unwrap();
        let registry = RuleRegistry::load(&path).unwrap();
        assert_eq!(registry.current().rules().len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, "").unwrap();
        let reloaded = registry.poll_reload().unwrap();
        assert!(reloaded);
        assert_eq!(registry.current().rules().len(), 0);
        assert_eq!(registry.reload_count(), 1);
    }

    #[test]
    fn field_value_as_str_used_by_structured_field_equals() {
        let v = FieldValue::Str("LAUNCH_AGENT".to_string());
        assert_eq!(v.as_str(), Some("LAUNCH_AGENT"));
    }
}
