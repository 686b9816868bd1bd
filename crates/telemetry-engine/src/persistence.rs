//! Incident and entity-risk persistence (§4.K "Persistence", §6 "Incident
//! store"). Grounded on `openibank-db::repos::audit`'s `query_as`/`bind`
//! shape, adapted from Postgres to the single-writer SQLite store this
//! workspace uses for the engine (§1.5 "a small single-writer database is
//! sufficient").

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use telemetry_types::Severity;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::risk::{Contribution, EntityRisk, RiskLevel};
use crate::rules::eval::Incident;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS incidents (
    id TEXT PRIMARY KEY,
    rule_name TEXT NOT NULL,
    severity TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    mitre_tactics TEXT NOT NULL,
    mitre_techniques TEXT NOT NULL,
    contributing_events TEXT NOT NULL,
    opened_at_ns INTEGER NOT NULL,
    closed_at_ns INTEGER
);

CREATE TABLE IF NOT EXISTS entity_risk (
    entity_id TEXT PRIMARY KEY,
    score REAL NOT NULL,
    level TEXT NOT NULL,
    confidence REAL NOT NULL,
    last_updated_ns INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contributions (
    entity_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    weight REAL NOT NULL,
    at_ns INTEGER NOT NULL
);
"#;

fn severity_str(s: Severity) -> &'static str {
    s.as_str()
}

fn parse_severity(s: &str) -> Result<Severity> {
    match s {
        "INFO" => Ok(Severity::Info),
        "LOW" => Ok(Severity::Low),
        "MEDIUM" => Ok(Severity::Medium),
        "HIGH" => Ok(Severity::High),
        "CRITICAL" => Ok(Severity::Critical),
        other => Err(EngineError::Persistence(format!("unknown severity {other:?}"))),
    }
}

fn level_str(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Benign => "BENIGN",
        RiskLevel::Low => "LOW",
        RiskLevel::Medium => "MEDIUM",
        RiskLevel::High => "HIGH",
        RiskLevel::Critical => "CRITICAL",
    }
}

fn parse_level(s: &str) -> Result<RiskLevel> {
    match s {
        "BENIGN" => Ok(RiskLevel::Benign),
        "LOW" => Ok(RiskLevel::Low),
        "MEDIUM" => Ok(RiskLevel::Medium),
        "HIGH" => Ok(RiskLevel::High),
        "CRITICAL" => Ok(RiskLevel::Critical),
        other => Err(EngineError::Persistence(format!("unknown risk level {other:?}"))),
    }
}

fn incident_from_row(row: &SqliteRow) -> Result<Incident> {
    let id_str: String = row.try_get("id").map_err(|e| EngineError::Persistence(e.to_string()))?;
    let tactics: String = row
        .try_get("mitre_tactics")
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    let techniques: String = row
        .try_get("mitre_techniques")
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    let events: String = row
        .try_get("contributing_events")
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
    let severity: String = row
        .try_get("severity")
        .map_err(|e| EngineError::Persistence(e.to_string()))?;

    Ok(Incident {
        id: Uuid::from_str(&id_str).map_err(|e| EngineError::Persistence(e.to_string()))?,
        rule_name: row.try_get("rule_name").map_err(|e| EngineError::Persistence(e.to_string()))?,
        severity: parse_severity(&severity)?,
        entity_id: row.try_get("entity_id").map_err(|e| EngineError::Persistence(e.to_string()))?,
        summary: row.try_get("summary").map_err(|e| EngineError::Persistence(e.to_string()))?,
        mitre_tactics: serde_json::from_str::<BTreeSet<String>>(&tactics)
            .map_err(|e| EngineError::Persistence(e.to_string()))?,
        mitre_techniques: serde_json::from_str::<BTreeSet<String>>(&techniques)
            .map_err(|e| EngineError::Persistence(e.to_string()))?,
        contributing_events: serde_json::from_str::<Vec<String>>(&events)
            .map_err(|e| EngineError::Persistence(e.to_string()))?,
        opened_at_ns: row.try_get("opened_at_ns").map_err(|e| EngineError::Persistence(e.to_string()))?,
        closed_at_ns: row.try_get("closed_at_ns").map_err(|e| EngineError::Persistence(e.to_string()))?,
    })
}

/// Single-writer SQLite store for incidents and entity risk (§4.K
/// "Persistence"). The score itself is recomputable from `contributions`;
/// `entity_risk` caches the last-computed snapshot for cheap reads.
pub struct PersistenceStore {
    pool: SqlitePool,
}

impl PersistenceStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Insert an incident (§3 "opened when rule fires; immutable thereafter
    /// except for `closed_at_ns`"). The unique `id` primary key rejects a
    /// double-insert of the same incident.
    pub async fn insert_incident(&self, incident: &Incident) -> Result<()> {
        sqlx::query(
            "INSERT INTO incidents (id, rule_name, severity, entity_id, summary, mitre_tactics, mitre_techniques, contributing_events, opened_at_ns, closed_at_ns) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(incident.id.to_string())
        .bind(&incident.rule_name)
        .bind(severity_str(incident.severity))
        .bind(&incident.entity_id)
        .bind(&incident.summary)
        .bind(serde_json::to_string(&incident.mitre_tactics).unwrap())
        .bind(serde_json::to_string(&incident.mitre_techniques).unwrap())
        .bind(serde_json::to_string(&incident.contributing_events).unwrap())
        .bind(incident.opened_at_ns)
        .bind(incident.closed_at_ns)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn list_incidents(&self, limit: i64) -> Result<Vec<Incident>> {
        let rows = sqlx::query("SELECT * FROM incidents ORDER BY opened_at_ns DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        rows.iter().map(incident_from_row).collect()
    }

    /// Replace the persisted snapshot and append contributions for
    /// `entity_id` (§4.K "incidents and entity-risk snapshots are written to
    /// a transactional store").
    pub async fn upsert_entity_risk(&self, risk: &EntityRisk, new_contributions: &[Contribution]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| EngineError::Persistence(e.to_string()))?;

        sqlx::query(
            "INSERT INTO entity_risk (entity_id, score, level, confidence, last_updated_ns) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(entity_id) DO UPDATE SET score = excluded.score, level = excluded.level, confidence = excluded.confidence, last_updated_ns = excluded.last_updated_ns",
        )
        .bind(&risk.entity_id)
        .bind(risk.score)
        .bind(level_str(risk.level))
        .bind(risk.confidence)
        .bind(risk.last_updated_ns)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::Persistence(e.to_string()))?;

        for contribution in new_contributions {
            sqlx::query("INSERT INTO contributions (entity_id, rule_name, weight, at_ns) VALUES (?, ?, ?, ?)")
                .bind(&risk.entity_id)
                .bind(&contribution.rule_name)
                .bind(contribution.weight)
                .bind(contribution.at_ns)
                .execute(&mut *tx)
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Read back the persisted snapshot plus its full contribution history
    /// (used by recovery/inspection tooling — the in-memory `RiskStore` is
    /// the source of truth while the process is running).
    pub async fn get_entity_risk(&self, entity_id: &str) -> Result<Option<EntityRisk>> {
        let row = sqlx::query("SELECT score, level, confidence, last_updated_ns FROM entity_risk WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let score: f64 = row.try_get("score").map_err(|e| EngineError::Persistence(e.to_string()))?;
        let level: String = row.try_get("level").map_err(|e| EngineError::Persistence(e.to_string()))?;
        let confidence: f64 = row.try_get("confidence").map_err(|e| EngineError::Persistence(e.to_string()))?;
        let last_updated_ns: i64 = row
            .try_get("last_updated_ns")
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        let contribution_rows = sqlx::query("SELECT rule_name, weight, at_ns FROM contributions WHERE entity_id = ? ORDER BY at_ns ASC")
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let mut contributions = Vec::with_capacity(contribution_rows.len());
        for row in &contribution_rows {
            contributions.push(Contribution {
                rule_name: row.try_get("rule_name").map_err(|e| EngineError::Persistence(e.to_string()))?,
                weight: row.try_get("weight").map_err(|e| EngineError::Persistence(e.to_string()))?,
                at_ns: row.try_get("at_ns").map_err(|e| EngineError::Persistence(e.to_string()))?,
            });
        }

        Ok(Some(EntityRisk {
            entity_id: entity_id.to_string(),
            score,
            level: parse_level(&level)?,
            confidence,
            contributions,
            last_updated_ns,
        }))
    }
}
