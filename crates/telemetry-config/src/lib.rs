//! Shared configuration loading for the three telemetry-fabric binaries
//! (§6 "Configuration"). Each binary loads a TOML file into one of the
//! structs below; unknown keys are rejected by serde's default (strict)
//! behavior so a typo'd key fails loudly at startup rather than being
//! silently ignored.

mod error;
mod masking;

pub use error::{ConfigError, Result};
pub use masking::mask_path;

use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_max_envelope_bytes() -> usize {
    131_072
}
fn default_dedup_window_seconds() -> u64 {
    300
}
fn default_window_seconds() -> u64 {
    300
}
fn default_decay_start_seconds() -> u64 {
    60
}
fn default_decay_full_seconds() -> u64 {
    3600
}
fn default_retry_min_ms() -> u64 {
    100
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_circuit_threshold() -> u32 {
    10
}
fn default_max_batch() -> usize {
    64
}
fn default_shed_cutoff() -> String {
    "LOW".to_string()
}
fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::DropNew
}
fn default_rule_reload_poll_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropNew,
    DropLowSeverity,
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    pub soft_inflight: usize,
    pub hard_inflight: usize,
    #[serde(default = "default_shed_cutoff")]
    pub shed_severity_cutoff: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub listen_addr: String,
    pub trust_map_path: PathBuf,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,
    pub governor: GovernorConfig,
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".into()));
        }
        if self.governor.soft_inflight >= self.governor.hard_inflight {
            return Err(ConfigError::Invalid(
                "governor.soft_inflight must be less than governor.hard_inflight".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSourceConfig {
    pub name: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
            circuit_threshold: default_circuit_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub device_id: String,
    pub broker_addr: String,
    pub signing_key_path: PathBuf,
    pub wal_path: PathBuf,
    pub wal_max_bytes: u64,
    #[serde(default = "default_overflow_policy")]
    pub wal_overflow_policy: OverflowPolicy,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub sources: Vec<SchedulerSourceConfig>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".into()));
        }
        if self.wal_max_bytes == 0 {
            return Err(ConfigError::Invalid("wal_max_bytes must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    #[serde(default = "default_decay_start_seconds")]
    pub start_seconds: u64,
    #[serde(default = "default_decay_full_seconds")]
    pub full_seconds: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            start_seconds: default_decay_start_seconds(),
            full_seconds: default_decay_full_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub broker_addr: String,
    pub cursor_path: PathBuf,
    pub rules_path: PathBuf,
    pub incident_db_path: PathBuf,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    pub max_events_in_window: usize,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default = "default_rule_reload_poll_ms")]
    pub rule_reload_poll_ms: u64,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_events_in_window == 0 {
            return Err(ConfigError::Invalid(
                "max_events_in_window must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
    toml::from_str(&source)
        .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn broker_config_loads_with_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
listen_addr = "0.0.0.0:9443"
trust_map_path = "/etc/telemetry/trust.toml"
tls_cert_path = "/etc/telemetry/broker.crt"
tls_key_path = "/etc/telemetry/broker.key"
ca_cert_path = "/etc/telemetry/ca.crt"
log_dir = "/var/lib/telemetry/log"

[governor]
soft_inflight = 100
hard_inflight = 500
"#
        )
        .unwrap();
        let cfg = BrokerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.max_envelope_bytes, 131_072);
        assert_eq!(cfg.dedup_window_seconds, 300);
        assert_eq!(cfg.governor.shed_severity_cutoff, "LOW");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = BrokerConfig::load(Path::new("/nonexistent/path.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_, _)));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not valid toml [[[").unwrap();
        let err = BrokerConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_, _)));
    }

    #[test]
    fn governor_soft_must_be_less_than_hard() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
listen_addr = "0.0.0.0:9443"
trust_map_path = "/etc/telemetry/trust.toml"
tls_cert_path = "/etc/telemetry/broker.crt"
tls_key_path = "/etc/telemetry/broker.key"
ca_cert_path = "/etc/telemetry/ca.crt"
log_dir = "/var/lib/telemetry/log"

[governor]
soft_inflight = 500
hard_inflight = 100
"#
        )
        .unwrap();
        let err = BrokerConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn agent_config_rejects_empty_device_id() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
device_id = ""
broker_addr = "127.0.0.1:9443"
signing_key_path = "/etc/telemetry/agent.key"
wal_path = "/var/lib/telemetry/wal"
wal_max_bytes = 1048576
"#
        )
        .unwrap();
        let err = AgentConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
