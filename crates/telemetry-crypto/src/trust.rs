//! Trust map: identity CN -> verification public key (§3 "Trust Map", §6
//! "Trust map file").
//!
//! Loaded at broker startup, reloadable. Per the "Trust map reload" design
//! note, reload swaps an entire immutable map behind an atomic pointer — it
//! never mutates an entry in place, so an in-flight verifier always sees a
//! internally-consistent snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{CryptoError, Result};

/// One trust-map entry as read from the trust map file.
#[derive(Debug, Clone, Deserialize)]
struct TrustEntryFile {
    cn: String,
    public_key_hex: String,
    allowed_device_id_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TrustMapFile {
    #[serde(default)]
    entries: Vec<TrustEntryFile>,
}

/// A resolved trust-map entry.
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub cn: String,
    pub verifying_key: VerifyingKey,
    pub allowed_device_id_prefix: String,
}

/// Immutable snapshot of the trust map, keyed by certificate CN.
#[derive(Debug, Default)]
pub struct TrustMapSnapshot {
    by_cn: HashMap<String, TrustEntry>,
}

impl TrustMapSnapshot {
    pub fn parse(toml_source: &str) -> Result<Self> {
        let file: TrustMapFile = toml::from_str(toml_source)
            .map_err(|e| CryptoError::TrustMapLoad(e.to_string()))?;
        let mut by_cn = HashMap::with_capacity(file.entries.len());
        for entry in file.entries {
            if by_cn.contains_key(&entry.cn) {
                return Err(CryptoError::DuplicateCn { cn: entry.cn });
            }
            let key_bytes: [u8; 32] = hex::decode(&entry.public_key_hex)
                .map_err(|e| CryptoError::TrustMapLoad(format!("{}: {}", entry.cn, e)))?
                .try_into()
                .map_err(|_| {
                    CryptoError::TrustMapLoad(format!(
                        "{}: public key must be 32 bytes",
                        entry.cn
                    ))
                })?;
            let verifying_key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| CryptoError::TrustMapLoad(format!("{}: {}", entry.cn, e)))?;
            by_cn.insert(
                entry.cn.clone(),
                TrustEntry {
                    cn: entry.cn,
                    verifying_key,
                    allowed_device_id_prefix: entry.allowed_device_id_prefix,
                },
            );
        }
        Ok(Self { by_cn })
    }

    pub fn lookup(&self, cn: &str) -> Option<&TrustEntry> {
        self.by_cn.get(cn)
    }

    pub fn len(&self) -> usize {
        self.by_cn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cn.is_empty()
    }
}

/// Reloadable handle to the current trust map. `reload` performs an atomic
/// pointer swap; in-flight verifiers keep using the snapshot they loaded at
/// the start of their request.
pub struct TrustMap {
    current: RwLock<Arc<TrustMapSnapshot>>,
    reload_count: AtomicUsize,
}

impl TrustMap {
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::TrustMapLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&source)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let snapshot = TrustMapSnapshot::parse(source)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            reload_count: AtomicUsize::new(0),
        })
    }

    /// Take the current snapshot. Callers (verifiers) should call this once
    /// at the start of a request and use the returned `Arc` throughout,
    /// rather than re-reading it, to get a consistent view even if a reload
    /// races the request. The lock is only held long enough to clone the
    /// `Arc` — the snapshot itself is never mutated in place.
    pub fn snapshot(&self) -> Arc<TrustMapSnapshot> {
        self.current.read().clone()
    }

    pub fn reload_from_toml(&self, source: &str) -> Result<()> {
        let snapshot = TrustMapSnapshot::parse(source)?;
        *self.current.write() = Arc::new(snapshot);
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn reload_count(&self) -> usize {
        self.reload_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY_HEX: &str =
        "302a300506032b65700321003b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29";

    fn valid_hex_key() -> String {
        // Any 32 valid Ed25519 public key bytes; derive one deterministically
        // from a signing key so the test doesn't depend on external fixtures.
        let sk = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        hex::encode(sk.verifying_key().as_bytes())
    }

    #[test]
    fn parses_entries_and_rejects_duplicates() {
        let key = valid_hex_key();
        let toml = format!(
            "[[entries]]\ncn = \"agent-1\"\npublic_key_hex = \"{key}\"\nallowed_device_id_prefix = \"dev-\"\n\n[[entries]]\ncn = \"agent-1\"\npublic_key_hex = \"{key}\"\nallowed_device_id_prefix = \"dev-\"\n",
        );
        let err = TrustMapSnapshot::parse(&toml).unwrap_err();
        assert!(matches!(err, CryptoError::DuplicateCn { .. }));
        let _ = SAMPLE_KEY_HEX;
    }

    #[test]
    fn lookup_and_reload() {
        let key = valid_hex_key();
        let toml = format!(
            "[[entries]]\ncn = \"agent-1\"\npublic_key_hex = \"{key}\"\nallowed_device_id_prefix = \"dev-\"\n",
        );
        let trust = TrustMap::from_toml(&toml).unwrap();
        assert!(trust.snapshot().lookup("agent-1").is_some());
        assert!(trust.snapshot().lookup("agent-2").is_none());

        trust.reload_from_toml("entries = []").unwrap();
        assert!(trust.snapshot().lookup("agent-1").is_none());
        assert_eq!(trust.reload_count(), 1);
    }
}
