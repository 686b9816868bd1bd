//! Append-only, crash-safe write-ahead log (§4.C, §6 "WAL on-disk layout").
//!
//! Record framing: `{len:u32, checksum:32 bytes, seq:u64, timestamp_ns:i64,
//! state:u8, key_len:u16, key:bytes, bytes_len:u32, bytes}`. `len` is the byte
//! count of everything after itself. `checksum` covers `seq`, `timestamp_ns`,
//! `key`, and `bytes` only — not `state`, which legitimately changes in place
//! (PENDING → INFLIGHT → ACKED) without touching the payload it guards.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::entry::{WalEntry, WalState};
use crate::error::{Result, WalError};

const LEN_PREFIX_BYTES: u64 = 4;

struct RecordMeta {
    state_offset: u64,
    idempotency_key: String,
    timestamp_ns: i64,
    bytes: Vec<u8>,
    state: WalState,
}

struct WalInner {
    file: File,
    next_seq: u64,
    size_bytes: u64,
    max_bytes: u64,
    records: BTreeMap<u64, RecordMeta>,
    key_to_seq: HashMap<String, u64>,
}

/// Agent-local WAL providing at-least-once publish (§4.C).
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

fn checksum(seq: u64, timestamp_ns: i64, key: &[u8], bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(timestamp_ns.to_le_bytes());
    hasher.update(key);
    hasher.update(bytes);
    hasher.finalize().into()
}

fn encode_record(seq: u64, timestamp_ns: i64, state: WalState, key: &str, bytes: &[u8]) -> Vec<u8> {
    let key_bytes = key.as_bytes();
    let sum = checksum(seq, timestamp_ns, key_bytes, bytes);

    let mut body = Vec::with_capacity(32 + 8 + 8 + 1 + 2 + key_bytes.len() + 4 + bytes.len());
    body.extend_from_slice(&sum);
    body.extend_from_slice(&seq.to_le_bytes());
    body.extend_from_slice(&timestamp_ns.to_le_bytes());
    body.push(state.tag());
    body.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
    body.extend_from_slice(key_bytes);
    body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(bytes);

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

/// A record decoded from `body` (post length-prefix), with its checksum
/// already verified against the immutable fields.
struct DecodedRecord {
    seq: u64,
    timestamp_ns: i64,
    state: WalState,
    key: String,
    bytes: Vec<u8>,
}

fn decode_record(body: &[u8]) -> Result<DecodedRecord> {
    if body.len() < 32 + 8 + 8 + 1 + 2 {
        return Err(WalError::Corrupt("record shorter than fixed header".into()));
    }
    let mut pos = 0usize;
    let sum: [u8; 32] = body[pos..pos + 32].try_into().unwrap();
    pos += 32;
    let seq = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let timestamp_ns = i64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let state_tag = body[pos];
    pos += 1;
    let state = WalState::from_tag(state_tag)
        .ok_or_else(|| WalError::Corrupt(format!("unknown state tag {state_tag}")))?;
    let key_len = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    if body.len() < pos + key_len + 4 {
        return Err(WalError::Corrupt("record truncated in key/bytes_len".into()));
    }
    let key = String::from_utf8(body[pos..pos + key_len].to_vec())
        .map_err(|e| WalError::Corrupt(format!("key not utf8: {e}")))?;
    pos += key_len;
    let bytes_len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if body.len() != pos + bytes_len {
        return Err(WalError::Corrupt("record length mismatch".into()));
    }
    let bytes = body[pos..pos + bytes_len].to_vec();

    let expected = checksum(seq, timestamp_ns, key.as_bytes(), &bytes);
    if expected != sum {
        return Err(WalError::Corrupt(format!("checksum mismatch at seq {seq}")));
    }

    Ok(DecodedRecord {
        seq,
        timestamp_ns,
        state,
        key,
        bytes,
    })
}

impl Wal {
    /// Open (creating if absent) the WAL at `path`, recovering any on-disk
    /// state: INFLIGHT entries are reverted to PENDING (§4.C invariants), and
    /// a partial or corrupt trailing record is truncated.
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut records = BTreeMap::new();
        let mut key_to_seq = HashMap::new();
        let mut next_seq = 0u64;
        let mut size_bytes = 0u64;
        let mut offset = 0u64;
        let mut to_revert: Vec<u64> = Vec::new();

        loop {
            let remaining = &contents[offset as usize..];
            if remaining.is_empty() {
                break;
            }
            if remaining.len() < LEN_PREFIX_BYTES as usize {
                tracing::warn!(offset, "wal: partial length prefix, truncating");
                break;
            }
            let len = u32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
            if remaining.len() < 4 + len {
                tracing::warn!(offset, "wal: partial trailing record, truncating");
                break;
            }
            let body = &remaining[4..4 + len];
            let decoded = match decode_record(body) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "wal: corrupt trailing record, truncating");
                    break;
                }
            };

            let state_offset = offset + LEN_PREFIX_BYTES + 32 + 8 + 8;
            let record_total = LEN_PREFIX_BYTES + len as u64;

            let mut state = decoded.state;
            if state == WalState::Inflight {
                state = WalState::Pending;
                to_revert.push(decoded.seq);
            }

            next_seq = next_seq.max(decoded.seq + 1);
            size_bytes += record_total;
            key_to_seq.insert(decoded.key.clone(), decoded.seq);
            records.insert(
                decoded.seq,
                RecordMeta {
                    state_offset,
                    idempotency_key: decoded.key,
                    timestamp_ns: decoded.timestamp_ns,
                    bytes: decoded.bytes,
                    state,
                },
            );

            offset += record_total;
        }

        if offset < contents.len() as u64 {
            file.set_len(offset)?;
            file.sync_all()?;
        }

        for seq in &to_revert {
            let state_offset = records[seq].state_offset;
            file.seek(SeekFrom::Start(state_offset))?;
            file.write_all(&[WalState::Pending.tag()])?;
        }
        if !to_revert.is_empty() {
            file.sync_all()?;
            tracing::warn!(count = to_revert.len(), "wal: reverted inflight entries to pending on recovery");
        }

        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                next_seq,
                size_bytes,
                max_bytes,
                records,
                key_to_seq,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append `bytes` under `idempotency_key`, returning its seq.
    /// Rejects a duplicate key locally rather than writing a second copy
    /// (§4.C "Duplicate appends ... are rejected locally").
    pub fn append(&self, bytes: &[u8], idempotency_key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.key_to_seq.contains_key(idempotency_key) {
            return Err(WalError::DuplicateKey(idempotency_key.to_string()));
        }

        let seq = inner.next_seq;
        let timestamp_ns = now_ns();
        let framed = encode_record(seq, timestamp_ns, WalState::Pending, idempotency_key, bytes);
        let record_total = framed.len() as u64;

        if inner.size_bytes + record_total > inner.max_bytes {
            return Err(WalError::WalFull {
                size: inner.size_bytes + record_total,
                limit: inner.max_bytes,
            });
        }

        let offset = inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&framed)?;
        inner.file.sync_all()?;

        let state_offset = offset + LEN_PREFIX_BYTES + 32 + 8 + 8;
        inner.records.insert(
            seq,
            RecordMeta {
                state_offset,
                idempotency_key: idempotency_key.to_string(),
                timestamp_ns,
                bytes: bytes.to_vec(),
                state: WalState::Pending,
            },
        );
        inner.key_to_seq.insert(idempotency_key.to_string(), seq);
        inner.size_bytes += record_total;
        inner.next_seq += 1;

        Ok(seq)
    }

    /// PENDING entries in seq order, oldest first, up to `limit`.
    pub fn iter_pending(&self, limit: usize) -> Vec<WalEntry> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter(|(_, meta)| meta.state == WalState::Pending)
            .take(limit)
            .map(|(seq, meta)| WalEntry {
                seq: *seq,
                idempotency_key: meta.idempotency_key.clone(),
                timestamp_ns: meta.timestamp_ns,
                bytes: meta.bytes.clone(),
                state: meta.state,
            })
            .collect()
    }

    fn set_state(&self, seq: u64, state: WalState) -> Result<()> {
        let mut inner = self.inner.lock();
        let state_offset = {
            let meta = inner.records.get(&seq).ok_or(WalError::NotFound(seq))?;
            meta.state_offset
        };
        inner.file.seek(SeekFrom::Start(state_offset))?;
        inner.file.write_all(&[state.tag()])?;
        inner.file.sync_all()?;
        inner.file.seek(SeekFrom::End(0))?;
        inner.records.get_mut(&seq).unwrap().state = state;
        Ok(())
    }

    pub fn mark_inflight(&self, seq: u64) -> Result<()> {
        self.set_state(seq, WalState::Inflight)
    }

    pub fn mark_pending(&self, seq: u64) -> Result<()> {
        self.set_state(seq, WalState::Pending)
    }

    /// Mark the entry for `idempotency_key` ACKED. Idempotent: acking an
    /// already-ACKED key is a no-op, matching the broker's own idempotent-OK
    /// semantics for a repeated key.
    pub fn mark_acked(&self, idempotency_key: &str) -> Result<()> {
        let seq = {
            let inner = self.inner.lock();
            *inner
                .key_to_seq
                .get(idempotency_key)
                .ok_or_else(|| WalError::KeyNotFound(idempotency_key.to_string()))?
        };
        self.set_state(seq, WalState::Acked)
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().size_bytes
    }

    /// Count of entries not yet ACKED (PENDING + INFLIGHT).
    pub fn backlog_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|m| m.state != WalState::Acked)
            .count()
    }

    /// Rewrite the WAL file keeping only non-ACKED entries, reclaiming the
    /// space ACKED entries occupied. Safe to call concurrently with readers
    /// of `iter_pending`/`size_bytes` only insofar as the lock serializes
    /// them; it does not run on a background thread on its own.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut new_records = BTreeMap::new();
        let mut new_key_to_seq = HashMap::new();
        let mut buf = Vec::new();
        let mut size_bytes = 0u64;

        for (seq, meta) in inner.records.iter() {
            if meta.state == WalState::Acked {
                continue;
            }
            let framed = encode_record(
                *seq,
                meta.timestamp_ns,
                meta.state,
                &meta.idempotency_key,
                &meta.bytes,
            );
            let offset = buf.len() as u64;
            let state_offset = offset + LEN_PREFIX_BYTES + 32 + 8 + 8;
            let total_len = framed.len() as u64;
            buf.extend_from_slice(&framed);
            size_bytes += total_len;
            new_key_to_seq.insert(meta.idempotency_key.clone(), *seq);
            new_records.insert(
                *seq,
                RecordMeta {
                    state_offset,
                    idempotency_key: meta.idempotency_key.clone(),
                    timestamp_ns: meta.timestamp_ns,
                    bytes: meta.bytes.clone(),
                    state: meta.state,
                },
            );
        }

        let tmp_path = self.path.with_extension("compact.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.file = file;
        inner.file.seek(SeekFrom::End(0))?;
        inner.records = new_records;
        inner.key_to_seq = new_key_to_seq;
        inner.size_bytes = size_bytes;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal(max_bytes: u64) -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.wal");
        let wal = Wal::open(&path, max_bytes).unwrap();
        (dir, wal)
    }

    #[test]
    fn append_and_iter_pending_round_trips() {
        let (_dir, wal) = temp_wal(1 << 20);
        let seq0 = wal.append(b"envelope-0", "k0").unwrap();
        let seq1 = wal.append(b"envelope-1", "k1").unwrap();
        assert_eq!(seq0, 0);
        assert_eq!(seq1, 1);

        let pending = wal.iter_pending(10);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].bytes, b"envelope-0");
        assert_eq!(pending[1].idempotency_key, "k1");
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (_dir, wal) = temp_wal(1 << 20);
        wal.append(b"e", "dup").unwrap();
        let err = wal.append(b"e2", "dup").unwrap_err();
        assert!(matches!(err, WalError::DuplicateKey(_)));
    }

    #[test]
    fn wal_full_rejects_further_appends() {
        let (_dir, wal) = temp_wal(1);
        let err = wal.append(b"a", "k0").unwrap_err();
        assert!(matches!(err, WalError::WalFull { .. }));
    }

    #[test]
    fn mark_acked_removes_entry_from_pending_and_backlog() {
        let (_dir, wal) = temp_wal(1 << 20);
        wal.append(b"e", "k0").unwrap();
        assert_eq!(wal.backlog_count(), 1);
        wal.mark_acked("k0").unwrap();
        assert_eq!(wal.backlog_count(), 0);
        assert!(wal.iter_pending(10).is_empty());
    }

    #[test]
    fn inflight_is_reverted_to_pending_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.wal");
        {
            let wal = Wal::open(&path, 1 << 20).unwrap();
            let seq = wal.append(b"e", "k0").unwrap();
            wal.mark_inflight(seq).unwrap();
        }
        let wal = Wal::open(&path, 1 << 20).unwrap();
        let pending = wal.iter_pending(10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].idempotency_key, "k0");
    }

    #[test]
    fn partial_trailing_record_is_truncated_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.wal");
        {
            let wal = Wal::open(&path, 1 << 20).unwrap();
            wal.append(b"whole-record", "k0").unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let wal = Wal::open(&path, 1 << 20).unwrap();
        let pending = wal.iter_pending(10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].idempotency_key, "k0");
    }

    #[test]
    fn compact_drops_acked_entries_and_keeps_rest() {
        let (_dir, wal) = temp_wal(1 << 20);
        wal.append(b"e0", "k0").unwrap();
        wal.append(b"e1", "k1").unwrap();
        wal.mark_acked("k0").unwrap();

        let size_before = wal.size_bytes();
        wal.compact().unwrap();
        assert!(wal.size_bytes() < size_before);
        assert_eq!(wal.backlog_count(), 1);
        let pending = wal.iter_pending(10);
        assert_eq!(pending[0].idempotency_key, "k1");
    }
}
