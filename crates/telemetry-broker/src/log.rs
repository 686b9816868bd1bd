//! Broker log: the durable, append-only, single-writer record of every
//! accepted envelope (§4.G, §3 "Broker Log Record", §6 "Broker log on-disk
//! layout").
//!
//! Record framing mirrors `telemetry-wal`'s: `{len:u32, checksum:32 bytes,
//! log_seq:u64, accepted_at_ns:i64, cn_len:u16, cn:bytes, key_len:u16,
//! key:bytes, bytes_len:u32, bytes}`. `log_seq` is dense — no gaps — since
//! it is assigned by a single writer incrementing a counter under the same
//! lock that performs the append.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BrokerError, Result};

const LEN_PREFIX_BYTES: u64 = 4;

/// One durable record in the broker log (§3 "Broker Log Record"). Also the
/// wire shape the ingestor reads over `GET /v1/log` (§4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerLogRecord {
    pub log_seq: u64,
    pub accepted_at_ns: i64,
    pub idempotency_key: String,
    pub envelope_bytes: Vec<u8>,
    pub source_cn: String,
}

fn checksum(log_seq: u64, accepted_at_ns: i64, cn: &[u8], key: &[u8], bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(log_seq.to_le_bytes());
    hasher.update(accepted_at_ns.to_le_bytes());
    hasher.update(cn);
    hasher.update(key);
    hasher.update(bytes);
    hasher.finalize().into()
}

fn encode_record(record: &BrokerLogRecord) -> Vec<u8> {
    let cn = record.source_cn.as_bytes();
    let key = record.idempotency_key.as_bytes();
    let sum = checksum(
        record.log_seq,
        record.accepted_at_ns,
        cn,
        key,
        &record.envelope_bytes,
    );

    let mut body = Vec::with_capacity(32 + 8 + 8 + 2 + cn.len() + 2 + key.len() + 4 + record.envelope_bytes.len());
    body.extend_from_slice(&sum);
    body.extend_from_slice(&record.log_seq.to_le_bytes());
    body.extend_from_slice(&record.accepted_at_ns.to_le_bytes());
    body.extend_from_slice(&(cn.len() as u16).to_le_bytes());
    body.extend_from_slice(cn);
    body.extend_from_slice(&(key.len() as u16).to_le_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(&(record.envelope_bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(&record.envelope_bytes);

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

fn decode_record(body: &[u8]) -> Result<BrokerLogRecord> {
    if body.len() < 32 + 8 + 8 + 2 {
        return Err(BrokerError::Corrupt("record shorter than fixed header".into()));
    }
    let mut pos = 0usize;
    let sum: [u8; 32] = body[pos..pos + 32].try_into().unwrap();
    pos += 32;
    let log_seq = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let accepted_at_ns = i64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let cn_len = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    if body.len() < pos + cn_len + 2 {
        return Err(BrokerError::Corrupt("record truncated in cn".into()));
    }
    let source_cn = String::from_utf8(body[pos..pos + cn_len].to_vec())
        .map_err(|e| BrokerError::Corrupt(format!("cn not utf8: {e}")))?;
    pos += cn_len;
    let key_len = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;
    if body.len() < pos + key_len + 4 {
        return Err(BrokerError::Corrupt("record truncated in key/bytes_len".into()));
    }
    let idempotency_key = String::from_utf8(body[pos..pos + key_len].to_vec())
        .map_err(|e| BrokerError::Corrupt(format!("key not utf8: {e}")))?;
    pos += key_len;
    let bytes_len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if body.len() != pos + bytes_len {
        return Err(BrokerError::Corrupt("record length mismatch".into()));
    }
    let envelope_bytes = body[pos..pos + bytes_len].to_vec();

    let expected = checksum(log_seq, accepted_at_ns, source_cn.as_bytes(), idempotency_key.as_bytes(), &envelope_bytes);
    if expected != sum {
        return Err(BrokerError::Corrupt(format!("checksum mismatch at log_seq {log_seq}")));
    }

    Ok(BrokerLogRecord {
        log_seq,
        accepted_at_ns,
        idempotency_key,
        envelope_bytes,
        source_cn,
    })
}

struct LogInner {
    file: File,
    next_seq: u64,
    records: BTreeMap<u64, BrokerLogRecord>,
    key_to_seq: std::collections::HashMap<String, u64>,
}

/// Append-only broker log, single writer, many readers via [`BrokerLog::scan`]
/// (§4.G).
pub struct BrokerLog {
    inner: Mutex<LogInner>,
}

impl BrokerLog {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut records = BTreeMap::new();
        let mut key_to_seq = std::collections::HashMap::new();
        let mut next_seq = 0u64;
        let mut offset = 0u64;

        loop {
            let remaining = &contents[offset as usize..];
            if remaining.is_empty() {
                break;
            }
            if remaining.len() < LEN_PREFIX_BYTES as usize {
                tracing::warn!(offset, "broker log: partial length prefix, truncating");
                break;
            }
            let len = u32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
            if remaining.len() < 4 + len {
                tracing::warn!(offset, "broker log: partial trailing record, truncating");
                break;
            }
            let body = &remaining[4..4 + len];
            let record = match decode_record(body) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "broker log: corrupt trailing record, truncating");
                    break;
                }
            };
            next_seq = next_seq.max(record.log_seq + 1);
            key_to_seq.insert(record.idempotency_key.clone(), record.log_seq);
            let record_total = LEN_PREFIX_BYTES + len as u64;
            records.insert(record.log_seq, record);
            offset += record_total;
        }

        if offset < contents.len() as u64 {
            file.set_len(offset)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                next_seq,
                records,
                key_to_seq,
            }),
        })
    }

    /// Durably append `record` (`log_seq` is assigned by the log, not the
    /// caller, to guarantee density). Returns the assigned `log_seq`.
    pub fn append(
        &self,
        accepted_at_ns: i64,
        idempotency_key: &str,
        envelope_bytes: Vec<u8>,
        source_cn: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let log_seq = inner.next_seq;
        let record = BrokerLogRecord {
            log_seq,
            accepted_at_ns,
            idempotency_key: idempotency_key.to_string(),
            envelope_bytes,
            source_cn: source_cn.to_string(),
        };
        let framed = encode_record(&record);

        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&framed)?;
        inner.file.sync_all()?;

        inner.key_to_seq.insert(idempotency_key.to_string(), log_seq);
        inner.records.insert(log_seq, record);
        inner.next_seq += 1;

        Ok(log_seq)
    }

    /// Records from `from_seq` (inclusive) in seq order, up to `limit`.
    pub fn scan(&self, from_seq: u64, limit: usize) -> Vec<BrokerLogRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .range(from_seq..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn lookup_by_key(&self, idempotency_key: &str) -> Option<u64> {
        self.inner.lock().key_to_seq.get(idempotency_key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}
