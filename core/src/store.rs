use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::job::DeliveryRecord;

/// Delivery sink for finalized Job records.
pub trait Store: Send + Sync + 'static {
    /// Accept `record` for eventual upload. Must not block indefinitely.
    fn push(&self, activity_id: &str, record: DeliveryRecord) -> Result<()>;
    /// Purge buffered records of activities not in `active_ids`.
    fn clear_offline_data(&self, active_ids: &[String]) -> Result<()>;
}

/// Filesystem-backed key/value store used as the default KV engine.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
    /// All keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>>;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes).with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root).with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // File names are the hex encoding of the key bytes.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

fn unhex(name: &str) -> Option<Vec<u8>> {
    if name.len() % 2 != 0 {
        return None;
    }
    (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect()
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let mut f = fs::File::open(&path).ok()?;
        let mut buf = Vec::new();
        if f.read_to_end(&mut buf).is_ok() { Some(buf) } else { None }
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write temp then rename so readers never see a partial value.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val).with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().ok();
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let Ok(entries) = fs::read_dir(&self.root) else { return Vec::new() };
        let mut keys: Vec<Vec<u8>> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(unhex))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys
    }
}

/* --------------------- offline queue --------------------- */

const OUTBOX: &str = "outbox";

/// A record waiting in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
    /// Activity the record belongs to.
    pub activity_id: String,
    /// Start time of the Job (ms).
    pub timestamp: u64,
    /// Exit code or 0 for advisory records.
    pub return_code: i32,
    /// JSON text of the record's data (bincode cannot carry arbitrary JSON).
    pub data_json: String,
}

impl QueuedRecord {
    fn new(activity_id: &str, record: &DeliveryRecord) -> Result<Self> {
        Ok(Self {
            activity_id: activity_id.to_string(),
            timestamp: record.timestamp,
            return_code: record.return_code,
            data_json: serde_json::to_string(&record.data).context("encode record data")?,
        })
    }

    /// Decode back into a delivery record.
    pub fn record(&self) -> Result<DeliveryRecord> {
        Ok(DeliveryRecord {
            timestamp: self.timestamp,
            return_code: self.return_code,
            data: serde_json::from_str(&self.data_json).context("decode record data")?,
        })
    }
}

/// [`Store`] that persists every record into a [`Kv`] until it is drained.
pub struct OfflineStore<K: Kv> {
    kv: K,
    seq: AtomicU64,
}

impl<K: Kv> OfflineStore<K> {
    /// Queue records into `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv, seq: AtomicU64::new(0) }
    }

    fn key(&self, activity_id: &str, timestamp: u64) -> Vec<u8> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        ns(OUTBOX, &format!("{activity_id}:{timestamp:020}:{seq:08}"))
    }

    fn activity_of(key: &[u8]) -> Option<String> {
        let s = std::str::from_utf8(key).ok()?;
        let rest = s.strip_prefix(OUTBOX)?.strip_prefix(':')?;
        let mut parts = rest.rsplitn(3, ':');
        let (_seq, _ts, id) = (parts.next()?, parts.next()?, parts.next()?);
        Some(id.to_string())
    }

    /// Every queued record in key order.
    pub fn pending(&self) -> Result<Vec<QueuedRecord>> {
        let mut out = Vec::new();
        for key in self.kv.keys_with_prefix(&ns(OUTBOX, "")) {
            if let Some(rec) = self.kv.get_t::<QueuedRecord>(&key)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Remove and return the queued records of one activity.
    pub fn drain_activity(&self, activity_id: &str) -> Result<Vec<QueuedRecord>> {
        let mut out = Vec::new();
        for key in self.kv.keys_with_prefix(&ns(OUTBOX, &format!("{activity_id}:"))) {
            if Self::activity_of(&key).as_deref() != Some(activity_id) {
                continue;
            }
            if let Some(rec) = self.kv.get_t::<QueuedRecord>(&key)? {
                out.push(rec);
            }
            self.kv.delete(&key);
        }
        Ok(out)
    }
}

impl<K: Kv> Store for OfflineStore<K> {
    fn push(&self, activity_id: &str, record: DeliveryRecord) -> Result<()> {
        let queued = QueuedRecord::new(activity_id, &record)?;
        let key = self.key(activity_id, record.timestamp);
        self.kv.put_t(&key, &queued)?;
        debug!("queued activity ({} @ {})", activity_id, record.timestamp);
        Ok(())
    }

    fn clear_offline_data(&self, active_ids: &[String]) -> Result<()> {
        let active: HashSet<&str> = active_ids.iter().map(String::as_str).collect();
        let mut removed = 0usize;
        for key in self.kv.keys_with_prefix(&ns(OUTBOX, "")) {
            match Self::activity_of(&key) {
                Some(id) if active.contains(id.as_str()) => {}
                _ => {
                    if self.kv.delete(&key) {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("purged {} offline records of stopped activities", removed);
        }
        Ok(())
    }
}

/// In-memory [`Store`] for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<(String, DeliveryRecord)>>,
    cleared: Mutex<Vec<Vec<String>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records pushed so far, in push order.
    pub fn records(&self) -> Vec<(String, DeliveryRecord)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Arguments of every `clear_offline_data` call.
    pub fn cleared(&self) -> Vec<Vec<String>> {
        self.cleared.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Store for MemoryStore {
    fn push(&self, activity_id: &str, record: DeliveryRecord) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        records.push((activity_id.to_string(), record));
        Ok(())
    }

    fn clear_offline_data(&self, active_ids: &[String]) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        records.retain(|(id, _)| active_ids.contains(id));
        drop(records);
        if let Ok(mut cleared) = self.cleared.lock() {
            cleared.push(active_ids.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(ts: u64, data: serde_json::Value) -> DeliveryRecord {
        DeliveryRecord { timestamp: ts, return_code: 0, data }
    }

    #[test]
    fn kv_roundtrip_and_prefix_scan() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        kv.put_t(&ns("a", "1"), &7u64).unwrap();
        kv.put_t(&ns("a", "2"), &8u64).unwrap();
        kv.put_t(&ns("b", "1"), &9u64).unwrap();
        assert_eq!(kv.get_t::<u64>(&ns("a", "2")).unwrap(), Some(8));
        assert_eq!(kv.keys_with_prefix(b"a:"), vec![ns("a", "1"), ns("a", "2")]);
        assert!(kv.delete(&ns("a", "1")));
        assert!(!kv.delete(&ns("a", "1")));
    }

    #[test]
    fn offline_store_queues_structured_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(open_default(dir.path()).unwrap());
        store.push("a1", record(10, json!("hi\n"))).unwrap();
        store.push("p:1", record(11, json!({"load1": 0.25}))).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].activity_id, "a1");
        assert_eq!(pending[1].record().unwrap().data["load1"], 0.25);
    }

    #[test]
    fn clear_keeps_only_active_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(open_default(dir.path()).unwrap());
        store.push("a1", record(1, json!("x"))).unwrap();
        store.push("a2", record(2, json!("y"))).unwrap();
        store.push("a2", record(3, json!("z"))).unwrap();

        store.clear_offline_data(&["a1".to_string()]).unwrap();
        let ids: Vec<_> = store.pending().unwrap().into_iter().map(|r| r.activity_id).collect();
        assert_eq!(ids, vec!["a1"]);
    }

    #[test]
    fn drain_does_not_touch_ids_sharing_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(open_default(dir.path()).unwrap());
        store.push("a", record(1, json!("x"))).unwrap();
        store.push("a:b", record(2, json!("y"))).unwrap();

        let drained = store.drain_activity("a").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(store.pending().unwrap()[0].activity_id, "a:b");
    }

    #[test]
    fn memory_store_tracks_clears() {
        let store = MemoryStore::new();
        store.push("a1", record(1, json!("x"))).unwrap();
        store.push("a2", record(2, json!("y"))).unwrap();
        store.clear_offline_data(&["a1".to_string()]).unwrap();
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.cleared(), vec![vec!["a1".to_string()]]);
    }
}
