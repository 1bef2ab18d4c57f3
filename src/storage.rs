// Persisted layout: one ordered JSON-lines log per tier, plus tensor snapshots.
// Logs are replayed on open; tensor snapshots are written tmp+rename.

use crate::entry::{Entry, Tier};
use crate::error::StorageError;
use crate::tensor::{DimensionState, T3_ROOTS, TensorKey, TensorKind, TensorSnapshot, V3_ROOTS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One line of a tier log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    Append { entry: Entry },
    Prune { entry_id: u64 },
    Evict { entry_id: u64 },
}

/// Ordered, append-only record sink per tier.
pub trait EntryLog: Send + Sync {
    fn record(&self, tier: Tier, rec: &LogRecord) -> Result<(), StorageError>;
    fn replay(&self, tier: Tier) -> Result<Vec<LogRecord>, StorageError>;
}

/// In-memory log for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryLog {
    tiers: Mutex<HashMap<Tier, Vec<LogRecord>>>,
}

impl MemoryLog {
    /// Edit the stored records in place (fault injection).
    pub fn mutate<F: FnOnce(&mut Vec<LogRecord>)>(&self, tier: Tier, f: F) {
        if let Ok(mut g) = self.tiers.lock() {
            f(g.entry(tier).or_default());
        }
    }
}

impl EntryLog for MemoryLog {
    fn record(&self, tier: Tier, rec: &LogRecord) -> Result<(), StorageError> {
        let mut g = self
            .tiers
            .lock()
            .map_err(|_| StorageError::LockPoisoned("memory log"))?;
        g.entry(tier).or_default().push(rec.clone());
        Ok(())
    }

    fn replay(&self, tier: Tier) -> Result<Vec<LogRecord>, StorageError> {
        let g = self
            .tiers
            .lock()
            .map_err(|_| StorageError::LockPoisoned("memory log"))?;
        Ok(g.get(&tier).cloned().unwrap_or_default())
    }
}

/// `<dir>/<tier>.jsonl`, one record per line, flushed per record.
pub struct FileLog {
    dir: PathBuf,
    writers: Mutex<HashMap<Tier, File>>,
}

impl FileLog {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self, tier: Tier) -> PathBuf {
        self.dir.join(format!("{}.jsonl", tier.as_str()))
    }

    /// Replace a tier's log with `records` atomically.
    pub fn compact(&self, tier: Tier, records: &[LogRecord]) -> Result<(), StorageError> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| StorageError::LockPoisoned("file log"))?;
        let path = self.path(tier);
        let tmp_path = path.with_extension("jsonl.tmp");
        let mut data = Vec::new();
        for rec in records {
            serde_json::to_writer(&mut data, rec)?;
            data.push(b'\n');
        }
        fs::write(&tmp_path, data).map_err(|e| StorageError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| StorageError::io(&path, e))?;
        // Reopen lazily against the new file.
        writers.remove(&tier);
        Ok(())
    }
}

impl EntryLog for FileLog {
    fn record(&self, tier: Tier, rec: &LogRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(rec)?;
        line.push(b'\n');
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| StorageError::LockPoisoned("file log"))?;
        let path = self.path(tier);
        if !writers.contains_key(&tier) {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            writers.insert(tier, f);
        }
        let Some(f) = writers.get_mut(&tier) else {
            return Err(StorageError::LockPoisoned("file log"));
        };
        f.write_all(&line).map_err(|e| StorageError::io(&path, e))?;
        f.flush().map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    fn replay(&self, tier: Tier) -> Result<Vec<LogRecord>, StorageError> {
        let path = self.path(tier);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let f = File::open(&path).map_err(|e| StorageError::io(&path, e))?;
        let mut out = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line.map_err(|e| StorageError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

/// Persisted per-dimension state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionRecord {
    pub value: f64,
    pub count: u64,
    pub last_update: u64,
}

impl From<&DimensionState> for DimensionRecord {
    fn from(d: &DimensionState) -> Self {
        Self {
            value: d.value,
            count: d.count,
            last_update: d.last_update,
        }
    }
}

/// entity -> {dimension: (value, count, last_update)}, alongside full snapshots for restore.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedTensors {
    pub dimensions: BTreeMap<String, BTreeMap<String, DimensionRecord>>,
    pub snapshots: Vec<TensorSnapshot>,
}

impl PersistedTensors {
    pub fn from_snapshots(snapshots: Vec<TensorSnapshot>) -> Self {
        let mut dimensions = BTreeMap::new();
        for s in &snapshots {
            dimensions.insert(entity_label(&s.key), flatten(s));
        }
        Self { dimensions, snapshots }
    }
}

fn entity_label(key: &TensorKey) -> String {
    key.to_string()
}

fn flatten(s: &TensorSnapshot) -> BTreeMap<String, DimensionRecord> {
    let mut out = BTreeMap::new();
    for t in [&s.t3, &s.v3] {
        let roots = match t.kind {
            TensorKind::Trust => T3_ROOTS,
            TensorKind::Value => V3_ROOTS,
        };
        for r in roots {
            if let Some(d) = t.root(r) {
                out.insert(r.as_str().to_string(), d.into());
            }
        }
        for (name, d) in &t.subs {
            out.insert(format!("{}.{}", t.kind.as_str(), name), d.into());
        }
    }
    out
}

pub struct TensorStore {
    path: PathBuf,
}

impl TensorStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        Ok(Self {
            path: dir.join("tensors.json"),
        })
    }

    pub fn load(&self) -> Result<Option<PersistedTensors>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub fn save(&self, tensors: &PersistedTensors) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(tensors)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).map_err(|e| StorageError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }
}
