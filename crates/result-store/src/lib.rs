//! Result Store (spec.md §4.H): per-message evaluation records, with
//! idempotent replay support.
//!
//! The actual storage engine is an external collaborator (spec.md §1's
//! "embedded document-store library"); this crate owns the key scheme and
//! range-query algorithms, reaching the engine through
//! [`ResultStoreBackend`]. The default production backend adapts RocksDB,
//! following the base crate's practice of RocksDB-backed, prefix-keyed
//! state (see `derive::registers::Registers`).

use ao_types::{CuError, Evaluation, Process};
use std::path::Path;

const EVALUATIONS_CF: &str = "evaluations";
const PROCESSES_CF: &str = "processes";

/// Identifiers starting with an underscore are not acceptable to the
/// embedded document store this component's keys were designed around;
/// every key is prefixed so that never happens.
fn process_key(process_id: &str) -> String {
    format!("proc-{process_id}")
}

/// Self-delimiting lower bound for a range scan over `process_id`'s
/// evaluations. `process_key` alone is not safe as a bound: for process
/// ids where one is a byte-prefix of another (e.g. `"1"` and `"10"`),
/// `'0'` (0x30) sorts before `':'` (0x3A), so a scan starting at
/// `"proc-1"` would also match `"proc-10:..."` keys. Anchoring on the
/// trailing colon rules that out.
fn process_prefix(process_id: &str) -> String {
    format!("{}:", process_key(process_id))
}

fn evaluation_key(process_id: &str, sort_key: &str) -> String {
    format!("proc-{process_id}:{}", ao_types::sort_key::canonicalize(sort_key))
}

fn deep_hash_index_key(process_id: &str, deep_hash: &str) -> String {
    format!("deephash-{process_id}:{deep_hash}")
}

fn message_id_index_key(process_id: &str, message_id: &str) -> String {
    format!("msgid-{process_id}:{message_id}")
}

/// The minimal ordered-KV contract this crate needs from its storage
/// engine. `scan_prefix` must return entries in ascending key order.
pub trait ResultStoreBackend: Send + Sync {
    fn put(&self, cf: &str, key: &str, value: &[u8]) -> Result<(), CuError>;
    fn get(&self, cf: &str, key: &str) -> Result<Option<Vec<u8>>, CuError>;
    fn scan_range(&self, cf: &str, from: &str, to: &str) -> Result<Vec<(String, Vec<u8>)>, CuError>;
}

pub struct ResultStore<B: ResultStoreBackend> {
    backend: B,
}

impl<B: ResultStoreBackend> ResultStore<B> {
    pub fn new(backend: B) -> Self {
        ResultStore { backend }
    }

    /// Save an evaluation and its secondary indices. Saving the same
    /// `(processId, sortKey)` twice yields the same stored record
    /// (RocksDB `put` is naturally idempotent for identical keys).
    pub fn save_evaluation(&self, eval: &Evaluation) -> Result<(), CuError> {
        let key = evaluation_key(&eval.process_id, &eval.sort_key);
        let value = serde_json::to_vec(eval).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        self.backend.put(EVALUATIONS_CF, &key, &value)?;

        if let Some(deep_hash) = &eval.deep_hash {
            let idx_key = deep_hash_index_key(&eval.process_id, deep_hash);
            self.backend
                .put(EVALUATIONS_CF, &idx_key, eval.sort_key.as_bytes())?;
        }
        if let Some(message_id) = &eval.message_id {
            let idx_key = message_id_index_key(&eval.process_id, message_id);
            self.backend
                .put(EVALUATIONS_CF, &idx_key, eval.sort_key.as_bytes())?;
        }
        Ok(())
    }

    /// The evaluation with the maximum sortKey `<= to` (or the latest
    /// overall, if `to` is `None`).
    pub fn find_latest_evaluation(
        &self,
        process_id: &str,
        to: Option<&str>,
    ) -> Result<Option<Evaluation>, CuError> {
        let from = process_prefix(process_id);
        let to = match to {
            Some(t) => evaluation_key(process_id, t),
            None => format!("{}~", process_prefix(process_id)),
        };
        let entries = self.backend.scan_range(EVALUATIONS_CF, &from, &to)?;
        let latest = entries
            .into_iter()
            .filter(|(k, _)| !k.starts_with("deephash-") && !k.starts_with("msgid-"))
            .last();
        match latest {
            Some((_, value)) => Ok(Some(
                serde_json::from_slice(&value).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?,
            )),
            None => Ok(None),
        }
    }

    /// All evaluations in `[from, to)` ascending sortKey order.
    pub fn find_evaluations(
        &self,
        process_id: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<Evaluation>, CuError> {
        let from_key = match from {
            Some(f) => evaluation_key(process_id, f),
            None => process_prefix(process_id),
        };
        let to_key = match to {
            Some(t) => evaluation_key(process_id, t),
            None => format!("{}~", process_prefix(process_id)),
        };
        let entries = self.backend.scan_range(EVALUATIONS_CF, &from_key, &to_key)?;
        entries
            .into_iter()
            .filter(|(k, _)| !k.starts_with("deephash-") && !k.starts_with("msgid-"))
            .map(|(_, v)| serde_json::from_slice(&v).map_err(|e| CuError::fatal(anyhow::anyhow!(e))))
            .collect()
    }

    /// Presence probe for a message id, used to make a single fold step
    /// idempotent under replay.
    pub fn find_message_id(&self, process_id: &str, message_id: &str) -> Result<bool, CuError> {
        let key = message_id_index_key(process_id, message_id);
        Ok(self.backend.get(EVALUATIONS_CF, &key)?.is_some())
    }

    /// The evaluation already recorded at this exact sortKey, if any. Used
    /// by the evaluator to make a single fold step idempotent under
    /// replay: consulted before folding, alongside `find_by_deep_hash`.
    pub fn find_evaluation_at(&self, process_id: &str, sort_key: &str) -> Result<Option<Evaluation>, CuError> {
        let key = evaluation_key(process_id, sort_key);
        match self.backend.get(EVALUATIONS_CF, &key)? {
            Some(v) => Ok(Some(
                serde_json::from_slice(&v).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?,
            )),
            None => Ok(None),
        }
    }

    /// The evaluation already recorded for this message id, if any. Used
    /// to serve `GET /result/{messageId}` directly from already-persisted
    /// state rather than guessing a SortKey bound from an opaque id.
    pub fn find_by_message_id(&self, process_id: &str, message_id: &str) -> Result<Option<Evaluation>, CuError> {
        let idx_key = message_id_index_key(process_id, message_id);
        let Some(sort_key_bytes) = self.backend.get(EVALUATIONS_CF, &idx_key)? else {
            return Ok(None);
        };
        let sort_key = String::from_utf8_lossy(&sort_key_bytes).to_string();
        let key = evaluation_key(process_id, &sort_key);
        match self.backend.get(EVALUATIONS_CF, &key)? {
            Some(v) => Ok(Some(
                serde_json::from_slice(&v).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?,
            )),
            None => Ok(None),
        }
    }

    /// Dedup lookup: the evaluation already recorded for this deepHash,
    /// if any.
    pub fn find_by_deep_hash(&self, process_id: &str, deep_hash: &str) -> Result<Option<Evaluation>, CuError> {
        let idx_key = deep_hash_index_key(process_id, deep_hash);
        let Some(sort_key_bytes) = self.backend.get(EVALUATIONS_CF, &idx_key)? else {
            return Ok(None);
        };
        let sort_key = String::from_utf8_lossy(&sort_key_bytes).to_string();
        let key = evaluation_key(process_id, &sort_key);
        match self.backend.get(EVALUATIONS_CF, &key)? {
            Some(v) => Ok(Some(
                serde_json::from_slice(&v).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?,
            )),
            None => Ok(None),
        }
    }

    /// Process records are immutable once recorded: saving twice is a
    /// no-op (a `Conflict` swallowed by this caller).
    pub fn save_process(&self, process: &Process) -> Result<(), CuError> {
        let key = process_key(&process.id);
        if self.backend.get(PROCESSES_CF, &key)?.is_some() {
            return Ok(());
        }
        let value = serde_json::to_vec(process).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        self.backend.put(PROCESSES_CF, &key, &value)
    }

    pub fn find_process(&self, process_id: &str) -> Result<Option<Process>, CuError> {
        let key = process_key(process_id);
        match self.backend.get(PROCESSES_CF, &key)? {
            Some(v) => Ok(Some(
                serde_json::from_slice(&v).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?,
            )),
            None => Ok(None),
        }
    }
}

/// Production backend: an embedded RocksDB instance with one column
/// family per record kind.
pub struct RocksDbBackend {
    db: rocksdb::DB,
}

impl RocksDbBackend {
    pub fn open(path: &Path) -> Result<Self, CuError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [EVALUATIONS_CF, PROCESSES_CF];
        let db = rocksdb::DB::open_cf(&opts, path, cfs).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        tracing::debug!(path = %path.display(), "opened result store");
        Ok(RocksDbBackend { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CuError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CuError::fatal(anyhow::anyhow!("missing column family {name}")))
    }
}

impl ResultStoreBackend for RocksDbBackend {
    fn put(&self, cf: &str, key: &str, value: &[u8]) -> Result<(), CuError> {
        self.db
            .put_cf(self.cf(cf)?, key.as_bytes(), value)
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
    }

    fn get(&self, cf: &str, key: &str) -> Result<Option<Vec<u8>>, CuError> {
        self.db
            .get_cf(self.cf(cf)?, key.as_bytes())
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
    }

    fn scan_range(&self, cf: &str, from: &str, to: &str) -> Result<Vec<(String, Vec<u8>)>, CuError> {
        let cf = self.cf(cf)?;
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(from.as_bytes(), rocksdb::Direction::Forward),
        );
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            if key_str.as_str() >= to {
                break;
            }
            out.push((key_str, value.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ao_types::{Block, Output};

    fn eval(process_id: &str, sort_key: &str, message_id: Option<&str>, deep_hash: Option<&str>) -> Evaluation {
        Evaluation {
            sort_key: sort_key.to_string(),
            process_id: process_id.to_string(),
            message_id: message_id.map(|s| s.to_string()),
            timestamp: 1,
            is_cron: false,
            epoch: None,
            nonce: None,
            evaluated_at: 1,
            output: Output::default(),
            deep_hash: deep_hash.map(|s| s.to_string()),
        }
    }

    fn store() -> ResultStore<RocksDbBackend> {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        // Leak the tempdir so the store outlives this function; tests are
        // short-lived single-process runs.
        std::mem::forget(dir);
        ResultStore::new(backend)
    }

    #[test]
    fn save_then_find_latest() {
        let store = store();
        store.save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), None)).unwrap();
        store.save_evaluation(&eval("proc-1", "000000000002,2,b", Some("m2"), None)).unwrap();

        let latest = store.find_latest_evaluation("proc-1", None).unwrap().unwrap();
        assert_eq!(latest.sort_key, "000000000002,2,b");
    }

    #[test]
    fn find_latest_respects_to_bound() {
        let store = store();
        store.save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), None)).unwrap();
        store.save_evaluation(&eval("proc-1", "000000000002,2,b", Some("m2"), None)).unwrap();

        let latest = store
            .find_latest_evaluation("proc-1", Some("000000000001,1,a"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.sort_key, "000000000001,1,a");
    }

    #[test]
    fn saving_twice_is_idempotent() {
        let store = store();
        let e = eval("proc-1", "000000000001,1,a", Some("m1"), None);
        store.save_evaluation(&e).unwrap();
        store.save_evaluation(&e).unwrap();
        assert_eq!(store.find_evaluations("proc-1", None, None).unwrap().len(), 1);
    }

    #[test]
    fn dedup_by_deep_hash() {
        let store = store();
        store
            .save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), Some("dh-1")))
            .unwrap();
        let found = store.find_by_deep_hash("proc-1", "dh-1").unwrap().unwrap();
        assert_eq!(found.sort_key, "000000000001,1,a");
        assert!(store.find_by_deep_hash("proc-1", "dh-missing").unwrap().is_none());
    }

    #[test]
    fn message_id_presence_probe() {
        let store = store();
        store
            .save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), None))
            .unwrap();
        assert!(store.find_message_id("proc-1", "m1").unwrap());
        assert!(!store.find_message_id("proc-1", "m-other").unwrap());
    }

    #[test]
    fn find_by_message_id_resolves_the_evaluation() {
        let store = store();
        store
            .save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), None))
            .unwrap();
        let found = store.find_by_message_id("proc-1", "m1").unwrap().unwrap();
        assert_eq!(found.sort_key, "000000000001,1,a");
        assert!(store.find_by_message_id("proc-1", "m-other").unwrap().is_none());
    }

    #[test]
    fn find_evaluation_at_exact_sort_key() {
        let store = store();
        store
            .save_evaluation(&eval("proc-1", "000000000001,1,a", Some("m1"), None))
            .unwrap();
        assert!(store.find_evaluation_at("proc-1", "000000000001,1,a").unwrap().is_some());
        assert!(store.find_evaluation_at("proc-1", "000000000002,2,b").unwrap().is_none());
    }

    #[test]
    fn prefix_process_ids_do_not_leak_into_each_other() {
        let store = store();
        store.save_evaluation(&eval("1", "000000000001,1,a", Some("m1"), None)).unwrap();
        store.save_evaluation(&eval("10", "000000000002,2,b", Some("m2"), None)).unwrap();

        let evals = store.find_evaluations("1", None, None).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].process_id, "1");

        let latest = store.find_latest_evaluation("1", None).unwrap().unwrap();
        assert_eq!(latest.process_id, "1");
    }

    #[test]
    fn process_save_is_idempotent_once_recorded() {
        let store = store();
        let p = Process {
            id: "proc-1".to_string(),
            owner: "owner-1".to_string(),
            signature: None,
            data: None,
            anchor: None,
            tags: vec![],
            block: Block {
                height: 1,
                timestamp: 1,
            },
        };
        store.save_process(&p).unwrap();
        let mut p2 = p.clone();
        p2.owner = "owner-2".to_string();
        store.save_process(&p2).unwrap();

        let found = store.find_process("proc-1").unwrap().unwrap();
        assert_eq!(found.owner, "owner-1");
    }
}
