//! Durable user-state persistence for GRIND.
//!
//! The core only assumes a durable string-to-string mapping whose writes can
//! reject oversized payloads ([`KvStore`]). [`StateStore`] layers the
//! collection snapshot and the per-problem user flags on top of that
//! capability, degrading to a reduced snapshot when the budget runs out.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grind_core::{FlagKind, FlagSets, ProblemRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "grind-storage";

/// Records kept when a full snapshot write exceeds the storage budget.
pub const TRUNCATION_LIMIT: usize = 500;

/// Default byte budget for the file-backed store.
pub const DEFAULT_BYTE_BUDGET: u64 = 5 * 1024 * 1024;

const KEY_COLLECTION: &str = "collection";
const KEY_COMPANIES: &str = "collection-companies";
const KEY_TOPICS: &str = "collection-topics";
const KEY_TIME_PERIODS: &str = "collection-time-periods";
const KEY_SAVED_AT: &str = "collection-saved-at";
const KEY_TRUNCATED: &str = "collection-truncated";
const KEY_FLAG_COMPLETED: &str = "flag-completed";
const KEY_FLAG_FOR_REVISION: &str = "flag-for-revision";

const ALL_KEYS: [&str; 8] = [
    KEY_COLLECTION,
    KEY_COMPANIES,
    KEY_TOPICS,
    KEY_TIME_PERIODS,
    KEY_SAVED_AT,
    KEY_TRUNCATED,
    KEY_FLAG_COMPLETED,
    KEY_FLAG_FOR_REVISION,
];

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable mapping from string key to string value. `put` may reject a
/// payload that would push usage past the store's byte budget.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn put(&mut self, key: &str, value: &str) -> Result<(), KvError>;

    async fn remove(&mut self, key: &str) -> Result<(), KvError>;

    async fn used_bytes(&self) -> Result<u64, KvError>;

    fn byte_budget(&self) -> Option<u64>;
}

/// One file per key under a state directory, written atomically via a
/// temp-file rename.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
    byte_budget: Option<u64>,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>, byte_budget: Option<u64>) -> Self {
        Self {
            root: root.into(),
            byte_budget,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.root.join(safe)
    }

    async fn scan_used_bytes(&self) -> Result<u64, KvError> {
        let mut total = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match tokio::fs::read_to_string(self.key_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.key_path(key);

        if let Some(budget) = self.byte_budget {
            let existing = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            let prospective =
                self.scan_used_bytes().await? - existing + value.len() as u64;
            if prospective > budget {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let temp = self.root.join(format!(
            ".{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ));
        tokio::fs::write(&temp, value).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn remove(&mut self, key: &str) -> Result<(), KvError> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn used_bytes(&self) -> Result<u64, KvError> {
        self.scan_used_bytes().await
    }

    fn byte_budget(&self) -> Option<u64> {
        self.byte_budget
    }
}

/// Ephemeral store for sessions that should not touch disk, and for
/// exercising quota behavior with an exact byte budget.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: HashMap<String, String>,
    byte_budget: Option<u64>,
}

impl MemoryKvStore {
    pub fn new(byte_budget: Option<u64>) -> Self {
        Self {
            entries: HashMap::new(),
            byte_budget,
        }
    }

    fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.get(key).cloned())
    }

    async fn put(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        if let Some(budget) = self.byte_budget {
            let existing = self
                .entries
                .get(key)
                .map(|v| (key.len() + v.len()) as u64)
                .unwrap_or(0);
            let prospective =
                self.total_bytes() - existing + (key.len() + value.len()) as u64;
            if prospective > budget {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&mut self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn used_bytes(&self) -> Result<u64, KvError> {
        Ok(self.total_bytes())
    }

    fn byte_budget(&self) -> Option<u64> {
        self.byte_budget
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("state serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The assembled durable form of the canonical collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<ProblemRecord>,
    pub companies: BTreeSet<String>,
    pub topics: BTreeSet<String>,
    pub time_periods: BTreeSet<String>,
    pub saved_at: Option<DateTime<Utc>>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersistOutcome {
    Full { saved: usize },
    Truncated { saved: usize, total: usize },
    /// Even the reduced snapshot would not fit. The in-memory collection
    /// stays valid for the session; nothing durable was guaranteed.
    Failed,
}

/// Storage health report: what is durably held and how much room is left.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub stored_records: Option<usize>,
    pub used_bytes: u64,
    pub saved_at: Option<DateTime<Utc>>,
    pub truncated: bool,
    pub percent_of_budget: Option<f64>,
}

/// Snapshot + flag persistence over a [`KvStore`].
///
/// Flag edits rewrite only their own key, so marking one problem complete
/// never re-serializes the whole dataset. Key layout is the aggregate-set
/// variant: one entry per flag kind holding the full link set.
#[derive(Debug)]
pub struct StateStore<K: KvStore> {
    kv: K,
    flags: FlagSets,
}

impl<K: KvStore> StateStore<K> {
    /// Open the store and restore both flag sets. Unreadable flag state is
    /// treated as empty, never as an error.
    pub async fn open(kv: K) -> Result<Self, StoreError> {
        let mut store = Self {
            kv,
            flags: FlagSets::default(),
        };
        store.flags.completed = store.read_flag_set(KEY_FLAG_COMPLETED).await?;
        store.flags.for_revision = store.read_flag_set(KEY_FLAG_FOR_REVISION).await?;
        Ok(store)
    }

    pub fn flags(&self) -> &FlagSets {
        &self.flags
    }

    async fn read_flag_set(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(BTreeSet::new());
        };
        match serde_json::from_str(&raw) {
            Ok(set) => Ok(set),
            Err(err) => {
                warn!(key, %err, "discarding unreadable flag state");
                Ok(BTreeSet::new())
            }
        }
    }

    /// Flip a flag and rewrite that flag's key immediately. Returns the new
    /// membership state, or `None` when the link is empty and the flag
    /// cannot be represented.
    pub async fn toggle_flag(
        &mut self,
        kind: FlagKind,
        link: &str,
    ) -> Result<Option<bool>, StoreError> {
        let Some(state) = self.flags.toggle(kind, link) else {
            return Ok(None);
        };
        let key = match kind {
            FlagKind::Completed => KEY_FLAG_COMPLETED,
            FlagKind::ForRevision => KEY_FLAG_FOR_REVISION,
        };
        let json = serde_json::to_string(self.flags.set(kind))?;
        self.kv.put(key, &json).await?;
        Ok(Some(state))
    }

    /// Persist the canonical collection plus its derived sets.
    ///
    /// A quota rejection degrades to the top [`TRUNCATION_LIMIT`] records by
    /// descending frequency; a second rejection is reported as
    /// [`PersistOutcome::Failed`] rather than an error.
    pub async fn persist_collection(
        &mut self,
        records: &[ProblemRecord],
    ) -> Result<PersistOutcome, StoreError> {
        match self.write_snapshot(records, false).await {
            Ok(()) => {
                return Ok(PersistOutcome::Full {
                    saved: records.len(),
                })
            }
            Err(StoreError::Kv(KvError::QuotaExceeded { .. })) => {}
            Err(err) => return Err(err),
        }

        warn!(
            total = records.len(),
            "storage quota exceeded, retrying with a reduced snapshot"
        );
        if records.len() > TRUNCATION_LIMIT {
            let reduced = top_by_frequency(records, TRUNCATION_LIMIT);
            match self.write_snapshot(&reduced, true).await {
                Ok(()) => {
                    return Ok(PersistOutcome::Truncated {
                        saved: reduced.len(),
                        total: records.len(),
                    })
                }
                Err(StoreError::Kv(KvError::QuotaExceeded { .. })) => {}
                Err(err) => return Err(err),
            }
        }

        warn!("collection not persisted; in-memory data remains usable this session");
        Ok(PersistOutcome::Failed)
    }

    async fn write_snapshot(
        &mut self,
        records: &[ProblemRecord],
        truncated: bool,
    ) -> Result<(), StoreError> {
        let mut companies = BTreeSet::new();
        let mut topics = BTreeSet::new();
        let mut time_periods = BTreeSet::new();
        for record in records {
            companies.extend(record.companies.iter().cloned());
            topics.extend(record.topics.iter().cloned());
            time_periods.extend(record.time_periods.iter().cloned());
        }

        self.kv
            .put(KEY_COLLECTION, &serde_json::to_string(records)?)
            .await?;
        self.kv
            .put(KEY_COMPANIES, &serde_json::to_string(&companies)?)
            .await?;
        self.kv
            .put(KEY_TOPICS, &serde_json::to_string(&topics)?)
            .await?;
        self.kv
            .put(KEY_TIME_PERIODS, &serde_json::to_string(&time_periods)?)
            .await?;
        self.kv.put(KEY_SAVED_AT, &Utc::now().to_rfc3339()).await?;
        self.kv
            .put(KEY_TRUNCATED, if truncated { "true" } else { "false" })
            .await?;
        Ok(())
    }

    /// Most recent successfully persisted snapshot. All four collection
    /// sub-keys must be present and readable; anything less is "no
    /// snapshot", never a partial restore.
    pub async fn load_collection(&self) -> Result<Option<Snapshot>, StoreError> {
        let Some(records_json) = self.kv.get(KEY_COLLECTION).await? else {
            return Ok(None);
        };
        let Some(companies_json) = self.kv.get(KEY_COMPANIES).await? else {
            return Ok(None);
        };
        let Some(topics_json) = self.kv.get(KEY_TOPICS).await? else {
            return Ok(None);
        };
        let Some(periods_json) = self.kv.get(KEY_TIME_PERIODS).await? else {
            return Ok(None);
        };

        let parsed = (
            serde_json::from_str::<Vec<ProblemRecord>>(&records_json),
            serde_json::from_str::<BTreeSet<String>>(&companies_json),
            serde_json::from_str::<BTreeSet<String>>(&topics_json),
            serde_json::from_str::<BTreeSet<String>>(&periods_json),
        );
        let (Ok(records), Ok(companies), Ok(topics), Ok(time_periods)) = parsed else {
            warn!("discarding unreadable collection snapshot");
            return Ok(None);
        };

        let saved_at = self
            .kv
            .get(KEY_SAVED_AT)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));
        let truncated = self
            .kv
            .get(KEY_TRUNCATED)
            .await?
            .map(|raw| raw == "true")
            .unwrap_or(false);

        Ok(Some(Snapshot {
            records,
            companies,
            topics,
            time_periods,
            saved_at,
            truncated,
        }))
    }

    /// Erase the collection snapshot and both flag sets.
    pub async fn clear_all(&mut self) -> Result<(), StoreError> {
        for key in ALL_KEYS {
            self.kv.remove(key).await?;
        }
        self.flags.clear();
        Ok(())
    }

    pub async fn status(&self) -> Result<StorageStatus, StoreError> {
        let stored_records = match self.kv.get(KEY_COLLECTION).await? {
            Some(json) => serde_json::from_str::<Vec<ProblemRecord>>(&json)
                .map(|records| records.len())
                .ok(),
            None => None,
        };
        let saved_at = self
            .kv
            .get(KEY_SAVED_AT)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));
        let truncated = self
            .kv
            .get(KEY_TRUNCATED)
            .await?
            .map(|raw| raw == "true")
            .unwrap_or(false);
        let used_bytes = self.kv.used_bytes().await?;
        let percent_of_budget = self
            .kv
            .byte_budget()
            .map(|budget| (used_bytes as f64 / budget as f64) * 100.0);

        Ok(StorageStatus {
            stored_records,
            used_bytes,
            saved_at,
            truncated,
            percent_of_budget,
        })
    }
}

/// Top `limit` records ranked by descending parsed frequency; ties keep
/// their input order.
fn top_by_frequency(records: &[ProblemRecord], limit: usize) -> Vec<ProblemRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by(|a, b| b.frequency.value().total_cmp(&a.frequency.value()));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use grind_core::RawNumber;
    use tempfile::tempdir;

    fn record(link: &str, frequency: &str) -> ProblemRecord {
        ProblemRecord {
            title: format!("Problem {link}"),
            link: link.to_string(),
            frequency: RawNumber::new(frequency),
            companies: vec!["Acme".to_string()],
            time_periods: vec!["5. All".to_string()],
            topics: vec!["array".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_writes_past_budget() {
        let mut kv = MemoryKvStore::new(Some(16));
        kv.put("k", "0123456789").await.expect("fits");
        let err = kv.put("k2", "0123456789").await.expect_err("over budget");
        assert!(matches!(err, KvError::QuotaExceeded { .. }));

        // Overwriting the same key reuses its budget share.
        kv.put("k", "9876543210").await.expect("overwrite fits");
    }

    #[tokio::test]
    async fn file_store_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let mut kv = FileKvStore::new(dir.path(), None);

        assert_eq!(kv.get("collection").await.expect("get"), None);
        kv.put("collection", "[]").await.expect("put");
        kv.put("collection", "[1]").await.expect("overwrite");
        assert_eq!(
            kv.get("collection").await.expect("get"),
            Some("[1]".to_string())
        );

        kv.remove("collection").await.expect("remove");
        assert_eq!(kv.get("collection").await.expect("get"), None);
    }

    #[tokio::test]
    async fn flag_toggle_survives_a_fresh_store() {
        let dir = tempdir().expect("tempdir");

        let mut store = StateStore::open(FileKvStore::new(dir.path(), None))
            .await
            .expect("open");
        assert_eq!(
            store
                .toggle_flag(FlagKind::Completed, "/p/1")
                .await
                .expect("toggle"),
            Some(true)
        );

        let reopened = StateStore::open(FileKvStore::new(dir.path(), None))
            .await
            .expect("reopen");
        assert!(reopened.flags().is_completed("/p/1"));
        assert!(!reopened.flags().is_for_revision("/p/1"));
    }

    #[tokio::test]
    async fn flag_toggle_without_link_is_a_noop() {
        let mut store = StateStore::open(MemoryKvStore::new(None))
            .await
            .expect("open");
        assert_eq!(
            store.toggle_flag(FlagKind::Completed, "").await.expect("toggle"),
            None
        );
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let mut store = StateStore::open(MemoryKvStore::new(None))
            .await
            .expect("open");
        let records = vec![record("/p/1", "40"), record("/p/2", "55")];

        let outcome = store.persist_collection(&records).await.expect("persist");
        assert_eq!(outcome, PersistOutcome::Full { saved: 2 });

        let snapshot = store
            .load_collection()
            .await
            .expect("load")
            .expect("snapshot");
        assert_eq!(snapshot.records, records);
        assert!(snapshot.companies.contains("Acme"));
        assert!(snapshot.topics.contains("array"));
        assert!(snapshot.time_periods.contains("5. All"));
        assert!(!snapshot.truncated);
        assert!(snapshot.saved_at.is_some());
    }

    #[tokio::test]
    async fn quota_exhaustion_degrades_to_top_records_by_frequency() {
        let records: Vec<ProblemRecord> = (0..600)
            .map(|i| record(&format!("/p/{i:04}"), &format!("{i:04}")))
            .collect();
        let full_json_len = serde_json::to_string(&records).expect("json").len() as u64;

        let mut store = StateStore::open(MemoryKvStore::new(Some(full_json_len)))
            .await
            .expect("open");
        let outcome = store.persist_collection(&records).await.expect("persist");
        assert_eq!(
            outcome,
            PersistOutcome::Truncated {
                saved: 500,
                total: 600
            }
        );

        let snapshot = store
            .load_collection()
            .await
            .expect("load")
            .expect("snapshot");
        assert_eq!(snapshot.records.len(), 500);
        assert!(snapshot.truncated);
        assert!(snapshot
            .records
            .iter()
            .all(|r| r.frequency.value() >= 100.0));
    }

    #[tokio::test]
    async fn hopeless_quota_reports_failure_without_erroring() {
        let records: Vec<ProblemRecord> = (0..600)
            .map(|i| record(&format!("/p/{i:04}"), &format!("{i:04}")))
            .collect();

        let mut store = StateStore::open(MemoryKvStore::new(Some(64)))
            .await
            .expect("open");
        let outcome = store.persist_collection(&records).await.expect("persist");
        assert_eq!(outcome, PersistOutcome::Failed);
        assert_eq!(store.load_collection().await.expect("load"), None);
    }

    #[tokio::test]
    async fn partial_snapshot_reads_as_absent() {
        let mut kv = MemoryKvStore::new(None);
        kv.put(KEY_COLLECTION, "[]").await.expect("put");
        kv.put(KEY_COMPANIES, "[]").await.expect("put");

        let store = StateStore::open(kv).await.expect("open");
        assert_eq!(store.load_collection().await.expect("load"), None);
    }

    #[tokio::test]
    async fn unreadable_snapshot_reads_as_absent() {
        let mut kv = MemoryKvStore::new(None);
        kv.put(KEY_COLLECTION, "not json").await.expect("put");
        kv.put(KEY_COMPANIES, "[]").await.expect("put");
        kv.put(KEY_TOPICS, "[]").await.expect("put");
        kv.put(KEY_TIME_PERIODS, "[]").await.expect("put");

        let store = StateStore::open(kv).await.expect("open");
        assert_eq!(store.load_collection().await.expect("load"), None);
    }

    #[tokio::test]
    async fn clear_all_erases_snapshot_and_flags() {
        let mut store = StateStore::open(MemoryKvStore::new(None))
            .await
            .expect("open");
        store
            .persist_collection(&[record("/p/1", "40")])
            .await
            .expect("persist");
        store
            .toggle_flag(FlagKind::ForRevision, "/p/1")
            .await
            .expect("toggle");

        store.clear_all().await.expect("clear");
        assert_eq!(store.load_collection().await.expect("load"), None);
        assert!(store.flags().for_revision.is_empty());

        let status = store.status().await.expect("status");
        assert_eq!(status.stored_records, None);
        assert_eq!(status.used_bytes, 0);
    }

    #[tokio::test]
    async fn status_reports_stored_count_and_budget_share() {
        let mut store = StateStore::open(MemoryKvStore::new(Some(1 << 20)))
            .await
            .expect("open");
        store
            .persist_collection(&[record("/p/1", "40"), record("/p/2", "55")])
            .await
            .expect("persist");

        let status = store.status().await.expect("status");
        assert_eq!(status.stored_records, Some(2));
        assert!(status.used_bytes > 0);
        assert!(status.saved_at.is_some());
        assert!(!status.truncated);
        let percent = status.percent_of_budget.expect("budget set");
        assert!(percent > 0.0 && percent < 100.0);
    }
}
