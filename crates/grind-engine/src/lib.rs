//! Canonical-collection engine for GRIND: merge, filter, sort, export, and
//! the workbench lifecycle tying them to acquisition and persistence.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use grind_adapters::{RecordSource, SourceBatch};
use grind_core::{Difficulty, FlagKind, FlagSets, MergeKey, ProblemRecord, SourcedRecord};
use grind_storage::{KvStore, PersistOutcome, StateStore, StorageStatus};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grind-engine";

/// Default name for an exported view.
pub const DEFAULT_EXPORT_FILE: &str = "grind_problems.csv";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub merged: usize,
    pub skipped: usize,
}

impl MergeStats {
    pub fn seen(&self) -> usize {
        self.inserted + self.merged + self.skipped
    }

    fn absorb(&mut self, other: MergeStats) {
        self.inserted += other.inserted;
        self.merged += other.merged;
        self.skipped += other.skipped;
    }
}

/// The canonical deduplicated collection: source of truth for filtering,
/// sorting, and export. Lookup during merge goes through a key index, so a
/// batch folds in with one probe per record.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Vec<ProblemRecord>,
    index: HashMap<MergeKey, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a catalog from previously persisted records. Keyless or
    /// duplicate-keyed entries cannot occur in a well-formed snapshot and
    /// are dropped rather than trusted.
    pub fn from_records(records: Vec<ProblemRecord>) -> Self {
        let mut catalog = Self::new();
        for record in records {
            let Some(key) = record.merge_key() else {
                warn!(title = %record.title, "dropping keyless record from snapshot");
                continue;
            };
            if catalog.index.contains_key(&key) {
                warn!(?key, "dropping duplicate-keyed record from snapshot");
                continue;
            }
            catalog.index.insert(key, catalog.records.len());
            catalog.records.push(record);
        }
        catalog
    }

    pub fn records(&self) -> &[ProblemRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    pub fn companies(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|r| r.companies.iter().cloned())
            .collect()
    }

    pub fn topics(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|r| r.topics.iter().cloned())
            .collect()
    }

    pub fn time_periods(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|r| r.time_periods.iter().cloned())
            .collect()
    }

    /// Fold one source batch into the collection. Re-merging an identical
    /// batch is a no-op, and batch order does not affect the final state.
    pub fn merge_batch(&mut self, batch: &SourceBatch) -> MergeStats {
        let mut stats = MergeStats::default();
        for record in &batch.records {
            match self.merge_one(record) {
                MergeEffect::Inserted => stats.inserted += 1,
                MergeEffect::Merged => stats.merged += 1,
                MergeEffect::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    fn merge_one(&mut self, incoming: &SourcedRecord) -> MergeEffect {
        let Some(key) = incoming.merge_key() else {
            return MergeEffect::Skipped;
        };
        match self.index.get(&key) {
            Some(&idx) => {
                merge_into(&mut self.records[idx], incoming);
                MergeEffect::Merged
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(seed_record(incoming));
                MergeEffect::Inserted
            }
        }
    }
}

enum MergeEffect {
    Inserted,
    Merged,
    Skipped,
}

fn seed_record(incoming: &SourcedRecord) -> ProblemRecord {
    let mut companies = Vec::new();
    if !incoming.company.is_empty() {
        companies.push(incoming.company.clone());
    }
    let mut time_periods = Vec::new();
    if !incoming.time_period.is_empty() {
        time_periods.push(incoming.time_period.clone());
    }
    ProblemRecord {
        title: incoming.title.clone(),
        link: incoming.link.clone(),
        difficulty: incoming.difficulty.clone(),
        frequency: incoming.frequency.clone(),
        acceptance_rate: incoming.acceptance_rate.clone(),
        topics: incoming.topics.clone(),
        companies,
        time_periods,
        extras: incoming.extras.clone(),
    }
}

/// Field-level merge policy: append-unique companies and time periods,
/// strictly-higher-wins frequency and acceptance rate (the winner's sourced
/// text is kept), topic union, first-seen extras.
fn merge_into(existing: &mut ProblemRecord, incoming: &SourcedRecord) {
    if !incoming.company.is_empty() && !existing.companies.contains(&incoming.company) {
        existing.companies.push(incoming.company.clone());
    }
    if !incoming.time_period.is_empty()
        && !existing.time_periods.contains(&incoming.time_period)
    {
        existing.time_periods.push(incoming.time_period.clone());
    }
    if incoming.frequency.value() > existing.frequency.value() {
        existing.frequency = incoming.frequency.clone();
    }
    if incoming.acceptance_rate.value() > existing.acceptance_rate.value() {
        existing.acceptance_rate = incoming.acceptance_rate.clone();
    }
    for topic in &incoming.topics {
        if !existing.topics.contains(topic) {
            existing.topics.push(topic.clone());
        }
    }
    for (header, value) in &incoming.extras {
        if !existing.extras.iter().any(|(h, _)| h == header) {
            existing.extras.push((header.clone(), value.clone()));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionFilter {
    #[default]
    Any,
    Completed,
    NotCompleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevisionFilter {
    #[default]
    Any,
    Marked,
    NotMarked,
}

/// Multi-predicate query over the canonical collection. Absent fields
/// always pass; present predicates are ANDed.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub company: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub time_period: Option<String>,
    /// Matched by set membership against the record's topic list, not by
    /// substring.
    pub topic: Option<String>,
    pub min_frequency: f64,
    pub min_acceptance_percent: f64,
    pub completion: CompletionFilter,
    pub revision: RevisionFilter,
    pub search_text: Option<String>,
}

impl FilterQuery {
    pub fn matches(&self, record: &ProblemRecord, flags: &FlagSets) -> bool {
        if let Some(company) = &self.company {
            if !record.companies.iter().any(|c| c == company) {
                return false;
            }
        }
        if let Some(difficulty) = &self.difficulty {
            if record.difficulty != *difficulty {
                return false;
            }
        }
        if let Some(period) = &self.time_period {
            if !record.time_periods.iter().any(|p| p == period) {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if !record.has_topic(topic) {
                return false;
            }
        }
        if self.min_frequency > 0.0 && record.frequency.value() < self.min_frequency {
            return false;
        }
        if self.min_acceptance_percent > 0.0
            && record.acceptance_rate.value() * 100.0 < self.min_acceptance_percent
        {
            return false;
        }

        match self.completion {
            CompletionFilter::Any => {}
            CompletionFilter::Completed => {
                if !flags.is_completed(&record.link) {
                    return false;
                }
            }
            CompletionFilter::NotCompleted => {
                if flags.is_completed(&record.link) {
                    return false;
                }
            }
        }
        match self.revision {
            RevisionFilter::Any => {}
            RevisionFilter::Marked => {
                if !flags.is_for_revision(&record.link) {
                    return false;
                }
            }
            RevisionFilter::NotMarked => {
                if flags.is_for_revision(&record.link) {
                    return false;
                }
            }
        }

        if let Some(search) = &self.search_text {
            let needle = search.to_lowercase();
            if !needle.is_empty() && !search_matches(record, &needle) {
                return false;
            }
        }
        true
    }
}

/// Case-insensitive substring match against title, any company, any time
/// period, or the joined topic list. One hit is enough.
fn search_matches(record: &ProblemRecord, needle: &str) -> bool {
    record.title.to_lowercase().contains(needle)
        || record
            .companies
            .iter()
            .any(|c| c.to_lowercase().contains(needle))
        || record
            .time_periods
            .iter()
            .any(|p| p.to_lowercase().contains(needle))
        || record.topics_joined().to_lowercase().contains(needle)
}

/// Stable, order-preserving filter: the view keeps the collection's record
/// order and never resorts.
pub fn filter_records<'a>(
    records: &'a [ProblemRecord],
    query: &FilterQuery,
    flags: &FlagSets,
) -> Vec<&'a ProblemRecord> {
    records
        .iter()
        .filter(|record| query.matches(record, flags))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Company,
    TimePeriod,
    Difficulty,
    Title,
    Frequency,
    AcceptanceRate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Stable sort producing a new ordering; the input view is never mutated.
/// Descending flips the comparator, so equal keys keep their input order
/// either way.
pub fn sort_view<'a>(
    view: &[&'a ProblemRecord],
    key: SortKey,
    direction: SortDirection,
) -> Vec<&'a ProblemRecord> {
    let mut sorted = view.to_vec();
    sorted.sort_by(|a, b| {
        let ordering = compare_records(a, b, key);
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
    sorted
}

fn compare_records(a: &ProblemRecord, b: &ProblemRecord, key: SortKey) -> Ordering {
    match key {
        // Multi-valued records deliberately sort on their first label only.
        SortKey::Company => compare_text(first(&a.companies), first(&b.companies)),
        SortKey::TimePeriod => compare_text(first(&a.time_periods), first(&b.time_periods)),
        SortKey::Title => compare_text(&a.title, &b.title),
        SortKey::Difficulty => a.difficulty.rank().cmp(&b.difficulty.rank()),
        SortKey::Frequency => a.frequency.value().total_cmp(&b.frequency.value()),
        SortKey::AcceptanceRate => a
            .acceptance_rate
            .value()
            .total_cmp(&b.acceptance_rate.value()),
    }
}

fn first(values: &[String]) -> &str {
    values.first().map(String::as_str).unwrap_or("")
}

/// Case-folded comparison with a raw tiebreak, standing in for locale
/// collation.
fn compare_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no records to export")]
    NoRecords,
}

const PREFERRED_COLUMNS: [&str; 8] = [
    "Company",
    "TimePeriod",
    "Difficulty",
    "Title",
    "Frequency",
    "Acceptance Rate",
    "Link",
    "Topics",
];

/// Render a view as CSV: the preferred column prefix, then any extra source
/// columns in first-seen order, then the derived `Completed` /
/// `ForRevision` columns computed from the flag sets at export time.
pub fn export_csv(records: &[&ProblemRecord], flags: &FlagSets) -> Result<String, ExportError> {
    if records.is_empty() {
        return Err(ExportError::NoRecords);
    }

    let mut columns: Vec<String> = PREFERRED_COLUMNS.iter().map(|c| c.to_string()).collect();
    for record in records {
        for (header, _) in &record.extras {
            if !columns.iter().any(|c| c == header) {
                columns.push(header.clone());
            }
        }
    }
    columns.push("Completed".to_string());
    columns.push("ForRevision".to_string());

    let mut out = String::new();
    out.push_str(
        &columns
            .iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for record in records {
        let row = columns
            .iter()
            .map(|column| csv_escape(&cell_value(record, column, flags)))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&row);
        out.push('\n');
    }
    Ok(out)
}

fn cell_value(record: &ProblemRecord, column: &str, flags: &FlagSets) -> String {
    match column {
        "Company" => record.companies_joined(),
        "TimePeriod" => record.time_periods_joined(),
        "Difficulty" => record.difficulty.as_str().to_string(),
        "Title" => record.title.clone(),
        "Frequency" => record.frequency.raw().to_string(),
        "Acceptance Rate" => record.acceptance_rate.raw().to_string(),
        "Link" => record.link.clone(),
        "Topics" => record.topics_joined(),
        "Completed" => yes_no(flags.is_completed(&record.link)),
        "ForRevision" => yes_no(flags.is_for_revision(&record.link)),
        other => record
            .extras
            .iter()
            .find(|(h, _)| h == other)
            .map(|(_, v)| v.clone())
            .unwrap_or_default(),
    }
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

/// Standard CSV quoting: wrap when the value contains the delimiter, a
/// quote, or a newline, doubling internal quotes.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub batches: usize,
    pub parsed_records: usize,
    pub inserted: usize,
    pub merged: usize,
    pub skipped: usize,
    pub total_records: usize,
    pub persist: PersistOutcome,
}

/// Owner of the shared mutable state (canonical collection + flag sets)
/// with an explicit lifecycle: open loads the last snapshot or starts
/// empty; mutation happens through ingest / toggle / clear; reads go
/// through [`Workbench::view`].
#[derive(Debug)]
pub struct Workbench<K: KvStore> {
    catalog: Catalog,
    store: StateStore<K>,
}

impl<K: KvStore> Workbench<K> {
    pub async fn open(kv: K) -> Result<Self> {
        let store = StateStore::open(kv).await?;
        let catalog = match store.load_collection().await? {
            Some(snapshot) => {
                info!(
                    records = snapshot.records.len(),
                    truncated = snapshot.truncated,
                    "restored collection snapshot"
                );
                Catalog::from_records(snapshot.records)
            }
            None => Catalog::new(),
        };
        Ok(Self { catalog, store })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn flags(&self) -> &FlagSets {
        self.store.flags()
    }

    /// Drain a source one batch at a time, folding each into the canonical
    /// collection before the next is requested, then persist the result.
    pub async fn ingest(&mut self, source: &mut dyn RecordSource) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let description = source.describe();

        let span = info_span!("ingest", %run_id, source = %description);
        let _guard = span.enter();

        let mut batches = 0usize;
        let mut stats = MergeStats::default();
        while let Some(batch) = source.next_batch().await? {
            stats.absorb(self.catalog.merge_batch(&batch));
            batches += 1;
        }

        let persist = self
            .store
            .persist_collection(self.catalog.records())
            .await?;
        info!(
            %run_id,
            source = %description,
            batches,
            parsed = stats.seen(),
            total = self.catalog.len(),
            "ingest run complete"
        );

        Ok(IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: description,
            batches,
            parsed_records: stats.seen(),
            inserted: stats.inserted,
            merged: stats.merged,
            skipped: stats.skipped,
            total_records: self.catalog.len(),
            persist,
        })
    }

    pub async fn toggle_flag(&mut self, kind: FlagKind, link: &str) -> Result<Option<bool>> {
        Ok(self.store.toggle_flag(kind, link).await?)
    }

    pub async fn persist(&mut self) -> Result<PersistOutcome> {
        Ok(self
            .store
            .persist_collection(self.catalog.records())
            .await?)
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.store.clear_all().await?;
        self.catalog.clear();
        Ok(())
    }

    pub async fn status(&self) -> Result<StorageStatus> {
        Ok(self.store.status().await?)
    }

    /// Filtered and optionally sorted read of the collection.
    pub fn view(
        &self,
        query: &FilterQuery,
        sort: Option<(SortKey, SortDirection)>,
    ) -> Vec<&ProblemRecord> {
        let filtered = filter_records(self.catalog.records(), query, self.store.flags());
        match sort {
            Some((key, direction)) => sort_view(&filtered, key, direction),
            None => filtered,
        }
    }
}
