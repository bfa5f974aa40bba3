//! Acquisition sources + delimited-text parsing for GRIND.
//!
//! Every acquisition strategy is expressed as a [`RecordSource`]: a finite
//! pull-based sequence of record batches, each batch labeled with the single
//! (company, time period) context it originated from. The merge engine is
//! written once against that capability and never sees where rows came from.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use grind_core::{Difficulty, RawNumber, SourcedRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "grind-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A batch of parsed rows sharing one originating (company, time period)
/// label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBatch {
    pub company: String,
    pub time_period: String,
    pub records: Vec<SourcedRecord>,
}

/// Acquisition capability: yields batches one at a time until exhausted.
/// Not restartable mid-stream.
#[async_trait]
pub trait RecordSource: Send {
    fn describe(&self) -> String;

    async fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError>;
}

/// Split delimited text into header-keyed rows.
///
/// Quoted cells may contain the delimiter, doubled-quote escapes, and
/// literal newlines. Blank lines and `//` comment lines are skipped. The
/// first remaining line is the header; short rows leave trailing fields
/// absent, rows with no usable cells are dropped.
pub fn parse_table(text: &str) -> Vec<Vec<(String, String)>> {
    let mut lines = split_logical_lines(text)
        .into_iter()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with("//")
        });

    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = parse_record_line(header_line)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        let values = parse_record_line(line);
        if values.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let row: Vec<(String, String)> = headers
            .iter()
            .zip(values)
            .map(|(header, value)| (header.clone(), value.trim().to_string()))
            .collect();
        rows.push(row);
    }
    rows
}

/// Record boundaries are newlines outside quotes, so a quoted cell can span
/// lines.
fn split_logical_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (idx, ch) in text.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' if !in_quotes => {
                lines.push(text[start..idx].trim_end_matches('\r'));
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < text.len() {
        lines.push(text[start..].trim_end_matches('\r'));
    }
    lines
}

/// Split one logical record into cells, unquoting as it goes. A doubled
/// quote inside a quoted cell is a literal quote.
fn parse_record_line(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                values.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    values.push(current);
    values
}

/// Build a [`SourcedRecord`] out of one header-keyed row.
///
/// The acquisition context labels win when present; `Company`/`TimePeriod`
/// cells in the row itself only apply when no context was supplied (the
/// pre-built JSON dump carries its labels inline). The two acceptance-rate
/// header spellings collapse into the one canonical field here and never
/// propagate further.
pub fn record_from_row(
    row: &[(String, String)],
    company: &str,
    time_period: &str,
) -> SourcedRecord {
    let mut record = SourcedRecord {
        company: company.to_string(),
        time_period: time_period.to_string(),
        ..Default::default()
    };

    for (header, value) in row {
        match header.as_str() {
            "Title" => record.title = value.clone(),
            "Link" => record.link = value.clone(),
            "Difficulty" => record.difficulty = Difficulty::from(value.clone()),
            "Frequency" => record.frequency = RawNumber::new(value.clone()),
            "Acceptance Rate" | "Acceptance_Rate" => {
                if record.acceptance_rate.is_empty() {
                    record.acceptance_rate = RawNumber::new(value.clone());
                }
            }
            "Topics" => record.topics = split_topics(value),
            "Company" => {
                if record.company.is_empty() && !value.is_empty() {
                    record.company = value.clone();
                }
            }
            "TimePeriod" => {
                if record.time_period.is_empty() && !value.is_empty() {
                    record.time_period = value.clone();
                }
            }
            _ => record.extras.push((header.clone(), value.clone())),
        }
    }
    record
}

/// Comma-separated topic cell into an ordered, deduplicated topic list.
pub fn split_topics(raw: &str) -> Vec<String> {
    let mut topics = Vec::new();
    for part in raw.split(',') {
        let topic = part.trim().trim_matches('"').trim().to_string();
        if !topic.is_empty() && !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    topics
}

fn batch_from_text(text: &str, company: &str, time_period: &str) -> Option<SourceBatch> {
    let rows = parse_table(text);
    if rows.is_empty() {
        return None;
    }
    let records = rows
        .iter()
        .map(|row| record_from_row(row, company, time_period))
        .collect::<Vec<_>>();
    Some(SourceBatch {
        company: company.to_string(),
        time_period: time_period.to_string(),
        records,
    })
}

/// Which (company, time period) files a [`TreeSource`] probes for.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetManifest {
    pub companies: Vec<String>,
    #[serde(default = "standard_time_periods")]
    pub time_periods: Vec<String>,
}

/// The five time-period labels the dataset ships with.
pub fn standard_time_periods() -> Vec<String> {
    [
        "1. Thirty Days",
        "2. Three Months",
        "3. Six Months",
        "4. More Than Six Months",
        "5. All",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl DatasetManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Manifest inferred from a tree root: each subdirectory is a company,
    /// probed for the standard time periods.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut companies = Vec::new();
        for entry in
            fs::read_dir(root).with_context(|| format!("reading {}", root.display()))?
        {
            let entry = entry.with_context(|| format!("reading entry under {}", root.display()))?;
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                companies.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        companies.sort();
        Ok(Self {
            companies,
            time_periods: standard_time_periods(),
        })
    }
}

/// Probes `<root>/<company>/<time period>.csv` for every pair the manifest
/// names. Gaps in the tree are expected and skipped silently.
#[derive(Debug)]
pub struct TreeSource {
    root: PathBuf,
    pairs: VecDeque<(String, String)>,
}

impl TreeSource {
    pub fn new(root: impl Into<PathBuf>, manifest: &DatasetManifest) -> Self {
        let mut pairs = VecDeque::new();
        for company in &manifest.companies {
            for period in &manifest.time_periods {
                pairs.push_back((company.clone(), period.clone()));
            }
        }
        Self {
            root: root.into(),
            pairs,
        }
    }
}

#[async_trait]
impl RecordSource for TreeSource {
    fn describe(&self) -> String {
        format!("tree:{}", self.root.display())
    }

    async fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        while let Some((company, period)) = self.pairs.pop_front() {
            let path = self.root.join(&company).join(format!("{period}.csv"));
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(SourceError::Anyhow(anyhow::Error::new(err).context(
                        format!("reading {}", path.display()),
                    )))
                }
            };
            if let Some(batch) = batch_from_text(&text, &company, &period) {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }
}

/// Walks an arbitrary folder for `.csv` files and infers each file's
/// (company, time period) label from its path.
#[derive(Debug)]
pub struct FolderSource {
    root: PathBuf,
    files: VecDeque<(PathBuf, String, String)>,
}

impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut csv_paths = Vec::new();
        collect_csv_files(&root, &mut csv_paths)
            .with_context(|| format!("walking {}", root.display()))?;
        csv_paths.sort();

        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let parts_per_file: Vec<Vec<String>> = csv_paths
            .iter()
            .map(|path| relative_parts(&root, &root_name, path))
            .collect();
        let depth = most_common_depth(&parts_per_file);

        let files = csv_paths
            .into_iter()
            .zip(parts_per_file)
            .map(|(path, parts)| {
                let (company, period) = labels_from_parts(&parts, depth);
                (path, company, period)
            })
            .collect();
        Ok(Self { root, files })
    }
}

fn collect_csv_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_csv_files(&path, out)?;
        } else if path.extension().map(|ext| ext == "csv").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

fn relative_parts(root: &Path, root_name: &str, path: &Path) -> Vec<String> {
    let mut parts = vec![root_name.to_string()];
    if let Ok(rel) = path.strip_prefix(root) {
        parts.extend(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().to_string()),
        );
    }
    parts
}

/// Dominant path depth across the walked files, ties resolved toward the
/// shallower depth.
fn most_common_depth(parts_per_file: &[Vec<String>]) -> usize {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for parts in parts_per_file {
        match counts.iter_mut().find(|(depth, _)| *depth == parts.len()) {
            Some((_, count)) => *count += 1,
            None => counts.push((parts.len(), 1)),
        }
    }
    counts.sort();
    let mut best = (0usize, 0usize);
    for (depth, count) in counts {
        if count > best.1 {
            best = (depth, count);
        }
    }
    best.0
}

fn strip_csv(name: &str) -> &str {
    name.strip_suffix(".csv").unwrap_or(name)
}

fn labels_from_parts(parts: &[String], most_common_depth: usize) -> (String, String) {
    if most_common_depth >= 3 && parts.len() >= 3 {
        return (parts[1].clone(), strip_csv(&parts[2]).to_string());
    }

    let stem = parts
        .last()
        .map(|name| strip_csv(name).to_string())
        .unwrap_or_default();
    if parts.len() > 2 {
        return (parts[parts.len() - 2].clone(), stem);
    }
    match stem.split_once(" - ") {
        Some((company, period)) => (company.to_string(), period.to_string()),
        None => ("Unknown".to_string(), stem),
    }
}

#[async_trait]
impl RecordSource for FolderSource {
    fn describe(&self) -> String {
        format!("folder:{}", self.root.display())
    }

    async fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        while let Some((path, company, period)) = self.files.pop_front() {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))
                .map_err(SourceError::Anyhow)?;
            if let Some(batch) = batch_from_text(&text, &company, &period) {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }
}

/// One pre-built JSON array of records, each carrying its own `Company` and
/// `TimePeriod` fields. Records regroup into per-label batches on load.
#[derive(Debug)]
pub struct JsonSource {
    path: PathBuf,
    batches: Option<VecDeque<SourceBatch>>,
}

impl JsonSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batches: None,
        }
    }

    async fn load(&self) -> Result<VecDeque<SourceBatch>, SourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))
            .map_err(SourceError::Anyhow)?;
        let values: Vec<JsonValue> = serde_json::from_str(&text)
            .map_err(|e| SourceError::Message(format!("invalid record dump: {e}")))?;

        let mut batches: Vec<SourceBatch> = Vec::new();
        for value in &values {
            let Some(object) = value.as_object() else {
                continue;
            };
            let row: Vec<(String, String)> = object
                .iter()
                .map(|(key, value)| (key.clone(), json_cell(value)))
                .collect();
            let record = record_from_row(&row, "", "");

            let label = (record.company.clone(), record.time_period.clone());
            match batches
                .iter_mut()
                .find(|b| b.company == label.0 && b.time_period == label.1)
            {
                Some(batch) => batch.records.push(record),
                None => batches.push(SourceBatch {
                    company: label.0,
                    time_period: label.1,
                    records: vec![record],
                }),
            }
        }
        Ok(batches.into())
    }
}

fn json_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => String::new(),
        JsonValue::Array(items) => items
            .iter()
            .map(json_cell)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[async_trait]
impl RecordSource for JsonSource {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    async fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        if self.batches.is_none() {
            self.batches = Some(self.load().await?);
        }
        Ok(self
            .batches
            .as_mut()
            .and_then(|batches| batches.pop_front()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cell<'a>(row: &'a [(String, String)], header: &str) -> Option<&'a str> {
        row.iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn quoted_cells_keep_delimiters_and_escaped_quotes() {
        let rows = parse_table(
            "Title,Topics\n\"Sum, of Two\",\"array, \"\"hash\"\" table\"\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "Title"), Some("Sum, of Two"));
        assert_eq!(cell(&rows[0], "Topics"), Some("array, \"hash\" table"));
    }

    #[test]
    fn quoted_cells_may_span_lines() {
        let rows = parse_table("Title,Link\n\"Two\nSum\",/p/1\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "Title"), Some("Two\nSum"));
        assert_eq!(cell(&rows[0], "Link"), Some("/p/1"));
    }

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        let rows = parse_table(
            "// dataset dump\n\nTitle,Link\n// a row comment\nTwo Sum,/p/1\n\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "Title"), Some("Two Sum"));
    }

    #[test]
    fn short_rows_leave_trailing_fields_absent() {
        let rows = parse_table("Title,Link,Difficulty\nTwo Sum,/p/1\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "Difficulty"), None);
    }

    #[test]
    fn rows_with_no_usable_cells_are_dropped() {
        let rows = parse_table("Title,Link\n,,\nTwo Sum,/p/1\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "Title"), Some("Two Sum"));
    }

    #[test]
    fn acceptance_rate_header_spellings_are_aliases() {
        let rows = parse_table("Title,Acceptance_Rate\nTwo Sum,0.55\n");
        let record = record_from_row(&rows[0], "Acme", "5. All");
        assert_eq!(record.acceptance_rate.raw(), "0.55");

        let rows = parse_table("Title,Acceptance Rate\nTwo Sum,0.61\n");
        let record = record_from_row(&rows[0], "Acme", "5. All");
        assert_eq!(record.acceptance_rate.raw(), "0.61");
    }

    #[test]
    fn context_labels_win_over_row_cells() {
        let rows = parse_table("Title,Company,Color\nTwo Sum,Globex,blue\n");
        let record = record_from_row(&rows[0], "Acme", "5. All");
        assert_eq!(record.company, "Acme");
        assert_eq!(record.time_period, "5. All");
        assert_eq!(record.extras, vec![("Color".to_string(), "blue".to_string())]);

        let record = record_from_row(&rows[0], "", "");
        assert_eq!(record.company, "Globex");
    }

    #[test]
    fn topics_split_trims_and_deduplicates() {
        assert_eq!(
            split_topics("array, \"hash table\" , array,"),
            vec!["array".to_string(), "hash table".to_string()]
        );
    }

    #[tokio::test]
    async fn tree_source_probes_manifest_pairs_and_skips_gaps() {
        let dir = tempdir().expect("tempdir");
        let acme = dir.path().join("Acme");
        fs::create_dir_all(&acme).expect("mkdir");
        fs::write(
            acme.join("5. All.csv"),
            "Title,Link,Frequency\nTwo Sum,/p/1,40\n",
        )
        .expect("write");

        let manifest = DatasetManifest {
            companies: vec!["Acme".to_string(), "Globex".to_string()],
            time_periods: standard_time_periods(),
        };
        let mut source = TreeSource::new(dir.path(), &manifest);

        let batch = source.next_batch().await.expect("batch").expect("some");
        assert_eq!(batch.company, "Acme");
        assert_eq!(batch.time_period, "5. All");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].link, "/p/1");

        assert!(source.next_batch().await.expect("end").is_none());
    }

    #[tokio::test]
    async fn folder_source_reads_nested_company_period_layout() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("questions");
        fs::create_dir_all(root.join("Acme")).expect("mkdir");
        fs::create_dir_all(root.join("Globex")).expect("mkdir");
        fs::write(
            root.join("Acme").join("5. All.csv"),
            "Title,Link\nTwo Sum,/p/1\n",
        )
        .expect("write");
        fs::write(
            root.join("Globex").join("5. All.csv"),
            "Title,Link\nThree Sum,/p/15\n",
        )
        .expect("write");

        let mut source = FolderSource::new(&root).expect("source");
        let mut labels = Vec::new();
        while let Some(batch) = source.next_batch().await.expect("batch") {
            labels.push((batch.company, batch.time_period));
        }
        assert_eq!(
            labels,
            vec![
                ("Acme".to_string(), "5. All".to_string()),
                ("Globex".to_string(), "5. All".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn folder_source_falls_back_to_dashed_file_names() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("flat");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(
            root.join("Acme - 5. All.csv"),
            "Title,Link\nTwo Sum,/p/1\n",
        )
        .expect("write");

        let mut source = FolderSource::new(&root).expect("source");
        let batch = source.next_batch().await.expect("batch").expect("some");
        assert_eq!(batch.company, "Acme");
        assert_eq!(batch.time_period, "5. All");
    }

    #[tokio::test]
    async fn json_source_groups_records_by_inline_labels() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dump.json");
        fs::write(
            &path,
            r#"[
                {"Title":"Two Sum","Link":"/p/1","Company":"Acme","TimePeriod":"5. All","Frequency":40},
                {"Title":"Three Sum","Link":"/p/15","Company":"Acme","TimePeriod":"5. All"},
                {"Title":"Two Sum","Link":"/p/1","Company":"Globex","TimePeriod":"5. All"}
            ]"#,
        )
        .expect("write");

        let mut source = JsonSource::new(&path);
        let first = source.next_batch().await.expect("batch").expect("some");
        assert_eq!(first.company, "Acme");
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].frequency.raw(), "40");

        let second = source.next_batch().await.expect("batch").expect("some");
        assert_eq!(second.company, "Globex");
        assert!(source.next_batch().await.expect("end").is_none());
    }
}
