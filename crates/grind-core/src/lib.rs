//! Core domain model for GRIND: problem records, merge identity, user flags.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "grind-core";

/// Problem difficulty as sourced. The three known labels are matched
/// case-sensitively; anything else is preserved verbatim and ranks lowest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Other(String),
}

impl Difficulty {
    /// Rank used for ordering: HARD > MEDIUM > EASY > everything else.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Hard => 3,
            Self::Medium => 2,
            Self::Easy => 1,
            Self::Other(_) => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Easy => "EASY",
            Self::Medium => "MEDIUM",
            Self::Hard => "HARD",
            Self::Other(raw) => raw,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for Difficulty {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "EASY" => Self::Easy,
            "MEDIUM" => Self::Medium,
            "HARD" => Self::Hard,
            _ => Self::Other(raw),
        }
    }
}

impl From<Difficulty> for String {
    fn from(difficulty: Difficulty) -> Self {
        difficulty.as_str().to_string()
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric field that keeps the sourced text verbatim. Comparisons go
/// through [`RawNumber::value`]; display and export always use the raw text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawNumber(String);

impl RawNumber {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Parsed numeric value, with absent or unparseable input coerced to 0.
    pub fn value(&self) -> f64 {
        parse_leading_float(self.0.trim()).unwrap_or(0.0)
    }
}

impl fmt::Display for RawNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Longest leading prefix that reads as a decimal number, so values like
/// `"55%"` still compare as 55.
fn parse_leading_float(input: &str) -> Option<f64> {
    let bytes = input.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;

    if matches!(bytes.first(), Some(&b'+') | Some(&b'-')) {
        end += 1;
    }
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }

    if !seen_digit {
        return None;
    }
    input[..end].parse().ok()
}

/// Identity of "the same problem" across sources: the link when present,
/// the title otherwise. Records with neither cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MergeKey {
    Link(String),
    Title(String),
}

pub fn merge_key_for(link: &str, title: &str) -> Option<MergeKey> {
    if !link.trim().is_empty() {
        Some(MergeKey::Link(link.to_string()))
    } else if !title.trim().is_empty() {
        Some(MergeKey::Title(title.to_string()))
    } else {
        None
    }
}

/// One parsed row as handed over by an acquisition source, still tied to
/// the single (company, time period) context it arrived with. The two
/// historical acceptance-rate header spellings are already collapsed into
/// `acceptance_rate` by the time a row reaches this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedRecord {
    pub company: String,
    pub time_period: String,
    pub title: String,
    pub link: String,
    pub difficulty: Difficulty,
    pub frequency: RawNumber,
    pub acceptance_rate: RawNumber,
    pub topics: Vec<String>,
    #[serde(default)]
    pub extras: Vec<(String, String)>,
}

impl SourcedRecord {
    pub fn merge_key(&self) -> Option<MergeKey> {
        merge_key_for(&self.link, &self.title)
    }
}

/// Canonical merged problem record. Within a canonical collection no two
/// records share a non-empty link (or, lacking links, a title).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub title: String,
    pub link: String,
    pub difficulty: Difficulty,
    pub frequency: RawNumber,
    pub acceptance_rate: RawNumber,
    pub topics: Vec<String>,
    pub companies: Vec<String>,
    pub time_periods: Vec<String>,
    #[serde(default)]
    pub extras: Vec<(String, String)>,
}

impl ProblemRecord {
    pub fn merge_key(&self) -> Option<MergeKey> {
        merge_key_for(&self.link, &self.title)
    }

    /// Topic membership against the controlled topic vocabulary.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn topics_joined(&self) -> String {
        self.topics.join(", ")
    }

    pub fn companies_joined(&self) -> String {
        self.companies.join(", ")
    }

    pub fn time_periods_joined(&self) -> String {
        self.time_periods.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagKind {
    Completed,
    ForRevision,
}

/// User annotations keyed by problem link. A record without a link cannot
/// carry a flag; that is an accepted limitation of the data model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSets {
    pub completed: BTreeSet<String>,
    pub for_revision: BTreeSet<String>,
}

impl FlagSets {
    pub fn set(&self, kind: FlagKind) -> &BTreeSet<String> {
        match kind {
            FlagKind::Completed => &self.completed,
            FlagKind::ForRevision => &self.for_revision,
        }
    }

    fn set_mut(&mut self, kind: FlagKind) -> &mut BTreeSet<String> {
        match kind {
            FlagKind::Completed => &mut self.completed,
            FlagKind::ForRevision => &mut self.for_revision,
        }
    }

    pub fn contains(&self, kind: FlagKind, link: &str) -> bool {
        !link.is_empty() && self.set(kind).contains(link)
    }

    pub fn is_completed(&self, link: &str) -> bool {
        self.contains(FlagKind::Completed, link)
    }

    pub fn is_for_revision(&self, link: &str) -> bool {
        self.contains(FlagKind::ForRevision, link)
    }

    /// Flip membership. Returns the new state, or `None` when the link is
    /// empty and the toggle cannot be represented.
    pub fn toggle(&mut self, kind: FlagKind, link: &str) -> Option<bool> {
        if link.is_empty() {
            return None;
        }
        let set = self.set_mut(kind);
        if set.remove(link) {
            Some(false)
        } else {
            set.insert(link.to_string());
            Some(true)
        }
    }

    pub fn clear(&mut self) {
        self.completed.clear();
        self.for_revision.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_labels_are_case_sensitive() {
        assert_eq!(Difficulty::from("HARD".to_string()), Difficulty::Hard);
        assert_eq!(
            Difficulty::from("Hard".to_string()),
            Difficulty::Other("Hard".to_string())
        );
        assert_eq!(Difficulty::Other("Hard".to_string()).rank(), 0);
    }

    #[test]
    fn difficulty_rank_orders_hard_over_medium_over_easy() {
        assert!(Difficulty::Hard.rank() > Difficulty::Medium.rank());
        assert!(Difficulty::Medium.rank() > Difficulty::Easy.rank());
        assert!(Difficulty::Easy.rank() > Difficulty::default().rank());
    }

    #[test]
    fn raw_number_coerces_unparseable_to_zero() {
        assert_eq!(RawNumber::new("40").value(), 40.0);
        assert_eq!(RawNumber::new(" 0.55 ").value(), 0.55);
        assert_eq!(RawNumber::new("55%").value(), 55.0);
        assert_eq!(RawNumber::new("-1.5x").value(), -1.5);
        assert_eq!(RawNumber::new("n/a").value(), 0.0);
        assert_eq!(RawNumber::new("").value(), 0.0);
    }

    #[test]
    fn raw_number_preserves_sourced_text() {
        let n = RawNumber::new("93.1527602862278");
        assert_eq!(n.raw(), "93.1527602862278");
        assert_eq!(n.to_string(), "93.1527602862278");
    }

    #[test]
    fn merge_key_prefers_link_and_falls_back_to_title() {
        assert_eq!(
            merge_key_for("/p/1", "Two Sum"),
            Some(MergeKey::Link("/p/1".to_string()))
        );
        assert_eq!(
            merge_key_for("", "Two Sum"),
            Some(MergeKey::Title("Two Sum".to_string()))
        );
        assert_eq!(merge_key_for("  ", ""), None);
    }

    #[test]
    fn flag_toggle_flips_membership() {
        let mut flags = FlagSets::default();
        assert_eq!(flags.toggle(FlagKind::Completed, "/p/1"), Some(true));
        assert!(flags.is_completed("/p/1"));
        assert_eq!(flags.toggle(FlagKind::Completed, "/p/1"), Some(false));
        assert!(!flags.is_completed("/p/1"));
    }

    #[test]
    fn flag_toggle_on_empty_link_is_a_noop() {
        let mut flags = FlagSets::default();
        assert_eq!(flags.toggle(FlagKind::ForRevision, ""), None);
        assert!(flags.for_revision.is_empty());
    }
}
