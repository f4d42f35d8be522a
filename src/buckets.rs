//! Canonical free-day / demurrage time buckets.
//!
//! Tariff sheets label the same day range a dozen ways ("Day 1-5",
//! "0–5 days", "1 to 5"). Every label is reduced to `(start, end)` day
//! bounds and matched against a closed vocabulary; anything that does not
//! match is an `UnknownBucket` rejection upstream.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One canonical bucket. `end = None` means open-ended ("31+").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub id: String,
    pub start: u32,
    #[serde(default)]
    pub end: Option<u32>,
}

impl BucketSpec {
    pub fn new(id: impl Into<String>, start: u32, end: Option<u32>) -> Self {
        Self {
            id: id.into(),
            start,
            end,
        }
    }

    fn matches(&self, start: u32, end: Option<u32>) -> bool {
        // "Day 1-5" and "0-5" describe the same first bucket.
        let start_ok = self.start == start || (self.start == 0 && start == 1);
        start_ok && self.end == end
    }
}

/// Closed set of bucket ids accepted by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BucketSpec>", into = "Vec<BucketSpec>")]
pub struct BucketVocabulary {
    buckets: Vec<BucketSpec>,
}

impl Default for BucketVocabulary {
    fn default() -> Self {
        Self {
            buckets: vec![
                BucketSpec::new("0-5", 0, Some(5)),
                BucketSpec::new("6-10", 6, Some(10)),
                BucketSpec::new("11-15", 11, Some(15)),
                BucketSpec::new("16-20", 16, Some(20)),
                BucketSpec::new("21-30", 21, Some(30)),
                BucketSpec::new("31+", 31, None),
            ],
        }
    }
}

impl TryFrom<Vec<BucketSpec>> for BucketVocabulary {
    type Error = String;

    fn try_from(buckets: Vec<BucketSpec>) -> Result<Self, Self::Error> {
        Self::new(buckets)
    }
}

impl From<BucketVocabulary> for Vec<BucketSpec> {
    fn from(v: BucketVocabulary) -> Self {
        v.buckets
    }
}

impl BucketVocabulary {
    /// Validate and build a vocabulary: ids unique and non-empty, `start <= end`.
    pub fn new(buckets: Vec<BucketSpec>) -> Result<Self, String> {
        if buckets.is_empty() {
            return Err("bucket vocabulary must not be empty".into());
        }
        let mut seen = HashSet::new();
        for b in &buckets {
            if b.id.trim().is_empty() {
                return Err("bucket id must not be empty".into());
            }
            if !seen.insert(b.id.as_str()) {
                return Err(format!("duplicate bucket id '{}'", b.id));
            }
            if let Some(end) = b.end {
                if end < b.start {
                    return Err(format!(
                        "bucket '{}' ends ({end}) before it starts ({})",
                        b.id, b.start
                    ));
                }
            }
        }
        Ok(Self { buckets })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.id.as_str())
    }

    /// Map a free-text range label onto a canonical bucket id.
    pub fn resolve(&self, label: &str) -> Option<&str> {
        let trimmed = label.trim();
        if let Some(b) = self.buckets.iter().find(|b| b.id == trimmed) {
            return Some(&b.id);
        }
        let (start, end) = parse_range(trimmed)?;
        self.buckets
            .iter()
            .find(|b| b.matches(start, end))
            .map(|b| b.id.as_str())
    }
}

static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Markers meaning "strictly after N".
const EXCLUSIVE_OPEN: &[&str] = &[">", "after", "beyond", "over", "more than", "exceeding"];
/// Markers meaning "N and later".
const INCLUSIVE_OPEN: &[&str] = &["+", "above", "onward", "thereafter", "and more", "or more"];

/// Reduce a day-range label to `(start, end)` bounds.
///
/// Returns `None` when no day numbers can be found or the range is inverted.
pub fn parse_range(label: &str) -> Option<(u32, Option<u32>)> {
    let lower = label
        .to_lowercase()
        .replace(['\u{2013}', '\u{2014}', '\u{2212}'], "-");

    let numbers: Vec<u32> = RE_NUMBER
        .find_iter(&lower)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();

    match numbers.as_slice() {
        [a, b] if a <= b => Some((*a, Some(*b))),
        [n] => {
            if EXCLUSIVE_OPEN.iter().any(|m| lower.contains(m)) {
                Some((n + 1, None))
            } else if INCLUSIVE_OPEN.iter().any(|m| lower.contains(m)) {
                Some((*n, None))
            } else {
                Some((*n, Some(*n)))
            }
        }
        _ => None,
    }
}
