//! Validation and normalisation of model rows into [`TariffRecord`]s.
//!
//! Every intermediate row ends as exactly one of two things: one or more
//! canonical records, or a [`Rejection`] with a reason code. A rejected row
//! never affects its siblings, with one exception: rows of the same region
//! that share a natural key but disagree on values are all rejected as
//! [`RejectReason::ConflictingRow`], since there is no way to tell which
//! one the table meant. Identical duplicates collapse into one record.

use crate::buckets::BucketVocabulary;
use crate::model::{NaturalKey, TariffRecord};
use crate::pipeline::parse::IntermediateRow;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Upper bound for a free-day count.
pub const MAX_FREE_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingField,
    TypeMismatch,
    UnknownBucket,
    OutOfRangeValue,
    ConflictingRow,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingField => "missing_field",
            RejectReason::TypeMismatch => "type_mismatch",
            RejectReason::UnknownBucket => "unknown_bucket",
            RejectReason::OutOfRangeValue => "out_of_range_value",
            RejectReason::ConflictingRow => "conflicting_row",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A row the validator refused, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Position of the row in the model output.
    pub row_index: usize,
    pub detail: String,
    pub raw: Value,
}

/// Validator output for one row (or one equipment of an expanded row).
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    Record(TariffRecord),
    Rejected(Rejection),
}

#[derive(Debug)]
struct RowError {
    reason: RejectReason,
    detail: String,
}

impl RowError {
    fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

type RowResult<T> = Result<T, RowError>;

// ── Field aliases ────────────────────────────────────────────────────────

const COUNTRY: &[&str] = &["country", "countryname"];
const PORT: &[&str] = &[
    "port",
    "portname",
    "pod",
    "pol",
    "portofdischarge",
    "portofloading",
    "location",
];
const LINE: &[&str] = &["line", "linername", "liner", "shippingline", "carrier"];
const EQUIPMENT: &[&str] = &[
    "equipmenttype",
    "equipment",
    "container",
    "containertype",
    "containersize",
    "eqtype",
];
const CURRENCY: &[&str] = &["currency", "curr", "ccy"];
const FREE_DAYS: &[&str] = &["freedays", "freetime", "freeday"];
const DEMURRAGE: &[&str] = &["demurrage", "demurragecharges", "charges", "rates"];

/// Lower-case alphanumerics only: `"Liner_Name"` → `"linername"`.
fn normalise_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// First non-null value whose key matches one of `aliases`.
fn field<'a>(row: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    row.iter()
        .filter(|(_, v)| !v.is_null())
        .find(|(k, _)| aliases.contains(&normalise_key(k).as_str()))
        .map(|(_, v)| v)
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Validate every row of one region.
///
/// Output is ordered by source row; rows that expand to several equipments
/// yield one entry per equipment.
pub fn validate_rows(
    rows: &[IntermediateRow],
    buckets: &BucketVocabulary,
    now: DateTime<Utc>,
) -> Vec<Validated> {
    let mut records: Vec<(usize, TariffRecord)> = Vec::new();
    let mut out: Vec<(usize, Validated)> = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        match validate_row(row, buckets, now) {
            Ok(recs) => records.extend(recs.into_iter().map(|r| (index, r))),
            Err(e) => out.push((index, reject(rows, index, e))),
        }
    }

    // Group by natural key, in first-seen order.
    let mut groups: Vec<(NaturalKey, Vec<(usize, TariffRecord)>)> = Vec::new();
    let mut position: HashMap<NaturalKey, usize> = HashMap::new();
    for (index, record) in records {
        let key = record.key();
        match position.get(&key) {
            Some(&g) => groups[g].1.push((index, record)),
            None => {
                position.insert(key.clone(), groups.len());
                groups.push((key, vec![(index, record)]));
            }
        }
    }

    for (key, members) in groups {
        let first = &members[0].1;
        if members.iter().all(|(_, r)| r.same_attributes(first)) {
            if let Some((index, record)) = members.into_iter().next() {
                out.push((index, Validated::Record(record)));
            }
            continue;
        }
        let indices: Vec<String> = members.iter().map(|(i, _)| i.to_string()).collect();
        for (index, _) in &members {
            let e = RowError::new(
                RejectReason::ConflictingRow,
                format!("rows {} disagree on {key}", indices.join(", ")),
            );
            out.push((*index, reject(rows, *index, e)));
        }
    }

    out.sort_by_key(|(index, _)| *index);
    out.into_iter().map(|(_, v)| v).collect()
}

fn reject(rows: &[IntermediateRow], index: usize, e: RowError) -> Validated {
    Validated::Rejected(Rejection {
        reason: e.reason,
        row_index: index,
        detail: e.detail,
        raw: Value::Object(rows[index].clone()),
    })
}

fn validate_row(
    row: &IntermediateRow,
    buckets: &BucketVocabulary,
    now: DateTime<Utc>,
) -> RowResult<Vec<TariffRecord>> {
    let country = required_text(row, COUNTRY, "country")?;
    let port = required_text(row, PORT, "port")?;
    let line = required_text(row, LINE, "line")?;
    let equipment = optional_text(row, EQUIPMENT, "equipment_type")?.map(|e| normalise_equipment(&e));
    let currency = currency(row)?;

    let free_days = match field(row, FREE_DAYS) {
        None => BTreeMap::new(),
        Some(Value::Object(obj)) => free_day_buckets(obj, buckets)?,
        Some(other) => {
            return Err(RowError::new(
                RejectReason::TypeMismatch,
                format!("free_days must be an object, got {other}"),
            ))
        }
    };

    let demurrage = match field(row, DEMURRAGE) {
        None => Demurrage::Absent,
        Some(Value::Object(obj)) => demurrage_table(obj, buckets)?,
        Some(other) => {
            return Err(RowError::new(
                RejectReason::TypeMismatch,
                format!("demurrage must be an object, got {other}"),
            ))
        }
    };

    let per_equipment: Vec<(String, BTreeMap<String, f64>)> = match (equipment, demurrage) {
        (Some(eq), Demurrage::Absent) => vec![(eq, BTreeMap::new())],
        (Some(eq), Demurrage::Flat(charges)) => vec![(eq, charges)],
        (Some(eq), Demurrage::ByEquipment(mut by_eq)) => match by_eq.remove(&eq) {
            Some(charges) if by_eq.is_empty() => vec![(eq, charges)],
            _ => {
                return Err(RowError::new(
                    RejectReason::TypeMismatch,
                    format!("demurrage is keyed by equipment other than {eq}"),
                ))
            }
        },
        (None, Demurrage::ByEquipment(by_eq)) if !by_eq.is_empty() => by_eq.into_iter().collect(),
        (None, _) => {
            return Err(RowError::new(
                RejectReason::MissingField,
                "equipment_type is missing",
            ))
        }
    };

    if free_days.is_empty() && per_equipment.iter().all(|(_, c)| c.is_empty()) {
        return Err(RowError::new(
            RejectReason::MissingField,
            "row has neither free days nor demurrage charges",
        ));
    }

    Ok(per_equipment
        .into_iter()
        .map(|(equipment, charges)| TariffRecord {
            country: country.clone(),
            port: port.clone(),
            line: line.clone(),
            equipment: equipment.clone(),
            currency: currency.clone(),
            free_days: free_days.clone(),
            demurrage: BTreeMap::from([(equipment, charges)]),
            last_updated: now,
        })
        .collect())
}

// ── Text fields ──────────────────────────────────────────────────────────

fn optional_text(row: &IntermediateRow, aliases: &[&str], name: &str) -> RowResult<Option<String>> {
    match field(row, aliases) {
        None => Ok(None),
        Some(Value::String(s)) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            Ok((!collapsed.is_empty()).then_some(collapsed))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(RowError::new(
            RejectReason::TypeMismatch,
            format!("{name} must be text, got {other}"),
        )),
    }
}

fn required_text(row: &IntermediateRow, aliases: &[&str], name: &str) -> RowResult<String> {
    optional_text(row, aliases, name)?
        .ok_or_else(|| RowError::new(RejectReason::MissingField, format!("{name} is missing")))
}

/// `"20' GP"` → `"20GP"`, `"40 hc"` → `"40HC"`.
pub fn normalise_equipment(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn currency(row: &IntermediateRow) -> RowResult<String> {
    let raw = required_text(row, CURRENCY, "currency")?;
    let code = match raw.as_str() {
        "$" | "US$" => "USD".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        "₹" | "Rs" | "Rs." => "INR".to_string(),
        other => other.trim().to_ascii_uppercase(),
    };
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(RowError::new(
            RejectReason::TypeMismatch,
            format!("'{raw}' is not a three-letter currency code"),
        ))
    }
}

// ── Buckets ──────────────────────────────────────────────────────────────

fn free_day_buckets(
    obj: &Map<String, Value>,
    buckets: &BucketVocabulary,
) -> RowResult<BTreeMap<String, u32>> {
    let mut out = BTreeMap::new();
    for (label, value) in obj {
        let Some(days) = integer_days(label, value)? else {
            continue;
        };
        insert_bucket(&mut out, resolve_bucket(label, buckets)?, days, label)?;
    }
    Ok(out)
}

fn integer_days(label: &str, value: &Value) -> RowResult<Option<u32>> {
    let n = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            lower
                .trim_end_matches("days")
                .trim_end_matches("day")
                .trim()
                .parse::<f64>()
                .ok()
        }
        _ => None,
    }
    .ok_or_else(|| {
        RowError::new(
            RejectReason::TypeMismatch,
            format!("free days for '{label}' is not a number: {value}"),
        )
    })?;

    if n.fract() != 0.0 {
        return Err(RowError::new(
            RejectReason::TypeMismatch,
            format!("free days for '{label}' is not a whole number: {n}"),
        ));
    }
    if !(0.0..=MAX_FREE_DAYS as f64).contains(&n) {
        return Err(RowError::new(
            RejectReason::OutOfRangeValue,
            format!("free days for '{label}' out of range: {n}"),
        ));
    }
    Ok(Some(n as u32))
}

fn resolve_bucket(label: &str, buckets: &BucketVocabulary) -> RowResult<String> {
    buckets.resolve(label).map(str::to_string).ok_or_else(|| {
        RowError::new(
            RejectReason::UnknownBucket,
            format!("'{label}' does not match a known day range"),
        )
    })
}

fn insert_bucket<T: PartialEq + Copy + fmt::Display>(
    map: &mut BTreeMap<String, T>,
    bucket: String,
    value: T,
    label: &str,
) -> RowResult<()> {
    match map.get(&bucket) {
        Some(existing) if *existing != value => Err(RowError::new(
            RejectReason::TypeMismatch,
            format!("'{label}' maps to bucket {bucket} which already holds {existing}"),
        )),
        _ => {
            map.insert(bucket, value);
            Ok(())
        }
    }
}

enum Demurrage {
    Absent,
    Flat(BTreeMap<String, f64>),
    ByEquipment(BTreeMap<String, BTreeMap<String, f64>>),
}

fn demurrage_table(obj: &Map<String, Value>, buckets: &BucketVocabulary) -> RowResult<Demurrage> {
    let nested = obj.values().filter(|v| v.is_object()).count();
    if nested == 0 {
        return Ok(Demurrage::Flat(charge_buckets(obj, buckets)?));
    }
    if nested != obj.values().filter(|v| !v.is_null()).count() {
        return Err(RowError::new(
            RejectReason::TypeMismatch,
            "demurrage mixes per-equipment tables and flat charges",
        ));
    }

    let mut by_eq = BTreeMap::new();
    for (equipment, charges) in obj {
        if let Value::Object(charges) = charges {
            by_eq.insert(
                normalise_equipment(equipment),
                charge_buckets(charges, buckets)?,
            );
        }
    }
    Ok(Demurrage::ByEquipment(by_eq))
}

fn charge_buckets(
    obj: &Map<String, Value>,
    buckets: &BucketVocabulary,
) -> RowResult<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for (label, value) in obj {
        let Some(amount) = amount(label, value)? else {
            continue;
        };
        insert_bucket(&mut out, resolve_bucket(label, buckets)?, amount, label)?;
    }
    Ok(out)
}

/// One amount, optionally wrapped in a currency code or symbol, with comma
/// thousands separators. Anything else in the cell is not a single charge.
static RE_CHARGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[A-Za-z]{3}|US\$|[$€£¥₹])?\s*(-?)\s*(?:[A-Za-z]{3}|US\$|[$€£¥₹])?\s*(\d{1,3}(?:,\d{3})+|\d+)(\.\d+)?\s*(?:[A-Za-z]{3}|[$€£¥₹])?$",
    )
    .unwrap()
});

/// Parse a charge cell such as `"USD 1,200.50"` or `"₹ 900"`.
fn parse_charge(text: &str) -> Option<f64> {
    let text = text.trim().replace('\u{2212}', "-");
    let caps = RE_CHARGE.captures(&text)?;
    let sign = caps.get(1).map_or("", |m| m.as_str());
    let whole = caps.get(2)?.as_str().replace(',', "");
    let frac = caps.get(3).map_or("", |m| m.as_str());
    format!("{sign}{whole}{frac}").parse().ok()
}

/// Coerce a charge: numbers as-is, strings through [`parse_charge`].
fn amount(label: &str, value: &Value) -> RowResult<Option<f64>> {
    let n = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => parse_charge(s),
        _ => None,
    }
    .ok_or_else(|| {
        RowError::new(
            RejectReason::TypeMismatch,
            format!("charge for '{label}' is not a number: {value}"),
        )
    })?;

    if !n.is_finite() || n < 0.0 {
        return Err(RowError::new(
            RejectReason::OutOfRangeValue,
            format!("charge for '{label}' out of range: {n}"),
        ));
    }
    Ok(Some(n))
}
