use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::decimal::Money;

/// flat extraction map: business key -> extracted value, insertion-ordered
pub type FlatMap = IndexMap<String, FieldValue>;

/// one extracted value: text, number, or a list of sub-records (table rows)
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(Decimal),
    Bool(bool),
    Rows(Vec<FlatMap>),
    Record(FlatMap),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn number(d: Decimal) -> Self {
        FieldValue::Number(d)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// string rendering of text and number values
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(d) => Some(d.to_string()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Rows(_) | FieldValue::Record(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(d) => Some(*d),
            FieldValue::Text(s) => clean_number(s),
            _ => None,
        }
    }

    pub fn as_money(&self) -> Option<Money> {
        match self {
            FieldValue::Number(d) => Some(Money::from_decimal(*d)),
            FieldValue::Text(s) => clean_currency(s),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[FlatMap]> {
        match self {
            FieldValue::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// convert into a json value for nested-mode trees and artifacts
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Number(d) => serde_json::Number::from_f64(d.to_f64().unwrap_or(0.0))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Rows(rows) => serde_json::Value::Array(
                rows.iter()
                    .map(|row| {
                        serde_json::Value::Object(
                            row.iter()
                                .map(|(k, v)| (k.clone(), v.to_json()))
                                .collect(),
                        )
                    })
                    .collect(),
            ),
            FieldValue::Record(record) => serde_json::Value::Object(
                record.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

// numbers serialize as json numbers so artifacts read naturally
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Number(d) => serializer.serialize_f64(d.to_f64().unwrap_or(0.0)),
            FieldValue::Rows(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
            FieldValue::Record(record) => {
                let mut map = serializer.serialize_map(Some(record.len()))?;
                for (k, v) in record {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Decimal> for FieldValue {
    fn from(d: Decimal) -> Self {
        FieldValue::Number(d)
    }
}

/// convert '$1,627.74' or '1,627.74' to cents-rounded money; None on empty/invalid
pub fn clean_currency(text: &str) -> Option<Money> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<Decimal>().ok().map(Money::from_decimal)
}

/// numeric table-cell cleaner, 4 decimal places
pub fn clean_number(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<Decimal>().ok().map(|d| d.round_dp(4))
}

fn mdy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2})/(\d{2})/(\d{4})$").unwrap())
}

/// convert MM/DD/YYYY to YYYY-MM-DD; ill-formed inputs pass through unchanged
pub fn to_iso_date(date: &str) -> String {
    let trimmed = date.trim();
    match mdy_re().captures(trimmed) {
        Some(c) => format!("{}-{}-{}", &c[3], &c[1], &c[2]),
        None => trimmed.to_string(),
    }
}

/// parsed pieces of a combined US address string
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressParts {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

fn full_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?),\s*(.+?),\s*([A-Z]{2})\s+(\d{5}(?:-\d{4})?)$").unwrap()
    })
}

fn loose_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?),\s*(.+?)\s+([A-Z]{2})\s+(\d{5}(?:-\d{4})?)$").unwrap()
    })
}

/// parse '748 Thompson Island, Milwaukee, WI 53288' into street/city/state/zip
pub fn parse_address(address: &str) -> AddressParts {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return AddressParts::default();
    }
    for re in [full_address_re(), loose_address_re()] {
        if let Some(c) = re.captures(trimmed) {
            return AddressParts {
                street: Some(c[1].trim().to_string()),
                city: Some(c[2].trim().to_string()),
                state: Some(c[3].to_string()),
                zip: Some(c[4].to_string()),
            };
        }
    }
    AddressParts {
        street: Some(trimmed.to_string()),
        ..AddressParts::default()
    }
}

fn csz_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?),\s*([A-Z]{2})\s+(\d{5}(?:-\d{4})?)$").unwrap())
}

/// parse 'City, ST 12345' into (city, state, zip)
pub fn parse_city_state_zip(csz: &str) -> (Option<String>, Option<String>, Option<String>) {
    let trimmed = csz.trim();
    if trimmed.is_empty() {
        return (None, None, None);
    }
    if let Some(c) = csz_re().captures(trimmed) {
        return (
            Some(c[1].trim().to_string()),
            Some(c[2].to_string()),
            Some(c[3].to_string()),
        );
    }
    // fallback: split on comma
    let parts: Vec<&str> = trimmed.split(',').collect();
    if parts.len() >= 2 {
        let city = parts[0].trim().to_string();
        let rest: Vec<&str> = parts[parts.len() - 1].split_whitespace().collect();
        let state = rest.first().map(|s| s.to_string());
        let zip = rest.get(1).map(|s| s.to_string());
        return (Some(city), state, zip);
    }
    (Some(trimmed.to_string()), None, None)
}

/// split a name into (first, last); pre-split names win, else split on whitespace
pub fn split_name(
    full_name: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> (Option<String>, Option<String>) {
    if first_name.is_some() || last_name.is_some() {
        return (
            first_name.map(|s| s.to_string()),
            last_name.map(|s| s.to_string()),
        );
    }
    let Some(full) = full_name.map(str::trim).filter(|s| !s.is_empty()) else {
        return (None, None);
    };
    let parts: Vec<&str> = full.split_whitespace().collect();
    if parts.len() == 1 {
        return (Some(full.to_string()), None);
    }
    (Some(parts[0].to_string()), Some(parts[1..].join(" ")))
}
