use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::rules::model::{Rule, RuleFile, RuleKind, RuleLibrary};
use crate::types::DocumentType;
use crate::value::{clean_currency, clean_number, FieldValue, FlatMap};

/// outcome of applying one rule, aggregated into the run report
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub status: RuleStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleStatus {
    /// wrote at least one value
    Applied,
    /// ran but found nothing to write
    NoMatch,
    /// skipped (unknown kind, missing required field)
    Skipped(String),
    /// failed (bad pattern, bad group index); never aborts the document
    Failed(String),
}

// ---------------------------------------------------------------------------
// nested path helpers
// ---------------------------------------------------------------------------

fn path_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\[(\d+)\]$").unwrap())
}

fn parse_part(part: &str) -> (&str, Option<usize>) {
    match path_part_re().captures(part) {
        Some(c) => {
            let key_end = c.get(1).map(|m| m.end()).unwrap_or(0);
            let idx = c[2].parse::<usize>().ok();
            (&part[..key_end], idx)
        }
        None => (part, None),
    }
}

/// set a value deep inside a json tree using a dotted path that may include
/// array indices, e.g. `deal.parties[0].employment[0].employer_name`
pub fn set_nested(target: &mut Value, dotted_path: &str, value: Value) {
    let parts: Vec<&str> = dotted_path.split('.').collect();
    let mut current = target;
    for part in &parts[..parts.len().saturating_sub(1)] {
        let (key, idx) = parse_part(part);
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = match current.as_object_mut() {
            Some(m) => m,
            None => return,
        };
        let slot = map
            .entry(key.to_string())
            .or_insert_with(|| match idx {
                Some(_) => Value::Array(Vec::new()),
                None => Value::Object(serde_json::Map::new()),
            });
        current = match idx {
            Some(i) => {
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                let arr = match slot.as_array_mut() {
                    Some(a) => a,
                    None => return,
                };
                while arr.len() <= i {
                    arr.push(Value::Object(serde_json::Map::new()));
                }
                &mut arr[i]
            }
            None => slot,
        };
    }

    if let Some(leaf) = parts.last() {
        let (key, idx) = parse_part(leaf);
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = match current.as_object_mut() {
            Some(m) => m,
            None => return,
        };
        match idx {
            Some(i) => {
                let slot = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                if let Some(arr) = slot.as_array_mut() {
                    while arr.len() <= i {
                        arr.push(Value::Null);
                    }
                    arr[i] = value;
                }
            }
            None => {
                map.insert(key.to_string(), value);
            }
        }
    }
}

/// read a value from a nested json tree using a dotted path
pub fn get_nested<'a>(source: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = source;
    for part in dotted_path.split('.') {
        let (key, idx) = parse_part(part);
        current = current.as_object()?.get(key)?;
        if let Some(i) = idx {
            current = current.as_array()?.get(i)?;
        }
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// markdown table parser (mode a)
// ---------------------------------------------------------------------------

type MdTable = Vec<Vec<String>>;

fn separator_cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-:]+$").unwrap())
}

/// parse pipe-delimited tables out of markdown, skipping separator rows
pub fn parse_markdown_tables(markdown: &str) -> Vec<MdTable> {
    let mut tables = Vec::new();
    let lines: Vec<&str> = markdown.split('\n').collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if line.starts_with('|') && line.ends_with('|') {
            let mut rows: MdTable = Vec::new();
            while i < lines.len() {
                let row_line = lines[i].trim();
                if !(row_line.starts_with('|') && row_line.ends_with('|')) {
                    break;
                }
                let mut cells: Vec<String> =
                    row_line.split('|').map(|c| c.trim().to_string()).collect();
                // leading and trailing pipe produce empty edge cells
                cells.remove(0);
                cells.pop();
                let is_separator = !cells.is_empty()
                    && cells
                        .iter()
                        .filter(|c| !c.is_empty())
                        .all(|c| separator_cell_re().is_match(c));
                if !is_separator {
                    rows.push(cells);
                }
                i += 1;
            }
            if !rows.is_empty() {
                tables.push(rows);
            }
        } else {
            i += 1;
        }
    }
    tables
}

/// pick the table whose first rows contain every header keyword
fn find_table_by_headers<'a>(tables: &'a [MdTable], keywords: &[String]) -> Option<&'a MdTable> {
    tables.iter().find(|table| {
        let header_text: String = table
            .iter()
            .take(3)
            .map(|row| row.join(" "))
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        keywords
            .iter()
            .all(|kw| header_text.contains(&kw.to_uppercase()))
    })
}

fn numeric_cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\$\d,.\-]+$").unwrap())
}

fn data_cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$?[\d,]+\.?\d*$").unwrap())
}

/// column name -> index, taken from the most text-heavy of the first 3 rows
fn build_column_index(table: &MdTable) -> IndexMap<String, usize> {
    let mut best_row: &Vec<String> = match table.first() {
        Some(row) => row,
        None => return IndexMap::new(),
    };
    let mut best_score: i64 = -1;
    for row in table.iter().take(3) {
        let text_cells = row
            .iter()
            .filter(|c| !c.trim().is_empty() && !numeric_cell_re().is_match(c.trim()))
            .count() as i64;
        if text_cells > best_score {
            best_score = text_cells;
            best_row = row;
        }
    }
    let mut index = IndexMap::new();
    for (i, cell) in best_row.iter().enumerate() {
        let clean = cell.trim().to_uppercase().replace('-', "");
        let clean = clean.trim().to_string();
        if !clean.is_empty() {
            index.insert(clean, i);
        }
    }
    index
}

fn find_row_by_label<'a>(table: &'a MdTable, label: &str) -> Option<&'a Vec<String>> {
    let label_upper = label.to_uppercase();
    table
        .iter()
        .find(|row| row.iter().any(|cell| cell.trim().to_uppercase() == label_upper))
}

fn find_data_start(table: &MdTable) -> usize {
    for (i, row) in table.iter().enumerate() {
        for cell in row {
            if data_cell_re().is_match(cell.trim()) {
                return i;
            }
        }
    }
    if table.len() > 1 {
        1
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// ocr helpers (mode b)
// ---------------------------------------------------------------------------

/// common ocr artifacts for checked boxes
fn checkbox_marks_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:X[Il]|\[X\]|\(X\))|☑|☒").unwrap())
}

// ---------------------------------------------------------------------------
// transforms
// ---------------------------------------------------------------------------

fn apply_transform(value: FieldValue, transform: &str) -> FieldValue {
    match transform {
        "annual_to_monthly" => {
            let text = value.to_text().unwrap_or_default();
            match clean_currency(&text) {
                Some(amount) => {
                    FieldValue::Number((amount.as_decimal() / Decimal::from(12)).round_dp(2))
                }
                None => value,
            }
        }
        "to_float" => {
            let text = value.to_text().unwrap_or_default();
            match clean_currency(&text) {
                Some(amount) => FieldValue::Number(amount.as_decimal()),
                None => value,
            }
        }
        "to_int" => {
            let text = value.to_text().unwrap_or_default();
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            match digits.parse::<i64>() {
                Ok(n) => FieldValue::Number(Decimal::from(n)),
                Err(_) => value,
            }
        }
        "strip_ocr_noise" => {
            let text = value.to_text().unwrap_or_default();
            let kept: String = text
                .chars()
                .filter(|c| {
                    c.is_ascii_alphanumeric()
                        || c.is_whitespace()
                        || ",.-/()$%#@&'".contains(*c)
                })
                .collect();
            FieldValue::Text(kept.trim().to_string())
        }
        _ => value,
    }
}

fn yaml_to_field_value(value: &serde_yaml::Value) -> FieldValue {
    match value {
        serde_yaml::Value::Bool(b) => FieldValue::Bool(*b),
        serde_yaml::Value::Number(n) => n
            .as_f64()
            .and_then(Decimal::from_f64)
            .map(FieldValue::Number)
            .unwrap_or_else(|| FieldValue::Text(n.to_string())),
        serde_yaml::Value::String(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Text(serde_yaml::to_string(other).unwrap_or_default().trim().to_string()),
    }
}

fn json_to_field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64).map(FieldValue::Number),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// value routing (flat vs nested)
// ---------------------------------------------------------------------------

enum Sink<'a> {
    Flat(&'a mut FlatMap),
    Nested(&'a mut Value),
}

impl Sink<'_> {
    fn is_flat(&self) -> bool {
        matches!(self, Sink::Flat(_))
    }

    /// route a value to the rule's flat key or nested target path
    fn set(&mut self, rule: &Rule, value: FieldValue) -> bool {
        match self {
            Sink::Flat(map) => match &rule.key {
                Some(key) => {
                    map.insert(key.clone(), value);
                    true
                }
                None => {
                    debug!(rule = rule.id_or_unnamed(), "flat mode rule without key, skipping");
                    false
                }
            },
            Sink::Nested(tree) => match &rule.target_path {
                Some(path) => {
                    set_nested(tree, path, value.to_json());
                    true
                }
                None => false,
            },
        }
    }

    /// route one group of a multi-group rule
    fn set_group(&mut self, rule: &Rule, gid: &str, target: &str, value: FieldValue) -> bool {
        match self {
            Sink::Flat(map) => {
                let flat_key = rule
                    .groups_keys
                    .as_ref()
                    .and_then(|gk| gk.get(gid).cloned())
                    .or_else(|| rule.key.as_ref().map(|k| format!("{k}_{gid}")));
                match flat_key {
                    Some(key) => {
                        map.insert(key, value);
                        true
                    }
                    None => false,
                }
            }
            Sink::Nested(tree) => {
                set_nested(tree, target, value.to_json());
                true
            }
        }
    }

    fn set_at(&mut self, flat_key: Option<&str>, target_path: &str, value: FieldValue) -> bool {
        match self {
            Sink::Flat(map) => match flat_key {
                Some(key) => {
                    map.insert(key.to_string(), value);
                    true
                }
                None => false,
            },
            Sink::Nested(tree) => {
                set_nested(tree, target_path, value.to_json());
                true
            }
        }
    }

    fn computed_source(&self, rule: &Rule) -> Option<FieldValue> {
        match self {
            Sink::Flat(map) => rule
                .source_key
                .as_ref()
                .and_then(|key| map.get(key))
                .cloned(),
            Sink::Nested(tree) => rule
                .source_path
                .as_ref()
                .and_then(|path| get_nested(tree, path))
                .and_then(json_to_field_value),
        }
    }
}

// ---------------------------------------------------------------------------
// rule engine
// ---------------------------------------------------------------------------

/// universal deterministic rule-based extractor
///
/// interprets per-document yaml rule files against markdown or ocr text and
/// produces either a flat business-key map or a nested canonical partial
pub struct RuleEngine {
    library: RuleLibrary,
}

impl RuleEngine {
    pub fn new(rules_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            library: RuleLibrary::new(rules_dir),
        }
    }

    /// flat mode: {business_key: value}
    pub fn extract_flat(
        &mut self,
        text: &str,
        doc_type: DocumentType,
    ) -> Result<(FlatMap, Vec<RuleOutcome>)> {
        let mut flat = FlatMap::new();
        let outcomes = self.run(text, doc_type, &mut Sink::Flat(&mut flat))?;
        info!(document_type = doc_type.label(), fields = flat.len(),
              "rule engine extracted flat fields");
        Ok((flat, outcomes))
    }

    /// nested mode: deep canonical partial
    pub fn extract_nested(
        &mut self,
        text: &str,
        doc_type: DocumentType,
    ) -> Result<(Value, Vec<RuleOutcome>)> {
        let mut tree = Value::Object(serde_json::Map::new());
        let outcomes = self.run(text, doc_type, &mut Sink::Nested(&mut tree))?;
        Ok((tree, outcomes))
    }

    fn run(
        &mut self,
        text: &str,
        doc_type: DocumentType,
        sink: &mut Sink<'_>,
    ) -> Result<Vec<RuleOutcome>> {
        let Some(file) = self.library.load(doc_type)? else {
            return Ok(Vec::new());
        };
        self.run_rules(&file, text, sink)
    }

    fn run_rules(
        &self,
        file: &RuleFile,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> Result<Vec<RuleOutcome>> {
        // cheap no-op on plain ocr text
        let tables = parse_markdown_tables(text);
        let mut outcomes = Vec::with_capacity(file.rules.len());

        for rule in &file.rules {
            let status = match RuleKind::parse(&rule.kind) {
                None => {
                    warn!(rule = rule.id_or_unnamed(), kind = %rule.kind, "unknown rule type");
                    RuleStatus::Skipped(format!("unknown rule type '{}'", rule.kind))
                }
                Some(kind) => match Self::apply(kind, rule, text, &tables, sink) {
                    Ok(true) => RuleStatus::Applied,
                    Ok(false) => RuleStatus::NoMatch,
                    Err(message) => {
                        warn!(rule = rule.id_or_unnamed(), %message, "rule failed");
                        RuleStatus::Failed(message)
                    }
                },
            };
            outcomes.push(RuleOutcome {
                rule_id: rule.id_or_unnamed().to_string(),
                status,
            });
        }
        Ok(outcomes)
    }

    /// single static dispatch point for the closed rule-kind set
    fn apply(
        kind: RuleKind,
        rule: &Rule,
        text: &str,
        tables: &[MdTable],
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        match kind {
            RuleKind::Heading => Self::apply_heading(rule, text, sink),
            RuleKind::KeyValue => Self::apply_key_value(rule, text, sink),
            RuleKind::Table => Self::apply_table(rule, tables, sink),
            RuleKind::Checkbox => Self::apply_checkbox(rule, text, sink),
            RuleKind::Positional => Self::apply_positional(rule, text, sink),
            RuleKind::Section => Self::apply_section(rule, text, sink),
            RuleKind::Regex => Self::apply_regex(rule, text, sink),
            RuleKind::Static => Self::apply_static(rule, sink),
            RuleKind::Computed => Self::apply_computed(rule, sink),
        }
    }

    // ----- mode a: markdown ------------------------------------------------

    fn apply_heading(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let level = rule.level.unwrap_or(2);
        let prefix = "#".repeat(level);
        let pattern = format!(r"(?m)^{}\s+(.+)$", regex::escape(&prefix));
        let re = Regex::new(&pattern).map_err(|e| e.to_string())?;
        match re.captures(text) {
            Some(c) => {
                let value = c[1].trim().to_string();
                Ok(sink.set(rule, FieldValue::Text(value)))
            }
            None => Ok(false),
        }
    }

    fn apply_key_value(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        // for key_value rules the key doubles as the label searched in text
        let label = rule
            .key
            .as_deref()
            .ok_or_else(|| "key_value rule requires 'key'".to_string())?;
        let escaped = regex::escape(label);
        // pattern 1: newline-separated "Key:\n\nValue" (structured renderer form)
        let p1 = format!(
            r"(?:^|\n)\s*(?:\*\*)?{escaped}(?:\*\*)?\s*:\s*\n\s*\n\s*(.+?)(?:\n|$)"
        );
        // pattern 2: same-line "Key: Value"
        let p2 = format!(r"(?:^|\n)\s*(?:\*\*)?{escaped}(?:\*\*)?\s*:\s*(.+?)(?:\n|$)");

        for pattern in [p1, p2] {
            let re = Regex::new(&pattern).map_err(|e| e.to_string())?;
            if let Some(c) = re.captures(text) {
                let value = c[1].trim().to_string();
                if !value.is_empty() {
                    return Ok(sink.set(rule, FieldValue::Text(value)));
                }
            }
        }
        Ok(false)
    }

    fn apply_table(
        rule: &Rule,
        tables: &[MdTable],
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let keywords = rule
            .identify_by
            .as_ref()
            .map(|i| i.header_contains.clone())
            .unwrap_or_default();
        let Some(table) = find_table_by_headers(tables, &keywords) else {
            debug!(rule = rule.id_or_unnamed(), ?keywords, "no table match");
            return Ok(false);
        };
        let col_index = build_column_index(table);
        let mut applied = false;

        // mode 1: specific cells by row label x column name
        if let Some(specs) = &rule.extract {
            for spec in specs {
                let Some(data_row) = find_row_by_label(table, &spec.row_label) else {
                    continue;
                };
                for (col_name, target_path) in &spec.columns {
                    let Some(&col_idx) = col_index.get(&col_name.to_uppercase()) else {
                        continue;
                    };
                    let Some(raw) = data_row.get(col_idx) else {
                        continue;
                    };
                    let Some(amount) = clean_currency(raw.trim()) else {
                        continue;
                    };
                    let value = FieldValue::Number(amount.as_decimal());
                    let routed = if sink.is_flat() {
                        let flat_key = rule
                            .extract_keys
                            .as_ref()
                            .and_then(|keys| keys.get(target_path).cloned())
                            .or_else(|| {
                                rule.key.as_ref().map(|k| {
                                    format!("{k}_{}_{}", spec.row_label, col_name)
                                        .to_lowercase()
                                        .replace(' ', "_")
                                })
                            });
                        sink.set_at(flat_key.as_deref(), target_path, value)
                    } else {
                        sink.set_at(None, target_path, value)
                    };
                    applied |= routed;
                }
            }
        }

        // mode 2: every data row as a sub-record
        if let Some(spec) = &rule.extract_rows {
            let data_start = if spec.skip_header_rows > 0 {
                spec.skip_header_rows
            } else {
                find_data_start(table)
            };
            let mut extracted_rows: Vec<FlatMap> = Vec::new();
            for row in table.iter().skip(data_start) {
                let first_cell = row.get(spec.col_offset).map(|c| c.trim()).unwrap_or("");
                if first_cell.is_empty() {
                    continue;
                }
                if spec.skip_total && first_cell.to_uppercase().contains("TOTAL") {
                    continue;
                }
                let mut record = FlatMap::new();
                for (col_idx_str, field_name) in &spec.column_map {
                    let Ok(base_idx) = col_idx_str.parse::<usize>() else {
                        continue;
                    };
                    let col_idx = base_idx + spec.col_offset;
                    let Some(raw) = row.get(col_idx).map(|c| c.trim()) else {
                        continue;
                    };
                    if raw.is_empty() {
                        continue;
                    }
                    let value = if spec.string_columns.contains(field_name) {
                        FieldValue::Text(raw.to_string())
                    } else {
                        match clean_number(raw) {
                            Some(n) => FieldValue::Number(n),
                            None => FieldValue::Text(raw.to_string()),
                        }
                    };
                    record.insert(field_name.clone(), value);
                }
                if !record.is_empty() {
                    extracted_rows.push(record);
                }
            }
            if !extracted_rows.is_empty() {
                let value = FieldValue::Rows(extracted_rows);
                let routed = if sink.is_flat() {
                    let flat_key = spec.flat_key.clone().or_else(|| rule.key.clone());
                    sink.set_at(flat_key.as_deref(), &spec.target_path, value)
                } else {
                    sink.set_at(None, &spec.target_path, value)
                };
                applied |= routed;
            }
        }

        Ok(applied)
    }

    // ----- mode b: ocr / plain text ----------------------------------------

    fn apply_checkbox(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let label = rule.label.as_deref().unwrap_or("");
        let options = rule.options.as_deref().unwrap_or(&[]);
        let window = rule.window_lines.unwrap_or(5);

        let lines: Vec<&str> = text.split('\n').collect();
        let label_lower = label.to_lowercase();
        let Some(label_idx) = lines
            .iter()
            .position(|line| line.to_lowercase().contains(&label_lower))
        else {
            debug!(rule = rule.id_or_unnamed(), label, "checkbox label not found");
            return Ok(false);
        };

        let start = label_idx.saturating_sub(1);
        let end = (label_idx + window + 1).min(lines.len());
        let window_lines = &lines[start..end];
        let window_text = window_lines.join("\n");

        // pass 1: checkbox mark immediately before the option keyword
        for opt in options {
            let pattern = format!(
                r"(?i)(?:X[Il]|\[X\]|\(X\)|☑|☒)\s*{}",
                regex::escape(&opt.keyword)
            );
            let re = Regex::new(&pattern).map_err(|e| e.to_string())?;
            if re.is_match(&window_text) {
                return Ok(sink.set(rule, yaml_to_field_value(&opt.value)));
            }
        }

        // fallback: option keyword on a line that also carries any mark
        for opt in options {
            let keyword_lower = opt.keyword.to_lowercase();
            if !window_text.to_lowercase().contains(&keyword_lower) {
                continue;
            }
            for line in window_lines {
                if line.to_lowercase().contains(&keyword_lower)
                    && checkbox_marks_re().is_match(line)
                {
                    return Ok(sink.set(rule, yaml_to_field_value(&opt.value)));
                }
            }
        }
        Ok(false)
    }

    fn apply_positional(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let anchor = rule.anchor.as_deref().unwrap_or("");
        let direction = rule.direction.as_deref().unwrap_or("below");
        let skip = rule.skip_lines.unwrap_or(0);

        let lines: Vec<&str> = text.split('\n').collect();
        let anchor_lower = anchor.to_lowercase();
        let Some(anchor_idx) = lines
            .iter()
            .position(|line| line.to_lowercase().contains(&anchor_lower))
        else {
            debug!(rule = rule.id_or_unnamed(), anchor, "positional anchor not found");
            return Ok(false);
        };

        let capture = match &rule.capture_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| e.to_string())?),
            None => None,
        };

        let mut value: Option<String> = None;
        match direction {
            "after" | "right" => {
                let line = lines[anchor_idx];
                let idx = line.to_lowercase().find(&anchor_lower).unwrap_or(0);
                let after_text = &line[idx + anchor.len()..];
                value = match &capture {
                    Some(re) => re.find(after_text).map(|m| m.as_str().trim().to_string()),
                    None => Some(
                        after_text
                            .trim()
                            .trim_matches(':')
                            .trim()
                            .to_string(),
                    ),
                };
            }
            _ => {
                // below: scan up to 10 non-blank candidate lines after the skip
                let search_start = anchor_idx + 1 + skip;
                let search_end = (search_start + 10).min(lines.len());
                for line in lines.iter().take(search_end).skip(search_start) {
                    let candidate = line.trim();
                    if candidate.is_empty() {
                        continue;
                    }
                    match &capture {
                        Some(re) => {
                            if let Some(m) = re.find(candidate) {
                                value = Some(m.as_str().trim().to_string());
                                break;
                            }
                        }
                        None => {
                            value = Some(candidate.to_string());
                            break;
                        }
                    }
                }
            }
        }

        match value.filter(|v| !v.is_empty()) {
            Some(v) => {
                let mut field = FieldValue::Text(v);
                if let Some(transform) = &rule.transform {
                    field = apply_transform(field, transform);
                }
                Ok(sink.set(rule, field))
            }
            None => Ok(false),
        }
    }

    fn apply_section(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let start_marker = rule.start_marker.as_deref().unwrap_or("");
        let end_marker = rule.end_marker.as_deref().unwrap_or("");

        let lines: Vec<&str> = text.split('\n').collect();
        let start_lower = start_marker.to_lowercase();
        let end_lower = end_marker.to_lowercase();
        let mut start_idx: Option<usize> = None;
        let mut end_idx = lines.len();
        for (i, line) in lines.iter().enumerate() {
            let lower = line.to_lowercase();
            if lower.contains(&start_lower) && start_idx.is_none() {
                start_idx = Some(i);
            } else if start_idx.is_some() && !end_marker.is_empty() && lower.contains(&end_lower) {
                end_idx = i;
                break;
            }
        }
        let Some(start_idx) = start_idx else {
            debug!(rule = rule.id_or_unnamed(), start_marker, "section start not found");
            return Ok(false);
        };
        let section_text = lines[start_idx..end_idx].join("\n");

        match &rule.capture_pattern {
            Some(pattern) => {
                let re = RegexBuilder::new(pattern)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| e.to_string())?;
                match re.captures(&section_text) {
                    Some(c) => {
                        let raw = match c.get(1) {
                            Some(g) => g.as_str(),
                            None => c.get(0).map(|g| g.as_str()).unwrap_or(""),
                        };
                        let mut field = FieldValue::Text(raw.trim().to_string());
                        if let Some(transform) = &rule.transform {
                            field = apply_transform(field, transform);
                        }
                        Ok(sink.set(rule, field))
                    }
                    None => Ok(false),
                }
            }
            None => Ok(sink.set(rule, FieldValue::Text(section_text.trim().to_string()))),
        }
    }

    // ----- common ----------------------------------------------------------

    fn apply_regex(
        rule: &Rule,
        text: &str,
        sink: &mut Sink<'_>,
    ) -> std::result::Result<bool, String> {
        let pattern = rule
            .pattern
            .as_deref()
            .ok_or_else(|| "regex rule requires 'pattern'".to_string())?;
        let mut builder = RegexBuilder::new(pattern);
        for flag in &rule.flags {
            match flag.as_str() {
                "IGNORECASE" => builder.case_insensitive(true),
                "MULTILINE" => builder.multi_line(true),
                "DOTALL" => builder.dot_matches_new_line(true),
                other => {
                    debug!(rule = rule.id_or_unnamed(), flag = other, "ignoring unknown regex flag");
                    &mut builder
                }
            };
        }
        let re = builder.build().map_err(|e| e.to_string())?;
        let Some(captures) = re.captures(text) else {
            return Ok(false);
        };

        // single-group form
        if let Some(group_idx) = rule.group {
            let raw = captures
                .get(group_idx)
                .ok_or_else(|| format!("capture group {group_idx} did not participate"))?
                .as_str()
                .trim()
                .to_string();
            let mut field = FieldValue::Text(raw);
            if let Some(transform) = &rule.transform {
                field = apply_transform(field, transform);
            }
            return Ok(sink.set(rule, field));
        }

        // multi-group form: fan out into groups / groups_keys
        let mut applied = false;
        if let Some(groups) = &rule.groups {
            for (gid, target) in groups {
                let Ok(idx) = gid.parse::<usize>() else {
                    continue;
                };
                let Some(m) = captures.get(idx) else {
                    continue;
                };
                let value = FieldValue::Text(m.as_str().trim().to_string());
                applied |= sink.set_group(rule, gid, target, value);
            }
        }
        Ok(applied)
    }

    fn apply_static(rule: &Rule, sink: &mut Sink<'_>) -> std::result::Result<bool, String> {
        let value = rule
            .value
            .as_ref()
            .ok_or_else(|| "static rule requires 'value'".to_string())?;
        Ok(sink.set(rule, yaml_to_field_value(value)))
    }

    fn apply_computed(rule: &Rule, sink: &mut Sink<'_>) -> std::result::Result<bool, String> {
        match sink.computed_source(rule) {
            Some(value) => Ok(sink.set(rule, value)),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::TempDir;

    fn engine_with(yaml: &str) -> (TempDir, RuleEngine) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("rules")).unwrap();
        fs::write(dir.path().join("rules/URLA.yaml"), yaml).unwrap();
        let engine = RuleEngine::new(dir.path().join("rules"));
        (dir, engine)
    }

    #[test]
    fn test_set_nested_with_indices() {
        let mut tree = Value::Object(serde_json::Map::new());
        set_nested(
            &mut tree,
            "deal.parties[1].individual.ssn",
            Value::String("123-45-6789".into()),
        );
        assert_eq!(
            tree["deal"]["parties"][1]["individual"]["ssn"],
            Value::String("123-45-6789".into())
        );
        // index 0 backfilled as an object
        assert!(tree["deal"]["parties"][0].is_object());
        assert_eq!(
            get_nested(&tree, "deal.parties[1].individual.ssn"),
            Some(&Value::String("123-45-6789".into()))
        );
    }

    #[test]
    fn test_markdown_table_parse_skips_separators() {
        let md = "intro\n| Earnings | Hours | Amount |\n|---|---|---|\n| Regular | 80 | 3,500.00 |\n| Overtime | 5 | 400.00 |\nafter";
        let tables = parse_markdown_tables(md);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].len(), 3);
        assert_eq!(tables[0][0], vec!["Earnings", "Hours", "Amount"]);
    }

    #[test]
    fn test_key_value_both_shapes() {
        let yaml = r#"
rules:
  - id: employee_name
    type: key_value
    key: "Employee Name"
    target_path: "deal.parties[0].individual.full_name"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        // same-line form
        let (flat, _) = engine
            .extract_flat("Employee Name: Jane Smith\n", DocumentType::Urla)
            .unwrap();
        assert_eq!(flat.get("Employee Name"), Some(&FieldValue::text("Jane Smith")));
        // newline-separated form
        let (flat, _) = engine
            .extract_flat("**Employee Name**:\n\nJohn Doe\n", DocumentType::Urla)
            .unwrap();
        assert_eq!(flat.get("Employee Name"), Some(&FieldValue::text("John Doe")));
    }

    #[test]
    fn test_table_cells_and_rows() {
        let yaml = r#"
rules:
  - id: earnings_cells
    type: table
    key: pay
    identify_by:
      header_contains: ["EARNINGS", "AMOUNT"]
    extract:
      - row_label: "Regular"
        columns:
          AMOUNT: "deal.parties[0].employment[0].monthly_income.base"
    extract_keys:
      "deal.parties[0].employment[0].monthly_income.base": paystub_monthly_income_base
  - id: earnings_rows
    type: table
    key: paystub_earnings
    identify_by:
      header_contains: ["EARNINGS", "AMOUNT"]
    extract_rows:
      target_path: "deal.parties[0].income_verification_fragments[0].earnings"
      flat_key: paystub_earnings
      column_map:
        "0": description
        "2": amount
      string_columns: ["description"]
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let md = "| Earnings | Hours | Amount |\n|---|---|---|\n| Regular | 80 | 3,500.00 |\n| Overtime | 5 | 400.00 |\n| TOTAL | 85 | 3,900.00 |";
        let (flat, outcomes) = engine.extract_flat(md, DocumentType::Urla).unwrap();
        assert_eq!(
            flat.get("paystub_monthly_income_base"),
            Some(&FieldValue::Number(dec!(3500.00)))
        );
        let rows = flat.get("paystub_earnings").unwrap().as_rows().unwrap();
        assert_eq!(rows.len(), 2); // TOTAL skipped
        assert_eq!(rows[0].get("description"), Some(&FieldValue::text("Regular")));
        assert_eq!(rows[0].get("amount"), Some(&FieldValue::Number(dec!(3500.00))));
        assert!(outcomes.iter().all(|o| o.status == RuleStatus::Applied));
    }

    #[test]
    fn test_checkbox_adjacency_and_fallback() {
        let yaml = r#"
rules:
  - id: loan_purpose
    type: checkbox
    label: "Purpose of Loan"
    key: urla_loan_purpose
    target_path: "deal.transaction_information.loan_purpose.value"
    options:
      - match: "Purchase"
        value: "Purchase"
      - match: "Refinance"
        value: "Refinance"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        // adjacency: mark immediately before keyword
        let text = "Purpose of Loan\nXI Purchase   Refinance Construction\n";
        let (flat, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert_eq!(flat.get("urla_loan_purpose"), Some(&FieldValue::text("Purchase")));

        // fallback: keyword on a line that carries a mark elsewhere
        let text = "Purpose of Loan\nRefinance [X]\n";
        let (flat, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert_eq!(flat.get("urla_loan_purpose"), Some(&FieldValue::text("Refinance")));

        // no mark at all
        let text = "Purpose of Loan\nPurchase Refinance\n";
        let (flat, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert!(flat.get("urla_loan_purpose").is_none());
    }

    #[test]
    fn test_positional_below_and_after() {
        let yaml = r#"
rules:
  - id: ssn_below
    type: positional
    anchor: "Social Security Number"
    direction: below
    capture_pattern: '\d{3}-\d{2}-\d{4}'
    key: urla_borrower_ssn
    target_path: "deal.parties[0].individual.ssn"
  - id: name_after
    type: positional
    anchor: "Borrower Name:"
    direction: after
    key: urla_borrower_name
    target_path: "deal.parties[0].individual.full_name"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let text = "Borrower Name: John Q Doe\nSocial Security Number\n\n123-45-6789\n";
        let (flat, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert_eq!(flat.get("urla_borrower_ssn"), Some(&FieldValue::text("123-45-6789")));
        assert_eq!(flat.get("urla_borrower_name"), Some(&FieldValue::text("John Q Doe")));
    }

    #[test]
    fn test_section_with_capture() {
        let yaml = r#"
rules:
  - id: loan_amount
    type: section
    start_marker: "I. TYPE OF MORTGAGE"
    end_marker: "II. PROPERTY"
    capture_pattern: 'Amount\s*\$?\s*([\d,]+)'
    transform: to_float
    key: urla_loan_amount
    target_path: "deal.disclosures_and_closing.promissory_note.principal_amount"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let text = "I. TYPE OF MORTGAGE AND TERMS\nAmount $ 450,000\nII. PROPERTY INFORMATION\nAmount $ 999,999\n";
        let (flat, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert_eq!(flat.get("urla_loan_amount"), Some(&FieldValue::Number(dec!(450000))));
    }

    #[test]
    fn test_regex_multi_group_flat_keys() {
        let yaml = r#"
rules:
  - id: city_state_zip
    type: regex
    pattern: '([A-Za-z ]+),\s*([A-Z]{2})\s+(\d{5})'
    groups:
      "1": "deal.collateral.subject_property.city"
      "2": "deal.collateral.subject_property.state"
      "3": "deal.collateral.subject_property.zip_code"
    groups_keys:
      "1": urla_property_city
      "2": urla_property_state
      "3": urla_property_zip
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let (flat, _) = engine
            .extract_flat("Property at Denver, CO 80202 today", DocumentType::Urla)
            .unwrap();
        assert_eq!(flat.get("urla_property_state"), Some(&FieldValue::text("CO")));
        assert_eq!(flat.get("urla_property_zip"), Some(&FieldValue::text("80202")));

        let (tree, _) = engine
            .extract_nested("Property at Denver, CO 80202 today", DocumentType::Urla)
            .unwrap();
        assert_eq!(
            get_nested(&tree, "deal.collateral.subject_property.state"),
            Some(&Value::String("CO".into()))
        );
    }

    #[test]
    fn test_static_and_computed() {
        let yaml = r#"
rules:
  - id: source_doc
    type: static
    value: "URLA (Form 1003)"
    key: urla_source_doc_type
    target_path: "document_metadata.source_document_type"
  - id: wages
    type: regex
    pattern: 'Wages:\s*\$?([\d,\.]+)'
    group: 1
    transform: to_float
    key: urla_base_employment_income
    target_path: "deal.parties[0].employment[0].monthly_income.base"
  - id: copy_income
    type: computed
    source_key: urla_base_employment_income
    source_path: "deal.parties[0].employment[0].monthly_income.base"
    key: urla_total_monthly_income
    target_path: "deal.parties[0].employment[0].monthly_income.total"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let (flat, _) = engine
            .extract_flat("Wages: $5,200.00 per month", DocumentType::Urla)
            .unwrap();
        assert_eq!(
            flat.get("urla_source_doc_type"),
            Some(&FieldValue::text("URLA (Form 1003)"))
        );
        assert_eq!(
            flat.get("urla_total_monthly_income"),
            Some(&FieldValue::Number(dec!(5200.00)))
        );
    }

    #[test]
    fn test_unknown_rule_type_is_skipped() {
        let yaml = r#"
rules:
  - id: future_rule
    type: llm_prompt
    key: nope
  - id: ok_rule
    type: static
    value: "x"
    key: some_key
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let (flat, outcomes) = engine.extract_flat("anything", DocumentType::Urla).unwrap();
        assert!(matches!(outcomes[0].status, RuleStatus::Skipped(_)));
        assert_eq!(outcomes[1].status, RuleStatus::Applied);
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn test_bad_pattern_fails_only_that_rule() {
        let yaml = r#"
rules:
  - id: broken
    type: regex
    pattern: '([unclosed'
    group: 1
    key: broken_key
  - id: fine
    type: static
    value: 42
    key: fine_key
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let (flat, outcomes) = engine.extract_flat("text", DocumentType::Urla).unwrap();
        assert!(matches!(outcomes[0].status, RuleStatus::Failed(_)));
        assert_eq!(outcomes[1].status, RuleStatus::Applied);
        assert_eq!(flat.get("fine_key"), Some(&FieldValue::Number(dec!(42))));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let yaml = r#"
rules:
  - id: name_after
    type: positional
    anchor: "Borrower Name:"
    direction: after
    key: urla_borrower_name
    target_path: "deal.parties[0].individual.full_name"
  - id: source_doc
    type: static
    value: "URLA (Form 1003)"
    key: urla_source_doc_type
    target_path: "document_metadata.source_document_type"
"#;
        let (_dir, mut engine) = engine_with(yaml);
        let text = "Borrower Name: Jane Roe\n";
        let (first, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        let (second, _) = engine.extract_flat(text, DocumentType::Urla).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_rule_file_returns_empty() {
        let dir = TempDir::new().unwrap();
        let mut engine = RuleEngine::new(dir.path());
        let (flat, outcomes) = engine.extract_flat("text", DocumentType::GiftLetter).unwrap();
        assert!(flat.is_empty());
        assert!(outcomes.is_empty());
    }
}
