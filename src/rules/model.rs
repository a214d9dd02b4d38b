use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{PipelineError, Result};
use crate::types::DocumentType;

/// the closed set of rule kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    // markdown mode
    Heading,
    KeyValue,
    Table,
    // ocr mode
    Checkbox,
    Positional,
    Section,
    // common
    Regex,
    Static,
    Computed,
}

impl RuleKind {
    pub fn parse(s: &str) -> Option<RuleKind> {
        match s {
            "heading" => Some(RuleKind::Heading),
            "key_value" => Some(RuleKind::KeyValue),
            "table" => Some(RuleKind::Table),
            "checkbox" => Some(RuleKind::Checkbox),
            "positional" => Some(RuleKind::Positional),
            "section" => Some(RuleKind::Section),
            "regex" => Some(RuleKind::Regex),
            "static" => Some(RuleKind::Static),
            "computed" => Some(RuleKind::Computed),
            _ => None,
        }
    }
}

/// table identification block: all header keywords must appear in the
/// first rows of the candidate table
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TableIdentify {
    #[serde(default)]
    pub header_contains: Vec<String>,
}

/// specific-cell extraction: row label x column name -> destination path
#[derive(Debug, Clone, Deserialize)]
pub struct CellSpec {
    #[serde(default)]
    pub row_label: String,
    #[serde(default)]
    pub columns: IndexMap<String, String>,
}

/// whole-row extraction into a list of sub-records
#[derive(Debug, Clone, Deserialize)]
pub struct RowSpec {
    pub target_path: String,
    pub flat_key: Option<String>,
    #[serde(default = "default_true")]
    pub skip_total: bool,
    #[serde(default)]
    pub column_map: IndexMap<String, String>,
    #[serde(default)]
    pub col_offset: usize,
    #[serde(default)]
    pub string_columns: Vec<String>,
    #[serde(default)]
    pub skip_header_rows: usize,
}

fn default_true() -> bool {
    true
}

/// one checkbox option: keyword searched near the label, value emitted on match
#[derive(Debug, Clone, Deserialize)]
pub struct CheckboxOption {
    #[serde(rename = "match")]
    pub keyword: String,
    pub value: serde_yaml::Value,
}

/// a single extraction rule as declared in yaml
///
/// the `kind` string is resolved against the closed `RuleKind` set at
/// application time; unknown kinds are logged and skipped, never fatal
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,

    // destination routing: flat-mode key and/or nested-mode dotted path;
    // multi-group rules fan out through `groups` / `groups_keys`
    pub key: Option<String>,
    pub target_path: Option<String>,
    pub groups: Option<IndexMap<String, String>>,
    pub groups_keys: Option<IndexMap<String, String>>,

    // regex
    pub pattern: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub group: Option<usize>,
    pub transform: Option<String>,

    // heading
    pub level: Option<usize>,

    // table
    pub identify_by: Option<TableIdentify>,
    pub extract: Option<Vec<CellSpec>>,
    pub extract_keys: Option<IndexMap<String, String>>,
    pub extract_rows: Option<RowSpec>,

    // checkbox
    pub label: Option<String>,
    pub options: Option<Vec<CheckboxOption>>,
    pub window_lines: Option<usize>,

    // positional
    pub anchor: Option<String>,
    pub direction: Option<String>,
    pub skip_lines: Option<usize>,
    pub capture_pattern: Option<String>,

    // section
    pub start_marker: Option<String>,
    pub end_marker: Option<String>,

    // static
    pub value: Option<serde_yaml::Value>,

    // computed
    pub source_path: Option<String>,
    pub source_key: Option<String>,
}

impl Rule {
    pub fn id_or_unnamed(&self) -> &str {
        self.id.as_deref().unwrap_or("unnamed")
    }
}

/// one rule file: ordered rules for a document type
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// explicit aliases: document label -> yaml file stem
fn alias_for(doc_type: DocumentType) -> Option<&'static str> {
    match doc_type {
        DocumentType::W2Form => Some("W-2Form"),
        DocumentType::TaxReturn1040 => Some("TaxReturn"),
        DocumentType::Appraisal => Some("Appraisal"),
        DocumentType::LoanEstimate => Some("LoanEstimate"),
        DocumentType::Form1099Misc => Some("1099 misc"),
        DocumentType::ClosingDisclosure => Some("ClosingDisclosure"),
        _ => None,
    }
}

/// loads and caches per-document rule files from a directory
pub struct RuleLibrary {
    rules_dir: PathBuf,
    cache: HashMap<DocumentType, Option<Arc<RuleFile>>>,
}

impl RuleLibrary {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            cache: HashMap::new(),
        }
    }

    /// candidate filenames for a document type, most specific first
    fn candidates(doc_type: DocumentType) -> Vec<String> {
        let label = doc_type.label();
        let mut names: Vec<String> = Vec::new();

        // "URLA (Form 1003)" -> "URLA.yaml"
        let base: String = label
            .split('(')
            .next()
            .unwrap_or(label)
            .trim()
            .chars()
            .filter(|c| *c != ' ')
            .collect();
        if !base.is_empty() {
            names.push(format!("{base}.yaml"));
        }
        if let Some(alias) = alias_for(doc_type) {
            let aliased = format!("{alias}.yaml");
            if !names.contains(&aliased) {
                names.insert(0, aliased);
            }
        }
        let spaceless: String = label.chars().filter(|c| *c != ' ').collect();
        let candidate = format!("{spaceless}.yaml");
        if !names.contains(&candidate) {
            names.push(candidate);
        }
        let underscored = format!("{}.yaml", label.replace(' ', "_"));
        if !names.contains(&underscored) {
            names.push(underscored);
        }
        names
    }

    /// resolve and cache the rule file for a document type
    ///
    /// a missing file is soft (None, logged); an unreadable or invalid file
    /// is a registration error
    pub fn load(&mut self, doc_type: DocumentType) -> Result<Option<Arc<RuleFile>>> {
        if let Some(cached) = self.cache.get(&doc_type) {
            return Ok(cached.clone());
        }

        let candidates = Self::candidates(doc_type);
        let mut found: Option<PathBuf> = None;
        for name in &candidates {
            let path = self.rules_dir.join(name);
            if path.is_file() {
                found = Some(path);
                break;
            }
        }

        let loaded = match found {
            Some(path) => Some(Arc::new(Self::parse_file(&path)?)),
            None => {
                warn!(document_type = doc_type.label(), tried = ?candidates,
                      "rule configuration not found");
                None
            }
        };
        self.cache.insert(doc_type, loaded.clone());
        Ok(loaded)
    }

    fn parse_file(path: &Path) -> Result<RuleFile> {
        let raw = fs::read_to_string(path)?;
        let file: RuleFile =
            serde_yaml::from_str(&raw).map_err(|e| PipelineError::InvalidRuleConfig {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        debug!(path = %path.display(), rules = file.rules.len(), "loaded rule file");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rule_kind_parse() {
        assert_eq!(RuleKind::parse("key_value"), Some(RuleKind::KeyValue));
        assert_eq!(RuleKind::parse("regex"), Some(RuleKind::Regex));
        assert_eq!(RuleKind::parse("llm_magic"), None);
    }

    #[test]
    fn test_candidate_names() {
        let names = RuleLibrary::candidates(DocumentType::Urla);
        assert_eq!(names[0], "URLA.yaml");
        let names = RuleLibrary::candidates(DocumentType::W2Form);
        assert_eq!(names[0], "W-2Form.yaml");
        let names = RuleLibrary::candidates(DocumentType::TaxReturn1040);
        assert_eq!(names[0], "TaxReturn.yaml");
        let names = RuleLibrary::candidates(DocumentType::Form1099Misc);
        assert_eq!(names[0], "1099 misc.yaml");
    }

    #[test]
    fn test_missing_file_is_soft() {
        let dir = TempDir::new().unwrap();
        let mut library = RuleLibrary::new(dir.path());
        assert!(library.load(DocumentType::GiftLetter).unwrap().is_none());
    }

    #[test]
    fn test_load_and_cache() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("URLA.yaml"),
            r#"
document_type: "URLA (Form 1003)"
rules:
  - id: borrower_ssn
    type: positional
    anchor: "Social Security Number"
    direction: below
    capture_pattern: '\d{3}-\d{2}-\d{4}'
    key: urla_borrower_ssn
    target_path: "deal.parties[0].individual.ssn"
"#,
        )
        .unwrap();
        let mut library = RuleLibrary::new(dir.path());
        let file = library.load(DocumentType::Urla).unwrap().unwrap();
        assert_eq!(file.rules.len(), 1);
        assert_eq!(file.rules[0].id_or_unnamed(), "borrower_ssn");
        // second load comes from cache
        let again = library.load(DocumentType::Urla).unwrap().unwrap();
        assert!(Arc::ptr_eq(&file, &again));
    }

    #[test]
    fn test_invalid_yaml_is_registration_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("URLA.yaml"), "rules: {not: [a, list").unwrap();
        let mut library = RuleLibrary::new(dir.path());
        assert!(library.load(DocumentType::Urla).is_err());
    }
}
