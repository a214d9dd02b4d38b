use indexmap::IndexMap;
use tracing::{debug, info};

use crate::types::DocumentType;
use crate::value::FlatMap;

/// document priority: higher is more authoritative, verified beats stated
fn priority(doc_type: DocumentType) -> i32 {
    match doc_type {
        DocumentType::W2Form => 90,
        DocumentType::Appraisal => 85,
        DocumentType::PayStub => 80,
        DocumentType::TaxReturn1040 => 70,
        DocumentType::BankStatement => 60,
        DocumentType::Urla => 50,
        DocumentType::LoanEstimate => 40,
        _ => 0,
    }
}

/// ssn-bearing flat keys per document type
fn ssn_keys(doc_type: DocumentType) -> &'static [&'static str] {
    match doc_type {
        DocumentType::W2Form => &["w2_employee_ssn"],
        DocumentType::Urla => &["urla_borrower_ssn", "urla_coborrower_ssn"],
        DocumentType::TaxReturn1040 => &["tax_taxpayer_ssn", "tax_spouse_ssn"],
        _ => &[],
    }
}

/// name-bearing flat keys per document type, aligned with ssn_keys by index
fn name_keys(doc_type: DocumentType) -> &'static [&'static str] {
    match doc_type {
        DocumentType::W2Form => &["w2_employee_full_name", "w2_employee_first_name"],
        DocumentType::Urla => &["urla_borrower_name", "urla_coborrower_name"],
        DocumentType::TaxReturn1040 => &["tax_taxpayer_first_name", "tax_spouse_first_name"],
        DocumentType::PayStub => &["paystub_employee_name"],
        DocumentType::BankStatement => &["bank_account_holder"],
        DocumentType::Appraisal => &["appraisal_borrower_name"],
        DocumentType::LoanEstimate => &["le_applicant_names"],
        _ => &[],
    }
}

const NAME_THRESHOLD: f64 = 0.80;

/// merges flat extractions from multiple documents
///
/// documents are applied in ascending priority order so higher-priority
/// values overwrite lower-priority ones for the same keys
#[derive(Debug, Default)]
pub struct DocumentMerger;

impl DocumentMerger {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(&self, extractions: &[(DocumentType, FlatMap)]) -> FlatMap {
        if extractions.is_empty() {
            return FlatMap::new();
        }

        let mut sorted: Vec<&(DocumentType, FlatMap)> = extractions.iter().collect();
        sorted.sort_by_key(|(doc_type, _)| priority(*doc_type));

        let mut merged = FlatMap::new();
        let mut sources: IndexMap<String, DocumentType> = IndexMap::new();

        for (doc_type, flat) in sorted {
            for (key, value) in flat {
                if let Some(previous) = sources.get(key) {
                    if previous != doc_type {
                        debug!(key, overwritten_by = doc_type.label(),
                               was = previous.label(), "merge conflict");
                    }
                }
                merged.insert(key.clone(), value.clone());
                sources.insert(key.clone(), *doc_type);
            }
        }

        info!(keys = merged.len(), documents = extractions.len(), "merge complete");
        merged
    }

    /// cross-document party matching: ssn exact first, then fuzzy name
    ///
    /// returns {party_label: canonical_party_id} with ids assigned in cluster
    /// discovery order
    pub fn match_parties(&self, extractions: &[(DocumentType, FlatMap)]) -> IndexMap<String, String> {
        // evidence tuples (label, ssn?, name?)
        let mut evidence: Vec<(String, Option<String>, Option<String>)> = Vec::new();

        for (doc_type, flat) in extractions {
            let ssns = ssn_keys(*doc_type);
            let names = name_keys(*doc_type);

            for (i, ssn_key) in ssns.iter().enumerate() {
                let ssn = flat.get(*ssn_key).and_then(|v| v.to_text());
                let name = names
                    .get(i)
                    .and_then(|k| flat.get(*k))
                    .and_then(|v| v.to_text());
                let label = ssn_key.trim_end_matches("_ssn").to_string();
                if ssn.is_some() || name.is_some() {
                    evidence.push((label, ssn, name));
                }
            }

            // name-only keys without an ssn counterpart
            for name_key in names.iter().skip(ssns.len()) {
                let Some(name) = flat.get(*name_key).and_then(|v| v.to_text()) else {
                    continue;
                };
                let mut label = name_key.trim_end_matches("_name").to_string();
                if label.ends_with("_full") {
                    label = label.trim_end_matches("_full").to_string();
                }
                evidence.push((label, None, Some(name)));
            }
        }

        if evidence.is_empty() {
            return IndexMap::new();
        }

        let mut clusters: Vec<Vec<String>> = Vec::new();
        let mut cluster_ssns: Vec<Option<String>> = Vec::new();
        let mut cluster_names: Vec<Option<String>> = Vec::new();

        for (label, ssn, name) in evidence {
            let mut matched: Option<usize> = None;

            if let Some(ssn) = &ssn {
                for (idx, candidate) in cluster_ssns.iter().enumerate() {
                    if let Some(candidate) = candidate {
                        if normalize_ssn(ssn) == normalize_ssn(candidate) {
                            matched = Some(idx);
                            break;
                        }
                    }
                }
            }

            if matched.is_none() {
                if let Some(name) = &name {
                    for (idx, candidate) in cluster_names.iter().enumerate() {
                        if let Some(candidate) = candidate {
                            if name_similarity(name, candidate) >= NAME_THRESHOLD {
                                matched = Some(idx);
                                break;
                            }
                        }
                    }
                }
            }

            match matched {
                Some(idx) => {
                    clusters[idx].push(label);
                    if cluster_ssns[idx].is_none() {
                        cluster_ssns[idx] = ssn;
                    }
                    if cluster_names[idx].is_none() {
                        cluster_names[idx] = name;
                    }
                }
                None => {
                    clusters.push(vec![label]);
                    cluster_ssns.push(ssn);
                    cluster_names.push(name);
                }
            }
        }

        let mut result = IndexMap::new();
        for (idx, cluster) in clusters.iter().enumerate() {
            let party_id = format!("party_{idx}");
            for label in cluster {
                result.insert(label.clone(), party_id.clone());
            }
        }
        info!(parties = clusters.len(), "party matching complete");
        result
    }
}

fn normalize_ssn(ssn: &str) -> String {
    ssn.chars().filter(|c| *c != '-' && *c != ' ').collect()
}

/// longest-common-subsequence similarity ratio on upper-cased names
fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.trim().to_uppercase().chars().collect();
    let b: Vec<char> = b.trim().to_uppercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    2.0 * dp[a.len()][b.len()] as f64 / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn flat(pairs: &[(&str, &str)]) -> FlatMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::text(*v)))
            .collect()
    }

    #[test]
    fn test_zero_inputs() {
        assert!(DocumentMerger::new().merge(&[]).is_empty());
        assert!(DocumentMerger::new().match_parties(&[]).is_empty());
    }

    #[test]
    fn test_higher_priority_overwrites() {
        let urla = flat(&[("shared_income", "100000"), ("urla_borrower_name", "John Doe")]);
        let w2 = flat(&[("shared_income", "120000")]);
        let merged = DocumentMerger::new().merge(&[
            (DocumentType::W2Form, w2),
            (DocumentType::Urla, urla),
        ]);
        // w2 (90) beats urla (50) regardless of input order
        assert_eq!(merged.get("shared_income"), Some(&FieldValue::text("120000")));
        assert_eq!(merged.get("urla_borrower_name"), Some(&FieldValue::text("John Doe")));
    }

    #[test]
    fn test_ssn_exact_match_clusters() {
        let urla = flat(&[
            ("urla_borrower_ssn", "123-45-6789"),
            ("urla_borrower_name", "John Doe"),
            ("urla_coborrower_ssn", "222-33-4444"),
            ("urla_coborrower_name", "Mary Doe"),
        ]);
        let w2 = flat(&[
            ("w2_employee_ssn", "123456789"), // same ssn, dashes stripped
            ("w2_employee_full_name", "JOHN DOE"),
        ]);
        let map = DocumentMerger::new().match_parties(&[
            (DocumentType::Urla, urla),
            (DocumentType::W2Form, w2),
        ]);
        assert_eq!(map.get("urla_borrower"), map.get("w2_employee"));
        assert_ne!(map.get("urla_borrower"), map.get("urla_coborrower"));
        assert_eq!(map.get("urla_borrower").map(String::as_str), Some("party_0"));
        assert_eq!(map.get("urla_coborrower").map(String::as_str), Some("party_1"));
    }

    #[test]
    fn test_fuzzy_name_match_clusters() {
        let urla = flat(&[("urla_borrower_name", "Jane Smith")]);
        let paystub = flat(&[("paystub_employee_name", "JANE SMITH")]);
        let bank = flat(&[("bank_account_holder", "Robert Brown")]);
        let map = DocumentMerger::new().match_parties(&[
            (DocumentType::Urla, urla),
            (DocumentType::PayStub, paystub),
            (DocumentType::BankStatement, bank),
        ]);
        assert_eq!(map.get("urla_borrower"), map.get("paystub_employee"));
        assert_ne!(map.get("urla_borrower"), map.get("bank_account_holder"));
    }

    #[test]
    fn test_name_similarity_ratio() {
        assert!(name_similarity("JANE SMITH", "jane smith") > 0.99);
        assert!(name_similarity("Jane Smith", "Jane Smyth") >= 0.80);
        assert!(name_similarity("Jane Smith", "Robert Brown") < 0.5);
    }

    proptest! {
        /// any two extractions sharing a key with distinct values resolve to
        /// the higher-priority document's value
        #[test]
        fn prop_priority_monotone(low in "[a-z]{1,8}", high in "[A-Z]{1,8}") {
            prop_assume!(low.to_uppercase() != high);
            let urla = flat(&[("k", low.as_str())]);
            let w2 = flat(&[("k", high.as_str())]);
            let merger = DocumentMerger::new();
            // both input orders yield the w2 value
            let forward = merger.merge(&[(DocumentType::Urla, urla.clone()), (DocumentType::W2Form, w2.clone())]);
            let backward = merger.merge(&[(DocumentType::W2Form, w2), (DocumentType::Urla, urla)]);
            prop_assert_eq!(forward.get("k"), Some(&FieldValue::text(high.as_str())));
            prop_assert_eq!(backward.get("k"), forward.get("k"));
        }

        /// evidence tuples sharing a normalized ssn always land in one cluster
        #[test]
        fn prop_ssn_equivalence(a in "[0-9]{3}", b in "[0-9]{2}", c in "[0-9]{4}") {
            let dashed = format!("{a}-{b}-{c}");
            let plain = format!("{a}{b}{c}");
            let urla = flat(&[("urla_borrower_ssn", dashed.as_str())]);
            let w2 = flat(&[("w2_employee_ssn", plain.as_str())]);
            let map = DocumentMerger::new().match_parties(&[
                (DocumentType::Urla, urla),
                (DocumentType::W2Form, w2),
            ]);
            prop_assert_eq!(map.get("urla_borrower"), map.get("w2_employee"));
        }
    }
}
