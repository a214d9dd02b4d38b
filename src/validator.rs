use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{info, warn};

use crate::canonical::model::{CanonicalRecord, Employment};
use crate::decimal::Money;
use crate::types::{Severity, ValidationIssue};

fn ssn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").unwrap())
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d{2}[/-]\d{2}[/-]\d{4}|\d{4}-\d{2}-\d{2})$").unwrap())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let trimmed = s.trim();
    for fmt in ["%m/%d/%Y", "%Y-%m-%d", "%m-%d-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date);
        }
    }
    None
}

/// post-assembly quality gate
///
/// runs after the assembler and before the relational transformer; checks
/// critical presence, formats, and logical sanity. never mutates data and
/// never blocks the pipeline
#[derive(Debug, Default)]
pub struct DataValidator;

impl DataValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, record: &CanonicalRecord) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        self.check_critical_fields(record, &mut issues);

        for (idx, party) in record.deal.parties.iter().enumerate() {
            if party.is_lender() {
                continue;
            }
            let party_label = format!("deal.parties[{idx}]");

            if let Some(individual) = &party.individual {
                if let Some(ssn) = &individual.ssn {
                    if !ssn_re().is_match(ssn) {
                        issues.push(ValidationIssue::new(
                            Severity::Format,
                            format!("{party_label}.individual.ssn"),
                            format!("'{ssn}' does not match XXX-XX-XXXX pattern"),
                        ));
                    }
                }
                if let Some(dob) = &individual.dob {
                    if !date_re().is_match(dob) {
                        issues.push(ValidationIssue::new(
                            Severity::Format,
                            format!("{party_label}.individual.dob"),
                            format!("'{dob}' is not a valid date format"),
                        ));
                    }
                }
            }

            for (emp_idx, employment) in party.employment.iter().enumerate() {
                let emp_label = format!("{party_label}.employment[{emp_idx}]");
                self.validate_employment(employment, &emp_label, &mut issues);

                if let Some(income) = &employment.monthly_income {
                    for (name, amount) in income.components() {
                        if amount.is_negative() {
                            issues.push(ValidationIssue::new(
                                Severity::Logic,
                                format!("{emp_label}.monthly_income.{name}"),
                                format!("{amount} (negative income)"),
                            ));
                        }
                    }
                }
            }
        }

        if let Some(tx) = &record.deal.transaction_information {
            if let Some(amount) = tx.final_loan_amount {
                if amount <= Money::ZERO {
                    issues.push(ValidationIssue::new(
                        Severity::Logic,
                        "deal.transaction_information.final_loan_amount",
                        format!("{amount} (must be > 0)"),
                    ));
                }
            }
            if let Some(date) = &tx.application_date {
                if !date_re().is_match(date) {
                    issues.push(ValidationIssue::new(
                        Severity::Format,
                        "deal.transaction_information.application_date",
                        format!("'{date}' is not a valid date format"),
                    ));
                }
            }
        }

        let sales_price = record
            .deal
            .collateral
            .as_ref()
            .and_then(|c| c.subject_property.as_ref())
            .and_then(|p| p.valuation.as_ref())
            .and_then(|v| v.sales_price);
        if let Some(price) = sales_price {
            if price <= Money::ZERO {
                issues.push(ValidationIssue::new(
                    Severity::Logic,
                    "deal.collateral.subject_property.valuation.sales_price",
                    format!("{price} (must be > 0)"),
                ));
            }
        }

        if issues.is_empty() {
            info!("validation passed");
        } else {
            warn!(count = issues.len(), "validation issues found");
        }
        issues
    }

    /// critical fields required for a complete loan file
    fn check_critical_fields(&self, record: &CanonicalRecord, issues: &mut Vec<ValidationIssue>) {
        let borrower = record.deal.parties.first();
        let individual = borrower.and_then(|p| p.individual.as_ref());

        let name_present = individual
            .and_then(|i| i.full_name.as_deref())
            .is_some_and(|s| !s.trim().is_empty());
        if !name_present {
            issues.push(Self::missing("deal.parties[0].individual.full_name", "Borrower Name"));
        }

        let ssn_present = individual
            .and_then(|i| i.ssn.as_deref())
            .is_some_and(|s| !s.trim().is_empty());
        if !ssn_present {
            issues.push(Self::missing("deal.parties[0].individual.ssn", "Borrower SSN"));
        }

        if record
            .deal
            .transaction_information
            .as_ref()
            .and_then(|t| t.final_loan_amount)
            .is_none()
        {
            issues.push(Self::missing(
                "deal.transaction_information.final_loan_amount",
                "Loan Amount",
            ));
        }

        let purpose_present = record
            .deal
            .transaction_information
            .as_ref()
            .and_then(|t| t.loan_purpose.as_ref())
            .is_some_and(|p| !p.value.trim().is_empty());
        if !purpose_present {
            issues.push(Self::missing(
                "deal.transaction_information.loan_purpose.value",
                "Loan Purpose",
            ));
        }

        let address_present = record
            .deal
            .collateral
            .as_ref()
            .and_then(|c| c.subject_property.as_ref())
            .and_then(|p| p.address.as_deref())
            .is_some_and(|s| !s.trim().is_empty());
        if !address_present {
            issues.push(Self::missing(
                "deal.collateral.subject_property.address",
                "Property Address",
            ));
        }
    }

    fn missing(path: &str, label: &str) -> ValidationIssue {
        ValidationIssue::new(
            Severity::Critical,
            path,
            format!("Missing required field ({label}) - Document may be unclear"),
        )
    }

    fn validate_employment(
        &self,
        employment: &Employment,
        label: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if employment
            .employer_name
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
        {
            issues.push(ValidationIssue::new(
                Severity::Quality,
                format!("{label}.employer_name"),
                "employer_name is missing",
            ));
        }

        if let (Some(start), Some(end)) = (&employment.start_date, &employment.end_date) {
            if let (Some(start_date), Some(end_date)) = (parse_date(start), parse_date(end)) {
                if start_date > end_date {
                    issues.push(ValidationIssue::new(
                        Severity::Logic,
                        format!("{label}.start_date"),
                        format!("start_date ({start}) is after end_date ({end})"),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::model::{
        Collateral, Individual, MonthlyIncome, Party, SubjectProperty, TaggedValue,
        TransactionInformation, Valuation,
    };

    fn complete_record() -> CanonicalRecord {
        let mut record = CanonicalRecord::default();
        record.deal.parties.push(Party {
            individual: Some(Individual {
                full_name: Some("John Q Doe".into()),
                ssn: Some("123-45-6789".into()),
                ..Individual::default()
            }),
            party_role: Some(TaggedValue::new("Borrower")),
            employment: vec![Employment {
                employer_name: Some("Initech LLC".into()),
                monthly_income: Some(MonthlyIncome {
                    base: Some(Money::from_major(10_000)),
                    ..MonthlyIncome::default()
                }),
                ..Employment::default()
            }],
            ..Party::default()
        });
        record.deal.transaction_information = Some(TransactionInformation {
            final_loan_amount: Some(Money::from_major(450_000)),
            loan_purpose: Some(TaggedValue::new("Purchase")),
            ..TransactionInformation::default()
        });
        record.deal.collateral = Some(Collateral {
            subject_property: Some(SubjectProperty {
                address: Some("123 Main St, Denver, CO 80202".into()),
                ..SubjectProperty::default()
            }),
        });
        record
    }

    #[test]
    fn test_complete_record_passes() {
        let record = complete_record();
        let issues = DataValidator::new().validate(&record);
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn test_validator_is_non_mutating() {
        let record = complete_record();
        let before = record.clone();
        let _ = DataValidator::new().validate(&record);
        assert_eq!(record, before);
    }

    #[test]
    fn test_missing_criticals_reported() {
        let record = CanonicalRecord::default();
        let issues = DataValidator::new().validate(&record);
        let criticals: Vec<&ValidationIssue> = issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .collect();
        assert_eq!(criticals.len(), 5);
        assert!(criticals.iter().any(|i| i.path == "deal.parties[0].individual.ssn"));
        assert!(criticals.iter().any(|i| i.path == "deal.collateral.subject_property.address"));
    }

    #[test]
    fn test_ssn_format_check() {
        let mut record = complete_record();
        record.deal.parties[0].individual.as_mut().unwrap().ssn = Some("123456789".into());
        let issues = DataValidator::new().validate(&record);
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Format && i.path.ends_with("individual.ssn")));
    }

    #[test]
    fn test_date_ordering_check() {
        let mut record = complete_record();
        record.deal.parties[0].employment[0].start_date = Some("06/01/2024".into());
        record.deal.parties[0].employment[0].end_date = Some("01/01/2020".into());
        let issues = DataValidator::new().validate(&record);
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Logic && i.path.ends_with("start_date")));
    }

    #[test]
    fn test_negative_income_check() {
        let mut record = complete_record();
        record.deal.parties[0].employment[0].monthly_income = Some(MonthlyIncome {
            base: Some(Money::from_major(-500)),
            ..MonthlyIncome::default()
        });
        let issues = DataValidator::new().validate(&record);
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Logic && i.path.ends_with("monthly_income.base")));
    }

    #[test]
    fn test_lender_party_skipped() {
        let mut record = complete_record();
        record.deal.parties.push(Party {
            company_name: Some("Ficus Bank".into()),
            party_role: Some(TaggedValue::new("Lender")),
            ..Party::default()
        });
        let issues = DataValidator::new().validate(&record);
        // lender has no individual/employment but produces no issues
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn test_zero_loan_amount_and_sales_price() {
        let mut record = complete_record();
        record.deal.transaction_information.as_mut().unwrap().final_loan_amount =
            Some(Money::ZERO);
        record.deal.collateral.as_mut().unwrap().subject_property.as_mut().unwrap().valuation =
            Some(Valuation {
                sales_price: Some(Money::from_major(-1)),
                ..Valuation::default()
            });
        let issues = DataValidator::new().validate(&record);
        assert!(issues.iter().any(|i| i.path.ends_with("final_loan_amount")));
        assert!(issues.iter().any(|i| i.path.ends_with("sales_price")));
    }

    #[test]
    fn test_bad_application_date_format() {
        let mut record = complete_record();
        record.deal.transaction_information.as_mut().unwrap().application_date =
            Some("Jan 15 2024".into());
        let issues = DataValidator::new().validate(&record);
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Format && i.path.ends_with("application_date")));
    }
}
