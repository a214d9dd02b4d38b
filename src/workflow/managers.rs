use std::path::PathBuf;

use hourglass_rs::SafeTimeProvider;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::decimal::{Money, Rate};
use crate::errors::Result;
use crate::workflow::activities::{
    run_with_retries, AnalysisRole, Comms, DocGen, DocumentAnalysis, DocumentRequest, Encompass,
    RiskEvaluation, RiskInput, UnderwritingOps, UwDecision,
};
use crate::workflow::WorkflowLog;

/// fixed disclosure terms used for document generation
const DISCLOSURE_TERM_YEARS: u32 = 30;

pub(crate) fn disclosure_rate() -> Rate {
    Rate::from_percentage_decimal(rust_decimal_macros::dec!(6.5))
}

/// the closed worker capability surface available to workflows
pub struct WorkerPool {
    pub comms: Box<dyn Comms>,
    pub encompass: Box<dyn Encompass>,
    pub docgen: Box<dyn DocGen>,
    pub underwriting: Box<dyn UnderwritingOps>,
    pub analysis: Box<dyn DocumentAnalysis>,
    pub retry: RetryPolicy,
}

/// applicant-entered information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicantInfo {
    pub name: String,
    pub email: String,
    pub ssn: Option<String>,
    /// form-entered value, may carry commas or a dollar sign
    pub stated_income: String,
}

/// uploaded document locations
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DocumentPaths {
    pub id_document: Option<PathBuf>,
    pub tax_document: Option<PathBuf>,
    pub pay_stub: Option<PathBuf>,
    pub credit_document: Option<PathBuf>,
}

/// workflow input / live loan data, editable in flight via `update_field`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanInput {
    pub applicant_info: ApplicantInfo,
    pub file_paths: DocumentPaths,
    pub loan_amount: Money,
    pub property_value: Money,
    pub down_payment: Money,
    /// manager-edited fields outside the known set
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl LoanInput {
    /// apply an in-flight field edit from the manager dashboard
    ///
    /// `name`/`email`/`ssn`/`stated_income` land on applicant_info; the known
    /// financial fields parse into money columns; anything else is kept in
    /// the open bag
    pub fn apply_field_update(&mut self, field_name: &str, value: &Value) {
        let as_text = || match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let as_money = || match value {
            Value::Number(n) => n.as_f64().map(|f| {
                Money::from_decimal(rust_decimal::Decimal::from_f64_retain(f).unwrap_or_default())
            }),
            Value::String(s) => crate::value::clean_currency(s),
            _ => None,
        };
        match field_name {
            "name" => self.applicant_info.name = as_text(),
            "email" => self.applicant_info.email = as_text(),
            "ssn" => self.applicant_info.ssn = Some(as_text()),
            "stated_income" => self.applicant_info.stated_income = as_text(),
            "loan_amount" => {
                if let Some(amount) = as_money() {
                    self.loan_amount = amount;
                }
            }
            "property_value" => {
                if let Some(amount) = as_money() {
                    self.property_value = amount;
                }
            }
            "down_payment" => {
                if let Some(amount) = as_money() {
                    self.down_payment = amount;
                }
            }
            other => {
                self.extra.insert(other.to_string(), value.clone());
            }
        }
        info!(field_name, "loan data field updated");
    }

    fn stated_income_parsed(&self) -> i64 {
        let digits: String = self
            .applicant_info
            .stated_income
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0)
    }
}

/// lead-capture recommendation to the human manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Recommendation {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "MANUAL_REVIEW")]
    ManualReview,
    #[serde(rename = "PENDING_REVIEW")]
    PendingReview,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approved => "APPROVED",
            Recommendation::ManualReview => "MANUAL_REVIEW",
            Recommendation::PendingReview => "PENDING_REVIEW",
        }
    }
}

/// income verification summary built during lead capture
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeAnalysis {
    pub verified_income: i64,
    pub pay_stub_income: i64,
    pub tax_income: i64,
    pub stated_income: i64,
    pub income_mismatch: bool,
    pub confidence: f64,
    pub extracted_name: Option<String>,
    pub credit_score: i64,
}

impl IncomeAnalysis {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeadCaptureResult {
    pub recommendation: Recommendation,
    pub loan_data: LoanInput,
    pub loan_number: Option<String>,
    pub analysis: IncomeAnalysis,
}

/// lead capture department: loan file creation, welcome email, document
/// analysis. no gate here, the gate lives in the ceo
pub struct LeadCaptureWorkflow;

impl LeadCaptureWorkflow {
    pub fn run(
        pool: &WorkerPool,
        clock: &SafeTimeProvider,
        log: &mut WorkflowLog,
        workflow_id: &str,
        input: &LoanInput,
    ) -> Result<LeadCaptureResult> {
        let applicant = &input.applicant_info;
        info!(workflow_id, applicant = %applicant.name, "lead capture started");

        // step 1: create loan file in the LOS
        let mut loan_file_data = serde_json::Map::new();
        loan_file_data.insert("applicant_name".into(), json!(applicant.name));
        loan_file_data.insert("email".into(), json!(applicant.email));
        loan_file_data.insert("stated_income".into(), json!(applicant.stated_income));
        let receipt = run_with_retries(&pool.retry, "create_loan_file", || {
            pool.encompass
                .create_loan_file(workflow_id, &loan_file_data, clock.now())
        })?;
        log.append("Lead Capture", format!("Loan file created: {}", receipt.loan_number), clock.now());

        // step 2: welcome email
        if !applicant.email.is_empty() {
            let mut context = serde_json::Map::new();
            context.insert("loan_number".into(), json!(receipt.loan_number));
            run_with_retries(&pool.retry, "send_email", || {
                pool.comms
                    .send_email("welcome", &applicant.email, &context, clock.now())
            })?;
        }

        // step 3: per-document analysis
        let mut total_confidence = 0.0_f64;
        let mut analysis_count = 0_u32;
        let mut pay_stub_income = 0_i64;
        let mut tax_income = 0_i64;
        let mut extracted_name: Option<String> = None;

        let mut analyze = |path: &PathBuf, label: &str, income_slot: &mut i64| {
            let outcome = run_with_retries(&pool.retry, "analyze_document", || {
                let text = pool.analysis.read_pdf_content(path)?;
                pool.analysis
                    .analyze_document(&text, AnalysisRole::FinancialAuditor)
            });
            match outcome {
                Ok(result) => {
                    *income_slot = result.annual_income;
                    if result.applicant_name != "Unknown" {
                        extracted_name = Some(result.applicant_name.clone());
                    }
                    total_confidence += if result.annual_income > 0 { 0.9 } else { 0.3 };
                    analysis_count += 1;
                    info!(label, income = result.annual_income, "document analysis complete");
                }
                Err(e) => {
                    warn!(label, error = %e, "document analysis failed");
                    total_confidence += 0.5;
                    analysis_count += 1;
                }
            }
        };

        if let Some(path) = &input.file_paths.pay_stub {
            analyze(path, "pay_stub", &mut pay_stub_income);
        }
        if let Some(path) = &input.file_paths.tax_document {
            analyze(path, "tax_return", &mut tax_income);
        }

        // the highest extracted income is the more reliable figure
        let verified_income = pay_stub_income.max(tax_income);
        let stated_income = input.stated_income_parsed();

        // mismatch: more than 20% off the stated figure
        let income_mismatch = if verified_income > 0 && stated_income > 0 {
            let diff = (verified_income - stated_income).abs() as f64 / stated_income as f64;
            diff > 0.20
        } else {
            false
        };

        let confidence = (total_confidence / analysis_count.max(1) as f64 * 100.0).round() / 100.0;

        let recommendation = if income_mismatch {
            log.append("Lead Capture", "Income mismatch detected", clock.now());
            Recommendation::ManualReview
        } else if confidence > 0.8 {
            Recommendation::Approved
        } else {
            Recommendation::ManualReview
        };
        info!(workflow_id, recommendation = recommendation.as_str(), confidence,
              verified_income, income_mismatch, "lead capture complete");

        Ok(LeadCaptureResult {
            recommendation,
            loan_data: input.clone(),
            loan_number: Some(receipt.loan_number),
            analysis: IncomeAnalysis {
                verified_income,
                pay_stub_income,
                tax_income,
                stated_income,
                income_mismatch,
                confidence,
                extracted_name,
                credit_score: 0,
            },
        })
    }
}

/// processing department: derived numbers, initial disclosures, verification
pub struct ProcessingWorkflow;

impl ProcessingWorkflow {
    pub fn run(
        pool: &WorkerPool,
        clock: &SafeTimeProvider,
        log: &mut WorkflowLog,
        workflow_id: &str,
        loan_data: &LoanInput,
    ) -> Result<String> {
        info!(workflow_id, "processing started");
        log.append("Processing Manager", "Processing phase started", clock.now());

        let mut loan_amount = loan_data.loan_amount;
        if loan_amount.is_zero() && loan_data.property_value.is_positive() {
            loan_amount = loan_data.property_value - loan_data.down_payment;
        }

        log.append("DocGen MCP", "Generating Initial Disclosures...", clock.now());
        let request = DocumentRequest {
            workflow_id: workflow_id.to_string(),
            name: if loan_data.applicant_info.name.is_empty() {
                "Unknown Borrower".to_string()
            } else {
                loan_data.applicant_info.name.clone()
            },
            email: loan_data.applicant_info.email.clone(),
            property_value: loan_data.property_value,
            down_payment: loan_data.down_payment,
            loan_amount,
            rate: disclosure_rate(),
            term_years: DISCLOSURE_TERM_YEARS,
            monthly_payment: None,
        };
        let document = run_with_retries(&pool.retry, "generate_document", || {
            pool.docgen
                .generate_document("Initial Disclosures", &request, clock.now())
        })?;
        log.append(
            "DocGen MCP",
            format!("Initial Disclosures generated: {}", document.public_url),
            clock.now(),
        );

        // document verification stays a placeholder step in this build
        log.append("Processing Manager", "Document verification in progress...", clock.now());
        log.append("Processing Manager", "All documents verified successfully", clock.now());

        info!(workflow_id, monthly_payment = %document.monthly_payment, "processing complete");
        Ok("COMPLETED".to_string())
    }
}

/// underwriting outcome handed back to the ceo
#[derive(Debug, Clone, PartialEq)]
pub struct UnderwritingOutcome {
    pub decision: UwDecision,
    pub risk_evaluation: Option<RiskEvaluation>,
    pub status: String,
}

/// underwriting department: signature verification then rule-based risk
pub struct UnderwritingWorkflow;

impl UnderwritingWorkflow {
    pub fn run(
        pool: &WorkerPool,
        clock: &SafeTimeProvider,
        log: &mut WorkflowLog,
        workflow_id: &str,
        loan_amount: Money,
        analysis: &IncomeAnalysis,
    ) -> Result<UnderwritingOutcome> {
        info!(workflow_id, "underwriting started");
        log.append("Underwriting Manager", "Underwriting phase started", clock.now());

        log.append(
            "Underwriting Manager",
            "Verifying borrower signature on disclosures...",
            clock.now(),
        );
        let signature = run_with_retries(&pool.retry, "verify_signature", || {
            pool.underwriting.verify_signature(workflow_id, clock.now())
        })?;
        if !signature.verified {
            log.append(
                "Underwriting Manager",
                "ERROR: Signature not found on disclosures",
                clock.now(),
            );
            warn!(workflow_id, "signature verification failed");
            return Ok(UnderwritingOutcome {
                decision: UwDecision::SignatureMissing,
                risk_evaluation: None,
                status: "Failed".to_string(),
            });
        }
        log.append(
            "Underwriting Manager",
            format!("Signature verified at {}", signature.verified_at),
            clock.now(),
        );

        log.append("Risk Analyst", "Evaluating loan against underwriting criteria...", clock.now());
        let evaluation = run_with_retries(&pool.retry, "evaluate_risk", || {
            pool.underwriting.evaluate_risk(
                &RiskInput {
                    loan_amount,
                    analysis: analysis.clone(),
                },
                clock.now(),
            )
        })?;

        log.append(
            "Risk Analyst",
            format!("Credit Score: {}", evaluation.credit_score),
            clock.now(),
        );
        log.append(
            "Risk Analyst",
            format!("DTI Ratio: {}%", evaluation.dti_ratio),
            clock.now(),
        );
        log.append(
            "Risk Analyst",
            format!(
                "Loan Amount: ${:.2}",
                evaluation.loan_amount.as_decimal().to_f64().unwrap_or(0.0)
            ),
            clock.now(),
        );
        for issue in &evaluation.issues {
            log.append("Risk Analyst", format!("Issue: {issue}"), clock.now());
        }

        let status = match evaluation.decision {
            UwDecision::ClearToClose => {
                log.append("Underwriting Manager", "Loan approved - Clear to Close!", clock.now());
                "Clear to Close"
            }
            _ => {
                log.append(
                    "Underwriting Manager",
                    "Loan referred for additional human review",
                    clock.now(),
                );
                "Referred for Review"
            }
        };
        info!(workflow_id, decision = evaluation.decision.as_str(), "underwriting complete");

        Ok(UnderwritingOutcome {
            decision: evaluation.decision,
            risk_evaluation: Some(evaluation),
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::activities::{
        FileUnderwriting, MockComms, MockEncompass, TemplateDocGen, TextFileAnalysis,
    };
    use crate::workflow::state::{InMemoryLoanStore, LoanStore};
    use hourglass_rs::TimeSource;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn test_pool(uploads_root: &std::path::Path) -> (WorkerPool, Rc<RefCell<InMemoryLoanStore>>) {
        let store = Rc::new(RefCell::new(InMemoryLoanStore::new()));
        let store_dyn: Rc<RefCell<dyn LoanStore>> = store.clone();
        let pool = WorkerPool {
            comms: Box::new(MockComms::new()),
            encompass: Box::new(MockEncompass::new(store_dyn)),
            docgen: Box::new(TemplateDocGen::new(uploads_root)),
            underwriting: Box::new(FileUnderwriting::new(uploads_root)),
            analysis: Box::new(TextFileAnalysis::new()),
            retry: RetryPolicy::default(),
        };
        (pool, store)
    }

    fn clock() -> SafeTimeProvider {
        use chrono::TimeZone;
        SafeTimeProvider::new(TimeSource::Test(
            chrono::Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap(),
        ))
    }

    fn write_analysis_doc(dir: &std::path::Path, name: &str, income: i64) -> PathBuf {
        let path = dir.join(name);
        fs::write(
            &path,
            format!(
                "{{\"applicant_name\": \"John Doe\", \"annual_income\": {income}, \"credit_score\": 780, \"missing_docs\": []}}"
            ),
        )
        .unwrap();
        path
    }

    fn loan_input(
        stated_income: &str,
        pay_stub: Option<PathBuf>,
        tax_document: Option<PathBuf>,
    ) -> LoanInput {
        LoanInput {
            applicant_info: ApplicantInfo {
                name: "John Doe".into(),
                email: "john@example.com".into(),
                ssn: Some("123-45-6789".into()),
                stated_income: stated_income.into(),
            },
            file_paths: DocumentPaths {
                pay_stub,
                tax_document,
                ..DocumentPaths::default()
            },
            loan_amount: Money::from_major(450_000),
            property_value: Money::from_major(500_000),
            down_payment: Money::from_major(50_000),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_lead_capture_auto_approve_path() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        let pay_stub = write_analysis_doc(dir.path(), "pay_stub.pdf", 120_000);
        let tax_doc = write_analysis_doc(dir.path(), "tax.pdf", 120_000);
        let input = loan_input("120,000", Some(pay_stub), Some(tax_doc));

        let result = LeadCaptureWorkflow::run(&pool, &clock, &mut log, "wf-1", &input).unwrap();
        assert_eq!(result.recommendation, Recommendation::Approved);
        assert!(!result.analysis.income_mismatch);
        assert!(result.analysis.confidence >= 0.9);
        assert_eq!(result.analysis.verified_income, 120_000);
        assert!(result.loan_number.unwrap().starts_with("ENC-"));
    }

    #[test]
    fn test_lead_capture_income_mismatch() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        // pay stub annualizes to 45k against 100k stated: 0.55 > 0.20
        let pay_stub = write_analysis_doc(dir.path(), "pay_stub.pdf", 45_000);
        let input = loan_input("100,000", Some(pay_stub), None);

        let result = LeadCaptureWorkflow::run(&pool, &clock, &mut log, "wf-1", &input).unwrap();
        assert!(result.analysis.income_mismatch);
        assert_eq!(result.recommendation, Recommendation::ManualReview);
    }

    #[test]
    fn test_lead_capture_missing_document_degrades_confidence() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        let input = loan_input(
            "120,000",
            Some(dir.path().join("missing.pdf")),
            None,
        );
        let result = LeadCaptureWorkflow::run(&pool, &clock, &mut log, "wf-1", &input).unwrap();
        // failed analysis contributes 0.5 confidence
        assert_eq!(result.analysis.confidence, 0.5);
        assert_eq!(result.recommendation, Recommendation::ManualReview);
    }

    #[test]
    fn test_processing_generates_disclosures() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        let input = loan_input("120,000", None, None);
        let status = ProcessingWorkflow::run(&pool, &clock, &mut log, "wf-1", &input).unwrap();
        assert_eq!(status, "COMPLETED");
        assert!(dir.path().join("wf-1/Initial_Disclosures.pdf").exists());
        assert!(log
            .entries()
            .iter()
            .any(|e| e.message.contains("Initial Disclosures generated")));
    }

    #[test]
    fn test_underwriting_signature_missing_short_circuits() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        let analysis = IncomeAnalysis {
            verified_income: 120_000,
            pay_stub_income: 120_000,
            tax_income: 120_000,
            stated_income: 120_000,
            income_mismatch: false,
            confidence: 0.9,
            extracted_name: None,
            credit_score: 780,
        };
        let outcome = UnderwritingWorkflow::run(
            &pool,
            &clock,
            &mut log,
            "wf-1",
            Money::from_major(450_000),
            &analysis,
        )
        .unwrap();
        assert_eq!(outcome.decision, UwDecision::SignatureMissing);
        assert!(outcome.risk_evaluation.is_none());
    }

    #[test]
    fn test_underwriting_clear_to_close_after_signing() {
        let dir = TempDir::new().unwrap();
        let (pool, _store) = test_pool(dir.path());
        let clock = clock();
        let mut log = WorkflowLog::new();

        fs::create_dir_all(dir.path().join("wf-1")).unwrap();
        fs::write(dir.path().join("wf-1/Initial_Disclosures_SIGNED.pdf"), b"signed").unwrap();

        let analysis = IncomeAnalysis {
            verified_income: 120_000,
            pay_stub_income: 120_000,
            tax_income: 0,
            stated_income: 120_000,
            income_mismatch: false,
            confidence: 0.9,
            extracted_name: None,
            credit_score: 780,
        };
        let outcome = UnderwritingWorkflow::run(
            &pool,
            &clock,
            &mut log,
            "wf-1",
            Money::from_major(450_000),
            &analysis,
        )
        .unwrap();
        assert_eq!(outcome.decision, UwDecision::ClearToClose);
        assert_eq!(outcome.status, "Clear to Close");
    }

    #[test]
    fn test_field_updates_route_correctly() {
        let mut input = loan_input("120,000", None, None);
        input.apply_field_update("name", &json!("Jane Roe"));
        input.apply_field_update("stated_income", &json!("95,000"));
        input.apply_field_update("loan_amount", &json!(400000));
        input.apply_field_update("notes", &json!("rush file"));
        assert_eq!(input.applicant_info.name, "Jane Roe");
        assert_eq!(input.stated_income_parsed(), 95_000);
        assert_eq!(input.loan_amount, Money::from_major(400_000));
        assert_eq!(input.extra.get("notes"), Some(&json!("rush file")));
    }
}
