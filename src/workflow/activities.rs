use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::decimal::{Money, Rate};
use crate::errors::{PipelineError, Result};
use crate::workflow::managers::IncomeAnalysis;
use crate::workflow::state::{LoanStore, MetadataPatch};

// ---------------------------------------------------------------------------
// retry runner
// ---------------------------------------------------------------------------

/// run an activity with the configured retry policy
///
/// non-retryable errors short-circuit; the final attempt's error is surfaced
pub fn run_with_retries<T>(
    policy: &RetryPolicy,
    activity: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= policy.maximum_attempts => {
                return Err(e);
            }
            Err(e) => {
                debug!(activity, attempt, backoff = %policy.backoff_for(attempt),
                       error = %e, "activity retry");
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// comms capability
// ---------------------------------------------------------------------------

pub trait Comms {
    fn send_email(
        &self,
        template_id: &str,
        recipient: &str,
        context: &serde_json::Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<String>;

    fn send_sms(&self, phone: &str, message: &str, now: DateTime<Utc>) -> Result<String>;
}

/// logging comms worker; deliveries are at-least-once and recorded for tests
#[derive(Debug, Default)]
pub struct MockComms {
    pub sent_emails: RefCell<Vec<(String, String)>>,
    pub sent_sms: RefCell<Vec<(String, String)>>,
}

impl MockComms {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Comms for MockComms {
    fn send_email(
        &self,
        template_id: &str,
        recipient: &str,
        context: &serde_json::Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        info!(template_id, recipient, %now, keys = context.len(), "email sent");
        self.sent_emails
            .borrow_mut()
            .push((template_id.to_string(), recipient.to_string()));
        Ok(format!("Email '{template_id}' sent to {recipient}"))
    }

    fn send_sms(&self, phone: &str, message: &str, now: DateTime<Utc>) -> Result<String> {
        info!(phone, message, %now, "sms sent");
        self.sent_sms
            .borrow_mut()
            .push((phone.to_string(), message.to_string()));
        Ok(format!("SMS sent to {phone}"))
    }
}

// ---------------------------------------------------------------------------
// encompass (LOS) capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanFileReceipt {
    pub loan_number: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

pub trait Encompass {
    /// create a loan file; idempotent on workflow_id
    fn create_loan_file(
        &self,
        workflow_id: &str,
        data: &serde_json::Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<LoanFileReceipt>;

    fn push_field_update(
        &self,
        loan_number: &str,
        field_id: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<String>;

    /// merge a patch into the durable loan record
    fn update_loan_metadata(
        &self,
        workflow_id: &str,
        patch: &MetadataPatch,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// mock LOS worker backed by the shared durable store
pub struct MockEncompass {
    store: Rc<RefCell<dyn LoanStore>>,
    issued: RefCell<HashMap<String, LoanFileReceipt>>,
}

impl MockEncompass {
    pub fn new(store: Rc<RefCell<dyn LoanStore>>) -> Self {
        Self {
            store,
            issued: RefCell::new(HashMap::new()),
        }
    }
}

impl Encompass for MockEncompass {
    fn create_loan_file(
        &self,
        workflow_id: &str,
        data: &serde_json::Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<LoanFileReceipt> {
        if let Some(existing) = self.issued.borrow().get(workflow_id).cloned() {
            info!(workflow_id, loan_number = %existing.loan_number, "loan file already created");
            return Ok(existing);
        }
        let loan_number = format!("ENC-{}", &Uuid::new_v4().simple().to_string()[..8].to_uppercase());
        let receipt = LoanFileReceipt {
            loan_number: loan_number.clone(),
            status: "Created".to_string(),
            created_at: now,
        };
        info!(workflow_id, %loan_number,
              applicant = data.get("applicant_name").and_then(|v| v.as_str()).unwrap_or("Unknown"),
              "loan file created");
        self.issued
            .borrow_mut()
            .insert(workflow_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    fn push_field_update(
        &self,
        loan_number: &str,
        field_id: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        info!(loan_number, field_id, value, %now, "field update pushed");
        Ok(format!("Field {field_id} updated to '{value}' for loan {loan_number}"))
    }

    fn update_loan_metadata(
        &self,
        workflow_id: &str,
        patch: &MetadataPatch,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.borrow_mut().update_metadata(workflow_id, patch, now)
    }
}

// ---------------------------------------------------------------------------
// docgen capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    pub workflow_id: String,
    pub name: String,
    pub email: String,
    pub property_value: Money,
    pub down_payment: Money,
    pub loan_amount: Money,
    pub rate: Rate,
    pub term_years: u32,
    pub monthly_payment: Option<Money>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedDocument {
    pub doc_type: String,
    pub file_path: PathBuf,
    pub public_url: String,
    pub loan_amount: Money,
    pub monthly_payment: Money,
    pub generated_at: DateTime<Utc>,
}

pub trait DocGen {
    fn generate_document(
        &self,
        doc_type: &str,
        data: &DocumentRequest,
        now: DateTime<Utc>,
    ) -> Result<GeneratedDocument>;
}

/// monthly payment via the standard amortization formula
/// P*r*(1+r)^n / ((1+r)^n - 1)
pub fn calculate_monthly_payment(loan_amount: Money, rate: Rate, term_years: u32) -> Money {
    if !loan_amount.is_positive() {
        return Money::ZERO;
    }
    let monthly_rate = rate.monthly_rate().as_decimal();
    let payments = term_years * 12;
    if payments == 0 {
        return Money::ZERO;
    }
    if monthly_rate.is_zero() {
        return loan_amount / Decimal::from(payments);
    }
    let mut factor = Decimal::ONE;
    let base = Decimal::ONE + monthly_rate;
    for _ in 0..payments {
        factor *= base;
    }
    let principal = loan_amount.as_decimal();
    Money::from_decimal(principal * monthly_rate * factor / (factor - Decimal::ONE))
}

/// templated document worker writing under `uploads/<workflow_id>/`
///
/// overwrites its target path; real deployments swap in a pdf renderer
pub struct TemplateDocGen {
    uploads_root: PathBuf,
}

impl TemplateDocGen {
    pub fn new(uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: uploads_root.into(),
        }
    }

    fn render(doc_type: &str, data: &DocumentRequest, monthly_payment: Money, now: DateTime<Utc>) -> Result<String> {
        let date = now.format("%B %d, %Y");
        let body = match doc_type {
            "Initial Disclosures" => format!(
                "INITIAL DISCLOSURES\n\nDate: {date}\n\nBorrower: {name}\nEmail: {email}\n\n\
                 LOAN SUMMARY\n---------------------------------------------------------\n\
                 Property Value:      ${property_value}\nDown Payment:        ${down_payment}\n\
                 Loan Amount:         ${loan_amount}\nInterest Rate:       {rate} Fixed\n\
                 Loan Term:           {term} years\nEstimated Monthly Payment: ${monthly_payment}\n\n\
                 IMPORTANT DISCLOSURES\n---------------------------------------------------------\n\
                 This is not a commitment to lend. Your actual rate, payment,\n\
                 and costs may vary based on your specific situation.\n\n\
                 Equal Housing Lender. NMLS #12345\n\n\
                 By proceeding with this application, you acknowledge\n\
                 receipt of these initial disclosures.\n",
                name = data.name,
                email = data.email,
                property_value = data.property_value,
                down_payment = data.down_payment,
                loan_amount = data.loan_amount,
                rate = data.rate,
                term = data.term_years,
            ),
            "Loan Estimate" => format!(
                "LOAN ESTIMATE\n\nPrepared for: {name}\nDate: {date}\n\n\
                 LOAN TERMS\n---------------------------------------------------------\n\
                 Loan Amount:    ${loan_amount}\nInterest Rate:  {rate}\n\
                 Monthly P&I:    ${monthly_payment}\n\n\
                 This estimate is valid for 10 business days.\n",
                name = data.name,
                loan_amount = data.loan_amount,
                rate = data.rate,
            ),
            "Final Approval Letter" => format!(
                "FINAL APPROVAL LETTER\n\nDate: {date}\n\nDear {name},\n\n\
                 Congratulations! Your mortgage application has been approved.\n\n\
                 Loan Amount:               ${loan_amount}\n\
                 Interest Rate:             {rate} Fixed\n\
                 Loan Term:                 {term} years\n\
                 Estimated Monthly Payment: ${monthly_payment}\n\n\
                 Your loan is clear to close. Our closing team will contact\n\
                 you to schedule the signing appointment.\n",
                name = data.name,
                loan_amount = data.loan_amount,
                rate = data.rate,
                term = data.term_years,
            ),
            other => {
                return Err(PipelineError::UnknownDocumentTemplate {
                    doc_type: other.to_string(),
                })
            }
        };
        Ok(body)
    }
}

impl DocGen for TemplateDocGen {
    fn generate_document(
        &self,
        doc_type: &str,
        data: &DocumentRequest,
        now: DateTime<Utc>,
    ) -> Result<GeneratedDocument> {
        let mut loan_amount = data.loan_amount;
        if loan_amount.is_zero() {
            loan_amount = data.property_value - data.down_payment;
        }
        let monthly_payment = data
            .monthly_payment
            .unwrap_or_else(|| calculate_monthly_payment(loan_amount, data.rate, data.term_years));

        let request = DocumentRequest {
            loan_amount,
            ..data.clone()
        };
        let rendered = Self::render(doc_type, &request, monthly_payment, now)?;

        let app_dir = self.uploads_root.join(&data.workflow_id);
        fs::create_dir_all(&app_dir)?;
        let filename = format!("{}.pdf", doc_type.replace(' ', "_"));
        let file_path = app_dir.join(&filename);
        fs::write(&file_path, rendered)?;

        let public_url = format!("/static/{}/{}", data.workflow_id, filename);
        info!(doc_type, path = %file_path.display(), "document generated");
        Ok(GeneratedDocument {
            doc_type: doc_type.to_string(),
            file_path,
            public_url,
            loan_amount,
            monthly_payment,
            generated_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// underwriting capability
// ---------------------------------------------------------------------------

/// automated underwriting outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UwDecision {
    #[serde(rename = "CLEAR_TO_CLOSE")]
    ClearToClose,
    #[serde(rename = "REFER_TO_HUMAN")]
    ReferToHuman,
    #[serde(rename = "SIGNATURE_MISSING")]
    SignatureMissing,
}

impl UwDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            UwDecision::ClearToClose => "CLEAR_TO_CLOSE",
            UwDecision::ReferToHuman => "REFER_TO_HUMAN",
            UwDecision::SignatureMissing => "SIGNATURE_MISSING",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureCheck {
    pub verified: bool,
    pub signed_document: Option<PathBuf>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskInput {
    pub loan_amount: Money,
    pub analysis: IncomeAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskEvaluation {
    pub decision: UwDecision,
    pub credit_score: i64,
    pub dti_ratio: Decimal,
    pub loan_amount: Money,
    pub issues: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

pub trait UnderwritingOps {
    /// confirm the signed initial disclosures exist
    fn verify_signature(&self, workflow_id: &str, now: DateTime<Utc>) -> Result<SignatureCheck>;

    /// apply the underwriting rules to the loan
    fn evaluate_risk(&self, input: &RiskInput, now: DateTime<Utc>) -> Result<RiskEvaluation>;
}

/// file-existence signature check + rule-based risk evaluation
///
/// risk rules: loan < $1,000,000; credit > 700 (estimated from analysis
/// confidence when absent); DTI < 43%; no income mismatch
pub struct FileUnderwriting {
    uploads_root: PathBuf,
}

impl FileUnderwriting {
    pub fn new(uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: uploads_root.into(),
        }
    }
}

impl UnderwritingOps for FileUnderwriting {
    fn verify_signature(&self, workflow_id: &str, now: DateTime<Utc>) -> Result<SignatureCheck> {
        let signed_file = self
            .uploads_root
            .join(workflow_id)
            .join("Initial_Disclosures_SIGNED.pdf");
        let verified = signed_file.exists();
        info!(workflow_id, path = %signed_file.display(), verified, "signature verification");
        Ok(SignatureCheck {
            signed_document: verified.then_some(signed_file),
            verified,
            verified_at: now,
        })
    }

    fn evaluate_risk(&self, input: &RiskInput, now: DateTime<Utc>) -> Result<RiskEvaluation> {
        let loan_amount = input.loan_amount;
        let analysis = &input.analysis;

        let mut credit_score = analysis.credit_score;
        if credit_score == 0 {
            // estimate from analysis confidence on the [650, 800] interval
            credit_score = 650 + (analysis.confidence * 150.0) as i64;
        }

        let monthly_payment = loan_amount.as_decimal() * Decimal::new(5, 3); // 0.005
        let monthly_income = if analysis.verified_income > 0 {
            Decimal::from(analysis.verified_income) / Decimal::from(12)
        } else {
            Decimal::ONE
        };
        // the threshold check runs on the unrounded ratio; rounding is
        // display-only
        let dti_ratio = if monthly_income > Decimal::ZERO {
            monthly_payment / monthly_income * Decimal::from(100)
        } else {
            Decimal::from(100)
        };
        let dti_display = dti_ratio.round_dp(2);

        let mut issues = Vec::new();
        if loan_amount >= Money::from_major(1_000_000) {
            issues.push(format!("Loan amount ${loan_amount} exceeds $1M limit"));
        }
        if credit_score <= 700 {
            issues.push(format!("Credit score {credit_score} below 700 threshold"));
        }
        if dti_ratio > Decimal::from(43) {
            issues.push(format!("DTI ratio {dti_display}% exceeds 43% limit"));
        }
        if analysis.income_mismatch {
            issues.push("Income mismatch detected between stated and verified income".to_string());
        }

        let decision = if issues.is_empty() {
            UwDecision::ClearToClose
        } else {
            UwDecision::ReferToHuman
        };
        info!(%loan_amount, credit_score, dti_ratio = %dti_display, decision = decision.as_str(),
              issues = issues.len(), "risk evaluation");
        Ok(RiskEvaluation {
            decision,
            credit_score,
            dti_ratio: dti_display,
            loan_amount,
            issues,
            evaluated_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// document analysis capability (deterministic stand-in for the llm mapper)
// ---------------------------------------------------------------------------

/// analysis role constraining what the mapper may extract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisRole {
    FinancialAuditor,
    IdentityVerifier,
    GeneralAnalyst,
}

impl AnalysisRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisRole::FinancialAuditor => "financial_auditor",
            AnalysisRole::IdentityVerifier => "identity_verifier",
            AnalysisRole::GeneralAnalyst => "general_analyst",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentAnalysisResult {
    pub applicant_name: String,
    pub annual_income: i64,
    pub credit_score: i64,
    pub missing_docs: Vec<String>,
}

pub trait DocumentAnalysis {
    fn read_pdf_content(&self, path: &Path) -> Result<String>;
    fn analyze_document(&self, text: &str, role: AnalysisRole) -> Result<DocumentAnalysisResult>;
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

fn coerce_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

/// strict-json analysis output contract
///
/// extracts the first `{...}` object from the raw response (markdown fences
/// tolerated), requires valid json with the known keys; missing income is
/// acceptable and a missing name degrades to "Unknown"
pub fn parse_analysis_json(raw: &str) -> Result<DocumentAnalysisResult> {
    let Some(found) = json_object_re().find(raw) else {
        return Err(PipelineError::AnalysisParse {
            message: "no JSON object found".to_string(),
        });
    };
    let parsed: Value =
        serde_json::from_str(found.as_str()).map_err(|e| PipelineError::AnalysisParse {
            message: format!("invalid JSON: {e}"),
        })?;

    let applicant_name = parsed
        .get("applicant_name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Unknown")
        .to_string();
    let missing_docs = parsed
        .get("missing_docs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(DocumentAnalysisResult {
        applicant_name,
        annual_income: coerce_int(parsed.get("annual_income")),
        credit_score: coerce_int(parsed.get("credit_score")),
        missing_docs,
    })
}

/// deterministic analysis worker for development and tests
///
/// documents carry their facts as an embedded json object; the worker reads
/// the file as text and applies the same output contract an llm mapper would
#[derive(Debug, Default)]
pub struct TextFileAnalysis;

impl TextFileAnalysis {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentAnalysis for TextFileAnalysis {
    fn read_pdf_content(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            return Err(PipelineError::ActivityFailed {
                activity: "read_pdf_content".to_string(),
                message: format!("File not found: {}", path.display()),
                retryable: false,
            });
        }
        let text = fs::read_to_string(path)?;
        // cap to keep downstream prompts bounded
        Ok(text.chars().take(5000).collect())
    }

    fn analyze_document(&self, text: &str, role: AnalysisRole) -> Result<DocumentAnalysisResult> {
        let mut result = parse_analysis_json(text)?;
        match role {
            AnalysisRole::FinancialAuditor => result.credit_score = 0,
            AnalysisRole::IdentityVerifier => result.annual_income = 0,
            AnalysisRole::GeneralAnalyst => {}
        }
        debug!(role = role.as_str(), name = %result.applicant_name,
               income = result.annual_income, "document analyzed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::InMemoryLoanStore;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
    }

    fn analysis(verified: i64, confidence: f64, mismatch: bool, credit: i64) -> IncomeAnalysis {
        IncomeAnalysis {
            verified_income: verified,
            pay_stub_income: verified,
            tax_income: verified,
            stated_income: verified,
            income_mismatch: mismatch,
            confidence,
            extracted_name: Some("John Doe".into()),
            credit_score: credit,
        }
    }

    #[test]
    fn test_monthly_payment_formula() {
        // $450k at 6.5% over 30 years
        let payment = calculate_monthly_payment(
            Money::from_major(450_000),
            Rate::from_percentage_decimal(dec!(6.5)),
            30,
        );
        assert_eq!(payment, Money::from_str_exact("2844.31").unwrap());
        // zero rate divides evenly
        let flat = calculate_monthly_payment(Money::from_major(12_000), Rate::ZERO, 1);
        assert_eq!(flat, Money::from_major(1_000));
        assert_eq!(calculate_monthly_payment(Money::ZERO, Rate::ZERO, 30), Money::ZERO);
    }

    #[test]
    fn test_parse_analysis_json_with_fences() {
        let raw = "Sure! Here is the JSON:\n```json\n{\"applicant_name\": \"Jane Roe\", \"annual_income\": 120000, \"credit_score\": null, \"missing_docs\": []}\n```";
        let result = parse_analysis_json(raw).unwrap();
        assert_eq!(result.applicant_name, "Jane Roe");
        assert_eq!(result.annual_income, 120_000);
        assert_eq!(result.credit_score, 0);
    }

    #[test]
    fn test_parse_analysis_json_coercions() {
        let raw = r#"{"applicant_name": null, "annual_income": "85,000", "credit_score": 712.0, "missing_docs": ["w2"]}"#;
        let result = parse_analysis_json(raw).unwrap();
        assert_eq!(result.applicant_name, "Unknown");
        assert_eq!(result.annual_income, 85_000);
        assert_eq!(result.credit_score, 712);
        assert_eq!(result.missing_docs, vec!["w2".to_string()]);
    }

    #[test]
    fn test_parse_analysis_json_failure_is_retryable() {
        let err = parse_analysis_json("no json here at all").unwrap_err();
        assert!(err.is_retryable());
        let err = parse_analysis_json("{not valid json}").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_runner_retries_then_succeeds() {
        let mut attempts = 0;
        let result = run_with_retries(&RetryPolicy::default(), "flaky", || {
            attempts += 1;
            if attempts < 3 {
                Err(PipelineError::AnalysisParse {
                    message: "transient".into(),
                })
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_runner_nonretryable_short_circuits() {
        let mut attempts = 0;
        let result: Result<()> = run_with_retries(&RetryPolicy::default(), "fatal", || {
            attempts += 1;
            Err(PipelineError::UnsupportedFileType {
                extension: "docx".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_create_loan_file_idempotent_on_workflow_id() {
        let store: Rc<RefCell<dyn LoanStore>> = Rc::new(RefCell::new(InMemoryLoanStore::new()));
        let encompass = MockEncompass::new(store);
        let data = serde_json::Map::new();
        let first = encompass.create_loan_file("wf-1", &data, now()).unwrap();
        let second = encompass.create_loan_file("wf-1", &data, now()).unwrap();
        assert_eq!(first.loan_number, second.loan_number);
        assert!(first.loan_number.starts_with("ENC-"));
        let other = encompass.create_loan_file("wf-2", &data, now()).unwrap();
        assert_ne!(first.loan_number, other.loan_number);
    }

    #[test]
    fn test_docgen_writes_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let docgen = TemplateDocGen::new(dir.path());
        let request = DocumentRequest {
            workflow_id: "wf-1".into(),
            name: "John Doe".into(),
            email: "john@example.com".into(),
            property_value: Money::from_major(500_000),
            down_payment: Money::from_major(50_000),
            loan_amount: Money::from_major(450_000),
            rate: Rate::from_percentage_decimal(dec!(6.5)),
            term_years: 30,
            monthly_payment: None,
        };
        let generated = docgen.generate_document("Initial Disclosures", &request, now()).unwrap();
        assert_eq!(generated.public_url, "/static/wf-1/Initial_Disclosures.pdf");
        assert!(generated.file_path.exists());
        assert_eq!(generated.monthly_payment, Money::from_str_exact("2844.31").unwrap());
        // overwrite is silent
        let again = docgen.generate_document("Initial Disclosures", &request, now()).unwrap();
        assert_eq!(again.file_path, generated.file_path);
    }

    #[test]
    fn test_docgen_derives_loan_amount_when_missing() {
        let dir = TempDir::new().unwrap();
        let docgen = TemplateDocGen::new(dir.path());
        let request = DocumentRequest {
            workflow_id: "wf-1".into(),
            name: "John Doe".into(),
            email: String::new(),
            property_value: Money::from_major(500_000),
            down_payment: Money::from_major(50_000),
            loan_amount: Money::ZERO,
            rate: Rate::from_percentage_decimal(dec!(6.5)),
            term_years: 30,
            monthly_payment: None,
        };
        let generated = docgen.generate_document("Loan Estimate", &request, now()).unwrap();
        assert_eq!(generated.loan_amount, Money::from_major(450_000));
    }

    #[test]
    fn test_unknown_template_is_fatal() {
        let dir = TempDir::new().unwrap();
        let docgen = TemplateDocGen::new(dir.path());
        let request = DocumentRequest {
            workflow_id: "wf-1".into(),
            name: "x".into(),
            email: String::new(),
            property_value: Money::ZERO,
            down_payment: Money::ZERO,
            loan_amount: Money::from_major(1),
            rate: Rate::ZERO,
            term_years: 30,
            monthly_payment: None,
        };
        let err = docgen.generate_document("Mystery Doc", &request, now()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_signature_verification_checks_file() {
        let dir = TempDir::new().unwrap();
        let underwriting = FileUnderwriting::new(dir.path());
        let check = underwriting.verify_signature("wf-1", now()).unwrap();
        assert!(!check.verified);

        fs::create_dir_all(dir.path().join("wf-1")).unwrap();
        fs::write(dir.path().join("wf-1/Initial_Disclosures_SIGNED.pdf"), b"signed").unwrap();
        let check = underwriting.verify_signature("wf-1", now()).unwrap();
        assert!(check.verified);
        assert!(check.signed_document.is_some());
    }

    #[test]
    fn test_risk_evaluation_clear_to_close() {
        let dir = TempDir::new().unwrap();
        let underwriting = FileUnderwriting::new(dir.path());
        let evaluation = underwriting
            .evaluate_risk(
                &RiskInput {
                    loan_amount: Money::from_major(450_000),
                    analysis: analysis(120_000, 0.9, false, 780),
                },
                now(),
            )
            .unwrap();
        // payment estimate 2250, income 10000/mo, dti 22.5
        assert_eq!(evaluation.dti_ratio, dec!(22.50));
        assert_eq!(evaluation.decision, UwDecision::ClearToClose);
        assert!(evaluation.issues.is_empty());
    }

    #[test]
    fn test_dti_threshold_checks_unrounded_ratio() {
        let dir = TempDir::new().unwrap();
        let underwriting = FileUnderwriting::new(dir.path());
        // $860,040 against $120k income: ratio 43.002, rounds to 43.00 but
        // still breaches the limit
        let evaluation = underwriting
            .evaluate_risk(
                &RiskInput {
                    loan_amount: Money::from_major(860_040),
                    analysis: analysis(120_000, 0.9, false, 780),
                },
                now(),
            )
            .unwrap();
        assert_eq!(evaluation.dti_ratio, dec!(43.00));
        assert_eq!(evaluation.decision, UwDecision::ReferToHuman);
        assert_eq!(evaluation.issues.len(), 1);
        assert!(evaluation.issues[0].contains("DTI ratio 43.00% exceeds"));

        // exactly 43.00 does not breach the strict > limit
        let evaluation = underwriting
            .evaluate_risk(
                &RiskInput {
                    loan_amount: Money::from_major(860_000),
                    analysis: analysis(120_000, 0.9, false, 780),
                },
                now(),
            )
            .unwrap();
        assert_eq!(evaluation.decision, UwDecision::ClearToClose);
    }

    #[test]
    fn test_risk_evaluation_flags_issues() {
        let dir = TempDir::new().unwrap();
        let underwriting = FileUnderwriting::new(dir.path());
        let evaluation = underwriting
            .evaluate_risk(
                &RiskInput {
                    loan_amount: Money::from_major(1_200_000),
                    analysis: analysis(45_000, 0.2, true, 0),
                },
                now(),
            )
            .unwrap();
        assert_eq!(evaluation.decision, UwDecision::ReferToHuman);
        // credit estimated from confidence: 650 + 0.2*150 = 680
        assert_eq!(evaluation.credit_score, 680);
        assert_eq!(evaluation.issues.len(), 4);
    }

    #[test]
    fn test_role_constraints_zero_ignored_fields() {
        let worker = TextFileAnalysis::new();
        let text = r#"{"applicant_name": "Jane Roe", "annual_income": 120000, "credit_score": 745, "missing_docs": []}"#;
        let audit = worker.analyze_document(text, AnalysisRole::FinancialAuditor).unwrap();
        assert_eq!(audit.annual_income, 120_000);
        assert_eq!(audit.credit_score, 0);
        let identity = worker.analyze_document(text, AnalysisRole::IdentityVerifier).unwrap();
        assert_eq!(identity.annual_income, 0);
        assert_eq!(identity.credit_score, 745);
    }
}
