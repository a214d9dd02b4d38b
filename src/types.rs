use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// recognized document types, closed set with stable string identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "Unknown")]
    Unknown,
    // application core
    #[serde(rename = "URLA (Form 1003)")]
    Urla,
    #[serde(rename = "URLA - Unmarried Addendum")]
    UrlaUnmarriedAddendum,
    #[serde(rename = "URLA - Continuation Sheet")]
    UrlaContinuationSheet,
    // supplemental
    #[serde(rename = "SCIF (Form 1103)")]
    Scif,
    // income & tax
    #[serde(rename = "Pay Stub")]
    PayStub,
    #[serde(rename = "W-2 Form")]
    W2Form,
    #[serde(rename = "Tax Return (1040)")]
    TaxReturn1040,
    #[serde(rename = "IRS Form 4506-C")]
    IrsForm4506C,
    #[serde(rename = "1099-MISC")]
    Form1099Misc,
    #[serde(rename = "Military LES")]
    MilitaryLes,
    // assets & funds
    #[serde(rename = "Bank Statement")]
    BankStatement,
    #[serde(rename = "Gift Letter")]
    GiftLetter,
    #[serde(rename = "Investment Statement")]
    InvestmentStatement,
    // property
    #[serde(rename = "Appraisal (Form 1004)")]
    Appraisal,
    #[serde(rename = "Sales Contract")]
    SalesContract,
    #[serde(rename = "Proof of Insurance")]
    ProofOfInsurance,
    #[serde(rename = "Lease Agreement")]
    LeaseAgreement,
    // identity
    #[serde(rename = "Government ID")]
    GovernmentId,
    // government loans
    #[serde(rename = "VA Form 26-1880")]
    VaForm26_1880,
    #[serde(rename = "VA Form 26-8937")]
    VaForm26_8937,
    // disclosures
    #[serde(rename = "Loan Estimate")]
    LoanEstimate,
    #[serde(rename = "Closing Disclosure")]
    ClosingDisclosure,
}

impl DocumentType {
    /// every type except Unknown, in classifier declaration order (tie-break order)
    pub const ALL: [DocumentType; 22] = [
        DocumentType::Urla,
        DocumentType::UrlaUnmarriedAddendum,
        DocumentType::UrlaContinuationSheet,
        DocumentType::Scif,
        DocumentType::PayStub,
        DocumentType::W2Form,
        DocumentType::TaxReturn1040,
        DocumentType::IrsForm4506C,
        DocumentType::Form1099Misc,
        DocumentType::MilitaryLes,
        DocumentType::BankStatement,
        DocumentType::GiftLetter,
        DocumentType::InvestmentStatement,
        DocumentType::Appraisal,
        DocumentType::SalesContract,
        DocumentType::ProofOfInsurance,
        DocumentType::LeaseAgreement,
        DocumentType::GovernmentId,
        DocumentType::VaForm26_1880,
        DocumentType::VaForm26_8937,
        DocumentType::LoanEstimate,
        DocumentType::ClosingDisclosure,
    ];

    /// stable string identity, as used in rule files and signatures
    pub fn label(&self) -> &'static str {
        match self {
            DocumentType::Unknown => "Unknown",
            DocumentType::Urla => "URLA (Form 1003)",
            DocumentType::UrlaUnmarriedAddendum => "URLA - Unmarried Addendum",
            DocumentType::UrlaContinuationSheet => "URLA - Continuation Sheet",
            DocumentType::Scif => "SCIF (Form 1103)",
            DocumentType::PayStub => "Pay Stub",
            DocumentType::W2Form => "W-2 Form",
            DocumentType::TaxReturn1040 => "Tax Return (1040)",
            DocumentType::IrsForm4506C => "IRS Form 4506-C",
            DocumentType::Form1099Misc => "1099-MISC",
            DocumentType::MilitaryLes => "Military LES",
            DocumentType::BankStatement => "Bank Statement",
            DocumentType::GiftLetter => "Gift Letter",
            DocumentType::InvestmentStatement => "Investment Statement",
            DocumentType::Appraisal => "Appraisal (Form 1004)",
            DocumentType::SalesContract => "Sales Contract",
            DocumentType::ProofOfInsurance => "Proof of Insurance",
            DocumentType::LeaseAgreement => "Lease Agreement",
            DocumentType::GovernmentId => "Government ID",
            DocumentType::VaForm26_1880 => "VA Form 26-1880",
            DocumentType::VaForm26_8937 => "VA Form 26-8937",
            DocumentType::LoanEstimate => "Loan Estimate",
            DocumentType::ClosingDisclosure => "Closing Disclosure",
        }
    }

    /// reverse lookup from the stable label (tolerates the H-24 alias)
    pub fn from_label(label: &str) -> Option<DocumentType> {
        if label == "Unknown" {
            return Some(DocumentType::Unknown);
        }
        if label == "Loan Estimate (H-24)" {
            return Some(DocumentType::LoanEstimate);
        }
        DocumentType::ALL.iter().copied().find(|d| d.label() == label)
    }

    /// label with parens/spaces stripped, for chunk and document file names
    pub fn safe_name(&self) -> String {
        self.label()
            .chars()
            .filter(|c| *c != '(' && *c != ')' && *c != ' ')
            .collect()
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// input file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Image,
    Unknown,
}

/// how the pdf content was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfType {
    Digital,
    Scanned,
    NotPdf,
}

/// which extraction path the classifier recommends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedExtractor {
    Structured,
    Ocr,
}

/// classification decision, produced once per input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub file_type: FileType,
    pub pdf_type: PdfType,
    pub document_category: DocumentType,
    pub recommended_extractor: RecommendedExtractor,
    pub confidence: f64,
    pub reasoning: String,
}

/// validation issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Format,
    Logic,
    Type,
    Quality,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "CRITICAL",
            Severity::Format => "FORMAT",
            Severity::Logic => "LOGIC",
            Severity::Type => "TYPE",
            Severity::Quality => "QUALITY",
        };
        f.write_str(s)
    }
}

/// non-blocking validation finding, surfaced in the run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(severity: Severity, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.severity, self.path, self.message)
    }
}

/// loan lifecycle stage, monotone forward except ARCHIVED on rejection/timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoanStage {
    #[serde(rename = "LEAD_CAPTURE")]
    LeadCapture,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "UNDERWRITING")]
    Underwriting,
    #[serde(rename = "CLOSING")]
    Closing,
    #[serde(rename = "ARCHIVED")]
    Archived,
}

impl LoanStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStage::LeadCapture => "LEAD_CAPTURE",
            LoanStage::Processing => "PROCESSING",
            LoanStage::Underwriting => "UNDERWRITING",
            LoanStage::Closing => "CLOSING",
            LoanStage::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<LoanStage> {
        match s {
            "LEAD_CAPTURE" => Some(LoanStage::LeadCapture),
            "PROCESSING" => Some(LoanStage::Processing),
            "UNDERWRITING" => Some(LoanStage::Underwriting),
            "CLOSING" => Some(LoanStage::Closing),
            "ARCHIVED" => Some(LoanStage::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for LoanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// borrower-facing application status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatus {
    #[serde(rename = "Submitted")]
    Submitted,
    #[serde(rename = "Processing")]
    Processing,
    #[serde(rename = "Pending Underwriting Decision")]
    PendingUnderwritingDecision,
    #[serde(rename = "Waiting for Signature")]
    WaitingForSignature,
    #[serde(rename = "Underwriting Complete")]
    UnderwritingComplete,
    #[serde(rename = "Clear to Close")]
    ClearToClose,
    #[serde(rename = "Closing with Conditions")]
    ClosingWithConditions,
    #[serde(rename = "Funded")]
    Funded,
    #[serde(rename = "Rejected by Manager")]
    RejectedByManager,
    #[serde(rename = "Rejected by Underwriter")]
    RejectedByUnderwriter,
    #[serde(rename = "Withdrawn (Timeout)")]
    WithdrawnTimeout,
    #[serde(rename = "Failed to Start")]
    FailedToStart,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Submitted => "Submitted",
            LoanStatus::Processing => "Processing",
            LoanStatus::PendingUnderwritingDecision => "Pending Underwriting Decision",
            LoanStatus::WaitingForSignature => "Waiting for Signature",
            LoanStatus::UnderwritingComplete => "Underwriting Complete",
            LoanStatus::ClearToClose => "Clear to Close",
            LoanStatus::ClosingWithConditions => "Closing with Conditions",
            LoanStatus::Funded => "Funded",
            LoanStatus::RejectedByManager => "Rejected by Manager",
            LoanStatus::RejectedByUnderwriter => "Rejected by Underwriter",
            LoanStatus::WithdrawnTimeout => "Withdrawn (Timeout)",
            LoanStatus::FailedToStart => "Failed to Start",
        }
    }

    pub fn parse(s: &str) -> Option<LoanStatus> {
        match s {
            "Submitted" => Some(LoanStatus::Submitted),
            "Processing" => Some(LoanStatus::Processing),
            "Pending Underwriting Decision" => Some(LoanStatus::PendingUnderwritingDecision),
            "Waiting for Signature" => Some(LoanStatus::WaitingForSignature),
            "Underwriting Complete" => Some(LoanStatus::UnderwritingComplete),
            "Clear to Close" => Some(LoanStatus::ClearToClose),
            "Closing with Conditions" => Some(LoanStatus::ClosingWithConditions),
            "Funded" => Some(LoanStatus::Funded),
            "Rejected by Manager" => Some(LoanStatus::RejectedByManager),
            "Rejected by Underwriter" => Some(LoanStatus::RejectedByUnderwriter),
            "Withdrawn (Timeout)" => Some(LoanStatus::WithdrawnTimeout),
            "Failed to Start" => Some(LoanStatus::FailedToStart),
            _ => None,
        }
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// human underwriting decision recorded on the durable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnderwritingDecision {
    Approved,
    Rejected,
    Withdrawn,
}

impl UnderwritingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnderwritingDecision::Approved => "approved",
            UnderwritingDecision::Rejected => "rejected",
            UnderwritingDecision::Withdrawn => "withdrawn",
        }
    }
}

/// one audit log entry, append-only, exposed via query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub agent: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for doc in DocumentType::ALL {
            assert_eq!(DocumentType::from_label(doc.label()), Some(doc));
        }
        assert_eq!(
            DocumentType::from_label("Loan Estimate (H-24)"),
            Some(DocumentType::LoanEstimate)
        );
        assert_eq!(DocumentType::from_label("Sticky Note"), None);
    }

    #[test]
    fn test_safe_name_strips_parens() {
        assert_eq!(DocumentType::Urla.safe_name(), "URLAForm1003");
        assert_eq!(DocumentType::W2Form.safe_name(), "W-2Form");
    }

    #[test]
    fn test_stage_ordering_is_monotone() {
        assert!(LoanStage::LeadCapture < LoanStage::Processing);
        assert!(LoanStage::Processing < LoanStage::Underwriting);
        assert!(LoanStage::Underwriting < LoanStage::Closing);
        assert!(LoanStage::Closing < LoanStage::Archived);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            LoanStatus::Submitted,
            LoanStatus::PendingUnderwritingDecision,
            LoanStatus::WithdrawnTimeout,
            LoanStatus::Funded,
        ] {
            assert_eq!(LoanStatus::parse(status.as_str()), Some(status));
        }
    }
}
