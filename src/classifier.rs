use std::path::Path;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use crate::types::{
    ClassificationResult, DocumentType, FileType, PdfType, RecommendedExtractor,
};

/// keyword table: 1 point per hit, declaration order breaks ties
const KEYWORDS: &[(DocumentType, &[&str])] = &[
    (DocumentType::Urla, &[
        "uniform residential loan application", "form 1003", "form 65",
        "uniform loan application dataset", "ulad", "borrower information",
    ]),
    (DocumentType::UrlaUnmarriedAddendum, &[
        "unmarried addendum", "domestic partnership", "community property rights", "civil union",
    ]),
    (DocumentType::UrlaContinuationSheet, &[
        "continuation sheet", "form 1003", "overflow", "additional information",
    ]),
    (DocumentType::Scif, &[
        "supplemental consumer information", "form 1103", "preferred language",
        "housing counseling", "consumer preferences",
    ]),
    (DocumentType::PayStub, &[
        "pay stub", "paystubs", "year-to-date earnings", "pay period", "earnings statement",
        "pay begin date", "pay end date", "hours and earnings", "net pay", "total gross",
        "fed taxable gross", "deductions", "ytd",
    ]),
    (DocumentType::W2Form, &[
        "w-2", "wage and tax statement", "tax withholdings", "form w-2",
    ]),
    (DocumentType::TaxReturn1040, &[
        "form 1040", "individual income tax return", "schedule c", "dividend income",
        "adjusted gross income", "profit or loss",
    ]),
    (DocumentType::IrsForm4506C, &[
        "form 4506-c", "request for transcript of tax return", "ives request",
    ]),
    (DocumentType::Form1099Misc, &[
        "1099-misc", "miscellaneous information", "nonemployee compensation", "rents", "royalties",
    ]),
    (DocumentType::MilitaryLes, &[
        "leave and earnings statement", "military pay", "base pay", "entitlements",
        "defense finance",
    ]),
    (DocumentType::BankStatement, &[
        "transaction history", "beginning balance", "ending balance", "summary of accounts",
        "checking account", "savings account",
    ]),
    (DocumentType::GiftLetter, &[
        "gift letter", "no repayment", "debt obligation", "donor", "gift funds",
    ]),
    (DocumentType::InvestmentStatement, &[
        "401(k)", "401k", "ira", "stock portfolio", "brokerage statement",
        "retirement account", "managed account",
    ]),
    (DocumentType::Appraisal, &[
        "uniform residential appraisal", "appraisal report", "appraised value",
        "sales comparison approach", "cost approach", "income approach", "subject property",
        "reconciliation", "gross living area",
    ]),
    (DocumentType::SalesContract, &[
        "sales contract", "purchase agreement", "terms of sale", "sales contract price",
        "offer to purchase",
    ]),
    (DocumentType::ProofOfInsurance, &[
        "hazard insurance", "homeowner's insurance", "declaration page",
        "collateral protection", "fire insurance",
    ]),
    (DocumentType::LeaseAgreement, &[
        "lease agreement", "rental terms", "monthly rent", "rental income", "residential lease",
    ]),
    (DocumentType::GovernmentId, &[
        "driver's license", "passport", "state id", "identity card", "government id",
    ]),
    (DocumentType::VaForm26_1880, &[
        "form 26-1880", "certificate of eligibility", "veterans affairs",
    ]),
    (DocumentType::VaForm26_8937, &[
        "form 26-8937", "verification of va benefits",
    ]),
    (DocumentType::LoanEstimate, &[
        "loan estimate", "estimated closing costs", "estimated cash to close",
        "projected payments", "comparisons", "rate lock",
    ]),
    (DocumentType::ClosingDisclosure, &[
        "closing disclosure", "loan terms", "closing costs", "uniform closing dataset",
        "ucd", "cash to close",
    ]),
];

/// regex table: 3 points per hit
const REGEX_PATTERNS: &[(DocumentType, &[&str])] = &[
    (DocumentType::W2Form, &[r"\bW-2\b", r"Form W-2"]),
    (DocumentType::TaxReturn1040, &[r"Form\s+1040", r"1040\s+U\.S\."]),
    (DocumentType::PayStub, &[
        r"\bYTD\b", r"\bNet Pay\b", r"\bGross Pay\b",
        r"\d{2}/\d{2}/\d{4}\s*-\s*\d{2}/\d{2}/\d{4}",
    ]),
    (DocumentType::BankStatement, &[r"Account\s+Summary", r"Statement\s+Period"]),
    (DocumentType::Appraisal, &[r"Form\s+1004", r"URAR", r"Appraisal\s+Report"]),
    (DocumentType::LoanEstimate, &[r"Loan\s+Estimate", r"LOAN\s+ESTIMATE", r"CFPB\s+H-24"]),
    (DocumentType::IrsForm4506C, &[r"Form\s+4506-C"]),
    (DocumentType::Form1099Misc, &[r"Form\s+1099-MISC"]),
    (DocumentType::VaForm26_1880, &[r"26-1880"]),
    (DocumentType::VaForm26_8937, &[r"26-8937"]),
];

/// complex structured forms that go down the structured-markdown path
const STRUCTURED_TYPES: &[DocumentType] = &[
    DocumentType::Scif,
    DocumentType::W2Form,
    DocumentType::TaxReturn1040,
    DocumentType::IrsForm4506C,
    DocumentType::Form1099Misc,
    DocumentType::BankStatement,
    DocumentType::PayStub,
    DocumentType::MilitaryLes,
    DocumentType::InvestmentStatement,
    DocumentType::VaForm26_1880,
    DocumentType::VaForm26_8937,
    DocumentType::Appraisal,
    DocumentType::LoanEstimate,
    DocumentType::ClosingDisclosure,
];

const URLA_TYPES: &[DocumentType] = &[
    DocumentType::Urla,
    DocumentType::UrlaUnmarriedAddendum,
    DocumentType::UrlaContinuationSheet,
];

fn compiled_patterns() -> &'static Vec<(DocumentType, Vec<Regex>)> {
    static PATTERNS: OnceLock<Vec<(DocumentType, Vec<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        REGEX_PATTERNS
            .iter()
            .map(|(doc, patterns)| {
                let compiled = patterns
                    .iter()
                    .filter_map(|p| {
                        RegexBuilder::new(p)
                            .case_insensitive(true)
                            .build()
                            .map_err(|e| warn!(pattern = p, error = %e, "bad classifier pattern"))
                            .ok()
                    })
                    .collect();
                (*doc, compiled)
            })
            .collect()
    })
}

/// keyword hit check, resilient to ocr word-fusion: multi-word keywords match
/// when every constituent word appears anywhere in the text
pub fn keyword_in_text(keyword: &str, text_lower: &str) -> bool {
    let words: Vec<&str> = keyword.split_whitespace().collect();
    if words.len() <= 1 {
        return text_lower.contains(&keyword.to_lowercase());
    }
    words.iter().all(|w| text_lower.contains(&w.to_lowercase()))
}

const PDF_EXTENSIONS: &[&str] = &["pdf"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "heic", "heif"];

pub fn is_pdf(path: &Path) -> bool {
    extension_lower(path).map_or(false, |e| PDF_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_image(path: &Path) -> bool {
    extension_lower(path).map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// keyword + regex document classifier over the first pages of text
#[derive(Debug, Default)]
pub struct DocumentClassifier;

impl DocumentClassifier {
    pub fn new() -> Self {
        Self
    }

    /// score text against the keyword and regex tables
    ///
    /// returns the winning category and its confidence; empty or unmatched
    /// text classifies as Unknown with confidence 0.5
    pub fn classify_text(&self, text: &str) -> (DocumentType, f64) {
        if text.trim().is_empty() {
            return (DocumentType::Unknown, 0.5);
        }
        let text_lower = text.to_lowercase();

        let mut best = DocumentType::Unknown;
        let mut best_score: u32 = 0;

        for (doc, keywords) in KEYWORDS {
            let mut score: u32 = keywords
                .iter()
                .filter(|kw| keyword_in_text(kw, &text_lower))
                .count() as u32;
            if let Some((_, patterns)) = compiled_patterns().iter().find(|(d, _)| d == doc) {
                score += 3 * patterns.iter().filter(|re| re.is_match(text)).count() as u32;
            }
            // strict > keeps the earliest declaration on ties
            if score > best_score {
                best_score = score;
                best = *doc;
            }
        }

        if best_score == 0 {
            return (DocumentType::Unknown, 0.5);
        }
        let confidence = (0.5 + best_score as f64 * 0.1).min(0.95);
        (best, confidence)
    }

    /// full classification for a file whose first pages of text were acquired
    pub fn classify(&self, path: &Path, text: &str) -> ClassificationResult {
        let file_type = if is_pdf(path) {
            FileType::Pdf
        } else if is_image(path) {
            FileType::Image
        } else {
            FileType::Unknown
        };
        // text arrives through the ocr port, so pdfs are treated as scanned
        let pdf_type = if file_type == FileType::Pdf {
            PdfType::Scanned
        } else {
            PdfType::NotPdf
        };

        let (category, confidence) = self.classify_text(text);

        let (recommended_extractor, reasoning) = if URLA_TYPES.contains(&category) {
            (
                RecommendedExtractor::Ocr,
                format!("Document is a URLA form ({category}). Using OCR for reliable extraction."),
            )
        } else if STRUCTURED_TYPES.contains(&category) {
            (
                RecommendedExtractor::Structured,
                format!("Document is a complex structured form ({category}). Structured parsing recommended."),
            )
        } else {
            (
                RecommendedExtractor::Ocr,
                "Standard document. Using OCR extraction.".to_string(),
            )
        };

        let result = ClassificationResult {
            file_type,
            pdf_type,
            document_category: category,
            recommended_extractor,
            confidence,
            reasoning,
        };
        info!(category = %result.document_category, confidence = result.confidence,
              "classification decision");
        result
    }
}
