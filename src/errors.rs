use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input file not found: {path}")]
    FileNotFound {
        path: PathBuf,
    },

    #[error("unsupported file type '{extension}': accepted .pdf and common image formats")]
    UnsupportedFileType {
        extension: String,
    },

    #[error("unreadable pdf {path}: {message}")]
    UnreadablePdf {
        path: PathBuf,
        message: String,
    },

    #[error("rule configuration not found for '{document_type}' (tried: {tried:?})")]
    RuleConfigMissing {
        document_type: String,
        tried: Vec<String>,
    },

    #[error("invalid rule configuration {path}: {message}")]
    InvalidRuleConfig {
        path: PathBuf,
        message: String,
    },

    #[error("signature file not found: {path}")]
    SignaturesMissing {
        path: PathBuf,
    },

    #[error("unknown anchor signature document type '{doc_type}' in {path}")]
    UnknownSignatureType {
        doc_type: String,
        path: PathBuf,
    },

    #[error("invalid regex pattern '{pattern}': {message}")]
    InvalidPattern {
        pattern: String,
        message: String,
    },

    #[error("unknown document template: {doc_type}")]
    UnknownDocumentTemplate {
        doc_type: String,
    },

    #[error("no renderer configured for {concern}")]
    RendererUnavailable {
        concern: String,
    },

    #[error("loan record not found for workflow '{workflow_id}'")]
    RecordNotFound {
        workflow_id: String,
    },

    #[error("activity '{activity}' failed: {message}")]
    ActivityFailed {
        activity: String,
        message: String,
        retryable: bool,
    },

    #[error("analysis response could not be parsed: {message}")]
    AnalysisParse {
        message: String,
    },

    #[error("invalid workflow state: current {current}, expected {expected}")]
    InvalidState {
        current: String,
        expected: String,
    },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
    },

    #[error("xml emission failed: {message}")]
    XmlEmission {
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// whether the durable runtime should retry the failing activity
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::FileNotFound { .. }
            | PipelineError::UnsupportedFileType { .. }
            | PipelineError::UnreadablePdf { .. }
            | PipelineError::UnknownDocumentTemplate { .. }
            | PipelineError::InvalidConfiguration { .. }
            | PipelineError::InvalidState { .. } => false,
            PipelineError::ActivityFailed { retryable, .. } => *retryable,
            PipelineError::AnalysisParse { .. } => true,
            PipelineError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
