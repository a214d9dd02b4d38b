pub mod acquire;
pub mod canonical;
pub mod classifier;
pub mod config;
pub mod decimal;
pub mod errors;
pub mod merger;
pub mod mismo;
pub mod pipeline;
pub mod relational;
pub mod rules;
pub mod splitter;
pub mod types;
pub mod validator;
pub mod value;
pub mod workflow;

// re-export key types
pub use canonical::{CanonicalAssembler, CanonicalRecord};
pub use classifier::DocumentClassifier;
pub use config::{MismoConfig, MismoVersion, PipelineConfig, RetryPolicy};
pub use decimal::{Money, Rate};
pub use errors::{PipelineError, Result};
pub use merger::DocumentMerger;
pub use mismo::MismoEmitter;
pub use pipeline::{DocumentInput, DocumentPipeline, RunArtifacts};
pub use relational::{RelationalPayload, RelationalTransformer, SchemaEnforcer};
pub use rules::RuleEngine;
pub use splitter::{DocumentSplitter, PageGroup, SignatureSet};
pub use types::{
    ClassificationResult, DocumentType, LoanStage, LoanStatus, Severity, UnderwritingDecision,
    ValidationIssue,
};
pub use validator::DataValidator;
pub use value::{clean_currency, clean_number, FieldValue, FlatMap};
pub use workflow::{
    InMemoryLoanStore, LoanApplication, LoanLifecycleWorkflow, LoanStore, WorkerPool, WorkflowEnv,
    WorkflowLog, WorkflowResult,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
