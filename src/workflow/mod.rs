pub mod activities;
pub mod ceo;
pub mod managers;
pub mod state;

use chrono::{DateTime, Utc};

use crate::types::LogEntry;

pub use activities::{
    calculate_monthly_payment, parse_analysis_json, run_with_retries, AnalysisRole, Comms, DocGen,
    DocumentAnalysis, DocumentAnalysisResult, DocumentRequest, Encompass, FileUnderwriting,
    GeneratedDocument, LoanFileReceipt, MockComms, MockEncompass, RiskEvaluation, RiskInput,
    SignatureCheck, TemplateDocGen, TextFileAnalysis, UnderwritingOps, UwDecision,
};
pub use ceo::{
    CeoPhase, HumanDecision, LoanLifecycleWorkflow, UnderwritingStatusView, WorkflowEnv,
    WorkflowResult,
};
pub use managers::{
    ApplicantInfo, DocumentPaths, IncomeAnalysis, LeadCaptureResult, LeadCaptureWorkflow,
    LoanInput, ProcessingWorkflow, Recommendation, UnderwritingOutcome, UnderwritingWorkflow,
    WorkerPool,
};
pub use state::{InMemoryLoanStore, LoanApplication, LoanStore, MetadataPatch};

/// append-only audit log exposed through the `get_logs` query
#[derive(Debug, Default)]
pub struct WorkflowLog {
    entries: Vec<LogEntry>,
}

impl WorkflowLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// append an entry without a stage annotation (manager-level logs)
    pub fn append(&mut self, agent: &str, message: impl Into<String>, timestamp: DateTime<Utc>) {
        self.append_with_stage(agent, message, timestamp, "");
    }

    pub fn append_with_stage(
        &mut self,
        agent: &str,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        stage: &str,
    ) {
        self.entries.push(LogEntry {
            agent: agent.to_string(),
            message: message.into(),
            timestamp,
            stage: stage.to_string(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_is_append_only_and_ordered() {
        let mut log = WorkflowLog::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        log.append_with_stage("CEO", "started", t0, "LEAD_CAPTURE");
        log.append("Processing Manager", "working", t0);
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].agent, "CEO");
        assert_eq!(log.entries()[0].stage, "LEAD_CAPTURE");
        assert_eq!(log.entries()[1].stage, "");
    }
}
