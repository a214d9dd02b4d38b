use chrono::{DateTime, Duration, Utc};
use hourglass_rs::SafeTimeProvider;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::Result;
use crate::types::{LoanStage, LogEntry};
use crate::workflow::activities::{run_with_retries, DocumentRequest, UwDecision};
use crate::workflow::managers::{
    disclosure_rate, IncomeAnalysis, LeadCaptureWorkflow, LoanInput, ProcessingWorkflow,
    Recommendation, UnderwritingWorkflow, WorkerPool,
};
use crate::workflow::state::MetadataPatch;
use crate::workflow::WorkflowLog;

/// underwriting decision gate timeout
const UNDERWRITING_DECISION_TIMEOUT_DAYS: i64 = 7;

/// human manager decision received at the approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanDecision {
    Approved,
    Rejected,
}

/// terminal workflow results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowResult {
    Completed,
    Rejected,
    Withdrawn,
}

impl WorkflowResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowResult::Completed => "COMPLETED",
            WorkflowResult::Rejected => "REJECTED",
            WorkflowResult::Withdrawn => "WITHDRAWN",
        }
    }
}

/// where the state machine currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeoPhase {
    LeadCapture,
    AwaitingHumanApproval,
    Processing,
    AwaitingUnderwritingDecision {
        deadline: DateTime<Utc>,
    },
    AwaitingSignature,
    Underwriting,
    Closing,
    Archived,
}

/// live underwriting gate status exposed via query
#[derive(Debug, Clone, PartialEq)]
pub struct UnderwritingStatusView {
    pub is_complete: bool,
    pub decision: Option<&'static str>,
    pub reason: Option<String>,
    pub automated_decision: Option<&'static str>,
}

/// the workflow's execution environment: workers and the injected clock
///
/// all side effects flow through the worker pool; the ceo never touches the
/// durable store directly
pub struct WorkflowEnv<'a> {
    pub pool: &'a WorkerPool,
    pub clock: &'a SafeTimeProvider,
}

/// supreme orchestrator: the loan lifecycle state machine
///
/// phases run linearly, delegating to department child workflows; gates
/// suspend the machine until a signal arrives (or, for the underwriting
/// decision, the 7-day timer fires). signals received before a gate is
/// reached are buffered and consumed at gate entry
pub struct LoanLifecycleWorkflow {
    workflow_id: String,
    stage: LoanStage,
    phase: CeoPhase,
    loan_data: LoanInput,
    logs: WorkflowLog,
    decision_reason: Option<String>,
    loan_number: Option<String>,
    analysis: Option<IncomeAnalysis>,

    // gate state, written by signal handlers
    human_decision: Option<HumanDecision>,
    borrower_signed: bool,
    is_underwriting_complete: bool,
    underwriting_decision_approved: Option<bool>,
    underwriting_decision_reason: Option<String>,

    automated_uw_decision: Option<UwDecision>,
    result: Option<WorkflowResult>,
}

impl LoanLifecycleWorkflow {
    pub fn new(workflow_id: impl Into<String>, input: LoanInput) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage: LoanStage::LeadCapture,
            phase: CeoPhase::LeadCapture,
            loan_data: input,
            logs: WorkflowLog::new(),
            decision_reason: None,
            loan_number: None,
            analysis: None,
            human_decision: None,
            borrower_signed: false,
            is_underwriting_complete: false,
            underwriting_decision_approved: None,
            underwriting_decision_reason: None,
            automated_uw_decision: None,
            result: None,
        }
    }

    // ================================================================
    //  signals
    // ================================================================

    /// human manager approval gate signal
    pub fn human_approval(&mut self, approved: bool) {
        self.human_decision = Some(if approved {
            HumanDecision::Approved
        } else {
            HumanDecision::Rejected
        });
        info!(workflow_id = %self.workflow_id, approved, "human decision received");
    }

    /// in-flight field edit from the manager dashboard
    pub fn update_field(&mut self, field_name: &str, value: &Value) {
        self.loan_data.apply_field_update(field_name, value);
    }

    /// borrower signed the initial disclosures
    pub fn borrower_signature(&mut self, signed: bool) {
        self.borrower_signed = signed;
        info!(workflow_id = %self.workflow_id, signed, "borrower signature received");
    }

    /// human underwriter decision (waiter pattern)
    pub fn submit_underwriting_decision(&mut self, approved: bool, reason: impl Into<String>) {
        self.underwriting_decision_approved = Some(approved);
        self.underwriting_decision_reason = Some(reason.into());
        self.is_underwriting_complete = true;
        info!(workflow_id = %self.workflow_id, approved, "underwriting decision received");
    }

    // ================================================================
    //  queries
    // ================================================================

    pub fn get_current_stage(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn get_loan_number(&self) -> Option<&str> {
        self.loan_number.as_deref()
    }

    pub fn get_decision_reason(&self) -> Option<&str> {
        self.decision_reason.as_deref()
    }

    pub fn get_logs(&self) -> &[LogEntry] {
        self.logs.entries()
    }

    pub fn get_underwriting_status(&self) -> UnderwritingStatusView {
        UnderwritingStatusView {
            is_complete: self.is_underwriting_complete,
            decision: self.underwriting_decision_approved.map(|approved| {
                if approved {
                    "approved"
                } else {
                    "rejected"
                }
            }),
            reason: self.underwriting_decision_reason.clone(),
            automated_decision: self.automated_uw_decision.map(|d| d.as_str()),
        }
    }

    pub fn result(&self) -> Option<WorkflowResult> {
        self.result
    }

    pub fn phase(&self) -> CeoPhase {
        self.phase
    }

    // ================================================================
    //  execution
    // ================================================================

    /// begin execution; runs until the first gate or a terminal result
    pub fn start(&mut self, env: &mut WorkflowEnv<'_>) -> Result<Option<WorkflowResult>> {
        info!(workflow_id = %self.workflow_id,
              applicant = %self.loan_data.applicant_info.name, "ceo workflow started");
        self.log("CEO", format!("Loan lifecycle initiated for {}", self.loan_data.applicant_info.name), env);
        self.resume(env)
    }

    /// timer tick: re-evaluates gates against the clock (7-day timeout)
    pub fn tick(&mut self, env: &mut WorkflowEnv<'_>) -> Result<Option<WorkflowResult>> {
        self.resume(env)
    }

    /// drive the state machine until it suspends at a gate or terminates
    ///
    /// transitions fire on child completion, buffered signals, and timer
    /// expirations; all durable writes go through the encompass activity
    pub fn resume(&mut self, env: &mut WorkflowEnv<'_>) -> Result<Option<WorkflowResult>> {
        if let Some(result) = self.result {
            return Ok(Some(result));
        }
        loop {
            match self.phase {
                CeoPhase::LeadCapture => self.run_lead_capture(env)?,

                CeoPhase::AwaitingHumanApproval => match self.human_decision {
                    None => return Ok(None),
                    Some(HumanDecision::Rejected) => {
                        self.log("Human Manager", "Decision: REJECTED", env);
                        self.stage = LoanStage::Archived;
                        self.decision_reason = Some("Rejected by human manager".to_string());
                        self.log("CEO", "Application REJECTED - Moving to Archive", env);
                        self.persist(
                            env,
                            json!({
                                "status": "Rejected by Manager",
                                "loan_stage": "ARCHIVED",
                                "final_status": "REJECTED",
                                "is_locked": false,
                            }),
                        )?;
                        return self.finish(WorkflowResult::Rejected);
                    }
                    Some(HumanDecision::Approved) => {
                        self.log("Human Manager", "Decision: APPROVED", env);
                        self.log("CEO", "Human APPROVED - Delegating to Processing Department", env);
                        self.stage = LoanStage::Processing;
                        self.persist(
                            env,
                            json!({
                                "status": "Processing",
                                "loan_stage": "PROCESSING",
                                "is_locked": false,
                            }),
                        )?;
                        self.phase = CeoPhase::Processing;
                    }
                },

                CeoPhase::Processing => {
                    // child workflow, maximum_attempts = 1
                    let status = ProcessingWorkflow::run(
                        env.pool,
                        env.clock,
                        &mut self.logs,
                        &self.workflow_id,
                        &self.loan_data,
                    )?;
                    self.log("Processing", format!("Phase completed: {status}"), env);

                    self.stage = LoanStage::Underwriting;
                    self.log("CEO", "Waiting for underwriting decision...", env);
                    self.persist(
                        env,
                        json!({
                            "status": "Pending Underwriting Decision",
                            "loan_stage": "UNDERWRITING",
                            "is_locked": true,
                        }),
                    )?;
                    let deadline =
                        env.clock.now() + Duration::days(UNDERWRITING_DECISION_TIMEOUT_DAYS);
                    self.phase = CeoPhase::AwaitingUnderwritingDecision { deadline };
                }

                CeoPhase::AwaitingUnderwritingDecision { deadline } => {
                    if self.is_underwriting_complete {
                        let approved = self.underwriting_decision_approved.unwrap_or(false);
                        let reason = self
                            .underwriting_decision_reason
                            .clone()
                            .unwrap_or_default();
                        self.log(
                            "Underwriter",
                            format!(
                                "Decision: {} - {reason}",
                                if approved { "APPROVED" } else { "REJECTED" }
                            ),
                            env,
                        );
                        if !approved {
                            self.stage = LoanStage::Archived;
                            self.decision_reason =
                                Some(format!("Rejected by underwriter: {reason}"));
                            self.log("CEO", "Application REJECTED by underwriter - Moving to Archive", env);
                            self.persist(
                                env,
                                json!({
                                    "status": "Rejected by Underwriter",
                                    "loan_stage": "ARCHIVED",
                                    "final_status": "REJECTED",
                                    "rejection_reason": reason,
                                    "is_locked": false,
                                }),
                            )?;
                            return self.finish(WorkflowResult::Rejected);
                        }
                        self.log("CEO", "Underwriting APPROVED - Proceeding to signature and closing", env);
                        self.log("CEO", "Initial Disclosures generated - Waiting for borrower signature", env);
                        self.persist(
                            env,
                            json!({
                                "status": "Waiting for Signature",
                                "loan_stage": "UNDERWRITING",
                                "is_locked": true,
                            }),
                        )?;
                        self.phase = CeoPhase::AwaitingSignature;
                    } else if env.clock.now() >= deadline {
                        warn!(workflow_id = %self.workflow_id, "underwriting decision timed out");
                        self.log("CEO", "Underwriting decision TIMED OUT - Application withdrawn", env);
                        self.stage = LoanStage::Archived;
                        self.decision_reason =
                            Some("Underwriting decision timed out - application withdrawn".to_string());
                        self.persist(
                            env,
                            json!({
                                "status": "Withdrawn (Timeout)",
                                "loan_stage": "ARCHIVED",
                                "final_status": "WITHDRAWN",
                                "is_locked": false,
                            }),
                        )?;
                        return self.finish(WorkflowResult::Withdrawn);
                    } else {
                        return Ok(None);
                    }
                }

                CeoPhase::AwaitingSignature => {
                    if !self.borrower_signed {
                        return Ok(None);
                    }
                    self.log("Borrower", "Documents signed by borrower", env);
                    self.phase = CeoPhase::Underwriting;
                }

                CeoPhase::Underwriting => self.run_underwriting(env)?,

                CeoPhase::Closing => self.run_closing(env)?,

                CeoPhase::Archived => {
                    self.stage = LoanStage::Archived;
                    self.log("CEO", "Loan lifecycle COMPLETED - Archiving", env);
                    self.persist(
                        env,
                        json!({
                            "status": "Funded",
                            "loan_stage": "ARCHIVED",
                            "final_status": "COMPLETED",
                            "underwriting_decision":
                                self.automated_uw_decision.map(|d| d.as_str()),
                        }),
                    )?;
                    info!(workflow_id = %self.workflow_id, "ceo workflow completed");
                    return self.finish(WorkflowResult::Completed);
                }
            }
        }
    }

    // ----- phases ----------------------------------------------------------

    fn run_lead_capture(&mut self, env: &mut WorkflowEnv<'_>) -> Result<()> {
        self.stage = LoanStage::LeadCapture;
        self.log("CEO", "Delegating to Lead Capture Department", env);

        // child workflow, maximum_attempts = 1
        let result = LeadCaptureWorkflow::run(
            env.pool,
            env.clock,
            &mut self.logs,
            &self.workflow_id,
            &self.loan_data,
        )?;

        self.loan_data = result.loan_data;
        self.loan_number = result.loan_number;
        let recommendation = result.recommendation;
        self.log(
            "Lead Capture",
            format!("Phase completed. Recommendation: {}", recommendation.as_str()),
            env,
        );

        // persist analysis for the dashboard
        self.persist(
            env,
            json!({
                "analysis": result.analysis.to_json(),
                "ai_recommendation": recommendation.as_str(),
                "loan_number": self.loan_number,
                "risk_score": result.analysis.confidence,
            }),
        )?;
        self.log(
            "CEO",
            format!(
                "Analysis: verified_income=${}, mismatch={}",
                result.analysis.verified_income, result.analysis.income_mismatch
            ),
            env,
        );
        self.analysis = Some(result.analysis);

        if recommendation == Recommendation::PendingReview {
            info!(workflow_id = %self.workflow_id, "recommendation pending, gate still applies");
        }

        self.log("CEO", "Waiting for human approval...", env);
        self.persist(env, json!({"is_locked": true}))?;
        self.phase = CeoPhase::AwaitingHumanApproval;
        Ok(())
    }

    fn run_underwriting(&mut self, env: &mut WorkflowEnv<'_>) -> Result<()> {
        self.log("CEO", "Delegating to Underwriting Department", env);
        let analysis = self.analysis.clone().unwrap_or(IncomeAnalysis {
            verified_income: 0,
            pay_stub_income: 0,
            tax_income: 0,
            stated_income: 0,
            income_mismatch: false,
            confidence: 0.0,
            extracted_name: None,
            credit_score: 0,
        });

        // child workflow, maximum_attempts = 1
        let outcome = UnderwritingWorkflow::run(
            env.pool,
            env.clock,
            &mut self.logs,
            &self.workflow_id,
            self.loan_data.loan_amount,
            &analysis,
        )?;

        self.automated_uw_decision = Some(outcome.decision);
        self.log("Underwriting", format!("Decision: {}", outcome.decision.as_str()), env);

        self.persist(
            env,
            json!({
                "underwriting_decision": outcome.decision.as_str(),
                "risk_evaluation": outcome.risk_evaluation,
                "status": "Underwriting Complete",
                "is_locked": false,
            }),
        )?;

        if outcome.decision == UwDecision::ReferToHuman {
            self.log("CEO", "Underwriting referred for additional human review", env);
        }
        self.phase = CeoPhase::Closing;
        Ok(())
    }

    fn run_closing(&mut self, env: &mut WorkflowEnv<'_>) -> Result<()> {
        self.stage = LoanStage::Closing;
        let clear = self.automated_uw_decision == Some(UwDecision::ClearToClose);
        if clear {
            self.log("CEO", "CLEAR TO CLOSE - Moving to closing phase", env);
        } else {
            self.log("CEO", "Moving to closing with conditions", env);
        }
        self.persist(
            env,
            json!({
                "status": if clear { "Clear to Close" } else { "Closing with Conditions" },
                "loan_stage": "CLOSING",
            }),
        )?;

        // final approval letter
        self.log("DocGen MCP", "Generating Final Approval Letter...", env);
        let request = DocumentRequest {
            workflow_id: self.workflow_id.clone(),
            name: self.loan_data.applicant_info.name.clone(),
            email: self.loan_data.applicant_info.email.clone(),
            property_value: self.loan_data.property_value,
            down_payment: self.loan_data.down_payment,
            loan_amount: self.loan_data.loan_amount,
            rate: disclosure_rate(),
            term_years: 30,
            monthly_payment: None,
        };
        let letter = run_with_retries(&env.pool.retry, "generate_document", || {
            env.pool
                .docgen
                .generate_document("Final Approval Letter", &request, env.clock.now())
        })?;
        self.log(
            "DocGen MCP",
            format!("Final Approval Letter generated: {}", letter.public_url),
            env,
        );

        // congratulations email
        let email = self.loan_data.applicant_info.email.clone();
        if !email.is_empty() {
            self.log("Comms MCP", "Sending congratulations notification...", env);
            let mut context = serde_json::Map::new();
            context.insert("name".into(), json!(self.loan_data.applicant_info.name));
            context.insert("loan_amount".into(), json!(self.loan_data.loan_amount));
            context.insert("approval_letter_url".into(), json!(letter.public_url));
            context.insert(
                "subject".into(),
                json!("Congratulations! Your Loan is Funded"),
            );
            run_with_retries(&env.pool.retry, "send_email", || {
                env.pool
                    .comms
                    .send_email("loan_funded", &email, &context, env.clock.now())
            })?;
            self.log("Comms MCP", format!("Email sent to {email}: Congratulations! Your loan is funded"), env);
        }

        self.phase = CeoPhase::Archived;
        Ok(())
    }

    // ----- helpers ---------------------------------------------------------

    fn finish(&mut self, result: WorkflowResult) -> Result<Option<WorkflowResult>> {
        self.result = Some(result);
        Ok(Some(result))
    }

    fn log(&mut self, agent: &str, message: impl Into<String>, env: &WorkflowEnv<'_>) {
        self.logs
            .append_with_stage(agent, message, env.clock.now(), self.stage.as_str());
    }

    /// durable write through the encompass activity; the ceo never mutates
    /// the store directly
    fn persist(&self, env: &WorkflowEnv<'_>, patch: Value) -> Result<bool> {
        let patch: MetadataPatch = patch.as_object().cloned().unwrap_or_default();
        run_with_retries(&env.pool.retry, "update_loan_metadata", || {
            env.pool
                .encompass
                .update_loan_metadata(&self.workflow_id, &patch, env.clock.now())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::decimal::Money;
    use crate::types::{LoanStatus, UnderwritingDecision};
    use crate::workflow::activities::{
        FileUnderwriting, MockComms, MockEncompass, TemplateDocGen, TextFileAnalysis,
    };
    use crate::workflow::managers::{ApplicantInfo, DocumentPaths};
    use crate::workflow::state::{InMemoryLoanStore, LoanApplication, LoanStore};
    use chrono::TimeZone;
    use hourglass_rs::TimeSource;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::TempDir;

    const WF: &str = "wf-test-1";

    struct Harness {
        pool: WorkerPool,
        store: Rc<RefCell<InMemoryLoanStore>>,
        clock: SafeTimeProvider,
        _dir: TempDir,
        uploads: std::path::PathBuf,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let uploads = dir.path().to_path_buf();
        let store = Rc::new(RefCell::new(InMemoryLoanStore::new()));
        let store_dyn: Rc<RefCell<dyn LoanStore>> = store.clone();
        let clock = SafeTimeProvider::new(TimeSource::Test(start_time()));
        store
            .borrow_mut()
            .init_record(LoanApplication::new(
                WF,
                "John Doe",
                Some("john@example.com".into()),
                Money::from_major(450_000),
                Some(Money::from_major(500_000)),
                Some(Money::from_major(50_000)),
                start_time(),
            ))
            .unwrap();
        Harness {
            pool: WorkerPool {
                comms: Box::new(MockComms::new()),
                encompass: Box::new(MockEncompass::new(store_dyn)),
                docgen: Box::new(TemplateDocGen::new(&uploads)),
                underwriting: Box::new(FileUnderwriting::new(&uploads)),
                analysis: Box::new(TextFileAnalysis::new()),
                retry: RetryPolicy::default(),
            },
            store,
            clock,
            _dir: dir,
            uploads,
        }
    }

    fn write_analysis_doc(dir: &Path, name: &str, income: i64) -> std::path::PathBuf {
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

    fn input(h: &Harness, stated: &str, income: i64) -> LoanInput {
        LoanInput {
            applicant_info: ApplicantInfo {
                name: "John Doe".into(),
                email: "john@example.com".into(),
                ssn: Some("123-45-6789".into()),
                stated_income: stated.into(),
            },
            file_paths: DocumentPaths {
                pay_stub: Some(write_analysis_doc(&h.uploads, "pay_stub.pdf", income)),
                tax_document: Some(write_analysis_doc(&h.uploads, "tax.pdf", income)),
                ..DocumentPaths::default()
            },
            loan_amount: Money::from_major(450_000),
            property_value: Money::from_major(500_000),
            down_payment: Money::from_major(50_000),
            extra: serde_json::Map::new(),
        }
    }

    fn sign_disclosures(h: &Harness) {
        let dir = h.uploads.join(WF);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Initial_Disclosures_SIGNED.pdf"), b"signed").unwrap();
    }

    #[test]
    fn test_auto_approve_path_reaches_funded() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };

        // runs to the human approval gate
        assert_eq!(workflow.start(&mut env).unwrap(), None);
        assert_eq!(workflow.phase(), CeoPhase::AwaitingHumanApproval);
        assert_eq!(workflow.get_current_stage(), "LEAD_CAPTURE");
        assert!(workflow.get_loan_number().unwrap().starts_with("ENC-"));
        assert!(h.store.borrow().get(WF).unwrap().is_locked);

        // manager approves; runs processing, parks at the underwriting gate
        workflow.human_approval(true);
        assert_eq!(workflow.resume(&mut env).unwrap(), None);
        assert!(matches!(
            workflow.phase(),
            CeoPhase::AwaitingUnderwritingDecision { .. }
        ));
        assert_eq!(
            h.store.borrow().get(WF).unwrap().status,
            LoanStatus::PendingUnderwritingDecision
        );

        // underwriter approves; parks at the signature gate
        workflow.submit_underwriting_decision(true, "income verified, file clean");
        assert_eq!(workflow.resume(&mut env).unwrap(), None);
        assert_eq!(workflow.phase(), CeoPhase::AwaitingSignature);
        assert_eq!(
            h.store.borrow().get(WF).unwrap().status,
            LoanStatus::WaitingForSignature
        );

        // borrower signs; automated underwriting clears, closing completes
        sign_disclosures(&h);
        workflow.borrower_signature(true);
        let result = workflow.resume(&mut env).unwrap();
        assert_eq!(result, Some(WorkflowResult::Completed));
        assert_eq!(workflow.get_current_stage(), "ARCHIVED");
        assert_eq!(
            workflow.get_underwriting_status().automated_decision,
            Some("CLEAR_TO_CLOSE")
        );

        let record = h.store.borrow().get(WF).unwrap();
        assert_eq!(record.status, LoanStatus::Funded);
        assert_eq!(record.loan_stage, Some(crate::types::LoanStage::Archived));
        assert_eq!(
            record.application_metadata.get("final_status"),
            Some(&json!("COMPLETED"))
        );
        assert!(h.uploads.join(WF).join("Final_Approval_Letter.pdf").exists());
    }

    #[test]
    fn test_manager_rejection_archives() {
        let h = harness();
        // income mismatch: pay stub annualizes to 45k against 100k stated
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "100,000", 45_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        assert_eq!(workflow.start(&mut env).unwrap(), None);

        let record = h.store.borrow().get(WF).unwrap();
        let analysis = record.application_metadata.get("analysis").unwrap();
        assert_eq!(analysis["income_mismatch"], json!(true));
        assert_eq!(
            record.application_metadata.get("ai_recommendation"),
            Some(&json!("MANUAL_REVIEW"))
        );

        workflow.human_approval(false);
        let result = workflow.resume(&mut env).unwrap();
        assert_eq!(result, Some(WorkflowResult::Rejected));
        assert_eq!(workflow.get_current_stage(), "ARCHIVED");
        assert_eq!(
            workflow.get_decision_reason(),
            Some("Rejected by human manager")
        );
        assert_eq!(
            h.store.borrow().get(WF).unwrap().status,
            LoanStatus::RejectedByManager
        );
    }

    #[test]
    fn test_underwriting_timeout_withdraws_after_seven_days() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        workflow.start(&mut env).unwrap();
        workflow.human_approval(true);
        workflow.resume(&mut env).unwrap();
        assert!(matches!(
            workflow.phase(),
            CeoPhase::AwaitingUnderwritingDecision { .. }
        ));

        let control = h.clock.test_control().unwrap();

        // one second before the deadline: nothing fires
        control.advance(Duration::days(7) - Duration::seconds(1));
        assert_eq!(workflow.tick(&mut env).unwrap(), None);

        // at exactly seven days the timeout path fires
        control.advance(Duration::seconds(1));
        let result = workflow.tick(&mut env).unwrap();
        assert_eq!(result, Some(WorkflowResult::Withdrawn));
        assert_eq!(workflow.get_current_stage(), "ARCHIVED");
        let record = h.store.borrow().get(WF).unwrap();
        assert_eq!(record.status, LoanStatus::WithdrawnTimeout);
        assert_eq!(
            record.application_metadata.get("final_status"),
            Some(&json!("WITHDRAWN"))
        );
    }

    #[test]
    fn test_signal_just_before_deadline_beats_timeout() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        workflow.start(&mut env).unwrap();
        workflow.human_approval(true);
        workflow.resume(&mut env).unwrap();

        let control = h.clock.test_control().unwrap();
        control.advance(Duration::days(7) - Duration::seconds(1));

        workflow.submit_underwriting_decision(false, "insufficient reserves");
        let result = workflow.tick(&mut env).unwrap();
        // the rejected path fires, not the timeout
        assert_eq!(result, Some(WorkflowResult::Rejected));
        assert_eq!(
            h.store.borrow().get(WF).unwrap().status,
            LoanStatus::RejectedByUnderwriter
        );
        assert!(workflow
            .get_decision_reason()
            .unwrap()
            .contains("insufficient reserves"));
    }

    #[test]
    fn test_signals_before_gate_are_buffered() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };

        // every signal lands before the workflow starts
        workflow.human_approval(true);
        workflow.submit_underwriting_decision(true, "pre-approved");
        workflow.borrower_signature(true);
        sign_disclosures(&h);

        // one start call drives straight through every gate to completion
        let result = workflow.start(&mut env).unwrap();
        assert_eq!(result, Some(WorkflowResult::Completed));
    }

    #[test]
    fn test_signature_missing_still_closes_with_conditions() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        workflow.start(&mut env).unwrap();
        workflow.human_approval(true);
        workflow.resume(&mut env).unwrap();
        workflow.submit_underwriting_decision(true, "ok");
        workflow.resume(&mut env).unwrap();

        // borrower signals signed but the signed pdf never landed
        workflow.borrower_signature(true);
        let result = workflow.resume(&mut env).unwrap();
        assert_eq!(result, Some(WorkflowResult::Completed));
        assert_eq!(
            workflow.get_underwriting_status().automated_decision,
            Some("SIGNATURE_MISSING")
        );
        // closing with conditions was recorded on the way through
        let record = h.store.borrow().get(WF).unwrap();
        assert_eq!(
            record.application_metadata.get("underwriting_decision"),
            Some(&json!("SIGNATURE_MISSING"))
        );
    }

    #[test]
    fn test_stage_is_monotone_on_happy_path() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        let mut seen = vec![workflow.stage];
        workflow.start(&mut env).unwrap();
        seen.push(workflow.stage);
        workflow.human_approval(true);
        workflow.resume(&mut env).unwrap();
        seen.push(workflow.stage);
        workflow.submit_underwriting_decision(true, "ok");
        workflow.resume(&mut env).unwrap();
        seen.push(workflow.stage);
        sign_disclosures(&h);
        workflow.borrower_signature(true);
        workflow.resume(&mut env).unwrap();
        seen.push(workflow.stage);

        for pair in seen.windows(2) {
            assert!(pair[0] <= pair[1], "stage went backwards: {pair:?}");
        }
    }

    #[test]
    fn test_update_field_visible_to_later_activities() {
        let h = harness();
        let mut workflow = LoanLifecycleWorkflow::new(WF, input(&h, "120,000", 120_000));
        let mut env = WorkflowEnv {
            pool: &h.pool,
            clock: &h.clock,
        };
        workflow.start(&mut env).unwrap();

        // manager edits the applicant email while the workflow waits
        workflow.update_field("email", &json!("fixed@example.com"));
        workflow.update_field("name", &json!("Johnathan Doe"));

        workflow.human_approval(true);
        workflow.resume(&mut env).unwrap();
        workflow.submit_underwriting_decision(true, "ok");
        workflow.resume(&mut env).unwrap();
        sign_disclosures(&h);
        workflow.borrower_signature(true);
        workflow.resume(&mut env).unwrap();

        // final approval letter rendered with the edited name
        let letter = fs::read_to_string(h.uploads.join(WF).join("Final_Approval_Letter.pdf")).unwrap();
        assert!(letter.contains("Johnathan Doe"));
    }

    #[test]
    fn test_underwriting_decision_recorded_via_store() {
        let h = harness();
        // decision recording happens through the store trait the http layer uses
        h.store
            .borrow_mut()
            .save_underwriting_decision(
                WF,
                UnderwritingDecision::Approved,
                "strong file",
                "underwriter@bank",
                start_time(),
            )
            .unwrap();
        let record = h.store.borrow().get(WF).unwrap();
        assert_eq!(record.underwriting_decision, Some(UnderwritingDecision::Approved));
    }
}
