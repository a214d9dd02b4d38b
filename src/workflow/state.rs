use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{PipelineError, Result};
use crate::types::{LoanStage, LoanStatus, UnderwritingDecision};

/// metadata patch applied through the encompass activity
pub type MetadataPatch = serde_json::Map<String, Value>;

/// durable loan application record
///
/// owned by the durable store; the orchestrator reads and writes through
/// activities only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanApplication {
    pub id: Uuid,
    pub workflow_id: String,
    pub borrower_name: String,
    pub borrower_email: Option<String>,
    pub loan_amount: Money,
    pub property_value: Option<Money>,
    pub down_payment: Option<Money>,
    pub status: LoanStatus,
    pub loan_stage: Option<LoanStage>,
    pub is_locked: bool,
    pub underwriting_decision: Option<UnderwritingDecision>,
    pub underwriting_decision_reason: Option<String>,
    pub underwriting_decided_at: Option<DateTime<Utc>>,
    pub underwriting_decided_by: Option<String>,
    pub automated_uw_decision: Option<String>,
    pub risk_score: Option<Decimal>,
    pub loan_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub application_metadata: MetadataPatch,
}

impl LoanApplication {
    /// create a fresh record at workflow start
    pub fn new(
        workflow_id: impl Into<String>,
        borrower_name: impl Into<String>,
        borrower_email: Option<String>,
        loan_amount: Money,
        property_value: Option<Money>,
        down_payment: Option<Money>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            borrower_name: borrower_name.into(),
            borrower_email,
            loan_amount,
            property_value,
            down_payment,
            status: LoanStatus::Submitted,
            loan_stage: Some(LoanStage::LeadCapture),
            is_locked: false,
            underwriting_decision: None,
            underwriting_decision_reason: None,
            underwriting_decided_at: None,
            underwriting_decided_by: None,
            automated_uw_decision: None,
            risk_score: None,
            loan_number: None,
            created_at: now,
            updated_at: now,
            application_metadata: MetadataPatch::new(),
        }
    }

    /// apply a metadata patch: `status`, `loan_stage`, `is_locked` and
    /// `loan_number` update scalar columns last-writer-wins, everything else
    /// deep-merges into the metadata json
    pub fn apply_patch(&mut self, patch: &MetadataPatch, now: DateTime<Utc>) {
        for (key, value) in patch {
            match key.as_str() {
                "status" => match value.as_str().and_then(LoanStatus::parse) {
                    Some(status) => self.status = status,
                    None => warn!(value = %value, "unparseable status in patch, ignoring"),
                },
                "loan_stage" => match value.as_str().and_then(LoanStage::parse) {
                    Some(stage) => self.loan_stage = Some(stage),
                    None => warn!(value = %value, "unparseable loan_stage in patch, ignoring"),
                },
                "is_locked" => {
                    if let Some(locked) = value.as_bool() {
                        self.is_locked = locked;
                    }
                }
                "loan_number" => {
                    if let Some(number) = value.as_str() {
                        self.loan_number = Some(number.to_string());
                    }
                }
                "risk_score" => {
                    if let Some(score) = value.as_f64().and_then(Decimal::from_f64) {
                        self.risk_score = Some(score.round_dp(2));
                    }
                }
                _ => deep_merge_entry(&mut self.application_metadata, key, value),
            }
        }
        self.updated_at = now;
    }
}

fn deep_merge_entry(target: &mut MetadataPatch, key: &str, value: &Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                deep_merge_entry(existing, k, v);
            }
        }
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

/// durable store port: read-modify-write through activities only
pub trait LoanStore {
    /// create the record if absent; idempotent on workflow_id
    fn init_record(&mut self, record: LoanApplication) -> Result<Uuid>;
    fn get(&self, workflow_id: &str) -> Option<LoanApplication>;
    fn update_metadata(
        &mut self,
        workflow_id: &str,
        patch: &MetadataPatch,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    fn save_underwriting_decision(
        &mut self,
        workflow_id: &str,
        decision: UnderwritingDecision,
        reason: &str,
        decided_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// in-memory reference store
#[derive(Debug, Default)]
pub struct InMemoryLoanStore {
    records: HashMap<String, LoanApplication>,
}

impl InMemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoanStore for InMemoryLoanStore {
    fn init_record(&mut self, record: LoanApplication) -> Result<Uuid> {
        if let Some(existing) = self.records.get(&record.workflow_id) {
            info!(workflow_id = %record.workflow_id, "loan record already exists");
            return Ok(existing.id);
        }
        let id = record.id;
        info!(workflow_id = %record.workflow_id, %id, "loan record created");
        self.records.insert(record.workflow_id.clone(), record);
        Ok(id)
    }

    fn get(&self, workflow_id: &str) -> Option<LoanApplication> {
        self.records.get(workflow_id).cloned()
    }

    fn update_metadata(
        &mut self,
        workflow_id: &str,
        patch: &MetadataPatch,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let record = self
            .records
            .get_mut(workflow_id)
            .ok_or_else(|| PipelineError::RecordNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        record.apply_patch(patch, now);
        Ok(true)
    }

    fn save_underwriting_decision(
        &mut self,
        workflow_id: &str,
        decision: UnderwritingDecision,
        reason: &str,
        decided_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = self
            .records
            .get_mut(workflow_id)
            .ok_or_else(|| PipelineError::RecordNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        record.underwriting_decision = Some(decision);
        record.underwriting_decision_reason = Some(reason.to_string());
        record.underwriting_decided_by = Some(decided_by.to_string());
        record.underwriting_decided_at = Some(now);
        record.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
    }

    fn record() -> LoanApplication {
        LoanApplication::new(
            "wf-1",
            "John Doe",
            Some("john@example.com".into()),
            Money::from_major(450_000),
            Some(Money::from_major(500_000)),
            Some(Money::from_major(50_000)),
            now(),
        )
    }

    fn patch(value: Value) -> MetadataPatch {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut store = InMemoryLoanStore::new();
        let first = store.init_record(record()).unwrap();
        let second = store.init_record(record()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scalar_columns_updated() {
        let mut record = record();
        record.apply_patch(
            &patch(json!({
                "status": "Pending Underwriting Decision",
                "loan_stage": "UNDERWRITING",
                "is_locked": true,
                "loan_number": "ENC-12345678",
            })),
            now(),
        );
        assert_eq!(record.status, LoanStatus::PendingUnderwritingDecision);
        assert_eq!(record.loan_stage, Some(LoanStage::Underwriting));
        assert!(record.is_locked);
        assert_eq!(record.loan_number.as_deref(), Some("ENC-12345678"));
        assert!(record.application_metadata.is_empty());
    }

    #[test]
    fn test_metadata_deep_merge() {
        let mut record = record();
        record.apply_patch(
            &patch(json!({"analysis": {"verified_income": 120000, "income_mismatch": false}})),
            now(),
        );
        record.apply_patch(
            &patch(json!({"analysis": {"confidence": 0.9}, "final_status": "COMPLETED"})),
            now(),
        );
        assert_eq!(
            Value::Object(record.application_metadata.clone()),
            json!({
                "analysis": {
                    "verified_income": 120000,
                    "income_mismatch": false,
                    "confidence": 0.9,
                },
                "final_status": "COMPLETED",
            })
        );
    }

    #[test]
    fn test_scalar_is_last_writer_wins() {
        let mut record = record();
        record.apply_patch(&patch(json!({"status": "Processing"})), now());
        record.apply_patch(&patch(json!({"status": "Funded"})), now());
        assert_eq!(record.status, LoanStatus::Funded);
    }

    #[test]
    fn test_update_missing_record_errors() {
        let mut store = InMemoryLoanStore::new();
        let err = store
            .update_metadata("ghost", &MetadataPatch::new(), now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::RecordNotFound { .. }));
    }

    #[test]
    fn test_save_underwriting_decision() {
        let mut store = InMemoryLoanStore::new();
        store.init_record(record()).unwrap();
        store
            .save_underwriting_decision("wf-1", UnderwritingDecision::Approved, "clean file", "uw@bank", now())
            .unwrap();
        let saved = store.get("wf-1").unwrap();
        assert_eq!(saved.underwriting_decision, Some(UnderwritingDecision::Approved));
        assert_eq!(saved.underwriting_decision_reason.as_deref(), Some("clean file"));
        assert_eq!(saved.underwriting_decided_by.as_deref(), Some("uw@bank"));
    }
}
