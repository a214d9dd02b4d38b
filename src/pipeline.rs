use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::canonical::assembler::CanonicalAssembler;
use crate::canonical::model::CanonicalRecord;
use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::merger::DocumentMerger;
use crate::mismo::MismoEmitter;
use crate::relational::schema::SchemaEnforcer;
use crate::relational::transformer::{RelationalPayload, RelationalTransformer};
use crate::rules::engine::{RuleEngine, RuleOutcome, RuleStatus};
use crate::types::{ClassificationResult, DocumentType, ValidationIssue};
use crate::validator::DataValidator;
use crate::value::FlatMap;

/// one classified input document ready for extraction
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// artifact directory stem, usually the input file stem
    pub stem: String,
    pub text: String,
    pub classification: ClassificationResult,
}

/// everything a single run produced
#[derive(Debug)]
pub struct RunArtifacts {
    pub run_dir: PathBuf,
    pub classifications: Vec<ClassificationResult>,
    pub merged_flat: Option<FlatMap>,
    pub canonical: CanonicalRecord,
    pub issues: Vec<ValidationIssue>,
    pub payload: RelationalPayload,
    pub mismo_xml: String,
}

/// deterministic end-to-end document pipeline
///
/// classify -> extract -> assemble -> validate -> relational -> enforce, with
/// artifacts written under `output/<stem>/`. multi-document runs merge flat
/// extractions before assembly
pub struct DocumentPipeline {
    config: PipelineConfig,
    engine: RuleEngine,
    assembler: CanonicalAssembler,
    merger: DocumentMerger,
    validator: DataValidator,
    transformer: RelationalTransformer,
    enforcer: SchemaEnforcer,
    emitter: MismoEmitter,
}

impl DocumentPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let engine = RuleEngine::new(config.rules_dir.clone());
        let emitter = MismoEmitter::new(config.mismo);
        Self {
            config,
            engine,
            assembler: CanonicalAssembler::new(),
            merger: DocumentMerger::new(),
            validator: DataValidator::new(),
            transformer: RelationalTransformer::new(),
            enforcer: SchemaEnforcer::new(),
            emitter,
        }
    }

    /// process one document
    pub fn run_single(&mut self, input: &DocumentInput, now: DateTime<Utc>) -> Result<RunArtifacts> {
        let run_dir = self.create_run_dir(&input.stem)?;
        fs::write(run_dir.join("1_raw.txt"), &input.text)?;

        let doc_type = input.classification.document_category;
        let (flat, outcomes) = self.engine.extract_flat(&input.text, doc_type)?;
        let canonical = self.assembler.assemble(&flat, doc_type);

        self.finish_run(
            run_dir,
            vec![input.classification.clone()],
            None,
            canonical,
            &outcomes,
            now,
        )
    }

    /// process several documents into one merged canonical record
    pub fn run_multi(&mut self, inputs: &[DocumentInput], now: DateTime<Utc>) -> Result<RunArtifacts> {
        let stem = inputs
            .first()
            .map(|i| i.stem.clone())
            .unwrap_or_else(|| "empty".to_string());
        let run_dir = self.create_run_dir(&stem)?;

        let mut extractions: Vec<(DocumentType, FlatMap)> = Vec::new();
        let mut classifications = Vec::new();
        let mut outcomes: Vec<RuleOutcome> = Vec::new();
        let mut raw_sections = Vec::new();

        for input in inputs {
            let doc_type = input.classification.document_category;
            let (flat, doc_outcomes) = self.engine.extract_flat(&input.text, doc_type)?;
            raw_sections.push(format!("=== {} ({}) ===\n{}", input.stem, doc_type, input.text));
            extractions.push((doc_type, flat));
            classifications.push(input.classification.clone());
            outcomes.extend(doc_outcomes);
        }
        fs::write(run_dir.join("1_raw.txt"), raw_sections.join("\n\n"))?;

        let merged = self.merger.merge(&extractions);
        let party_map = self.merger.match_parties(&extractions);
        info!(parties = party_map.len(), "party identity map built");

        fs::write(
            run_dir.join("1b_merged_flat.json"),
            serde_json::to_string_pretty(&merged)?,
        )?;

        let canonical = self.assembler.assemble_merged(&merged);
        self.finish_run(run_dir, classifications, Some(merged), canonical, &outcomes, now)
    }

    fn finish_run(
        &mut self,
        run_dir: PathBuf,
        classifications: Vec<ClassificationResult>,
        merged_flat: Option<FlatMap>,
        canonical: CanonicalRecord,
        outcomes: &[RuleOutcome],
        now: DateTime<Utc>,
    ) -> Result<RunArtifacts> {
        let issues = self.validator.validate(&canonical);

        fs::write(
            run_dir.join("2_canonical.json"),
            serde_json::to_string_pretty(&canonical)?,
        )?;

        let payload = self.enforcer.enforce(&self.transformer.transform(&canonical, now));
        fs::write(
            run_dir.join("3_relational_payload.json"),
            serde_json::to_string_pretty(&payload)?,
        )?;

        let mismo_xml = self.emitter.emit(&canonical)?;

        let report = self.render_report(&classifications, &canonical, &issues, &payload, outcomes);
        fs::write(run_dir.join("report.md"), report)?;

        info!(run_dir = %run_dir.display(), issues = issues.len(), "pipeline run complete");
        Ok(RunArtifacts {
            run_dir,
            classifications,
            merged_flat,
            canonical,
            issues,
            payload,
            mismo_xml,
        })
    }

    fn create_run_dir(&self, stem: &str) -> Result<PathBuf> {
        let run_dir = self.config.output_root.join(stem);
        fs::create_dir_all(&run_dir)?;
        Ok(run_dir)
    }

    fn render_report(
        &self,
        classifications: &[ClassificationResult],
        canonical: &CanonicalRecord,
        issues: &[ValidationIssue],
        payload: &RelationalPayload,
        outcomes: &[RuleOutcome],
    ) -> String {
        let mut out = String::from("# Extraction Run Report\n\n## Classification\n\n");
        for c in classifications {
            out.push_str(&format!(
                "- {} (confidence {:.2}, extractor {:?})\n",
                c.document_category, c.confidence, c.recommended_extractor
            ));
        }

        let applied = outcomes.iter().filter(|o| o.status == RuleStatus::Applied).count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.status, RuleStatus::Failed(_)))
            .count();
        out.push_str(&format!(
            "\n## Extraction\n\n- rules applied: {applied}/{}\n- rules failed: {failed}\n- canonical leaves: {}\n",
            outcomes.len(),
            canonical.leaf_count()
        ));

        out.push_str("\n## Validation\n\n");
        if issues.is_empty() {
            out.push_str("All checks passed.\n");
        } else {
            for issue in issues {
                out.push_str(&format!("- {issue}\n"));
            }
        }

        out.push_str("\n## Relational Payload\n\n");
        for (table, rows) in &payload.tables {
            if !rows.is_empty() {
                out.push_str(&format!("- {table}: {} row(s)\n", rows.len()));
            }
        }
        out
    }
}
