//! Validation of explanations against their source rows
//!
//! Two layers: deterministic grounding rules (always run, cannot be argued
//! with) and an LLM audit for what text matching cannot judge. A
//! deterministic failure overrides an LLM pass.

use crate::error::ParseError;
use crate::explainer::EXPLANATION_PLACEHOLDER;
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::models::{RowData, ValidationTask, ValidationVerdict};
use crate::schema::SCHEMA_DESCRIPTION;
use crate::store::Row;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod grounding;

pub use grounding::{CompletenessRule, EmptyDataAcknowledgedRule, UnsupportedNumbersRule};

/// Trait for verification rules
pub trait VerificationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, rows: &[Row], explanation: &str) -> VerificationCheckResult;
}

#[derive(Debug, Clone)]
pub struct VerificationCheckResult {
    pub passed: bool,
    pub details: String,
}

impl VerificationCheckResult {
    pub fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }

    pub fn not_applicable() -> Self {
        Self::pass("not applicable")
    }
}

#[derive(Debug, Clone)]
pub struct GroundingReport {
    pub passed: bool,
    pub issues: Vec<String>,
}

/// Runs every registered rule against one explanation.
pub struct VerificationEngine {
    rules: Vec<Box<dyn VerificationRule>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn VerificationRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, rows: &[Row], explanation: &str) -> GroundingReport {
        let issues: Vec<String> = self
            .rules
            .iter()
            .filter_map(|rule| {
                let result = rule.verify(rows, explanation);
                (!result.passed).then(|| format!("{}: {}", rule.name(), result.details))
            })
            .collect();

        debug!(
            rule_count = self.rules.len(),
            issue_count = issues.len(),
            "Grounding checks completed"
        );

        GroundingReport {
            passed: issues.is_empty(),
            issues,
        }
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a verification engine with the standard grounding rules
pub fn create_default_verification_engine() -> VerificationEngine {
    let mut engine = VerificationEngine::new();
    engine.add_rule(Box::new(EmptyDataAcknowledgedRule));
    engine.add_rule(Box::new(CompletenessRule));
    engine.add_rule(Box::new(UnsupportedNumbersRule));
    engine
}

// ================= LLM audit =================

impl OutputSchema for ValidationVerdict {
    fn validate(&self) -> Result<(), ParseError> {
        if !self.valid && self.reasoning.trim().is_empty() {
            return Err(ParseError::Schema {
                field: "reasoning",
                reason: "a failing verdict must give a reason".into(),
            });
        }
        Ok(())
    }
}

const VALIDATOR_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are a meticulous Validation Agent. Decide whether an explanation is a perfect one-to-one representation of a query result: all of its information and nothing more.

Empty data: if the query result is empty, the explanation is valid as long as it acknowledges the absence of data.

Non-empty data:
1) No omissions: every key and value in the query result must be mentioned.
2) No hallucinations: every fact, number and name must be traceable to the query result. Nothing inferred or calculated.

Respond with one JSON object:
{"valid": true, "reasoning": ""}
or
{"valid": false, "reasoning": "<specific reason>"}

Schema reference (context only):
{schema}

All money amounts are in EGP."#,
    r#"Please validate the following:

Query Result:
{query_result}

Explanation:
`{explanation}`"#,
);

pub struct Validator {
    engine: VerificationEngine,
    auditor: StructuredAgent<ValidationVerdict>,
}

impl Validator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            engine: create_default_verification_engine(),
            auditor: StructuredAgent::new("validator", VALIDATOR_PROMPT, provider),
        }
    }

    pub async fn validate(&self, data: &RowData, explanation: &str) -> ValidationVerdict {
        if explanation.trim() == EXPLANATION_PLACEHOLDER {
            return ValidationVerdict::fail("No explanation was generated for this result.");
        }

        let rows = match data {
            // Error payloads are transcribed verbatim; there is nothing to ground.
            RowData::Error(_) => return ValidationVerdict::pass(),
            RowData::Rows(rows) => rows,
        };

        let report = self.engine.verify(rows, explanation);

        if data.is_empty() {
            return if report.passed {
                ValidationVerdict::pass()
            } else {
                ValidationVerdict::fail(report.issues.join("; "))
            };
        }

        let inputs = PromptInputs::new()
            .with("schema", SCHEMA_DESCRIPTION)
            .with("query_result", data)
            .with("explanation", explanation);

        let audit = match self.auditor.invoke(&inputs).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                warn!(error = %e, "LLM audit unavailable; relying on grounding checks");
                None
            }
        };

        match (report.passed, audit) {
            (false, _) => ValidationVerdict::fail(report.issues.join("; ")),
            (true, Some(verdict)) => verdict,
            (true, None) => ValidationVerdict::pass(),
        }
    }

    /// Validate every task concurrently; verdicts are index-aligned with `tasks`.
    pub async fn validate_batch(&self, tasks: &[ValidationTask]) -> Vec<ValidationVerdict> {
        let verdicts = join_all(
            tasks
                .iter()
                .map(|task| self.validate(&task.result.data, &task.explanation)),
        )
        .await;

        info!(
            task_count = tasks.len(),
            failed = verdicts.iter().filter(|v| !v.valid).count(),
            "Validation completed"
        );
        verdicts
    }
}
