//! Explainer
//!
//! Restates one (step, rows) pair as a plain sentence. Error payloads and
//! empty results get fixed texts without an LLM call; a failed LLM call
//! degrades to a placeholder instead of aborting the batch.

use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::error::ParseError;
use crate::models::{CorrectionFeedback, DbResult, RowData};
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const NO_DATA_EXPLANATION: &str = "No data was found for this step.";
pub const EXPLANATION_PLACEHOLDER: &str = "Could not generate explanation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplanationKind {
    /// Fixed text for an empty or failed result; needs no audit.
    Direct,
    /// Model-written; eligible for validation.
    Generated,
    /// The model call failed.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub text: String,
    pub kind: ExplanationKind,
}

#[derive(Debug, Deserialize)]
struct ExplainerOutput {
    explanation: String,
}

impl OutputSchema for ExplainerOutput {
    fn validate(&self) -> Result<(), ParseError> {
        if self.explanation.trim().is_empty() {
            return Err(ParseError::Schema {
                field: "explanation",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

const EXPLAINER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are a literal data transcription agent.
Convert a query result into simple declarative sentences.

Rules:
1) Mention every field and every row of the result. Do not omit or summarise.
2) Add nothing that is not in the result: no user ids, no assumptions, no inferred meaning.
3) Do not interpret. Avoid words like "highest", "trend", "increase", "good", "bad".
4) Write numbers exactly as they appear in the result.
5) Fields with null values must be mentioned as null.
6) If a previous explanation and its problems are given, fix only those problems.
   Never mention the previous explanation or the problems themselves.

All money amounts are in EGP.
Return ONLY one JSON object, no markdown: {"explanation": "<text>"}"#,
    r#"The request was: {step}

The result was: {data}

PREVIOUS EXPLANATION:
{previous_explanation}

PROBLEMS IN PREVIOUS EXPLANATION:
{problems}"#,
);

pub struct Explainer {
    agent: StructuredAgent<ExplainerOutput>,
}

impl Explainer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            agent: StructuredAgent::new("explainer", EXPLAINER_PROMPT, provider),
        }
    }

    pub async fn explain(
        &self,
        result: &DbResult,
        feedback: Option<&CorrectionFeedback>,
    ) -> Explanation {
        match &result.data {
            RowData::Error(message) => {
                return Explanation {
                    text: format!("Database error: {}", message),
                    kind: ExplanationKind::Direct,
                }
            }
            data if data.is_empty() => {
                return Explanation {
                    text: NO_DATA_EXPLANATION.to_string(),
                    kind: ExplanationKind::Direct,
                }
            }
            _ => {}
        }

        let (previous, problems) = match feedback {
            Some(f) => (f.previous_explanation.as_str(), f.failure_reason.as_str()),
            None => ("No previous explanation.", "None."),
        };

        let inputs = PromptInputs::new()
            .with("step", &result.step)
            .with("data", &result.data)
            .with("previous_explanation", previous)
            .with("problems", problems);

        match self.agent.invoke(&inputs).await {
            Ok(output) => Explanation {
                text: output.explanation.trim().to_string(),
                kind: ExplanationKind::Generated,
            },
            Err(e) => {
                warn!(step = %result.step, error = %e, "Explanation failed; using placeholder");
                Explanation {
                    text: EXPLANATION_PLACEHOLDER.to_string(),
                    kind: ExplanationKind::Placeholder,
                }
            }
        }
    }

    /// Explain every pending result concurrently. Output is index-aligned
    /// with `results`; `feedback[i]` (if any) belongs to `results[i]`.
    pub async fn explain_batch(
        &self,
        results: &[DbResult],
        feedback: &[CorrectionFeedback],
    ) -> Vec<Explanation> {
        let explanations = join_all(
            results
                .iter()
                .enumerate()
                .map(|(i, result)| self.explain(result, feedback.get(i))),
        )
        .await;

        info!(
            count = explanations.len(),
            corrections = feedback.len().min(results.len()),
            placeholders = explanations
                .iter()
                .filter(|e| e.kind == ExplanationKind::Placeholder)
                .count(),
            "Explanations generated"
        );
        explanations
    }
}
