//! Behaviour analyser
//!
//! Produces the single current narrative from everything validated so far.
//! Each pass replaces the previous analysis.

use crate::error::ParseError;
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::schema::SCHEMA_DESCRIPTION;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct AnalyserOutput {
    #[serde(alias = "analysis", default)]
    output: String,
    #[serde(default)]
    message: String,
}

impl OutputSchema for AnalyserOutput {
    fn validate(&self) -> Result<(), ParseError> {
        if self.output.trim().is_empty() {
            return Err(ParseError::Schema {
                field: "output",
                reason: "analysis must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisUpdate {
    pub analysis: String,
    /// Hint for the router: `FETCH: ...` when more data is wanted, `DONE: ...` otherwise.
    pub message: String,
}

impl AnalysisUpdate {
    pub fn wants_more_data(&self) -> bool {
        self.message.trim_start().to_uppercase().starts_with("FETCH")
    }
}

const ANALYSER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are a Financial Behaviour Analyst.
Explain spending behaviour, patterns, anomalies and goal alignment. Focus on WHY, not just WHAT.

Principles:
- Synthesise: connect several data points instead of listing them.
- Detect anomalies: unusual amounts, new cities, rare categories, sudden spikes. Offer a reasonable hypothesis.
- Behavioural insight: late-night or weekend spending, habitual leaks, spending that contradicts goals.
- Actionable: point out risks and concrete improvements.

Revision:
- Refine the previous analysis with the new data. Never return the previous analysis unchanged when new data exists.
- If data is missing or failed, stop asking for it.
- Request more data only when strictly needed, using exact column names.

Schema:
{schema}

Return ONLY one JSON object:
{"output": "<analysis>", "message": "FETCH: <data request>" or "DONE: <reason>"}
If there is no data: {"output": "No data available", "message": "DONE: No data found"}"#,
    r#"Current Date: {current_date}
Acquired Data till now: {data_acquired}
Previous Analysis: {previous_analysis}
User request: {request}
If there is new information in the acquired data, update the previous analysis with it. Do not return the previous analysis as it is."#,
);

pub struct Analyser {
    agent: StructuredAgent<AnalyserOutput>,
}

impl Analyser {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            agent: StructuredAgent::new("analyser", ANALYSER_PROMPT, provider).with_temperature(0.3),
        }
    }

    /// `has_new_data` says whether anything was validated since the last pass.
    pub async fn analyse(
        &self,
        request: &str,
        data_acquired: &[String],
        previous_analysis: &str,
        current_date: &str,
        has_new_data: bool,
    ) -> AnalysisUpdate {
        let data = if data_acquired.is_empty() {
            "None".to_string()
        } else {
            data_acquired
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {}", i + 1, item))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let previous = if previous_analysis.is_empty() {
            "None"
        } else {
            previous_analysis
        };

        let inputs = PromptInputs::new()
            .with("schema", SCHEMA_DESCRIPTION)
            .with("current_date", current_date)
            .with("data_acquired", data)
            .with("previous_analysis", previous)
            .with("request", request);

        match self.agent.invoke(&inputs).await {
            Ok(output) => {
                let analysis = output.output.trim().to_string();
                let mut message = output.message.trim().to_string();

                if has_new_data && !previous_analysis.is_empty() && analysis == previous_analysis.trim() {
                    warn!("Analyser returned the previous analysis despite new data");
                    message = format!(
                        "{} (note: analysis unchanged although new data arrived)",
                        if message.is_empty() { "DONE" } else { message.as_str() }
                    );
                }

                let update = AnalysisUpdate { analysis, message };
                info!(
                    chars = update.analysis.len(),
                    wants_more = update.wants_more_data(),
                    "Analysis updated"
                );
                update
            }
            Err(e) => {
                warn!(error = %e, "Analyser failed; keeping previous analysis");
                AnalysisUpdate {
                    analysis: previous_analysis.to_string(),
                    message: format!("DONE: analysis could not be updated ({})", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;

    #[tokio::test]
    async fn test_analysis_replaces_previous() {
        let llm = Arc::new(ScriptedLlm::new().respond("analyser", |req| {
            assert!(req.user.contains("1. Food spending was 2500."));
            assert!(req.user.contains("Previous Analysis: Dining is high."));
            Ok(r#"{"output": "Dining and food together drive overspending.", "message": "DONE: enough data"}"#.into())
        }));
        let analyser = Analyser::new(llm);

        let update = analyser
            .analyse(
                "Why am I overspending?",
                &["Food spending was 2500.".to_string()],
                "Dining is high.",
                "2025-03-10",
                true,
            )
            .await;

        assert_eq!(update.analysis, "Dining and food together drive overspending.");
        assert!(!update.analysis.contains("Dining is high."));
        assert!(!update.wants_more_data());
    }

    #[tokio::test]
    async fn test_unchanged_analysis_is_flagged() {
        let llm = Arc::new(ScriptedLlm::new().respond("analyser", |_| {
            Ok(r#"{"output": "Dining is high.", "message": "DONE: ok"}"#.into())
        }));
        let analyser = Analyser::new(llm);

        let update = analyser
            .analyse("Why?", &["new fact".to_string()], "Dining is high.", "2025-03-10", true)
            .await;
        assert!(update.message.contains("analysis unchanged"));
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_previous() {
        let llm = Arc::new(ScriptedLlm::new().respond("analyser", |_| Ok("## Analysis\nlooks bad".into())));
        let analyser = Analyser::new(llm);

        let update = analyser
            .analyse("Why?", &[], "Earlier narrative.", "2025-03-10", false)
            .await;
        assert_eq!(update.analysis, "Earlier narrative.");
        assert!(update.message.starts_with("DONE"));
    }

    #[test]
    fn test_fetch_directive() {
        let update = AnalysisUpdate {
            analysis: String::new(),
            message: "fetch: weekend spending by hour".into(),
        };
        assert!(update.wants_more_data());
    }
}
