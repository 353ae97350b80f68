//! Behaviour-analyst router
//!
//! Reads the run state and picks the next stage: fetch more data, refresh
//! the analysis, or stop.

use super::state::AnalystState;
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::models::NextStep;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RouterOutput {
    next_step: NextStep,
    #[serde(default)]
    message: String,
}

impl OutputSchema for RouterOutput {}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterDecision {
    pub next_step: NextStep,
    pub message: String,
}

const ROUTER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the orchestrator of a financial behaviour analysis team.

Stages:
- query_planner: plans and fetches more data. Choose it when the data acquired so far cannot answer the request, or the analyser asked to FETCH something.
- analyser: writes or refreshes the analysis. Choose it when there is acquired data the current analysis does not cover yet.
- end: stop. Choose it when the analysis answers the request, when the analyser says DONE, or when further fetching would repeat completed steps.

Never ask the planner for data that was already fetched. Prefer ending over looping.

Return ONLY one JSON object:
{"next_step": "query_planner" | "analyser" | "end", "message": "<instruction for the next stage>"}"#,
    r#"User request: {request}
Current date: {current_date}
Completed steps: {completed_steps}
Data Acquired: {data_acquired}
Analysis Done: {analysis}
Unanalysed data: {unanalysed}
Last Message From: '{sender}'
Last Message: {message}"#,
);

pub struct AnalystRouter {
    agent: StructuredAgent<RouterOutput>,
}

impl AnalystRouter {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            agent: StructuredAgent::new("behaviour_orchestrator", ROUTER_PROMPT, provider),
        }
    }

    /// An unparsable answer ends the run.
    pub async fn decide(&self, state: &AnalystState) -> RouterDecision {
        let inputs = PromptInputs::new()
            .with("request", &state.request)
            .with("current_date", &state.current_date)
            .with("completed_steps", or_none(&state.completed_steps))
            .with("data_acquired", or_none(&state.data_acquired))
            .with(
                "analysis",
                if state.analysis.is_empty() { "None" } else { state.analysis.as_str() },
            )
            .with("unanalysed", state.has_unanalysed_data())
            .with("sender", if state.sender.is_empty() { "user" } else { state.sender.as_str() })
            .with("message", &state.message);

        match self.agent.invoke(&inputs).await {
            Ok(output) => {
                debug!(next_step = %output.next_step, "Router decided");
                RouterDecision {
                    next_step: output.next_step,
                    message: output.message,
                }
            }
            Err(e) => {
                warn!(error = %e, "Router output unusable; ending run");
                RouterDecision {
                    next_step: NextStep::End,
                    message: format!("Router failed: {}", e),
                }
            }
        }
    }
}

fn or_none(items: &[String]) -> String {
    if items.is_empty() {
        "None".to_string()
    } else {
        items.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;

    #[tokio::test]
    async fn test_decision_is_parsed() {
        let llm = Arc::new(ScriptedLlm::new().respond("behaviour_orchestrator", |req| {
            assert!(req.user.contains("Data Acquired: None"));
            assert!(req.user.contains("Last Message From: 'user'"));
            Ok(r#"{"next_step": "query_planner", "message": "fetch monthly totals"}"#.into())
        }));
        let router = AnalystRouter::new(llm);

        let decision = router.decide(&AnalystState::new("Why?", 1, "2025-03-10")).await;
        assert_eq!(decision.next_step, NextStep::QueryPlanner);
        assert_eq!(decision.message, "fetch monthly totals");
    }

    #[tokio::test]
    async fn test_unknown_stage_ends_the_run() {
        let llm = Arc::new(ScriptedLlm::new().respond("behaviour_orchestrator", |_| {
            Ok(r#"{"next_step": "explainer"}"#.into())
        }));
        let router = AnalystRouter::new(llm);

        let decision = router.decide(&AnalystState::new("Why?", 1, "2025-03-10")).await;
        assert_eq!(decision.next_step, NextStep::End);
    }
}
