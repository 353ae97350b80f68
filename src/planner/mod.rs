//! Query planner
//!
//! Turns an analytical request into at most four single-dimension
//! aggregation steps for the database agent. The planner never retries
//! itself: a failed parse is reported to the caller, which ends the run.

use crate::error::{AgentError, ParseError};
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::schema::SCHEMA_DESCRIPTION;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_PLAN_STEPS: usize = 4;

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub request: String,
    pub prior_message: String,
    pub completed_steps: Vec<String>,
    pub user_id: i64,
    pub current_date: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub steps: Vec<String>,
    pub message: String,
}

/// Trait for plan generation (LLM controlled)
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<QueryPlan, AgentError>;
}

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(alias = "output", default)]
    steps: Vec<String>,
    #[serde(default)]
    message: String,
}

impl OutputSchema for PlanOutput {
    fn validate(&self) -> Result<(), ParseError> {
        if self.steps.iter().any(|s| s.contains('\n')) {
            return Err(ParseError::Schema {
                field: "steps",
                reason: "a step must be a single line".into(),
            });
        }
        Ok(())
    }
}

const PLANNER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the Query Planner.
Produce no more than 4 short, text-only steps. Each step describes ONE aggregated query for ONE user_id.

Every step must state, in plain language (no SQL):
- Metric: exactly one aggregate (SUM, COUNT, AVG, MAX or MIN)
- Dimension: exactly one lens (time, store_name, city, budget/category or type_spending)
- Time window: explicit (current month, last 90 days, last 6 months...)
- Filters: always user_id, plus any request-specific filters
- Output size: at most 10 rows
- Ordering: chronological, or top/bottom by the metric

Rules:
1) Aggregations only, never raw row listings.
2) One lens per step.
3) Never repeat a step listed as already completed.
4) Prefer period comparisons when they help.
5) For vague requests plan a compact baseline: trend, top category, overspend vs limit.

Schema:
{schema}

Return ONLY one JSON object, no markdown:
{"message": "One sentence on what the steps cover.", "steps": ["step one", "step two"]}"#,
    r#"Current Date: {current_date}
Request: {request}
User ID: {user_id}
Completed steps: {completed_steps}
Orchestrator request: {message}"#,
);

pub struct QueryPlanner {
    agent: StructuredAgent<PlanOutput>,
}

impl QueryPlanner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            agent: StructuredAgent::new("query_planner", PLANNER_PROMPT, provider),
        }
    }
}

#[async_trait]
impl Planner for QueryPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<QueryPlan, AgentError> {
        let completed = if request.completed_steps.is_empty() {
            "none yet".to_string()
        } else {
            request.completed_steps.join(" | ")
        };

        let inputs = PromptInputs::new()
            .with("schema", SCHEMA_DESCRIPTION)
            .with("current_date", &request.current_date)
            .with("request", &request.request)
            .with("user_id", request.user_id)
            .with("completed_steps", completed)
            .with("message", &request.prior_message);

        let output = self.agent.invoke(&inputs).await?;
        let plan = bound_plan(output.steps, output.message, &request.completed_steps);

        info!(step_count = plan.steps.len(), "Query plan ready");
        Ok(plan)
    }
}

/// Drop blanks, repeats and completed steps, then cap the plan length.
fn bound_plan(steps: Vec<String>, message: String, completed: &[String]) -> QueryPlan {
    let done: HashSet<String> = completed.iter().map(|s| normalize(s)).collect();
    let mut seen = HashSet::new();

    let mut kept: Vec<String> = steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let key = normalize(s);
            !done.contains(&key) && seen.insert(key)
        })
        .collect();

    if kept.len() > MAX_PLAN_STEPS {
        warn!(
            proposed = kept.len(),
            limit = MAX_PLAN_STEPS,
            "Planner exceeded the step limit; truncating"
        );
        kept.truncate(MAX_PLAN_STEPS);
    }

    QueryPlan {
        steps: kept,
        message,
    }
}

/// Compare steps without their numbering or case.
fn normalize(step: &str) -> String {
    step.trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == ')' || c == '.' || c == ' ')
        .to_lowercase()
}
