//! Behaviour-analyst graph
//!
//! ROUTER → PLAN → FETCH → EXPLAIN → AUDIT? → (CORRECT → EXPLAIN)* → ROUTER → ANALYSE → ROUTER → END
//!
//! Each node reads the current state and returns a delta; the engine merges
//! it into a fresh state and follows the outgoing edge. A run stops at
//! `End` or when the step budget is spent, in which case the partial state
//! is returned.

pub mod router;
pub mod state;

pub use router::{AnalystRouter, RouterDecision};
pub use state::{AnalystState, StateDelta};

use crate::analyser::Analyser;
use crate::config::{normalize_sample_rate, GraphConfig};
use crate::database::DatabaseAgent;
use crate::explainer::{ExplanationKind, Explainer, EXPLANATION_PLACEHOLDER};
use crate::llm::LlmProvider;
use crate::models::{CorrectionFeedback, NextStep, ValidationTask};
use crate::planner::{PlanRequest, Planner, QueryPlanner};
use crate::verification::Validator;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Orchestrator,
    QueryPlanner,
    DatabaseAgent,
    Explainer,
    Validator,
    Analyser,
    End,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Node::Orchestrator => "orchestrator",
            Node::QueryPlanner => "query_planner",
            Node::DatabaseAgent => "database_agent",
            Node::Explainer => "explainer",
            Node::Validator => "validator",
            Node::Analyser => "analyser",
            Node::End => "end",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    /// Step budget exhausted; the state is whatever was reached.
    RecursionLimit,
}

#[derive(Debug, Clone)]
pub struct AnalystRun {
    pub run_id: Uuid,
    pub state: AnalystState,
    pub trace: Vec<Node>,
    pub termination: Termination,
}

impl AnalystRun {
    pub fn analysis(&self) -> &str {
        &self.state.analysis
    }
}

//
// ================= Audit Sampling =================
//

/// Decides whether a batch of explanations is audited.
pub struct AuditSampler {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl AuditSampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: normalize_sample_rate(rate),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(rate: f64, seed: u64) -> Self {
        Self {
            rate: normalize_sample_rate(rate),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_audit(&self) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        if self.rate >= 1.0 {
            return true;
        }
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_bool(self.rate)
    }
}

//
// ================= Engine =================
//

pub struct AnalystGraph {
    router: AnalystRouter,
    planner: Arc<dyn Planner>,
    database: Arc<DatabaseAgent>,
    explainer: Explainer,
    validator: Validator,
    analyser: Analyser,
    sampler: AuditSampler,
    config: GraphConfig,
}

impl AnalystGraph {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        database: Arc<DatabaseAgent>,
        config: GraphConfig,
    ) -> Self {
        Self {
            router: AnalystRouter::new(provider.clone()),
            planner: Arc::new(QueryPlanner::new(provider.clone())),
            database,
            explainer: Explainer::new(provider.clone()),
            validator: Validator::new(provider.clone()),
            analyser: Analyser::new(provider),
            sampler: AuditSampler::new(config.audit_sample_rate),
            config,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_sampler(mut self, sampler: AuditSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Run one analysis to completion or until the step budget is spent.
    pub async fn run(&self, request: &str, user_id: i64) -> AnalystRun {
        let run_id = Uuid::new_v4();
        let start_time = Instant::now();
        let current_date = Utc::now().format("%Y-%m-%d").to_string();

        info!(
            run_id = %run_id,
            user_id,
            recursion_limit = self.config.recursion_limit,
            audit_rate = self.sampler.rate(),
            "Behaviour analysis: starting run"
        );

        let mut state = AnalystState::new(request, user_id, current_date);
        let mut trace = Vec::new();
        let mut node = Node::Orchestrator;

        let termination = loop {
            if node == Node::End {
                break Termination::Completed;
            }
            if trace.len() >= self.config.recursion_limit {
                warn!(
                    run_id = %run_id,
                    limit = self.config.recursion_limit,
                    "Recursion limit reached; returning partial state"
                );
                break Termination::RecursionLimit;
            }

            trace.push(node);
            let delta = self.execute(node, &state).await;
            state = state.apply(delta);
            node = self.next_node(node, &state);

            debug!(run_id = %run_id, step = trace.len(), next = %node, "Graph step complete");
        };

        info!(
            run_id = %run_id,
            steps = trace.len(),
            facts = state.data_acquired.len(),
            termination = ?termination,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Behaviour analysis: run finished"
        );

        AnalystRun {
            run_id,
            state,
            trace,
            termination,
        }
    }

    async fn execute(&self, node: Node, state: &AnalystState) -> StateDelta {
        match node {
            Node::Orchestrator => self.route(state).await,
            Node::QueryPlanner => self.plan(state).await,
            Node::DatabaseAgent => self.fetch(state).await,
            Node::Explainer => self.explain(state).await,
            Node::Validator => self.audit(state).await,
            Node::Analyser => self.analyse(state).await,
            Node::End => StateDelta::default(),
        }
    }

    fn next_node(&self, node: Node, state: &AnalystState) -> Node {
        match node {
            Node::Orchestrator => match state.next_step {
                NextStep::QueryPlanner => Node::QueryPlanner,
                NextStep::Analyser => Node::Analyser,
                NextStep::End => Node::End,
            },
            Node::QueryPlanner if state.plan_failed => Node::End,
            Node::QueryPlanner if state.steps.is_empty() => Node::Orchestrator,
            Node::QueryPlanner => Node::DatabaseAgent,
            Node::DatabaseAgent if state.db_results.is_empty() => Node::Orchestrator,
            Node::DatabaseAgent => Node::Explainer,
            Node::Explainer if state.validation_tasks.is_empty() => Node::Orchestrator,
            Node::Explainer => Node::Validator,
            Node::Validator if state.db_results.is_empty() => Node::Orchestrator,
            Node::Validator => Node::Explainer,
            Node::Analyser => Node::Orchestrator,
            Node::End => Node::End,
        }
    }

    // ================= Nodes =================

    async fn route(&self, state: &AnalystState) -> StateDelta {
        let decision = self.router.decide(state).await;
        StateDelta {
            next_step: Some(decision.next_step),
            ..StateDelta::from_sender("orchestrator").message(decision.message)
        }
    }

    async fn plan(&self, state: &AnalystState) -> StateDelta {
        let request = PlanRequest {
            request: state.request.clone(),
            prior_message: state.message.clone(),
            completed_steps: state.completed_steps.clone(),
            user_id: state.user_id,
            current_date: state.current_date.clone(),
        };

        match self.planner.plan(&request).await {
            Ok(plan) => StateDelta {
                steps: Some(plan.steps),
                plan_failed: Some(false),
                ..StateDelta::from_sender("query_planner").message(plan.message)
            },
            Err(e) => {
                warn!(error = %e, "Query planning failed; ending run");
                StateDelta {
                    steps: Some(Vec::new()),
                    plan_failed: Some(true),
                    ..StateDelta::from_sender("query_planner")
                        .message(format!("Error: failed to produce a query plan ({})", e))
                }
            }
        }
    }

    async fn fetch(&self, state: &AnalystState) -> StateDelta {
        let results = self.database.run_steps(&state.steps, state.user_id).await;
        let failed = results.iter().filter(|r| r.data.is_error()).count();

        let mut completed = state.completed_steps.clone();
        completed.extend(state.steps.iter().cloned());

        StateDelta {
            db_results: Some(results),
            validation_results: Some(Vec::new()),
            completed_steps: Some(completed),
            ..StateDelta::from_sender("database_agent").message(format!(
                "Fetched {} step(s), {} failed",
                state.steps.len(),
                failed
            ))
        }
    }

    async fn explain(&self, state: &AnalystState) -> StateDelta {
        let explanations = self
            .explainer
            .explain_batch(&state.db_results, &state.validation_results)
            .await;

        let mut data = state.data_acquired.clone();
        let mut tasks = Vec::new();

        for (i, (result, explanation)) in state.db_results.iter().zip(explanations).enumerate() {
            let attempt = state.validation_results.get(i).map(|f| f.attempt).unwrap_or(0);
            match explanation.kind {
                ExplanationKind::Direct => data.push(explanation.text),
                ExplanationKind::Generated => {
                    data.push(explanation.text.clone());
                    tasks.push(ValidationTask {
                        result: result.clone(),
                        explanation: explanation.text,
                        attempt,
                    });
                }
                // never merged; the audit decides its fate
                ExplanationKind::Placeholder => tasks.push(ValidationTask {
                    result: result.clone(),
                    explanation: explanation.text,
                    attempt,
                }),
            }
        }

        let mut message = format!("Explained {} result(s)", state.db_results.len());

        // Without an audit, a placeholder still has to reach the analyser.
        if !tasks.is_empty() && !self.sampler.should_audit() {
            debug!(skipped = tasks.len(), "Audit skipped for this batch");
            for task in tasks.drain(..) {
                if task.explanation == EXPLANATION_PLACEHOLDER {
                    data.push(format!("{}: {}", task.result.step, EXPLANATION_PLACEHOLDER));
                }
            }
            message.push_str("; audit skipped");
        }

        StateDelta {
            data_acquired: Some(data),
            validation_tasks: Some(tasks),
            db_results: Some(Vec::new()),
            validation_results: Some(Vec::new()),
            ..StateDelta::from_sender("explainer").message(message)
        }
    }

    async fn audit(&self, state: &AnalystState) -> StateDelta {
        let verdicts = self.validator.validate_batch(&state.validation_tasks).await;

        let mut rejected = HashSet::new();
        let mut retry = Vec::new();
        let mut feedback = Vec::new();
        let mut dropped = 0usize;

        for (task, verdict) in state.validation_tasks.iter().zip(verdicts) {
            if verdict.valid {
                continue;
            }
            rejected.insert(task.explanation.clone());

            if task.attempt >= self.config.max_correction_attempts {
                warn!(
                    step = %task.result.step,
                    attempts = task.attempt,
                    reason = %verdict.reasoning,
                    "Explanation still invalid after correction limit; dropping"
                );
                dropped += 1;
                continue;
            }

            retry.push(task.result.clone());
            feedback.push(CorrectionFeedback {
                previous_explanation: task.explanation.clone(),
                failure_reason: verdict.reasoning,
                attempt: task.attempt + 1,
            });
        }

        let data: Vec<String> = state
            .data_acquired
            .iter()
            .filter(|item| !rejected.contains(*item))
            .cloned()
            .collect();

        let mut message = format!(
            "Validated {} explanation(s): {} rejected, {} sent back for correction",
            state.validation_tasks.len(),
            rejected.len(),
            retry.len()
        );
        if dropped > 0 {
            message.push_str(&format!(
                "; {} dropped after {} correction attempts",
                dropped, self.config.max_correction_attempts
            ));
        }

        StateDelta {
            data_acquired: Some(data),
            db_results: Some(retry),
            validation_results: Some(feedback),
            validation_tasks: Some(Vec::new()),
            ..StateDelta::from_sender("validator").message(message)
        }
    }

    async fn analyse(&self, state: &AnalystState) -> StateDelta {
        let update = self
            .analyser
            .analyse(
                &state.request,
                &state.data_acquired,
                &state.analysis,
                &state.current_date,
                state.has_unanalysed_data(),
            )
            .await;

        StateDelta {
            analysis: Some(update.analysis),
            analysed: true,
            ..StateDelta::from_sender("analyser").message(update.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, ParseError};
    use crate::planner::QueryPlan;
    use crate::testing::{MockStore, ScriptedLlm};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TOTALS_STEP: &str = "total spending and transaction count for user 1";
    const TOTALS_TEXT: &str =
        "The total spent is 122610 and the total number of transactions is 150.";

    /// Router that plans once, analyses once, then ends.
    fn scripted_router(llm: ScriptedLlm) -> ScriptedLlm {
        let calls = AtomicUsize::new(0);
        llm.respond("behaviour_orchestrator", move |_| {
            let decision = match calls.fetch_add(1, Ordering::SeqCst) {
                0 => r#"{"next_step": "query_planner", "message": "need totals"}"#,
                1 => r#"{"next_step": "analyser", "message": "analyse totals"}"#,
                _ => r#"{"next_step": "end", "message": "done"}"#,
            };
            Ok(decision.to_string())
        })
    }

    fn totals_llm() -> ScriptedLlm {
        scripted_router(ScriptedLlm::new())
            .respond("query_planner", |_| {
                Ok(format!(r#"{{"message": "totals", "steps": ["{}"]}}"#, TOTALS_STEP))
            })
            .respond("database_agent", |_| {
                Ok(r#"{"query": "SELECT SUM(amount) AS total_spent, COUNT(*) AS total_transactions FROM transactions WHERE user_id = 1", "edit": false, "message": "ok"}"#.into())
            })
            .respond("analyser", |_| {
                Ok(r#"{"output": "You spent 122610 EGP over 150 transactions.", "message": "DONE: enough"}"#.into())
            })
    }

    fn totals_store() -> Arc<MockStore> {
        Arc::new(MockStore::new().rows(
            "total_spent",
            json!([{"total_spent": 122610, "total_transactions": 150}]),
        ))
    }

    fn graph(llm: Arc<ScriptedLlm>, store: Arc<MockStore>, config: GraphConfig) -> AnalystGraph {
        let database = Arc::new(DatabaseAgent::new(llm.clone(), store, config.db_step_timeout));
        AnalystGraph::new(llm, database, config)
    }

    fn config(rate: f64) -> GraphConfig {
        GraphConfig {
            audit_sample_rate: rate,
            max_correction_attempts: 2,
            recursion_limit: 50,
            db_step_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_sampler_extremes() {
        let never = AuditSampler::seeded(0.0, 7);
        let always = AuditSampler::seeded(1.0, 7);
        for _ in 0..100 {
            assert!(!never.should_audit());
            assert!(always.should_audit());
        }
        assert_eq!(AuditSampler::new(3.0).rate(), 1.0);
    }

    #[test]
    fn test_sampler_ignores_nan_rate() {
        let sampler = AuditSampler::seeded(f64::NAN, 7);
        assert_eq!(sampler.rate(), GraphConfig::default().audit_sample_rate);
        // must not panic inside gen_bool
        for _ in 0..20 {
            sampler.should_audit();
        }
        assert!(AuditSampler::new(f64::NAN).rate().is_finite());
    }

    #[tokio::test]
    async fn test_end_to_end_totals() {
        let llm = Arc::new(
            totals_llm()
                .respond("explainer", |_| Ok(format!(r#"{{"explanation": "{}"}}"#, TOTALS_TEXT)))
                .respond("validator", |_| Ok(r#"{"valid": true, "reasoning": ""}"#.into())),
        );
        let run = graph(llm.clone(), totals_store(), config(1.0))
            .run("Analyse my overall spending", 1)
            .await;

        assert_eq!(run.termination, Termination::Completed);
        assert_eq!(
            run.trace,
            vec![
                Node::Orchestrator,
                Node::QueryPlanner,
                Node::DatabaseAgent,
                Node::Explainer,
                Node::Validator,
                Node::Orchestrator,
                Node::Analyser,
                Node::Orchestrator,
            ]
        );
        assert_eq!(run.state.data_acquired, vec![TOTALS_TEXT.to_string()]);
        assert_eq!(run.state.completed_steps, vec![TOTALS_STEP.to_string()]);
        assert!(run.state.db_results.is_empty());
        assert!(run.analysis().contains("122610"));
        assert_eq!(llm.call_count("validator"), 1);
    }

    #[tokio::test]
    async fn test_audit_skipped_at_zero_rate() {
        let llm = Arc::new(
            totals_llm()
                .respond("explainer", |_| Ok(format!(r#"{{"explanation": "{}"}}"#, TOTALS_TEXT)))
                .respond("validator", |_| Ok(r#"{"valid": false, "reasoning": "never asked"}"#.into())),
        );
        let run = graph(llm.clone(), totals_store(), config(0.0))
            .run("Analyse my overall spending", 1)
            .await;

        assert!(!run.trace.contains(&Node::Validator));
        assert_eq!(run.state.data_acquired, vec![TOTALS_TEXT.to_string()]);
        assert_eq!(llm.call_count("validator"), 0);
    }

    #[tokio::test]
    async fn test_unaudited_placeholder_reaches_analyser() {
        let llm = Arc::new(
            totals_llm()
                .respond("explainer", |_| Ok("garbled".into()))
                .respond("validator", |_| Ok(r#"{"valid": true, "reasoning": ""}"#.into())),
        );
        let run = graph(llm.clone(), totals_store(), config(0.0))
            .run("Analyse my overall spending", 1)
            .await;

        let expected = format!("{}: {}", TOTALS_STEP, EXPLANATION_PLACEHOLDER);
        assert_eq!(run.state.data_acquired, vec![expected.clone()]);
        assert!(run.state.validation_tasks.is_empty());
        assert_eq!(llm.call_count("validator"), 0);

        let analyser_calls = llm.calls_for("analyser");
        assert!(analyser_calls[0].user.contains(&expected));
    }

    #[tokio::test]
    async fn test_corrections_are_bounded_and_rejected_text_dropped() {
        let bad = "The total spent is 122610.";
        let llm = Arc::new(
            totals_llm()
                .respond("explainer", move |_| Ok(format!(r#"{{"explanation": "{}"}}"#, bad)))
                .respond("validator", |_| {
                    Ok(r#"{"valid": false, "reasoning": "total_transactions is missing"}"#.into())
                }),
        );
        let run = graph(llm.clone(), totals_store(), config(1.0))
            .run("Analyse my overall spending", 1)
            .await;

        assert_eq!(run.termination, Termination::Completed);
        // first explanation plus two corrections
        assert_eq!(llm.call_count("explainer"), 3);
        assert!(!run.state.data_acquired.iter().any(|d| d == bad));
        assert!(run.state.db_results.is_empty());
        assert!(run.state.validation_tasks.is_empty());

        let retries = llm.calls_for("explainer");
        // the grounding failure outranks the model's own reason
        assert!(retries[1].user.contains("values missing from the explanation: 150"));
        assert!(retries[2].user.contains(bad));
    }

    #[tokio::test]
    async fn test_recursion_limit_returns_partial_state() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .respond("behaviour_orchestrator", |_| {
                    Ok(r#"{"next_step": "analyser", "message": "again"}"#.into())
                })
                .respond("analyser", |_| {
                    Ok(r#"{"output": "Still thinking.", "message": "DONE: loop"}"#.into())
                }),
        );
        let mut cfg = config(1.0);
        cfg.recursion_limit = 5;

        let run = graph(llm, Arc::new(MockStore::new()), cfg).run("Why?", 1).await;

        assert_eq!(run.termination, Termination::RecursionLimit);
        assert_eq!(run.trace.len(), 5);
        assert_eq!(run.analysis(), "Still thinking.");
    }

    struct BrokenPlanner;

    #[async_trait]
    impl Planner for BrokenPlanner {
        async fn plan(&self, _request: &PlanRequest) -> Result<QueryPlan, AgentError> {
            Err(AgentError::Parse(ParseError::Empty))
        }
    }

    #[tokio::test]
    async fn test_planner_failure_ends_run() {
        let llm = Arc::new(scripted_router(ScriptedLlm::new()));
        let run = graph(llm.clone(), Arc::new(MockStore::new()), config(1.0))
            .with_planner(Arc::new(BrokenPlanner))
            .run("Why?", 1)
            .await;

        assert_eq!(run.termination, Termination::Completed);
        assert_eq!(run.trace, vec![Node::Orchestrator, Node::QueryPlanner]);
        assert!(run.state.plan_failed);
        assert!(run.state.message.starts_with("Error"));
        assert_eq!(llm.call_count("database_agent"), 0);
    }

    #[tokio::test]
    async fn test_failed_step_is_explained_without_model() {
        let llm = Arc::new(totals_llm());
        let store = Arc::new(MockStore::new().fail("total_spent", "relation does not exist"));

        let run = graph(llm.clone(), store, config(1.0))
            .run("Analyse my overall spending", 1)
            .await;

        assert_eq!(llm.call_count("explainer"), 0);
        assert_eq!(run.state.data_acquired.len(), 1);
        assert!(run.state.data_acquired[0].starts_with("Database error: Error Executing Query:"));
        assert!(!run.trace.contains(&Node::Validator));
    }
}
