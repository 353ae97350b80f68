//! Personal assistant (top-level orchestrator)
//!
//! INPUT → ROUTE → {DATABASE | BEHAVIOUR ANALYST | DIRECT} → RESPOND → PERSIST
//!
//! Nothing below `handle` is allowed to surface an error to the caller: every
//! branch degrades to text, and the outermost boundary turns anything left
//! into an apology that keeps the conversation id.

use crate::classifier::RouteClassifier;
use crate::config::AssistantConfig;
use crate::database::DatabaseAgent;
use crate::error::OrchestrationError;
use crate::graph::{AnalystGraph, Termination};
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent, TextAgent};
use crate::memory::{ConversationMemory, NewMessage, NO_PREVIOUS_MESSAGES};
use crate::models::{AssistantRequest, AssistantResponse, Route};
use crate::store::{active_budgets_summary, FinanceStore, Row};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const APOLOGY_MESSAGE: &str =
    "Sorry, something went wrong while handling your request. Please try again in a moment.";
const RESPONSE_FALLBACK: &str = "I'm sorry, I couldn't put together a response right now.";

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingDecision {
    #[serde(alias = "routing_decision", alias = "route")]
    pub agent: Route,
    #[serde(default, alias = "routing_message")]
    pub message: String,
}

impl OutputSchema for RoutingDecision {}

impl RoutingDecision {
    fn fallback() -> Self {
        Self {
            agent: Route::PersonalAssistantResponse,
            message: String::new(),
        }
    }
}

/// What a branch hands to the response step.
#[derive(Debug, Default)]
struct BranchOutcome {
    context: String,
    data: Option<Vec<Row>>,
}

const ROUTER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the router of a personal finance assistant. Pick exactly one branch:

- database_agent: factual, read-only questions answered by looking up the user's data (totals, lists, balances, budgets). Your message must tell the database agent what to fetch and must ask it not to return internal identifiers.
- behaviour_analyst: questions about causes, trends, habits, comparisons or recommendations.
- personal_assistant_response: greetings, small talk, ambiguous requests and any request to add, change or delete data. This assistant never writes data and must never claim that it did.

Return ONLY one JSON object:
{"agent": "database_agent" | "behaviour_analyst" | "personal_assistant_response", "message": "<instruction for the chosen branch>"}"#,
    r#"Conversation so far:
{history}

Active budgets: {budgets}
Keyword hint: {hint}

User message: {query}"#,
);

const RESPONSE_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are a friendly personal finance assistant. Answer the user in plain language.

Rules:
- Use only the facts in the branch result. Do not invent numbers.
- Never show internal identifiers (user ids, budget ids, transaction ids).
- You cannot create, update or delete anything. If the user asked for that, explain that it is done from the app's forms or the dedicated makers, and never claim it was done.
- All money amounts are in EGP.
- Keep it short."#,
    r#"Conversation so far:
{history}

Active budgets: {budgets}
Branch: {route}
Branch result:
{context}

User message: {query}"#,
);

pub struct PersonalAssistant {
    router: StructuredAgent<RoutingDecision>,
    responder: TextAgent,
    database: Arc<DatabaseAgent>,
    analyst: AnalystGraph,
    store: Arc<dyn FinanceStore>,
    memory: Arc<ConversationMemory>,
    db_timeout: Duration,
    window: usize,
}

impl PersonalAssistant {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn FinanceStore>,
        memory: Arc<ConversationMemory>,
        config: &AssistantConfig,
    ) -> Self {
        let database = Arc::new(DatabaseAgent::new(
            provider.clone(),
            store.clone(),
            config.graph.db_step_timeout,
        ));

        Self {
            router: StructuredAgent::new("personal_assistant_router", ROUTER_PROMPT, provider.clone()),
            responder: TextAgent::new("personal_assistant", RESPONSE_PROMPT, provider.clone()),
            analyst: AnalystGraph::new(provider, database.clone(), config.graph.clone()),
            database,
            store,
            memory,
            db_timeout: config.db_agent_timeout,
            window: config.conversation_window,
        }
    }

    /// Handle one user turn. Never fails.
    pub async fn handle(&self, request: AssistantRequest) -> AssistantResponse {
        let start_time = Instant::now();
        let mut conversation_id = request.conversation_id;

        info!(
            user_id = request.user_id,
            conversation_id = ?conversation_id,
            "Assistant: handling request"
        );

        match self.process(&request, &mut conversation_id).await {
            Ok(response) => {
                info!(
                    conversation_id = ?response.conversation_id,
                    has_data = response.data.is_some(),
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Assistant: request complete"
                );
                response
            }
            Err(e) => {
                error!(conversation_id = ?conversation_id, error = %e, "Assistant: request failed");
                AssistantResponse {
                    final_output: APOLOGY_MESSAGE.to_string(),
                    data: None,
                    conversation_id,
                }
            }
        }
    }

    async fn process(
        &self,
        request: &AssistantRequest,
        conversation_id: &mut Option<i64>,
    ) -> crate::Result<AssistantResponse> {
        let id = self
            .memory
            .start_conversation(request.user_id, *conversation_id, &request.query)
            .await?;
        *conversation_id = Some(id);

        let history = match self.memory.summary(id, self.window).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(conversation_id = id, error = %e, "Failed to load conversation history");
                NO_PREVIOUS_MESSAGES.to_string()
            }
        };
        let budgets = active_budgets_summary(self.store.as_ref(), request.user_id).await;

        let decision = self.route(&request.query, &history, &budgets).await;
        info!(conversation_id = id, route = %decision.agent, "Assistant: routed");

        let outcome = match decision.agent {
            Route::DatabaseAgent => self.database_branch(request, &decision).await,
            Route::BehaviourAnalyst => self.behaviour_branch(request, &decision).await,
            Route::PersonalAssistantResponse => BranchOutcome {
                context: "No data lookup was needed.".to_string(),
                data: None,
            },
        };

        let final_output = self
            .respond(request, &history, &budgets, decision.agent, &outcome)
            .await;

        self.persist_turn(id, &request.query, decision.agent, &final_output, outcome.data.as_deref())
            .await;

        Ok(AssistantResponse {
            final_output,
            data: outcome.data,
            conversation_id: Some(id),
        })
    }

    async fn route(&self, query: &str, history: &str, budgets: &str) -> RoutingDecision {
        let inputs = PromptInputs::new()
            .with("history", history)
            .with("budgets", budgets)
            .with("hint", RouteClassifier::classify(query))
            .with("query", query);

        match self.router.invoke(&inputs).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Routing failed; answering directly");
                RoutingDecision::fallback()
            }
        }
    }

    async fn database_branch(&self, request: &AssistantRequest, decision: &RoutingDecision) -> BranchOutcome {
        let ask = compose_database_request(&request.query, &decision.message);

        match tokio::time::timeout(self.db_timeout, self.database.answer(&ask, request.user_id)).await {
            Ok(Ok(answer)) => match answer.rows {
                Some(rows) => {
                    let rendered = serde_json::to_string(&rows).unwrap_or_default();
                    BranchOutcome {
                        context: format!("{}\nRows: {}", answer.message, rendered),
                        data: Some(rows),
                    }
                }
                None => BranchOutcome {
                    context: format!("Nothing was read or written. {}", answer.message),
                    data: None,
                },
            },
            Ok(Err(e)) => {
                warn!(user_id = request.user_id, error = %e, "Database branch failed");
                BranchOutcome {
                    context: "The data lookup failed, so no data is available.".to_string(),
                    data: None,
                }
            }
            Err(_) => {
                let e = OrchestrationError::Timeout(self.db_timeout);
                warn!(user_id = request.user_id, error = %e, "Database branch timed out");
                BranchOutcome {
                    context: "The data lookup took too long, so no data is available.".to_string(),
                    data: None,
                }
            }
        }
    }

    async fn behaviour_branch(&self, request: &AssistantRequest, decision: &RoutingDecision) -> BranchOutcome {
        let ask = if decision.message.trim().is_empty() {
            request.query.clone()
        } else {
            format!("{}\n({})", request.query, decision.message.trim())
        };

        let run = self.analyst.run(&ask, request.user_id).await;

        if run.termination == Termination::RecursionLimit {
            let e = OrchestrationError::RecursionLimit(run.trace.len());
            warn!(run_id = %run.run_id, error = %e, "Analysis stopped early; using partial state");
        }

        let context = if run.analysis().is_empty() {
            if run.state.data_acquired.is_empty() {
                "No analysis could be produced for this request.".to_string()
            } else {
                format!("Facts gathered:\n{}", run.state.data_acquired.join("\n"))
            }
        } else {
            run.analysis().to_string()
        };

        BranchOutcome { context, data: None }
    }

    async fn respond(
        &self,
        request: &AssistantRequest,
        history: &str,
        budgets: &str,
        route: Route,
        outcome: &BranchOutcome,
    ) -> String {
        let inputs = PromptInputs::new()
            .with("history", history)
            .with("budgets", budgets)
            .with("route", route)
            .with("context", &outcome.context)
            .with("query", &request.query);

        match self.responder.invoke(&inputs).await {
            Ok(text) => text,
            Err(e) => {
                warn!(route = %route, error = %e, "Response generation failed; using fallback");
                match route {
                    Route::DatabaseAgent if outcome.data.is_some() => {
                        "Here is the data I found for your request.".to_string()
                    }
                    Route::BehaviourAnalyst => outcome.context.clone(),
                    _ => RESPONSE_FALLBACK.to_string(),
                }
            }
        }
    }

    async fn persist_turn(
        &self,
        conversation_id: i64,
        query: &str,
        route: Route,
        final_output: &str,
        data: Option<&[Row]>,
    ) {
        let mut messages = vec![
            NewMessage::user(query),
            NewMessage::assistant(route.source_agent(), final_output),
        ];
        if let Some(rows) = data {
            let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
            messages.push(NewMessage::payload(route.source_agent(), &payload));
        }

        for message in messages {
            if let Err(e) = self.memory.append_message(conversation_id, message).await {
                warn!(conversation_id, error = %e, "Failed to persist conversation turn");
            }
        }
    }
}

/// `"User ask: ...\nInstruction: ..."`, with whichever parts are present.
pub fn compose_database_request(query: &str, instruction: &str) -> String {
    let mut parts = Vec::new();
    if !query.trim().is_empty() {
        parts.push(format!("User ask: {}", query.trim()));
    }
    if !instruction.trim().is_empty() {
        parts.push(format!("Instruction: {}", instruction.trim()));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::memory::SenderType;
    use crate::testing::{MockStore, ScriptedLlm};
    use serde_json::json;

    /// Router that trusts the keyword hint in its prompt.
    fn hint_router(llm: ScriptedLlm) -> ScriptedLlm {
        llm.respond("personal_assistant_router", |req| {
            let hint = req
                .user
                .lines()
                .find_map(|line| line.strip_prefix("Keyword hint: "))
                .unwrap_or("personal_assistant_response")
                .to_string();
            Ok(json!({"agent": hint, "message": "fetch what the user asked for, no ids"}).to_string())
        })
    }

    fn config() -> AssistantConfig {
        AssistantConfig {
            db_agent_timeout: Duration::from_millis(200),
            graph: GraphConfig {
                audit_sample_rate: 0.0,
                ..GraphConfig::default()
            },
            ..AssistantConfig::default()
        }
    }

    fn assistant(llm: ScriptedLlm, store: MockStore) -> (PersonalAssistant, Arc<ConversationMemory>) {
        let memory = Arc::new(ConversationMemory::in_memory());
        let assistant = PersonalAssistant::new(Arc::new(llm), Arc::new(store), memory.clone(), &config());
        (assistant, memory)
    }

    fn request(query: &str) -> AssistantRequest {
        AssistantRequest {
            query: query.into(),
            user_id: 1,
            conversation_id: None,
            metadata: None,
        }
    }

    fn base_llm() -> ScriptedLlm {
        hint_router(ScriptedLlm::new())
            .respond("personal_assistant", |req| {
                Ok(format!("reply via {}", req.user.lines().find(|l| l.starts_with("Branch: ")).unwrap_or("?")))
            })
            .respond("database_agent", |req| {
                if req.user.contains("Add") {
                    Ok(r#"{"query": "", "edit": true, "message": "Query rejected: writes are not allowed"}"#.into())
                } else {
                    Ok(r#"{"query": "SELECT SUM(amount) AS total FROM transactions WHERE user_id = 1", "edit": false, "message": "Food total"}"#.into())
                }
            })
            .respond("behaviour_orchestrator", |_| Ok(r#"{"next_step": "end", "message": "nothing to do"}"#.into()))
    }

    #[tokio::test]
    async fn test_routing_examples() {
        let cases = [
            ("How much did I spend on food last month?", Route::DatabaseAgent),
            ("Why am I overspending on dining?", Route::BehaviourAnalyst),
            ("Hi there", Route::PersonalAssistantResponse),
        ];

        for (query, expected) in cases {
            let (assistant, memory) = assistant(base_llm(), MockStore::new());
            let response = assistant.handle(request(query)).await;

            assert_eq!(response.final_output, format!("reply via Branch: {}", expected));
            let history = memory.read_recent(response.conversation_id.unwrap(), 10).await.unwrap();
            assert_eq!(history[1].source_agent.as_deref(), Some(expected.source_agent()));
        }
    }

    #[tokio::test]
    async fn test_database_branch_attaches_and_persists_data() {
        let store = MockStore::new().rows("SUM(amount)", json!([{"total": 2500}]));
        let (assistant, memory) = assistant(base_llm(), store);

        let response = assistant.handle(request("How much did I spend on food?")).await;

        let data = response.data.expect("rows attached");
        assert_eq!(data[0]["total"], json!(2500));

        let history = memory.read_recent(response.conversation_id.unwrap(), 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].sender_type, SenderType::User);
        assert_eq!(history[0].source_agent.as_deref(), Some("User"));
        assert_eq!(history[1].source_agent.as_deref(), Some("DatabaseAgent"));
        assert_eq!(history[2].payload(), Some(json!([{"total": 2500}])));
    }

    #[tokio::test]
    async fn test_write_request_gets_no_data() {
        let llm = ScriptedLlm::new()
            .respond("personal_assistant_router", |_| {
                Ok(r#"{"agent": "database_agent", "message": "Add 50 to food"}"#.into())
            })
            .respond("personal_assistant", |_| Ok("I can't add transactions from here.".into()))
            .respond("database_agent", |_| {
                Ok(r#"{"query": "", "edit": true, "message": "Query rejected: writes are not allowed"}"#.into())
            });
        let store = MockStore::new();
        let (assistant, _) = assistant(llm, store);

        let response = assistant.handle(request("Add a 50 EGP food transaction")).await;
        assert!(response.data.is_none());
        assert_eq!(response.final_output, "I can't add transactions from here.");
    }

    #[tokio::test]
    async fn test_database_timeout_degrades() {
        let store = MockStore::new().rows_after(
            "SUM(amount)",
            json!([{"total": 1}]),
            Duration::from_secs(2),
        );
        let (assistant, _) = assistant(base_llm(), store);

        let response = assistant.handle(request("How much did I spend on food?")).await;
        assert!(response.data.is_none());
        assert!(response.conversation_id.is_some());
        assert_eq!(response.final_output, "reply via Branch: database_agent");
    }

    #[tokio::test]
    async fn test_router_failure_answers_directly() {
        let llm = ScriptedLlm::new()
            .respond("personal_assistant_router", |_| Ok("database, probably".into()))
            .respond("personal_assistant", |req| {
                assert!(req.user.contains("Branch: personal_assistant_response"));
                Ok("Hello!".into())
            });
        let (assistant, _) = assistant(llm, MockStore::new());

        let response = assistant.handle(request("How much did I spend?")).await;
        assert_eq!(response.final_output, "Hello!");
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn test_conversation_id_is_kept_across_turns() {
        let (assistant, memory) = assistant(base_llm(), MockStore::new());

        let first = assistant.handle(request("Hi there")).await;
        let id = first.conversation_id.unwrap();
        let second = assistant
            .handle(AssistantRequest {
                conversation_id: Some(id),
                ..request("Hi again")
            })
            .await;

        assert_eq!(second.conversation_id, Some(id));
        assert_eq!(memory.read_recent(id, 10).await.unwrap().len(), 4);
    }

    #[test]
    fn test_database_request_composition() {
        assert_eq!(
            compose_database_request("food total?", "sum food spending"),
            "User ask: food total?\nInstruction: sum food spending"
        );
        assert_eq!(compose_database_request("food total?", " "), "User ask: food total?");
        assert_eq!(compose_database_request("", "sum"), "Instruction: sum");
    }
}
