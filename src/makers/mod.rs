//! Maker agents
//!
//! Slot-filling dialogues that collect the fields of a goal, budget or
//! transaction one turn at a time. Nothing is written to the finance
//! tables here: a maker only returns the record and whether it is ready.
//!
//! Slot state is not stored separately. Each turn persists the slot record
//! as a JSON message and the next turn rebuilds state from the latest one.
//! The model's `is_done` flag is checked against a completion gate before
//! it is returned.

pub mod budget;
pub mod goal;
pub mod transaction;

pub use budget::BudgetSlots;
pub use goal::GoalSlots;
pub use transaction::TransactionSlots;

use crate::error::ParseError;
use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::memory::{summarize, ConversationMemory, NewMessage, SenderType};
use crate::store::{user_context_summary, FinanceStore};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAKER_FAILURE_MESSAGE: &str =
    "Sorry, I could not process that request. Please rephrase it and try again.";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MakerAction {
    #[default]
    Create,
    Update,
}

/// One kind of record a maker fills in.
pub trait MakerSlots:
    Serialize + DeserializeOwned + Default + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Agent name, also the `source_agent` of persisted turns.
    const AGENT: &'static str;
    const PROMPT: PromptTemplate;
    /// Identifier column of the rows listed by `existing_query`.
    const ID_COLUMN: &'static str;

    /// Read-only query listing the entities this maker can refer to.
    fn existing_query(user_id: i64) -> String;

    fn missing_mandatory(&self, action: MakerAction) -> Vec<&'static str>;

    /// Entity an update applies to.
    fn target_id(&self) -> Option<i64>;

    fn supports_update() -> bool {
        true
    }

    /// Fill defaults once the model has answered.
    fn finalize(&mut self, _today: &str) {}

    /// Kind-specific reasons the record is not ready yet.
    fn gate_issues(&self, _existing_ids: &[i64]) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound = "S: DeserializeOwned")]
struct MakerOutput<S> {
    #[serde(default)]
    message: String,
    #[serde(default)]
    action: MakerAction,
    #[serde(default)]
    is_done: bool,
    #[serde(flatten)]
    slots: S,
}

impl<S: MakerSlots> OutputSchema for MakerOutput<S> {
    fn validate(&self) -> Result<(), ParseError> {
        if self.message.trim().is_empty() {
            return Err(ParseError::Schema {
                field: "message",
                reason: "a maker must always answer the user".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakerRequest {
    pub user_id: i64,
    pub user_request: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MakerReply<S> {
    pub conversation_id: i64,
    pub message: String,
    pub action: MakerAction,
    #[serde(flatten)]
    pub slots: S,
    pub is_done: bool,
}

pub struct MakerAgent<S: MakerSlots> {
    agent: StructuredAgent<MakerOutput<S>>,
    store: Arc<dyn FinanceStore>,
    memory: Arc<ConversationMemory>,
    window: usize,
}

impl<S: MakerSlots> MakerAgent<S> {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn FinanceStore>,
        memory: Arc<ConversationMemory>,
        window: usize,
    ) -> Self {
        Self {
            agent: StructuredAgent::new(S::AGENT, S::PROMPT, provider),
            store,
            memory,
            window,
        }
    }

    /// Handle one user turn.
    pub async fn assist(&self, request: &MakerRequest) -> crate::Result<MakerReply<S>> {
        let conversation_id = self
            .memory
            .start_conversation(request.user_id, request.conversation_id, &request.user_request)
            .await?;

        let history = self.memory.read_recent(conversation_id, self.window).await?;
        let prior_turn = history
            .iter()
            .any(|m| m.sender_type == SenderType::Assistant && m.is_from(S::AGENT) && !m.is_json());

        let current: S = self
            .memory
            .latest_payload(conversation_id, S::AGENT, self.window)
            .await?
            .and_then(|payload| serde_json::from_value(payload).ok())
            .unwrap_or_default();

        let existing = match self.store.fetch_rows(&S::existing_query(request.user_id)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(agent = S::AGENT, error = %e, "Failed to list existing entities");
                Vec::new()
            }
        };
        let existing_ids: Vec<i64> = existing
            .iter()
            .filter_map(|row| row.get(S::ID_COLUMN).and_then(Value::as_i64))
            .collect();
        let existing_text = if existing.is_empty() {
            "None".to_string()
        } else {
            serde_json::to_string(&existing)?
        };

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let inputs = PromptInputs::new()
            .with("user_context", user_context_summary(&self.store, request.user_id).await)
            .with("existing", existing_text)
            .with("history", summarize(&history))
            .with("current_state", serde_json::to_string(&current)?)
            .with("current_date", &today)
            .with("user_request", &request.user_request);

        let reply = match self.agent.invoke(&inputs).await {
            Ok(output) => gate(output, prior_turn, &existing_ids, &today, conversation_id),
            Err(e) => {
                warn!(agent = S::AGENT, conversation_id, error = %e, "Maker output unusable");
                MakerReply {
                    conversation_id,
                    message: MAKER_FAILURE_MESSAGE.to_string(),
                    action: MakerAction::Create,
                    slots: current,
                    is_done: false,
                }
            }
        };

        info!(
            agent = S::AGENT,
            conversation_id,
            action = ?reply.action,
            is_done = reply.is_done,
            "Maker turn handled"
        );

        self.persist(conversation_id, &request.user_request, &reply).await;
        Ok(reply)
    }

    async fn persist(&self, conversation_id: i64, user_request: &str, reply: &MakerReply<S>) {
        let mut messages = vec![
            NewMessage::user(user_request),
            NewMessage::assistant(S::AGENT, &reply.message),
        ];
        match serde_json::to_value(&reply.slots) {
            Ok(payload) if has_slots(&payload) => {
                messages.push(NewMessage::payload(S::AGENT, &payload));
            }
            Ok(_) => {}
            Err(e) => warn!(agent = S::AGENT, error = %e, "Failed to serialize slot record"),
        }

        for message in messages {
            if let Err(e) = self.memory.append_message(conversation_id, message).await {
                warn!(agent = S::AGENT, conversation_id, error = %e, "Failed to persist maker turn");
            }
        }
    }
}

/// Only let `is_done` through when the record is really ready.
fn gate<S: MakerSlots>(
    output: MakerOutput<S>,
    prior_turn: bool,
    existing_ids: &[i64],
    today: &str,
    conversation_id: i64,
) -> MakerReply<S> {
    let mut slots = output.slots;
    slots.finalize(today);

    let action = if S::supports_update() {
        output.action
    } else {
        MakerAction::Create
    };

    let mut blockers = Vec::new();
    let missing = slots.missing_mandatory(action);
    if !missing.is_empty() {
        blockers.push(format!("I still need: {}.", missing.join(", ")));
    }
    if action == MakerAction::Update {
        match slots.target_id() {
            Some(id) if existing_ids.contains(&id) => {}
            _ => blockers.push("Which of your existing entries do you want to change?".to_string()),
        }
    }
    blockers.extend(slots.gate_issues(existing_ids));

    let is_done = output.is_done && prior_turn && blockers.is_empty();
    let mut message = output.message.trim().to_string();

    if output.is_done && !is_done {
        info!(
            agent = S::AGENT,
            conversation_id,
            prior_turn,
            blockers = ?blockers,
            "Completion gate kept the record open"
        );
        if blockers.is_empty() {
            message.push_str(" Please confirm these details so I can save them.");
        } else {
            message.push(' ');
            message.push_str(&blockers.join(" "));
        }
    }

    MakerReply {
        conversation_id,
        message,
        action,
        slots,
        is_done,
    }
}

/// Any slot set to something other than null or `false`.
fn has_slots(payload: &Value) -> bool {
    match payload {
        Value::Object(map) => map
            .values()
            .any(|v| !v.is_null() && *v != Value::Bool(false)),
        _ => false,
    }
}
