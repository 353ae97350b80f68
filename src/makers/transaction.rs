//! Transaction maker slots
//!
//! Records new spending only; there is no update mode. The budget listing
//! doubles as the category list.

use super::{MakerAction, MakerSlots};
use crate::llm::PromptTemplate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionSlots {
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub budget_id: Option<i64>,
    #[serde(default)]
    pub store_name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub neighbourhood: Option<String>,
    #[serde(default)]
    pub type_spending: Option<String>,
    /// The user agreed to record it without a budget category.
    #[serde(default)]
    pub proceed_without_category: bool,
}

const TRANSACTION_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the Transaction Maker. You help the user record a new transaction from natural language.

Fields:
- amount (mandatory, EGP)
- budget_id (recommended): map the user's category to one of the active budgets. If nothing matches, leave it null and ask whether to proceed without a category or pick one from the list. Set "proceed_without_category": true only when the user says so.
- store_name, date (YYYY-MM-DD, defaults to the current date), time (HH:MM), city, neighbourhood, type_spending (optional)

Rules:
1. Keep everything already collected in the current state unless the user changes it.
2. If the amount is missing, ask for it.
3. Offer the optional fields once before finishing.
4. Set "is_done": true only when the amount is known, the category is resolved or explicitly declined, and the user confirmed the summary.
5. Never claim the transaction was saved.

Return ONLY one JSON object:
{"message": "<reply to the user>", "amount": null, "budget_id": null, "store_name": null, "date": null, "time": null, "city": null, "neighbourhood": null, "type_spending": null, "proceed_without_category": false, "is_done": false}"#,
    r#"User profile:
{user_context}

Active budgets: {existing}

Conversation so far:
{history}

Current state: {current_state}
Current date: {current_date}
User: {user_request}"#,
);

impl MakerSlots for TransactionSlots {
    const AGENT: &'static str = "TransactionMaker";
    const PROMPT: PromptTemplate = TRANSACTION_PROMPT;
    const ID_COLUMN: &'static str = "budget_id";

    fn existing_query(user_id: i64) -> String {
        format!(
            "SELECT budget_id, budget_name, total_limit FROM budget \
             WHERE user_id = {} AND is_active = true ORDER BY budget_name",
            user_id
        )
    }

    fn missing_mandatory(&self, _action: MakerAction) -> Vec<&'static str> {
        if self.amount.map_or(true, |a| a <= 0.0) {
            vec!["amount"]
        } else {
            Vec::new()
        }
    }

    fn target_id(&self) -> Option<i64> {
        None
    }

    fn supports_update() -> bool {
        false
    }

    fn finalize(&mut self, today: &str) {
        if self.date.as_deref().map_or(true, |d| d.trim().is_empty()) {
            self.date = Some(today.to_string());
        }
    }

    fn gate_issues(&self, existing_ids: &[i64]) -> Vec<String> {
        match self.budget_id {
            Some(id) if existing_ids.contains(&id) => Vec::new(),
            Some(_) => vec!["That budget is not one of your active budgets; please pick one from the list.".to_string()],
            None if self.proceed_without_category => Vec::new(),
            None => vec!["Which budget should this go under, or should I record it without a category?".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::makers::{MakerAgent, MakerRequest};
    use crate::memory::ConversationMemory;
    use crate::testing::{MockStore, ScriptedLlm};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_missing_date_defaults_to_today() {
        let mut slots = TransactionSlots {
            amount: Some(50.0),
            ..TransactionSlots::default()
        };
        slots.finalize("2025-03-10");
        assert_eq!(slots.date.as_deref(), Some("2025-03-10"));
    }

    #[tokio::test]
    async fn test_amount_without_category_stays_open() {
        let llm = Arc::new(ScriptedLlm::new().respond(TransactionSlots::AGENT, |req| {
            if req.user.contains("User: Food") {
                Ok(r#"{"message": "Recording 50 EGP for Food. Confirmed.", "amount": 50, "budget_id": 1, "is_done": true}"#.into())
            } else {
                Ok(r#"{"message": "Recorded 50 EGP.", "amount": 50, "is_done": true}"#.into())
            }
        }));
        let store = Arc::new(MockStore::new().rows(
            "FROM budget",
            json!([{"budget_id": 1, "budget_name": "Food", "total_limit": 3000}]),
        ));
        let memory = Arc::new(ConversationMemory::in_memory());
        let maker: MakerAgent<TransactionSlots> = MakerAgent::new(llm, store, memory, 20);

        let first = maker
            .assist(&MakerRequest {
                user_id: 1,
                user_request: "spent 50".into(),
                conversation_id: None,
            })
            .await
            .unwrap();

        assert_eq!(first.slots.amount, Some(50.0));
        assert!(!first.is_done);
        assert!(first.message.contains("without a category"));

        let second = maker
            .assist(&MakerRequest {
                user_id: 1,
                user_request: "Food".into(),
                conversation_id: Some(first.conversation_id),
            })
            .await
            .unwrap();

        assert_eq!(second.slots.budget_id, Some(1));
        assert_eq!(second.action, MakerAction::Create);
        assert!(second.is_done);
    }

    #[test]
    fn test_declined_category_is_accepted() {
        let slots = TransactionSlots {
            amount: Some(50.0),
            proceed_without_category: true,
            ..TransactionSlots::default()
        };
        assert!(slots.gate_issues(&[1, 2]).is_empty());
    }
}
