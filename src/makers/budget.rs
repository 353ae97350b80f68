//! Budget maker slots

use super::{MakerAction, MakerSlots};
use crate::llm::PromptTemplate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetSlots {
    #[serde(default)]
    pub budget_id: Option<i64>,
    #[serde(default)]
    pub budget_name: Option<String>,
    /// Monthly limit in EGP.
    #[serde(default)]
    pub total_limit: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority_level_int: Option<i64>,
}

const BUDGET_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the Budget Maker. You help the user create a monthly budget or change one of their existing budgets.

Fields:
- budget_name (mandatory for a new budget)
- total_limit (mandatory for a new budget, monthly limit in EGP)
- description, priority_level_int (1-10) (optional)

Rules:
1. Keep everything already collected in the current state unless the user changes it.
2. If the user clearly names one of the existing budgets, set "action": "update" and "budget_id" from the list; fill only the fields that change.
3. If the reference could match more than one budget, ask which one and keep "action": "create".
4. Offer the optional fields once before finishing.
5. Set "is_done": true only after summarising the budget and the user confirming it.
6. Never claim the budget was saved.

Return ONLY one JSON object:
{"message": "<reply to the user>", "action": "create" | "update", "budget_id": null, "budget_name": null, "total_limit": null, "description": null, "priority_level_int": null, "is_done": false}"#,
    r#"User profile:
{user_context}

Existing budgets: {existing}

Conversation so far:
{history}

Current state: {current_state}
Current date: {current_date}
User: {user_request}"#,
);

impl MakerSlots for BudgetSlots {
    const AGENT: &'static str = "BudgetMaker";
    const PROMPT: PromptTemplate = BUDGET_PROMPT;
    const ID_COLUMN: &'static str = "budget_id";

    fn existing_query(user_id: i64) -> String {
        format!(
            "SELECT budget_id, budget_name, total_limit, priority_level_int FROM budget \
             WHERE user_id = {} AND is_active = true ORDER BY budget_name",
            user_id
        )
    }

    fn missing_mandatory(&self, action: MakerAction) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match action {
            MakerAction::Create => {
                if self.budget_name.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    missing.push("budget name");
                }
                if self.total_limit.map_or(true, |l| l <= 0.0) {
                    missing.push("monthly limit");
                }
            }
            MakerAction::Update => {
                if self.budget_id.is_none() {
                    missing.push("which budget to update");
                }
            }
        }
        missing
    }

    fn target_id(&self) -> Option<i64> {
        self.budget_id
    }

    fn gate_issues(&self, _existing_ids: &[i64]) -> Vec<String> {
        match self.priority_level_int {
            Some(p) if !(1..=10).contains(&p) => {
                vec!["Priority must be between 1 and 10.".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        let slots = BudgetSlots {
            budget_name: Some("Food".into()),
            total_limit: Some(3000.0),
            priority_level_int: Some(12),
            ..BudgetSlots::default()
        };
        assert!(slots.missing_mandatory(MakerAction::Create).is_empty());
        assert_eq!(slots.gate_issues(&[]).len(), 1);
    }
}
