//! Goal maker slots

use super::{MakerAction, MakerSlots};
use crate::llm::PromptTemplate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GoalSlots {
    #[serde(default)]
    pub goal_id: Option<i64>,
    #[serde(default)]
    pub goal_name: Option<String>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub goal_description: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    /// Suggested savings plan, e.g. "save 5000 EGP per month for 12 months".
    #[serde(default)]
    pub plan: Option<String>,
}

const GOAL_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are the Goal Maker. You help the user define a savings goal through a short conversation.

Fields:
- goal_name (mandatory)
- target (mandatory, amount in EGP)
- goal_description, due_date (YYYY-MM-DD), plan (optional)

Rules:
1. Keep everything already collected in the current state unless the user changes it.
2. Ask for one missing mandatory field at a time.
3. Once the mandatory fields are known, offer the optional ones once. Suggest a realistic monthly plan from the user's income when a due date is known.
4. If the user clearly refers to one of their existing goals, set "action": "update" and "goal_id" from the list. If the reference is ambiguous, ask which goal they mean and keep "action": "create".
5. Set "is_done": true only after summarising the goal and the user confirming it.
6. Never claim the goal was saved.

Return ONLY one JSON object:
{"message": "<reply to the user>", "action": "create" | "update", "goal_id": null, "goal_name": null, "target": null, "goal_description": null, "due_date": null, "plan": null, "is_done": false}"#,
    r#"User profile:
{user_context}

Existing goals: {existing}

Conversation so far:
{history}

Current state: {current_state}
Current date: {current_date}
User: {user_request}"#,
);

impl MakerSlots for GoalSlots {
    const AGENT: &'static str = "GoalMaker";
    const PROMPT: PromptTemplate = GOAL_PROMPT;
    const ID_COLUMN: &'static str = "goal_id";

    fn existing_query(user_id: i64) -> String {
        format!(
            "SELECT goal_id, goal_name, target, due_date, status FROM goals WHERE user_id = {} ORDER BY goal_id LIMIT 20",
            user_id
        )
    }

    fn missing_mandatory(&self, action: MakerAction) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match action {
            MakerAction::Create => {
                if self.goal_name.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    missing.push("goal name");
                }
                if self.target.map_or(true, |t| t <= 0.0) {
                    missing.push("target amount");
                }
            }
            MakerAction::Update => {
                if self.goal_id.is_none() {
                    missing.push("which goal to update");
                }
            }
        }
        missing
    }

    fn target_id(&self) -> Option<i64> {
        self.goal_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_fields() {
        let mut slots = GoalSlots {
            goal_name: Some("Car".into()),
            ..GoalSlots::default()
        };
        assert_eq!(slots.missing_mandatory(MakerAction::Create), vec!["target amount"]);

        slots.target = Some(200000.0);
        assert!(slots.missing_mandatory(MakerAction::Create).is_empty());
        assert_eq!(
            slots.missing_mandatory(MakerAction::Update),
            vec!["which goal to update"]
        );
    }
}
