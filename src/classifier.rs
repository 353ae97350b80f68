//! Route hint classifier
//!
//! Keyword scoring that suggests a top-level branch for an utterance:
//! - BehaviourAnalyst: causal, trend and advice questions ("why am I overspending?")
//! - DatabaseAgent: factual lookups ("how much did I spend on food?")
//! - PersonalAssistantResponse: greetings, chit-chat and anything that asks for a write
//!
//! The hint is fed to the LLM router, which has the final word.

use crate::models::Route;

/// Static keyword lists
const BEHAVIOUR_KEYWORDS: &[&str] = &[
    // Causal
    "why", "reason", "cause",
    // Trends
    "trend", "pattern", "habit", "behaviour", "behavior", "over time",
    // Advice
    "recommend", "advice", "advise", "suggest", "improve", "should i", "how can i", "save more",
    // Comparison
    "compare", "overspend", "insight", "analyse", "analyze",
];

const LOOKUP_KEYWORDS: &[&str] = &[
    "how much", "how many", "total", "spent", "spend", "spending",
    "transactions", "transaction", "balance", "income", "salary",
    "list", "show", "budget", "goal", "last month", "this month",
    "average", "biggest", "largest",
];

/// Verbs that ask for data to change; the assistant never writes.
const WRITE_VERBS: &[&str] = &[
    "add", "create", "delete", "update", "record", "remove", "insert", "edit", "change",
];

pub struct RouteClassifier;

impl RouteClassifier {
    pub fn classify(text: &str) -> Route {
        let lowered = text.to_lowercase();

        if BEHAVIOUR_KEYWORDS.iter().any(|kw| lowered.contains(*kw)) {
            return Route::BehaviourAnalyst;
        }

        if contains_write_verb(&lowered) {
            return Route::PersonalAssistantResponse;
        }

        let lookup_score = LOOKUP_KEYWORDS
            .iter()
            .filter(|kw| lowered.contains(**kw))
            .count();

        if lookup_score > 0 {
            Route::DatabaseAgent
        } else {
            Route::PersonalAssistantResponse
        }
    }
}

/// Whole-word match so "address" or "recorded" do not count.
fn contains_write_verb(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| WRITE_VERBS.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_questions() {
        let cases = vec![
            "How much did I spend on food last month?",
            "show my transactions in Cairo",
            "What is my total income this month?",
        ];

        for c in cases {
            assert_eq!(RouteClassifier::classify(c), Route::DatabaseAgent, "{}", c);
        }
    }

    #[test]
    fn test_behaviour_questions() {
        let cases = vec![
            "Why am I overspending on dining?",
            "What patterns do you see in my weekend spending?",
            "How can I save more each month?",
        ];

        for c in cases {
            assert_eq!(RouteClassifier::classify(c), Route::BehaviourAnalyst, "{}", c);
        }
    }

    #[test]
    fn test_conversational_and_write_requests() {
        let cases = vec![
            "Hi there",
            "thanks!",
            "Add a transaction of 50 for groceries",
            "delete my food budget",
        ];

        for c in cases {
            assert_eq!(
                RouteClassifier::classify(c),
                Route::PersonalAssistantResponse,
                "{}",
                c
            );
        }
    }
}
