//! Conversation message records
//!
//! Messages are append-only. JSON-typed messages carry data payloads
//! (query rows, maker slot records) and are left out of the text summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NO_PREVIOUS_MESSAGES: &str = "No previous text messages in this conversation.";

/// Who wrote a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Assistant,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Assistant => "assistant",
            SenderType::System => "system",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "assistant" => SenderType::Assistant,
            "system" => SenderType::System,
            _ => SenderType::User,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Json,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Json => "json",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            ContentType::Json
        } else {
            ContentType::Text
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_type: SenderType,
    pub source_agent: Option<String>,
    pub content: String,
    pub content_type: ContentType,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            sender_type: SenderType::User,
            source_agent: Some("User".to_string()),
            content: content.into(),
            content_type: ContentType::Text,
        }
    }

    pub fn assistant(source_agent: &str, content: impl Into<String>) -> Self {
        Self {
            sender_type: SenderType::Assistant,
            source_agent: Some(source_agent.to_string()),
            content: content.into(),
            content_type: ContentType::Text,
        }
    }

    pub fn payload(source_agent: &str, payload: &Value) -> Self {
        Self {
            sender_type: SenderType::Assistant,
            source_agent: Some(source_agent.to_string()),
            content: payload.to_string(),
            content_type: ContentType::Json,
        }
    }
}

/// A stored message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub message_id: i64,
    pub conversation_id: i64,
    pub sender_type: SenderType,
    pub source_agent: Option<String>,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_json(&self) -> bool {
        self.content_type == ContentType::Json
    }

    pub fn is_from(&self, source_agent: &str) -> bool {
        self.source_agent.as_deref() == Some(source_agent)
    }

    /// Parsed payload of a JSON message.
    pub fn payload(&self) -> Option<Value> {
        if !self.is_json() {
            return None;
        }
        serde_json::from_str(&self.content).ok()
    }
}

/// Numbered text-only transcript used as LLM context.
pub fn summarize(messages: &[ChatMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .filter(|m| !m.is_json())
        .enumerate()
        .map(|(i, m)| {
            let speaker = m
                .source_agent
                .as_deref()
                .unwrap_or_else(|| m.sender_type.as_str());
            format!("{}. [{}] {}", i + 1, speaker, m.content)
        })
        .collect();

    if lines.is_empty() {
        NO_PREVIOUS_MESSAGES.to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(id: i64, message: NewMessage) -> ChatMessage {
        ChatMessage {
            message_id: id,
            conversation_id: 1,
            sender_type: message.sender_type,
            source_agent: message.source_agent,
            content: message.content,
            content_type: message.content_type,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_skips_json_and_numbers_lines() {
        let messages = vec![
            stored(1, NewMessage::user("How much did I spend?")),
            stored(2, NewMessage::assistant("DatabaseAgent", "You spent 300 EGP.")),
            stored(3, NewMessage::payload("DatabaseAgent", &json!([{"total": 300}]))),
            stored(4, NewMessage::user("Thanks")),
        ];

        assert_eq!(
            summarize(&messages),
            "1. [User] How much did I spend?\n2. [DatabaseAgent] You spent 300 EGP.\n3. [User] Thanks"
        );
    }

    #[test]
    fn test_summary_falls_back_to_sender_type() {
        let mut message = stored(1, NewMessage::assistant("X", "hello"));
        message.source_agent = None;
        assert_eq!(summarize(&[message]), "1. [assistant] hello");
    }

    #[test]
    fn test_empty_summary() {
        let only_json = vec![stored(1, NewMessage::payload("GoalMaker", &json!({"amount": 5})))];
        assert_eq!(summarize(&[]), NO_PREVIOUS_MESSAGES);
        assert_eq!(summarize(&only_json), NO_PREVIOUS_MESSAGES);
    }

    #[test]
    fn test_payload_parsing() {
        let message = stored(1, NewMessage::payload("BudgetMaker", &json!({"budget_name": "Food"})));
        assert_eq!(message.payload(), Some(json!({"budget_name": "Food"})));
        assert!(stored(2, NewMessage::user("{}")).payload().is_none());
    }
}
