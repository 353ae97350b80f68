//! Test doubles for the provider and store boundaries.

use crate::error::OrchestrationError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::store::{FinanceStore, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

type Script = Box<dyn Fn(&CompletionRequest) -> crate::Result<String> + Send + Sync>;

/// Provider whose answers are closures keyed by agent name.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: HashMap<&'static str, Script>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(mut self, agent: &'static str, script: F) -> Self
    where
        F: Fn(&CompletionRequest) -> crate::Result<String> + Send + Sync + 'static,
    {
        self.scripts.insert(agent, Box::new(script));
        self
    }

    pub fn calls_for(&self, agent: &str) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| c.agent == agent).cloned().collect())
            .unwrap_or_default()
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.calls_for(agent).len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> crate::Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        match self.scripts.get(request.agent) {
            Some(script) => script(request),
            None => Err(OrchestrationError::LlmError(format!(
                "no script for agent {}",
                request.agent
            ))),
        }
    }
}

enum Canned {
    Rows(Vec<Row>),
    Fail(String),
}

/// Store that answers by SQL substring. Unmatched statements return no rows.
#[derive(Default)]
pub struct MockStore {
    answers: Vec<(String, Canned, Duration)>,
    executed: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(self, pattern: &str, rows: Value) -> Self {
        self.rows_after(pattern, rows, Duration::ZERO)
    }

    pub fn rows_after(mut self, pattern: &str, rows: Value, latency: Duration) -> Self {
        let rows = match rows {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        self.answers
            .push((pattern.to_string(), Canned::Rows(rows), latency));
        self
    }

    pub fn fail(mut self, pattern: &str, message: &str) -> Self {
        self.answers.push((
            pattern.to_string(),
            Canned::Fail(message.to_string()),
            Duration::ZERO,
        ));
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FinanceStore for MockStore {
    async fn fetch_rows(&self, sql: &str) -> crate::Result<Vec<Row>> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }

        let Some((_, canned, latency)) = self
            .answers
            .iter()
            .find(|(pattern, _, _)| sql.contains(pattern.as_str()))
        else {
            return Ok(Vec::new());
        };

        if !latency.is_zero() {
            tokio::time::sleep(*latency).await;
        }

        match canned {
            Canned::Rows(rows) => Ok(rows.clone()),
            Canned::Fail(message) => Err(OrchestrationError::DatabaseError(message.clone())),
        }
    }
}
