//! Database sub-agent
//!
//! One plain-language step in, one `DbResult` out. The agent never raises:
//! writer failures, rejected statements, execution errors and timeouts all
//! come back as an in-band error payload so sibling calls are unaffected.

use crate::llm::{LlmProvider, OutputSchema, PromptInputs, PromptTemplate, StructuredAgent};
use crate::models::{DbResult, RowData};
use crate::schema::SCHEMA_DESCRIPTION;
use crate::store::{FinanceStore, Row};
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the SQL writer hands back.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SqlDraft {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub message: String,
}

impl OutputSchema for SqlDraft {}

impl SqlDraft {
    /// Nothing should be executed for this draft.
    pub fn is_rejected(&self) -> bool {
        self.edit
            || self.query.trim().is_empty()
            || self.message.to_lowercase().contains("query rejected")
    }
}

/// Result of a direct (top-level) database request.
#[derive(Debug, Clone)]
pub struct DbAnswer {
    pub query: String,
    pub message: String,
    /// `None` when nothing was read (write request or rejected draft).
    pub rows: Option<Vec<Row>>,
}

const SQL_WRITER_PROMPT: PromptTemplate = PromptTemplate::new(
    r#"You are a read-only database agent. Translate the request into a single PostgreSQL query.

OUTPUT: {"query": "<SQL>", "edit": false, "message": "<TEXT>"}
- "message": brief confirmation, or the reason the request cannot be served.
- "query": empty string when the request is invalid.
- "edit": true only when the request asks to change data; then "query" must be empty and "message" must start with "Query rejected".

RULES:
1. STRICTLY READ-ONLY: never INSERT, UPDATE, DELETE, DROP or any DDL.
2. PostgreSQL syntax (DATE_TRUNC, EXTRACT, ...).
3. Name every result column; round numerics to 2 decimals.
4. Always filter by user_id = {user_id}.
5. Return at most 10 rows unless the request says otherwise.

SCHEMA:
{schema}"#,
    r#"request: {request}
user_id: {user_id}"#,
);

pub struct DatabaseAgent {
    writer: StructuredAgent<SqlDraft>,
    store: Arc<dyn FinanceStore>,
    step_timeout: Duration,
}

impl DatabaseAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn FinanceStore>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            writer: StructuredAgent::new("database_agent", SQL_WRITER_PROMPT, provider),
            store,
            step_timeout,
        }
    }

    async fn draft(&self, request: &str, user_id: i64) -> Result<SqlDraft, crate::error::AgentError> {
        let inputs = PromptInputs::new()
            .with("schema", SCHEMA_DESCRIPTION)
            .with("request", request)
            .with("user_id", user_id);
        self.writer.invoke(&inputs).await
    }

    /// Draft and execute one step.
    pub async fn run_step(&self, step: &str, user_id: i64) -> DbResult {
        let draft = match self.draft(step, user_id).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(step, error = %e, "SQL writer failed");
                return DbResult {
                    step: step.to_string(),
                    query: String::new(),
                    data: RowData::agent_error(e),
                };
            }
        };

        if draft.is_rejected() {
            let reason = if draft.message.is_empty() {
                "Query rejected".to_string()
            } else {
                draft.message.clone()
            };
            return DbResult {
                step: step.to_string(),
                query: draft.query,
                data: RowData::agent_error(reason),
            };
        }

        let data = match self.store.fetch_rows(&draft.query).await {
            Ok(rows) => RowData::Rows(rows),
            Err(e) => {
                warn!(step, error = %e, "Query execution failed");
                RowData::execution_error(e)
            }
        };

        DbResult {
            step: step.to_string(),
            query: draft.query,
            data,
        }
    }

    /// `run_step` bounded by the per-step timeout.
    pub async fn run_step_bounded(&self, step: &str, user_id: i64) -> DbResult {
        match tokio::time::timeout(self.step_timeout, self.run_step(step, user_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    step,
                    timeout_ms = self.step_timeout.as_millis() as u64,
                    "Database step timed out"
                );
                DbResult {
                    step: step.to_string(),
                    query: String::new(),
                    data: RowData::agent_error(format!("timed out after {:?}", self.step_timeout)),
                }
            }
        }
    }

    /// Fan out every step concurrently; results are index-aligned with `steps`.
    pub async fn run_steps(&self, steps: &[String], user_id: i64) -> Vec<DbResult> {
        let start = Instant::now();

        let results = join_all(
            steps
                .iter()
                .map(|step| self.run_step_bounded(step, user_id)),
        )
        .await;

        info!(
            step_count = steps.len(),
            failed = results.iter().filter(|r| r.data.is_error()).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Database steps completed"
        );
        results
    }

    /// Direct request from the top-level router. Writes are never executed.
    pub async fn answer(&self, request: &str, user_id: i64) -> crate::Result<DbAnswer> {
        let draft = self
            .draft(request, user_id)
            .await
            .map_err(|e| crate::error::OrchestrationError::LlmError(e.to_string()))?;

        if draft.is_rejected() {
            debug!(edit = draft.edit, "Database request not executed");
            return Ok(DbAnswer {
                query: draft.query,
                message: draft.message,
                rows: None,
            });
        }

        let rows = self.store.fetch_rows(&draft.query).await?;
        Ok(DbAnswer {
            query: draft.query,
            message: draft.message,
            rows: Some(rows),
        })
    }
}
