//! Error types for the personal finance orchestrator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Rejected statement: {0}")]
    RejectedStatement(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Recursion limit of {0} node executions reached")]
    RecursionLimit(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Structured-output failures: the model answered, but not in the declared shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("empty model output")]
    Empty,

    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("field `{field}` violates the output schema: {reason}")]
    Schema { field: &'static str, reason: String },
}

/// Why a structured agent call produced no usable output.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("transport failure: {0}")]
    Transport(#[from] OrchestrationError),

    #[error("unparseable output: {0}")]
    Parse(#[from] ParseError),
}

impl AgentError {
    pub fn is_parse(&self) -> bool {
        matches!(self, AgentError::Parse(_))
    }
}
