//! Core data models shared by the agents and the graphs

use crate::store::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const EXECUTION_ERROR_PREFIX: &str = "Error Executing Query:";
pub const AGENT_ERROR_PREFIX: &str = "Agent Error:";

//
// ================= Routing =================
//

/// Top-level branch chosen for a user message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    DatabaseAgent,
    BehaviourAnalyst,
    PersonalAssistantResponse,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::DatabaseAgent => "database_agent",
            Route::BehaviourAnalyst => "behaviour_analyst",
            Route::PersonalAssistantResponse => "personal_assistant_response",
        }
    }

    /// `source_agent` recorded on the assistant's reply.
    pub fn source_agent(&self) -> &'static str {
        match self {
            Route::DatabaseAgent => "DatabaseAgent",
            Route::BehaviourAnalyst => "BehaviourAnalyst",
            Route::PersonalAssistantResponse => "PersonalAssistant",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decision of the behaviour-analyst router.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    QueryPlanner,
    Analyser,
    End,
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NextStep::QueryPlanner => "query_planner",
            NextStep::Analyser => "analyser",
            NextStep::End => "end",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Database Results =================
//

/// Rows, or the in-band error that replaced them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RowData {
    Rows(Vec<Row>),
    Error(String),
}

impl RowData {
    pub fn execution_error(detail: impl fmt::Display) -> Self {
        RowData::Error(format!("{} {}", EXECUTION_ERROR_PREFIX, detail))
    }

    pub fn agent_error(detail: impl fmt::Display) -> Self {
        RowData::Error(format!("{} {}", AGENT_ERROR_PREFIX, detail))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RowData::Error(_))
    }

    /// No rows, or only rows without any columns.
    pub fn is_empty(&self) -> bool {
        match self {
            RowData::Rows(rows) => rows.iter().all(|row| row.is_empty()),
            RowData::Error(_) => false,
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            RowData::Rows(rows) => rows,
            RowData::Error(_) => &[],
        }
    }
}

impl fmt::Display for RowData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowData::Rows(rows) => {
                let json = serde_json::to_string(rows).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
            RowData::Error(message) => write!(f, "{}", message),
        }
    }
}

/// Outcome of one planned step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbResult {
    pub step: String,
    pub query: String,
    pub data: RowData,
}

//
// ================= Explanation & Validation =================
//

/// An explanation waiting for an audit pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationTask {
    pub result: DbResult,
    pub explanation: String,
    /// Corrections already spent on this result.
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl ValidationVerdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            reasoning: String::new(),
        }
    }

    pub fn fail(reasoning: impl Into<String>) -> Self {
        Self {
            valid: false,
            reasoning: reasoning.into(),
        }
    }
}

/// Carried back to the explainer with a result that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionFeedback {
    pub previous_explanation: String,
    pub failure_reason: String,
    pub attempt: u32,
}

//
// ================= Assistant I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantRequest {
    pub query: String,
    pub user_id: i64,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub final_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    pub conversation_id: Option<i64>,
}
