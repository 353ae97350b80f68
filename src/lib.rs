//! Personal Finance Orchestrator
//!
//! A conversational assistant over a user's finance database:
//! - Routes each request to a data lookup, a behaviour analysis or a plain reply
//! - Plans read-only SQL steps and explains the rows they return
//! - Audits a sample of explanations against the underlying data
//! - Helps the user draft goals, budgets and transactions turn by turn
//! - Keeps the conversation history in Postgres or in memory
//!
//! ANALYST LOOP:
//! ORCHESTRATE → PLAN → FETCH → EXPLAIN → AUDIT? → ANALYSE → RESPOND

pub mod analyser;
pub mod api;
pub mod assistant;
pub mod classifier;
pub mod config;
pub mod database;
pub mod error;
pub mod explainer;
pub mod gemini;
pub mod graph;
pub mod llm;
pub mod makers;
pub mod memory;
pub mod models;
pub mod planner;
pub mod schema;
pub mod services;
pub mod store;
pub mod verification;

#[cfg(test)]
mod testing;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use assistant::PersonalAssistant;
pub use classifier::RouteClassifier;
pub use config::{AssistantConfig, GraphConfig};
pub use graph::{AnalystGraph, AnalystRun};
pub use services::Services;
