//! Finance store boundary
//!
//! The agents only ever read. Statements are checked before they reach the
//! database and then run inside a read-only transaction on a pooled
//! connection acquired for that single call.

use crate::error::OrchestrationError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, warn};

/// One result row: column name to scalar.
pub type Row = Map<String, Value>;

#[async_trait]
pub trait FinanceStore: Send + Sync {
    async fn fetch_rows(&self, sql: &str) -> crate::Result<Vec<Row>>;
}

lazy_static! {
    static ref WRITE_KEYWORDS: Regex = Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|merge|copy|call|vacuum|comment|lock|refresh|reindex|cluster)\b"
    )
    .unwrap();
}

/// Reject anything that is not a single SELECT / WITH statement.
pub fn ensure_read_only(sql: &str) -> crate::Result<&str> {
    let statement = sql.trim().trim_end_matches(';').trim();
    let lowered = statement.to_lowercase();

    if statement.is_empty() {
        return Err(OrchestrationError::RejectedStatement("empty statement".into()));
    }

    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return Err(OrchestrationError::RejectedStatement(
            "only SELECT or WITH statements are allowed".into(),
        ));
    }

    if statement.contains(';') {
        return Err(OrchestrationError::RejectedStatement(
            "multiple statements are not allowed".into(),
        ));
    }

    if let Some(found) = WRITE_KEYWORDS.find(statement) {
        return Err(OrchestrationError::RejectedStatement(format!(
            "write keyword `{}` is not allowed",
            found.as_str()
        )));
    }

    Ok(statement)
}

/// Postgres-backed store.
pub struct PgFinanceStore {
    pool: PgPool,
}

impl PgFinanceStore {
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> crate::Result<Self> {
        if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")) {
            return Err(OrchestrationError::ConfigError(
                "DATABASE_URL must be a postgres:// connection string".to_string(),
            ));
        }
        if max_connections == 0 {
            return Err(OrchestrationError::ConfigError(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl FinanceStore for PgFinanceStore {
    async fn fetch_rows(&self, sql: &str) -> crate::Result<Vec<Row>> {
        let statement = ensure_read_only(sql)?;
        debug!(sql = statement, "Executing read-only statement");

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let wrapped = format!("SELECT row_to_json(q) AS row FROM ({}) q", statement);
        let rows: Vec<(Json<Value>,)> = sqlx::query_as(&wrapped).fetch_all(&mut *tx).await?;

        tx.rollback().await?;

        Ok(rows
            .into_iter()
            .map(|(Json(value),)| match value {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            })
            .collect())
    }
}

/// Stand-in when no database is configured: every call reports the gap in-band.
pub struct UnavailableStore;

#[async_trait]
impl FinanceStore for UnavailableStore {
    async fn fetch_rows(&self, _sql: &str) -> crate::Result<Vec<Row>> {
        Err(OrchestrationError::DatabaseError(
            "no database configured".into(),
        ))
    }
}

// ================= Context helpers =================

pub const NO_ACTIVE_BUDGETS: &str = "No active budgets found.";
pub const BUDGETS_UNAVAILABLE: &str = "Error fetching budgets.";
pub const NO_USER_INFO: &str = "No user information available.";

pub async fn fetch_active_budgets(store: &dyn FinanceStore, user_id: i64) -> crate::Result<Vec<Row>> {
    store
        .fetch_rows(&format!(
            "SELECT budget_id, budget_name, total_limit FROM budget \
             WHERE user_id = {} AND is_active = true ORDER BY budget_name",
            user_id
        ))
        .await
}

/// `"Food (ID: 1), Transport (ID: 2)"` or one of the fixed fallbacks.
pub async fn active_budgets_summary(store: &dyn FinanceStore, user_id: i64) -> String {
    match fetch_active_budgets(store, user_id).await {
        Ok(rows) if rows.is_empty() => NO_ACTIVE_BUDGETS.to_string(),
        Ok(rows) => rows
            .iter()
            .map(|row| {
                format!(
                    "{} (ID: {})",
                    scalar_text(row.get("budget_name")),
                    scalar_text(row.get("budget_id"))
                )
            })
            .collect::<Vec<_>>()
            .join(", "),
        Err(e) => {
            warn!(user_id, error = %e, "Failed to fetch active budgets");
            BUDGETS_UNAVAILABLE.to_string()
        }
    }
}

/// Profile, income, budgets and goals, as prompt context for the makers.
pub async fn user_context_summary(store: &Arc<dyn FinanceStore>, user_id: i64) -> String {
    let profile = store
        .fetch_rows(&format!(
            "SELECT first_name, last_name, job_title FROM users WHERE user_id = {}",
            user_id
        ))
        .await;

    let profile = match profile {
        Ok(rows) => match rows.first() {
            Some(row) => row.clone(),
            None => return NO_USER_INFO.to_string(),
        },
        Err(e) => {
            warn!(user_id, error = %e, "Failed to fetch user profile");
            return NO_USER_INFO.to_string();
        }
    };

    let mut summary = format!(
        "Name: {} {}\nJob: {}",
        scalar_text(profile.get("first_name")),
        scalar_text(profile.get("last_name")),
        scalar_text(profile.get("job_title"))
    );

    let income = store
        .fetch_rows(&format!(
            "SELECT type_income, amount, period FROM income WHERE user_id = {} ORDER BY amount DESC",
            user_id
        ))
        .await
        .unwrap_or_default();
    if !income.is_empty() {
        let streams: Vec<String> = income
            .iter()
            .map(|row| {
                format!(
                    "{} {} ({})",
                    scalar_text(row.get("type_income")),
                    scalar_text(row.get("amount")),
                    scalar_text(row.get("period"))
                )
            })
            .collect();
        summary.push_str(&format!("\nIncome: {}", streams.join(", ")));
    }

    summary.push_str(&format!(
        "\nActive budgets: {}",
        active_budgets_summary(store.as_ref(), user_id).await
    ));

    let goals = store
        .fetch_rows(&format!(
            "SELECT goal_name, target, due_date FROM goals WHERE user_id = {} AND status = 'active' ORDER BY due_date",
            user_id
        ))
        .await
        .unwrap_or_default();
    if !goals.is_empty() {
        let goals: Vec<String> = goals
            .iter()
            .map(|row| {
                format!(
                    "{} (target {}, due {})",
                    scalar_text(row.get("goal_name")),
                    scalar_text(row.get("target")),
                    scalar_text(row.get("due_date"))
                )
            })
            .collect();
        summary.push_str(&format!("\nGoals: {}", goals.join(", ")));
    }

    summary
}

pub fn scalar_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "n/a".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
