//! Runtime configuration
//!
//! Everything is read from the environment (the binaries load `.env` first).
//! Bad values never abort startup: they fall back to the default with a warning.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Knobs that shape a single behaviour-analyst sub-graph run.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Probability that an explainer batch goes through the validator.
    pub audit_sample_rate: f64,
    /// How many times one result may be re-explained after failing validation.
    pub max_correction_attempts: u32,
    /// Maximum node executions per run.
    pub recursion_limit: usize,
    /// Per-step timeout for database calls made inside the sub-graph.
    pub db_step_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            audit_sample_rate: 0.4,
            max_correction_attempts: 3,
            recursion_limit: 100,
            db_step_timeout: Duration::from_secs(20),
        }
    }
}

impl GraphConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            audit_sample_rate: normalize_sample_rate(env_parse(
                "AUDIT_SAMPLE_RATE",
                defaults.audit_sample_rate,
            )),
            max_correction_attempts: env_parse(
                "MAX_CORRECTION_ATTEMPTS",
                defaults.max_correction_attempts,
            ),
            recursion_limit: env_parse("RECURSION_LIMIT", defaults.recursion_limit).max(1),
            db_step_timeout: Duration::from_secs(env_parse(
                "SUBGRAPH_DB_TIMEOUT_SECS",
                defaults.db_step_timeout.as_secs(),
            )),
        }
    }
}

/// Clamp a sampling probability into [0, 1]. NaN and infinities fall back
/// to the default rate.
pub fn normalize_sample_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        let fallback = GraphConfig::default().audit_sample_rate;
        warn!(rate, fallback, "Ignoring non-finite audit sample rate");
        fallback
    }
}

/// Top-level configuration for the assistant and its binaries.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub llm_max_retries: u32,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_agent_timeout: Duration,
    pub conversation_window: usize,
    pub port: u16,
    pub graph: GraphConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            llm_max_retries: 2,
            database_url: None,
            db_max_connections: 5,
            db_agent_timeout: Duration::from_secs(20),
            conversation_window: 20,
            port: 8080,
            graph: GraphConfig::default(),
        }
    }
}

impl AssistantConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let gemini_api_key = env::var("GEMINI_API_KEY").unwrap_or_default();
        if gemini_api_key.is_empty() {
            warn!("GEMINI_API_KEY not set; every agent call will degrade to its fallback");
        }

        let database_url = env::var("DATABASE_URL")
            .or_else(|_| env::var("POSTGRES_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty());

        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .ok()
            .and_then(|raw| parse_or_warn("PORT", &raw))
            .unwrap_or(defaults.port);

        Self {
            gemini_api_key,
            gemini_model: env::var("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            llm_max_retries: env_parse("LLM_MAX_RETRIES", defaults.llm_max_retries),
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            db_agent_timeout: Duration::from_secs(env_parse(
                "DB_AGENT_TIMEOUT_SECS",
                defaults.db_agent_timeout.as_secs(),
            )),
            conversation_window: env_parse("CONVERSATION_WINDOW", defaults.conversation_window),
            port,
            graph: GraphConfig::from_env(),
        }
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or_warn(key, &raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "Ignoring invalid configuration value");
            None
        }
    }
}
