//! REST API for the personal finance assistant
//!
//! Exposes the assistant and the maker agents over HTTP.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::assistant::APOLOGY_MESSAGE;
use crate::error::OrchestrationError;
use crate::makers::{MakerAgent, MakerRequest, MakerSlots};
use crate::models::AssistantRequest;
use crate::services::Services;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub services: Arc<Services>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "personal-finance-orchestrator",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Assistant Endpoint
/// =============================

async fn analyze(State(state): State<ApiState>, Json(req): Json<AssistantRequest>) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty")),
        )
            .into_response();
    }

    info!(
        user_id = req.user_id,
        conversation_id = ?req.conversation_id,
        "Received assistant request"
    );

    // Failures come back as an apology in `final_output`, still 200.
    let response = state.services.assistant.handle(req).await;
    (StatusCode::OK, Json(response)).into_response()
}

/// =============================
/// Maker Endpoints
/// =============================

async fn run_maker<S: MakerSlots>(maker: &MakerAgent<S>, req: MakerRequest) -> Response {
    if req.user_request.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("user_request must not be empty")),
        )
            .into_response();
    }

    match maker.assist(&req).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => maker_failure(S::AGENT, req.user_id, &e),
    }
}

/// Internal detail stays in the logs; the client gets a fixed apology.
fn maker_failure(agent: &'static str, user_id: i64, e: &OrchestrationError) -> Response {
    error!(agent, user_id, error = %e, "Maker request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(APOLOGY_MESSAGE)),
    )
        .into_response()
}

async fn goal_maker(State(state): State<ApiState>, Json(req): Json<MakerRequest>) -> Response {
    run_maker(&state.services.goal_maker, req).await
}

async fn budget_maker(State(state): State<ApiState>, Json(req): Json<MakerRequest>) -> Response {
    run_maker(&state.services.budget_maker, req).await
}

async fn transaction_maker(State(state): State<ApiState>, Json(req): Json<MakerRequest>) -> Response {
    run_maker(&state.services.transaction_maker, req).await
}

/// =============================
/// Router
/// =============================

pub fn create_router(services: Arc<Services>) -> Router {
    let state = ApiState { services };

    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/goal-maker/assist", post(goal_maker))
        .route("/api/budget-maker/assist", post(budget_maker))
        .route("/api/transaction-maker/assist", post(transaction_maker))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(services: Arc<Services>, port: u16) -> crate::Result<()> {
    let router = create_router(services);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistantConfig;
    use crate::memory::ConversationMemory;
    use crate::testing::{MockStore, ScriptedLlm};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(llm: ScriptedLlm) -> Router {
        let services = Services::build(
            Arc::new(llm),
            Arc::new(MockStore::new()),
            Arc::new(ConversationMemory::in_memory()),
            &AssistantConfig::default(),
        );
        create_router(Arc::new(services))
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(ScriptedLlm::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "personal-finance-orchestrator");
    }

    #[tokio::test]
    async fn test_analyze_rejects_empty_query() {
        let (status, body) = post_json(
            app(ScriptedLlm::new()),
            "/api/analyze",
            json!({"query": "  ", "user_id": 1}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_analyze_degrades_to_text() {
        // no scripts at all: every agent call fails
        let (status, body) = post_json(
            app(ScriptedLlm::new()),
            "/api/analyze",
            json!({"query": "Hi there", "user_id": 1}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["final_output"].as_str().is_some_and(|s| !s.is_empty()));
        assert!(body["conversation_id"].is_i64());
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_maker_failure_hides_internal_detail() {
        let e = OrchestrationError::DatabaseError(
            "relation \"chat_messages\" does not exist".to_string(),
        );
        let response = maker_failure("GoalMaker", 1, &e);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], APOLOGY_MESSAGE);
        assert!(!body.to_string().contains("chat_messages"));
    }

    #[tokio::test]
    async fn test_transaction_maker_endpoint() {
        let llm = ScriptedLlm::new().respond("TransactionMaker", |_| {
            Ok(r#"{"message": "What was the 100 EGP for?", "amount": 100, "is_done": false}"#.into())
        });
        let (status, body) = post_json(
            app(llm),
            "/api/transaction-maker/assist",
            json!({"user_id": 1, "user_request": "spent 100"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["amount"], 100.0);
        assert_eq!(body["is_done"], false);
        assert_eq!(body["action"], "create");
        assert!(body["date"].is_string());
    }
}
