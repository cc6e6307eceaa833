//! HTTP server exposing pipeline execution and agent management.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::agent::{AgentHealth, AgentRole};
use crate::orchestrator::{Orchestrator, OrchestratorStatus};
use crate::pipeline::PipelineResult;
use crate::preloader::{PreloadReport, PreloadState};
use crate::recorder::LoadLevel;
use crate::settings::Settings;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub agents_constructed: usize,
    pub cache_entries: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub query: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdaptRequest {
    /// Explicit load level; derived from recorded performance when absent
    #[serde(default)]
    pub load: Option<LoadLevel>,
    /// Preload with the retuned strategy right away
    #[serde(default)]
    pub preload: bool,
}

#[derive(Debug, Serialize)]
pub struct AdaptResponse {
    pub state: PreloadState,
    pub preload: Option<PreloadReport>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/execute", post(execute))
        .route("/api/agents/load/:role", post(load_agent))
        .route("/api/agents/unload/:role", delete(unload_agent))
        .route("/api/preload/adapt", post(adapt_preload))
        .route("/api/cache/cleanup", post(cleanup_cache))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn parse_role(role: &str) -> Result<AgentRole, StatusCode> {
    role.parse().map_err(|e| {
        warn!("{}", e);
        StatusCode::NOT_FOUND
    })
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        agents_constructed: orchestrator.factory().constructed_roles().len(),
        cache_entries: orchestrator.context().cache().len(),
    })
}

async fn status(State(state): State<AppState>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status())
}

#[instrument(skip(state, request))]
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<PipelineResult>, StatusCode> {
    if request.query.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(Json(state.orchestrator.execute(&request.query).await))
}

#[instrument(skip(state))]
async fn load_agent(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<AgentHealth>, StatusCode> {
    let role = parse_role(&role)?;
    Ok(Json(state.orchestrator.load_agent(role).await))
}

#[instrument(skip(state))]
async fn unload_agent(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let role = parse_role(&role)?;
    let released = state.orchestrator.unload_agent(role);
    Ok(Json(json!({ "role": role, "released": released })))
}

#[instrument(skip(state, request))]
async fn adapt_preload(
    State(state): State<AppState>,
    request: Option<Json<AdaptRequest>>,
) -> Json<AdaptResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let adapted = state.orchestrator.adapt(request.load);
    let preload = if request.preload {
        Some(state.orchestrator.preloader().preload_current().await)
    } else {
        None
    };
    Json(AdaptResponse {
        state: adapted,
        preload,
    })
}

async fn cleanup_cache(State(state): State<AppState>) -> Json<Value> {
    let cache = state.orchestrator.context().cache();
    let removed = cache.cleanup();
    Json(json!({ "removed": removed, "remaining": cache.len() }))
}

/// Start the HTTP server and wait for a shutdown signal.
pub async fn serve(settings: Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .context("Invalid server address")?,
    };

    let orchestrator =
        Arc::new(Orchestrator::new(settings).context("Orchestrator initialization failed")?);
    if orchestrator.start_background() {
        info!("Background preloading scheduled");
    }

    let app = create_router(AppState::new(orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server error")?;

    orchestrator.shutdown().await;
    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C, or SIGTERM on unix)
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;
    use crate::context::OrchestratorContext;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Orchestrator>) {
        let settings = Settings::offline();
        let context = Arc::new(
            OrchestratorContext::from_settings(&settings)
                .with_backend(Arc::new(OfflineBackend::new("offline://test"))),
        );
        let orchestrator = Arc::new(Orchestrator::with_context(settings, context).unwrap());
        (create_router(AppState::new(orchestrator.clone())), orchestrator)
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (app, _) = app();
        let (status, body) = send(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["agents_constructed"], 0);
    }

    #[tokio::test]
    async fn execute_returns_pipeline_result() {
        let (app, _) = app();
        let (status, body) = send(
            app,
            Method::POST,
            "/api/execute",
            Some(json!({ "query": "how do rust lifetimes work" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aborted"], false);
        assert!(body["answer"].is_string());
        assert_eq!(body["completed_stages"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (app, _) = app();
        let (status, _) = send(app, Method::POST, "/api/execute", Some(json!({ "query": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn load_and_unload_agent() {
        let (app, orchestrator) = app();
        let (status, body) = send(app.clone(), Method::POST, "/api/agents/load/critic", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "critic");
        assert_eq!(orchestrator.factory().constructed_roles(), vec![AgentRole::Critic]);

        let (status, body) = send(app.clone(), Method::DELETE, "/api/agents/unload/critic", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["released"], true);

        let (status, _) = send(app, Method::POST, "/api/agents/load/oracle", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn adapt_accepts_explicit_load() {
        let (app, _) = app();
        let (status, body) = send(
            app,
            Method::POST,
            "/api/preload/adapt",
            Some(json!({ "load": "high" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["strategy"], "conservative");
        assert!(body["preload"].is_null());
    }
}
