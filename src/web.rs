//! Axum-based HTTP surface: health, status, meter views and manual refresh

use crate::orchestrator::RefreshOrchestrator;
use crate::scheduler::{CommandSender, RefreshCommand};
use axum::body::Bytes;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub commands: CommandSender,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshBody {
    #[serde(default)]
    pub account_id: Option<String>,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

pub async fn meters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot())
}

/// Queue a full refresh; the body is optional
pub async fn refresh(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let parsed = if body.iter().all(u8::is_ascii_whitespace) {
        Ok(RefreshBody::default())
    } else {
        serde_json::from_slice::<RefreshBody>(&body)
    };
    let body = match parsed {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"accepted": false, "error": e.to_string()})),
            );
        }
    };

    let account_id = body.account_id.filter(|s| !s.trim().is_empty());
    let cmd = RefreshCommand::ForceFull {
        account_id: account_id.clone(),
    };
    match state.commands.send(cmd) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"accepted": true, "account_id": account_id})),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"accepted": false, "error": "scheduler not running"})),
        ),
    }
}

pub async fn clear_reauth(State(state): State<AppState>) -> impl IntoResponse {
    match state.commands.send(RefreshCommand::ClearReauth) {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({"accepted": true}))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"accepted": false, "error": "scheduler not running"})),
        ),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/meters", get(meters))
        .route("/api/refresh", post(refresh))
        .route("/api/reauth/clear", post(clear_reauth))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    orchestrator: Arc<RefreshOrchestrator>,
    commands: CommandSender,
    host: &str,
    port: u16,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let router = build_router(AppState {
        orchestrator,
        commands,
    });

    let logger = crate::logging::get_logger("web");
    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
            ([127, 0, 0, 1], port).into()
        }
    };
    logger.info(&format!("Binding web server to {}", addr));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
