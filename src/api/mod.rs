//! HTTP facade
//!
//! Thin axum layer over [`Supervisor`]. Handlers only translate between JSON
//! and supervisor calls; commands run on their own task so a dropped request
//! never cancels a sequence halfway.

mod views;

pub use views::{energy_links, DeviceView, EnergyLink, TelemetryView};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::executor::{deadline_after, CommandResult};
use crate::registry::DeviceKind;
use crate::supervisor::Supervisor;

/// Shared state for the axum handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub device: String,
    pub action: String,
    /// Abort remaining steps once this many milliseconds have passed
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
}

impl ControlResponse {
    fn rejected(error: String) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error),
            result: None,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/control", post(control))
        .route("/device_data", get(device_data))
        .route("/logs", get(logs))
        .route("/config", get(effective_config))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;

    info!("HTTP facade listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "all_connected": state.supervisor.all_connected(),
    }))
}

fn device_views(supervisor: &Supervisor) -> BTreeMap<String, DeviceView> {
    let records = supervisor.snapshots();
    supervisor
        .registry()
        .iter()
        .filter_map(|device| {
            let record = records.get(&device.id)?;
            let state = supervisor
                .connection_state(&device.id)
                .unwrap_or(ConnectionState::Disconnected);
            Some((device.id.clone(), DeviceView::new(device, state, record)))
        })
        .collect()
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "devices": device_views(&state.supervisor),
        "global_status": state.supervisor.all_connected(),
    }))
}

async fn device_data(State(state): State<AppState>) -> Json<serde_json::Value> {
    let soc = state
        .supervisor
        .registry()
        .first_of_kind(DeviceKind::Bms)
        .and_then(|device| state.supervisor.snapshot(&device.id).ok())
        .and_then(|record| record.snapshot.as_bms().map(|bms| bms.soc))
        .unwrap_or(0.0);

    Json(json!({
        "devices": device_views(&state.supervisor),
        "connections": energy_links(soc),
    }))
}

async fn control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> (StatusCode, Json<ControlResponse>) {
    let supervisor = Arc::clone(&state.supervisor);
    let ControlRequest {
        device,
        action,
        timeout_ms,
    } = request;

    let task = {
        let device = device.clone();
        let action = action.clone();
        tokio::spawn(async move {
            let deadline = timeout_ms.map(|ms| deadline_after(Duration::from_millis(ms)));
            supervisor
                .submit_command_with_deadline(&device, &action, deadline)
                .await
        })
    };

    match task.await {
        Ok(Ok(result)) if result.succeeded => (
            StatusCode::OK,
            Json(ControlResponse {
                success: true,
                message: Some(result.describe()),
                error: None,
                result: Some(result),
            }),
        ),
        Ok(Ok(result)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ControlResponse {
                success: false,
                message: None,
                error: Some(result.describe()),
                result: Some(result),
            }),
        ),
        Ok(Err(e)) => {
            let message = format!("Error executing action {} on {}: {}", action, device, e);
            error!("{}", message);
            state.supervisor.activity().record(&message).await;

            let status = if e.is_configuration() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(ControlResponse::rejected(e.to_string())))
        }
        Err(e) => {
            error!("Command task for {} on {} failed: {}", action, device, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ControlResponse::rejected(e.to_string())),
            )
        }
    }
}

/// Newest first, as a bare array
async fn logs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.supervisor.activity().entries().await)
}

async fn effective_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.as_ref().clone())
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}
