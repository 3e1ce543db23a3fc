use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use crate::domain::firewall::FirewallSummary;
use crate::domain::mesh::ConnectivityMatrix;
use crate::domain::mesh_service::MeshService;
use crate::domain::node::Node;
use crate::domain::rules::FirewallRule;
use crate::domain::types::*;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub mesh: Arc<MeshService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/nodes", get(nodes))
        // Mesh verification
        .route("/api/v1/mesh/matrix", get(matrix))
        .route("/api/v1/mesh/results", get(mesh_results))
        .route("/api/v1/mesh/verify", post(verify_mesh))
        // Firewall configuration
        .route("/api/v1/firewall/results", get(firewall_results))
        .route("/api/v1/firewall/summary", get(firewall_summary))
        .route("/api/v1/firewall/apply", post(apply_firewall))
        .route("/api/v1/firewall/rules/{node}", get(firewall_rules))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<DaemonHealth> {
    Json(state.mesh.health().await)
}

async fn nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.mesh.nodes())
}

async fn matrix(State(state): State<AppState>) -> Json<ConnectivityMatrix> {
    Json(state.mesh.matrix().await)
}

async fn mesh_results(State(state): State<AppState>) -> Json<Vec<ConnectivityResult>> {
    Json(state.mesh.connectivity().await)
}

async fn verify_mesh(State(state): State<AppState>) -> (StatusCode, Json<RunOutcome>) {
    let outcome = state.mesh.verify_mesh().await;
    (run_status(&outcome), Json(outcome))
}

async fn firewall_results(State(state): State<AppState>) -> Json<Vec<FirewallResult>> {
    Json(state.mesh.firewall_results().await)
}

async fn firewall_summary(State(state): State<AppState>) -> Json<FirewallSummary> {
    Json(state.mesh.firewall_summary().await)
}

async fn apply_firewall(State(state): State<AppState>) -> (StatusCode, Json<RunOutcome>) {
    let outcome = state.mesh.configure_firewall().await;
    (run_status(&outcome), Json(outcome))
}

async fn firewall_rules(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> Result<Json<Vec<FirewallRule>>, (StatusCode, String)> {
    state.mesh.rules_for(&node).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("node '{}' is not in the inventory", node),
        )
    })
}

/// Remote failures map to 502, deadline expiry to 504.
fn run_status(outcome: &RunOutcome) -> StatusCode {
    if outcome.success {
        StatusCode::OK
    } else if outcome.timed_out {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    }
}
