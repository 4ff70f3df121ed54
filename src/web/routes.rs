//! HTTP surface for the kiosk UI. Every write enqueues a [`Command`]; the
//! orchestrator applies it in order on its own loop.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use crate::command::{Command, OrchestratorHandle};
use crate::orchestrator::Orchestrator;
use crate::state::{StateSnapshot, Target};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub handle: OrchestratorHandle,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let handle = orchestrator.handle();
        Self {
            orchestrator,
            handle,
        }
    }
}

pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/target", post(select_target))
        .route("/api/home", post(go_home))
        .route("/api/cancel", post(cancel))
        .route("/api/acknowledge", post(acknowledge))
        .route("/api/interaction", post(interaction))
        .route("/api/promotion/start", post(start_promotion))
        .route("/api/promotion/stop", post(stop_promotion))
        .with_state(state)
}

async fn get_state(State(state): State<ApiState>) -> Json<StateSnapshot> {
    Json(state.orchestrator.snapshot())
}

async fn enqueue(state: &ApiState, command: Command) -> Result<StatusCode, (StatusCode, String)> {
    state.handle.send(command).await.map_err(|e| {
        error!("Failed to enqueue command: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    Ok(StatusCode::ACCEPTED)
}

async fn select_target(
    State(state): State<ApiState>,
    Json(target): Json<Target>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!("UI selected target {}", target.name);
    enqueue(&state, Command::SelectTarget(target)).await
}

async fn go_home(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::GoHome).await
}

async fn cancel(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::Cancel).await
}

async fn acknowledge(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::Acknowledge).await
}

async fn interaction(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::UserInteraction).await
}

async fn start_promotion(
    State(state): State<ApiState>,
) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::StartPromotion).await
}

async fn stop_promotion(
    State(state): State<ApiState>,
) -> Result<StatusCode, (StatusCode, String)> {
    enqueue(&state, Command::StopPromotion).await
}
