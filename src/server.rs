use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::SolverConfig;
use crate::data::{AnalyzeInput, ConflictReport, ScheduleInput, ScheduleOutput};
use crate::error::SchedulerError;
use crate::orchestrator;

type ApiError = (StatusCode, String);

#[derive(Clone)]
struct AppState {
    config: Arc<SolverConfig>,
}

fn status_of(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::Data(_) | SchedulerError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a blocking solver call on tokio's blocking pool and map its errors to HTTP responses.
async fn blocking<T, F>(work: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SchedulerError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(output)) => Ok(Json(output)),
        Ok(Err(e)) => {
            let status = status_of(&e);
            if status.is_server_error() {
                error!("Request failed: {}", e);
            }
            Err((status, e.to_string()))
        }
        Err(e) => {
            error!("Solver task aborted: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "solver task aborted".into()))
        }
    }
}

async fn optimize_handler(
    State(state): State<AppState>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<ScheduleOutput>, ApiError> {
    info!(
        "Optimize request: {} students, {} courses",
        input.students.len(),
        input.courses.len()
    );
    blocking(move || orchestrator::optimize(&input, &state.config)).await
}

async fn analyze_handler(Json(input): Json<AnalyzeInput>) -> Result<Json<ConflictReport>, ApiError> {
    blocking(move || orchestrator::analyze_mapping(&input)).await
}

pub fn router(config: SolverConfig) -> Router {
    let state = AppState {
        config: Arc::new(config),
    };
    Router::new()
        .route("/v1/exams/optimize", post(optimize_handler))
        .route("/v1/exams/analyze", post(analyze_handler))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, config: SolverConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server running at http://{}", listener.local_addr()?);
    axum::serve(listener, router(config)).await
}
