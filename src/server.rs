//! HTTP boundary: `GET /health` and `POST /predict`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{IftError, Result};
use crate::service::{Prediction, PredictionService};

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// Builds the router over a loaded service.
pub fn router(service: Arc<PredictionService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .with_state(service)
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn serve(service: Arc<PredictionService>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| IftError::io(err, None))?;
    info!("dephy-ift listening on http://{addr}");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| IftError::io(err, None))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
        return;
    }
    info!("shutdown signal received");
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn predict(
    State(service): State<Arc<PredictionService>>,
    Json(body): Json<Value>,
) -> std::result::Result<Json<Prediction>, ApiError> {
    service.predict_json(body).map(Json).map_err(into_api_error)
}

fn into_api_error(err: IftError) -> ApiError {
    let status = if err.is_client_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        error!("prediction failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}
