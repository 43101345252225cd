//! HTTP surface: health check and the job endpoint

pub mod jobs;

use crate::config::Config;
use crate::ingest::TokenProvider;
use crate::middleware;
use crate::storage::Storage;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// Absent when the server runs without object storage
    pub storage: Option<Storage>,
    /// Shared by every job's feature-service client
    pub http: reqwest::Client,
    pub tokens: Arc<TokenProvider>,
    pub config: Arc<Config>,
    /// Cancelled on server shutdown; every job runs under a child token
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/agol2pg", get(jobs::start_job_query).post(jobs::start_job_form))
        .with_state(state)
        .layer(middleware::tracing_layer())
}

async fn health_check(State(state): State<AppState>) -> Result<Response, StatusCode> {
    match sqlx::query("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}
