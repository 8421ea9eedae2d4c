//! HTTP route definitions.
//!
//! ```text
//! GET    /api/stats                    - Per-state counts, queue lengths
//! GET    /api/jobs?state=&queue=&page=&per_page=
//! POST   /api/jobs                     - Submit a job
//! GET    /api/jobs/{id}                - Job with state history
//! POST   /api/jobs/{id}/requeue        - Re-enqueue a failed or scheduled job
//! DELETE /api/jobs/{id}                - Delete a job
//! GET    /api/queues                   - Ready length per queue
//! GET    /api/recurring                - Recurring entries
//! POST   /api/recurring/{id}/trigger   - Enqueue a recurring entry now
//! DELETE /api/recurring/{id}           - Remove a recurring entry
//! GET    /livez                        - Liveness probe
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use jobmill_protocols::{JobId, Page, StateName};

use crate::dashboard::{Dashboard, SubmitRequest};
use crate::error::DashboardError;

type ApiResult = Result<(StatusCode, Json<serde_json::Value>), DashboardError>;

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
    pub queue: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

pub fn create_router(dashboard: Arc<Dashboard>) -> Router {
    let api = Router::new()
        .route("/stats", get(stats))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/requeue", post(requeue_job))
        .route("/queues", get(list_queues))
        .route("/recurring", get(list_recurring))
        .route("/recurring/{id}", axum::routing::delete(remove_recurring))
        .route("/recurring/{id}/trigger", post(trigger_recurring))
        .with_state(dashboard);

    Router::new()
        .nest("/api", api)
        .route("/livez", get(liveness_probe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn parse_id(id: &str) -> Result<JobId, DashboardError> {
    id.parse()
        .map_err(|_| DashboardError::BadRequest(format!("invalid job id: {}", id)))
}

fn ok(value: impl serde::Serialize) -> ApiResult {
    let body = serde_json::to_value(value).map_err(|e| DashboardError::Internal(e.to_string()))?;
    Ok((StatusCode::OK, Json(body)))
}

/// GET /api/stats
async fn stats(State(dashboard): State<Arc<Dashboard>>) -> ApiResult {
    ok(dashboard.stats().await?)
}

/// GET /api/jobs
async fn list_jobs(
    State(dashboard): State<Arc<Dashboard>>,
    query: Result<Query<JobsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let state = query
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<StateName>)
        .transpose()
        .map_err(DashboardError::BadRequest)?;
    let default = Page::default();
    let page = Page::new(
        query.page.unwrap_or(default.number),
        query.per_page.unwrap_or(default.per_page),
    );
    ok(dashboard
        .list_jobs(state, query.queue.as_deref(), page)
        .await?)
}

/// POST /api/jobs
async fn submit_job(
    State(dashboard): State<Arc<Dashboard>>,
    request: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = request?;
    let id = dashboard.submit(request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// GET /api/jobs/{id}
async fn get_job(State(dashboard): State<Arc<Dashboard>>, Path(id): Path<String>) -> ApiResult {
    ok(dashboard.get_job(&parse_id(&id)?).await?)
}

/// POST /api/jobs/{id}/requeue
async fn requeue_job(
    State(dashboard): State<Arc<Dashboard>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(dashboard.requeue(&parse_id(&id)?).await?.summary())
}

/// DELETE /api/jobs/{id}
async fn delete_job(
    State(dashboard): State<Arc<Dashboard>>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(dashboard.delete(&parse_id(&id)?).await?.summary())
}

/// GET /api/queues
async fn list_queues(State(dashboard): State<Arc<Dashboard>>) -> ApiResult {
    ok(dashboard.list_queues().await?)
}

/// GET /api/recurring
async fn list_recurring(State(dashboard): State<Arc<Dashboard>>) -> ApiResult {
    ok(dashboard.list_recurring().await?)
}

/// POST /api/recurring/{id}/trigger
async fn trigger_recurring(
    State(dashboard): State<Arc<Dashboard>>,
    Path(id): Path<String>,
) -> ApiResult {
    let job = dashboard.trigger_recurring(&id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": job }))))
}

/// DELETE /api/recurring/{id}
async fn remove_recurring(
    State(dashboard): State<Arc<Dashboard>>,
    Path(id): Path<String>,
) -> Result<StatusCode, DashboardError> {
    dashboard.remove_recurring(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /livez
async fn liveness_probe() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod tests;
