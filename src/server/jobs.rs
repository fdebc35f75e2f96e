//! Job management API under `/scheduler`.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::error::ApiError;
use crate::scheduler::{JobInfo, TIMESTAMP_FORMAT};

#[derive(Debug, Deserialize)]
pub struct CronJobRequest {
    pub id: String,
    pub cron: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct OnceJobRequest {
    pub id: String,
    pub run_at: String,
    pub content: String,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.scheduler.list_jobs())
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobInfo>, ApiError> {
    Ok(Json(state.scheduler.get_job(&id)?))
}

pub async fn add(State(state): State<AppState>, Json(req): Json<CronJobRequest>) -> Result<Json<Value>, ApiError> {
    state.scheduler.add_cron_job(&req.id, &req.cron, &req.content)?;
    Ok(Json(json!({ "status": "ok", "id": req.id })))
}

pub async fn add_once(
    State(state): State<AppState>,
    Json(req): Json<OnceJobRequest>,
) -> Result<Json<Value>, ApiError> {
    let run_at = state.scheduler.add_once_job(&req.id, &req.run_at, &req.content)?;
    Ok(Json(json!({
        "status": "ok",
        "id": req.id,
        "run_at": run_at.format(TIMESTAMP_FORMAT).to_string(),
    })))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.scheduler.remove_job(&id)?;
    Ok(Json(json!({ "status": "ok", "id": id })))
}

pub async fn trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.scheduler.trigger_job(&id)?;
    Ok(Json(json!({ "status": "triggered", "id": id })))
}
