//! Route handlers. Each one is a thin shim over a `Dispatcher` call.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::dispatch::WorkerSession;
use crate::error::Error;
use crate::model::{AckRequest, ConnectParams, Evidence, Job, JobId, ModuleRun, PushJobRequest};

pub(super) async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.dispatcher.health_check().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Open a worker's job stream: newline-delimited JSON descriptors.
pub(super) async fn job_stream(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    query: Result<Query<ConnectParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = query?;
    let lines = state
        .dispatcher
        .connect(params, remote.to_string())
        .await?
        .map(Ok::<_, Infallible>);

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

pub(super) async fn ack(
    State(state): State<AppState>,
    body: Result<Json<AckRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(ack) = body?;
    let applied = state.dispatcher.ack(ack).await?;
    Ok(Json(json!({ "applied": applied })))
}

pub(super) async fn workers(State(state): State<AppState>) -> Json<Vec<WorkerSession>> {
    Json(state.dispatcher.workers().await)
}

pub(super) async fn push_job(
    State(state): State<AppState>,
    body: Result<Json<PushJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let Json(request) = body?;
    let job = state.dispatcher.push_job(request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.dispatcher.get_job(&JobId(id)).await?))
}

pub(super) async fn runnable_modules(
    State(state): State<AppState>,
    Path((case_id, evidence_id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<ModuleRun>>> {
    Ok(Json(
        state
            .dispatcher
            .runnable_modules(&case_id, &evidence_id)
            .await?,
    ))
}

pub(super) async fn evidence_jobs(
    State(state): State<AppState>,
    Path((case_id, evidence_id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(
        state
            .dispatcher
            .evidence_jobs(&case_id, &evidence_id)
            .await?,
    ))
}

pub(super) async fn register_evidence(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    body: Result<Json<Evidence>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(evidence) = body?;
    if evidence.case_id != case_id {
        return Err(ApiError::Core(Error::Validation(format!(
            "evidence belongs to case {:?}, not {case_id:?}",
            evidence.case_id
        ))));
    }
    let jobs = state.dispatcher.register_evidence(evidence.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "evidence": evidence, "jobs": jobs })),
    ))
}
