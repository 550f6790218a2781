use axum::body::Bytes;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::{self, Principal};
use crate::directory::{DirectoryError, MachineFilter, NewMachine};
use crate::error::{internal_error, AppError, AppResult, ErrorDetail};
use crate::routes::{cached, guarded, parse_body, validation_failed};
use crate::services::batch_ingest::{BatchOutcome, BatchReport};
use crate::services::query::{MachineData, MachineSummary, QueryError};
use crate::state::AppState;
use crate::telemetry::{validate_batch, RawIngestBatch};

const MACHINE_DATA_TTL: Duration = Duration::from_secs(30);
const MACHINES_LIST_TTL: Duration = Duration::from_secs(60);

async fn ingest_batch(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> AppResult<Response> {
    let raw: RawIngestBatch = parse_body(&body)?;
    let batch = validate_batch(&raw).map_err(|errors| {
        validation_failed(errors.into_iter().map(ErrorDetail::from).collect())
    })?;
    tracing::debug!(
        subject = %principal.subject,
        gateway_id = %batch.gateway_id,
        groups = batch.groups.len(),
        "ingest batch accepted"
    );

    let report = state.batch.process(&batch).await;
    Ok(batch_response(&report))
}

fn batch_response(report: &BatchReport) -> Response {
    let summary = json!({
        "total_machines": report.total_machines,
        "total_readings": report.total_written,
        "processed_at": report.processed_at,
        "gateway_id": report.gateway_id,
    });
    let outcome = report.outcome();
    let body = match outcome {
        BatchOutcome::Failed => json!({
            "status": "error",
            "message": "Batch ingestion failed",
            "errors": report.errors,
        }),
        BatchOutcome::StorageFailure => json!({
            "status": "error",
            "message": "Batch ingestion failed - No readings could be written to database",
            "details": report.details,
        }),
        BatchOutcome::PartialSuccess => json!({
            "status": "partial_success",
            "message": "Batch ingestion completed with errors",
            "summary": summary,
            "details": report.details,
            "errors": report.errors,
        }),
        BatchOutcome::Success => json!({
            "status": "success",
            "message": "Batch ingestion completed",
            "summary": summary,
            "details": report.details,
        }),
    };
    (outcome.status_code(), Json(body)).into_response()
}

async fn machine_data(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    RawQuery(query): RawQuery,
) -> AppResult<Json<MachineData>> {
    let id = Uuid::parse_str(&machine_id).map_err(|_| {
        AppError::bad_request("Invalid machine ID format").with("machine_id", &machine_id)
    })?;

    match state.query.run(id, query.as_deref(), Utc::now()).await {
        Ok(data) => Ok(Json(data)),
        Err(QueryError::MachineNotFound(id)) => {
            Err(AppError::not_found("Machine not found").with("machine_id", id))
        }
        Err(QueryError::InvalidParameters(errors)) => {
            Err(AppError::bad_request("Invalid query parameters").with("errors", errors))
        }
        Err(QueryError::Directory(err)) => {
            tracing::error!(%id, error = %err, "machine lookup failed");
            Err(AppError::unavailable("Machine directory unavailable"))
        }
        Err(QueryError::Store(err)) => {
            tracing::error!(%id, error = %err, "time-series query failed");
            Err(AppError::unavailable("Time-series store unavailable"))
        }
    }
}

async fn create_machine(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> AppResult<Response> {
    let machine: NewMachine = parse_body(&body)?;
    let status = machine.validate().map_err(validation_failed)?;

    let created = match state.directory.create(&machine, status).await {
        Ok(created) => created,
        Err(DirectoryError::Duplicate(name)) => {
            return Err(AppError::conflict(format!(
                "Machine with name {name} already exists"
            )));
        }
        Err(err) => return Err(internal_error(err)),
    };
    tracing::info!(
        machine_id = %created.id,
        name = %created.name,
        subject = %principal.subject,
        "machine created"
    );
    state
        .response_cache
        .invalidate("cache:machines_list:*")
        .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": "Machine created successfully",
            "machine_id": created.id,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListMachinesQuery {
    location: Option<String>,
    status: Option<String>,
    sensor_type: Option<String>,
}

impl From<ListMachinesQuery> for MachineFilter {
    fn from(query: ListMachinesQuery) -> Self {
        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        MachineFilter {
            location: non_empty(query.location),
            status: non_empty(query.status),
            sensor_type: non_empty(query.sensor_type),
        }
    }
}

#[derive(Debug, Serialize)]
struct MachineList {
    status: &'static str,
    count: usize,
    machines: Vec<MachineSummary>,
}

async fn list_machines(
    State(state): State<AppState>,
    Query(query): Query<ListMachinesQuery>,
) -> AppResult<Json<MachineList>> {
    let machines = state
        .directory
        .list(&MachineFilter::from(query))
        .await
        .map_err(internal_error)?;
    let machines: Vec<MachineSummary> = machines.iter().map(MachineSummary::from).collect();
    Ok(Json(MachineList {
        status: "success",
        count: machines.len(),
        machines,
    }))
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/data/ingest",
            guarded(state, auth::WRITE_SENSOR_DATA, post(ingest_batch)),
        )
        .route(
            "/api/v1/data/machine/{machine_id}",
            guarded(
                state,
                auth::READ_SENSOR_DATA,
                cached(state, "machine_data", MACHINE_DATA_TTL, get(machine_data)),
            ),
        )
        .route(
            "/api/v1/data/machine",
            guarded(state, auth::WRITE_MACHINES, post(create_machine)),
        )
        .route(
            "/api/v1/data/machines",
            guarded(
                state,
                auth::READ_MACHINES,
                cached(state, "machines_list", MACHINES_LIST_TTL, get(list_machines)),
            ),
        )
}
