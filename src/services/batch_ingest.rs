//! Gateway batch ingestion: resolve each machine group, write its readings,
//! and classify the whole batch as full, partial or failed.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ErrorDetail;
use crate::services::broadcaster::{Broadcaster, SensorDataEvent};
use crate::services::resolver::{MachineResolver, ResolveError};
use crate::telemetry::{IngestBatch, MachineGroup, SensorReading};
use crate::tsdb::{TimeSeriesPoint, TimeSeriesStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupDetail {
    pub machine_id: Uuid,
    pub readings_count: usize,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    PartialSuccess,
    Failed,
    /// Nothing written and no group errors: every write failed downstream.
    StorageFailure,
}

impl BatchOutcome {
    pub fn status_code(self) -> StatusCode {
        match self {
            BatchOutcome::Success => StatusCode::CREATED,
            BatchOutcome::PartialSuccess => StatusCode::MULTI_STATUS,
            BatchOutcome::Failed => StatusCode::BAD_REQUEST,
            BatchOutcome::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub gateway_id: String,
    pub total_machines: usize,
    pub total_requested: usize,
    pub total_written: usize,
    pub details: Vec<GroupDetail>,
    pub errors: Vec<ErrorDetail>,
    pub processed_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn outcome(&self) -> BatchOutcome {
        if !self.errors.is_empty() && self.total_written == 0 {
            BatchOutcome::Failed
        } else if !self.errors.is_empty() || self.total_written < self.total_requested {
            if self.errors.is_empty() && self.total_written == 0 {
                BatchOutcome::StorageFailure
            } else {
                BatchOutcome::PartialSuccess
            }
        } else {
            BatchOutcome::Success
        }
    }
}

struct GroupResult {
    detail: GroupDetail,
    error: Option<ErrorDetail>,
}

#[derive(Clone)]
pub struct BatchProcessor {
    resolver: MachineResolver,
    store: Arc<dyn TimeSeriesStore>,
    broadcaster: Broadcaster,
    concurrency: usize,
}

impl BatchProcessor {
    pub fn new(
        resolver: MachineResolver,
        store: Arc<dyn TimeSeriesStore>,
        broadcaster: Broadcaster,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver,
            store,
            broadcaster,
            concurrency: concurrency.max(1),
        }
    }

    /// Groups run concurrently but `details` keeps request order. One
    /// group's failure never stops the others.
    pub async fn process(&self, batch: &IngestBatch) -> BatchReport {
        let results: Vec<GroupResult> = stream::iter(batch.groups.iter().cloned().enumerate())
            .map(|(idx, group)| {
                let this = self.clone();
                async move { this.process_group(idx, group).await }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut details = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        let mut total_written = 0;
        for result in results {
            total_written += result.detail.readings_count;
            details.push(result.detail);
            errors.extend(result.error);
        }

        let report = BatchReport {
            gateway_id: batch.gateway_id.clone(),
            total_machines: batch.groups.len(),
            total_requested: batch.total_readings(),
            total_written,
            details,
            errors,
            processed_at: Utc::now(),
        };
        tracing::info!(
            gateway_id = %report.gateway_id,
            machines = report.total_machines,
            requested = report.total_requested,
            written = report.total_written,
            errors = report.errors.len(),
            "processed ingest batch"
        );
        report
    }

    async fn process_group(&self, idx: usize, group: MachineGroup) -> GroupResult {
        let machine_id = group.machine_id;
        let failed = |error: ErrorDetail| GroupResult {
            detail: GroupDetail {
                machine_id,
                readings_count: 0,
                status: GroupStatus::Failed,
            },
            error: Some(error),
        };

        match self.resolver.resolve(machine_id).await {
            Ok(_) => {}
            Err(ResolveError::NotFound(_)) => {
                tracing::warn!(%machine_id, idx, "batch references unknown machine");
                return failed(ErrorDetail::new(
                    format!("batch[{idx}].machine_id"),
                    "Machine ID not found in database",
                    Some(machine_id.to_string()),
                ));
            }
            Err(ResolveError::Unavailable(err)) => {
                tracing::error!(%machine_id, idx, error = %err, "machine lookup failed");
                return failed(ErrorDetail::new(
                    format!("batch[{idx}]"),
                    "Machine directory unavailable",
                    None,
                ));
            }
        }

        let group = Arc::new(group);
        let written: usize = stream::iter(group.readings.clone())
            .map(|reading| {
                let this = self.clone();
                let group = Arc::clone(&group);
                async move { this.write_reading(&group, &reading).await }
            })
            .buffer_unordered(self.concurrency)
            .fold(0, |written, ok| futures::future::ready(written + usize::from(ok)))
            .await;

        GroupResult {
            detail: GroupDetail {
                machine_id,
                readings_count: written,
                status: if written > 0 {
                    GroupStatus::Success
                } else {
                    GroupStatus::Failed
                },
            },
            error: None,
        }
    }

    async fn write_reading(&self, group: &MachineGroup, reading: &SensorReading) -> bool {
        let point =
            TimeSeriesPoint::from_reading(group.machine_id, &group.sensor_type, &group.location, reading);
        match self.store.write_point(&point).await {
            Ok(()) => {
                self.broadcaster.broadcast(SensorDataEvent {
                    machine_id: group.machine_id,
                    sensor_type: group.sensor_type.clone(),
                    location: group.location.clone(),
                    timestamp: reading.timestamp,
                    temperature: reading.temperature,
                    pressure: reading.pressure,
                    speed: reading.speed,
                });
                true
            }
            Err(err) => {
                tracing::error!(
                    machine_id = %group.machine_id,
                    timestamp = %reading.timestamp,
                    error = %err,
                    "failed to write reading"
                );
                false
            }
        }
    }
}
