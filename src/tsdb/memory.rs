use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{FieldRecord, RangeQuery, StoreError, TimeSeriesPoint, TimeSeriesStore};
use crate::telemetry::SensorField;

/// In-process store used for local runs and tests. Windowed queries follow
/// the same shape as Flux `aggregateWindow`: epoch-aligned windows, mean per
/// field, each row stamped with its window's stop (clamped to the range stop).
#[derive(Clone, Default)]
pub struct MemoryStore {
    points: Arc<Mutex<Vec<TimeSeriesPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|points| points.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> Vec<TimeSeriesPoint> {
        self.points
            .lock()
            .map(|points| points.clone())
            .unwrap_or_default()
    }
}

fn window_start(ts: DateTime<Utc>, width_ms: i64) -> i64 {
    ts.timestamp_millis().div_euclid(width_ms) * width_ms
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_point(&self, point: &TimeSeriesPoint) -> Result<(), StoreError> {
        if point.fields.is_empty() {
            return Err(StoreError::InvalidPoint("point has no fields".to_string()));
        }
        let mut points = self
            .points
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        points.push(point.clone());
        Ok(())
    }

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<FieldRecord>, StoreError> {
        let points = self
            .points
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;

        let in_range = points.iter().filter(|point| {
            point.machine_id == query.machine_id
                && point.timestamp >= query.start
                && point.timestamp < query.stop
        });

        let Some(window) = query.window else {
            let mut records: Vec<FieldRecord> = in_range
                .flat_map(|point| {
                    point.fields.iter().map(|(field, value)| FieldRecord {
                        time: point.timestamp,
                        field: *field,
                        value: *value,
                    })
                })
                .collect();
            records.sort_by(|a, b| a.field.cmp(&b.field).then(a.time.cmp(&b.time)));
            return Ok(records);
        };

        let width_ms = window.duration().num_milliseconds();
        let mut sums: BTreeMap<(SensorField, i64), (f64, u32)> = BTreeMap::new();
        for point in in_range {
            let bucket = window_start(point.timestamp, width_ms);
            for (field, value) in &point.fields {
                let slot = sums.entry((*field, bucket)).or_insert((0.0, 0));
                slot.0 += value;
                slot.1 += 1;
            }
        }

        let mut records = Vec::with_capacity(sums.len());
        for ((field, bucket), (sum, count)) in sums {
            let stop = DateTime::<Utc>::from_timestamp_millis(bucket + width_ms)
                .ok_or_else(|| StoreError::Decode(format!("window {bucket} out of range")))?;
            records.push(FieldRecord {
                time: stop.min(query.stop),
                field,
                value: sum / f64::from(count),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::AggregateWindow;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn point(machine_id: Uuid, at: DateTime<Utc>, temperature: f64) -> TimeSeriesPoint {
        TimeSeriesPoint {
            machine_id,
            sensor_type: "Temperature".to_string(),
            location: "Line 1".to_string(),
            timestamp: at,
            fields: vec![(SensorField::Temperature, temperature)],
        }
    }

    #[tokio::test]
    async fn raw_range_is_half_open_and_scoped_to_machine() {
        let store = MemoryStore::new();
        let machine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let stop = start + Duration::hours(1);

        store.write_point(&point(machine, start, 20.0)).await.unwrap();
        store.write_point(&point(machine, stop, 21.0)).await.unwrap();
        store
            .write_point(&point(other, start + Duration::minutes(5), 22.0))
            .await
            .unwrap();

        let records = store
            .query_range(&RangeQuery {
                machine_id: machine,
                start,
                stop,
                window: None,
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, start);
    }

    #[tokio::test]
    async fn hourly_window_over_two_hours_yields_two_means() {
        let store = MemoryStore::new();
        let machine = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        for step in 0..12 {
            let at = start + Duration::minutes(10 * step);
            store
                .write_point(&point(machine, at, step as f64))
                .await
                .unwrap();
        }

        let records = store
            .query_range(&RangeQuery {
                machine_id: machine,
                start,
                stop: start + Duration::hours(2),
                window: Some(AggregateWindow::OneHour),
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, start + Duration::hours(1));
        assert_eq!(records[0].value, 2.5);
        assert_eq!(records[1].value, 8.5);
    }

    #[tokio::test]
    async fn rejects_points_without_fields() {
        let store = MemoryStore::new();
        let mut empty = point(Uuid::new_v4(), Utc::now(), 1.0);
        empty.fields.clear();
        assert!(matches!(
            store.write_point(&empty).await,
            Err(StoreError::InvalidPoint(_))
        ));
        assert!(store.is_empty());
    }
}
