//! Historical retrieval: parameter validation, range query, wide-row
//! assembly and pagination.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::form_urlencoded;
use uuid::Uuid;

use crate::directory::MachineDirectoryEntry;
use crate::services::resolver::{MachineResolver, ResolveError};
use crate::telemetry::{parse_timestamp, SensorField};
use crate::tsdb::{AggregateWindow, FieldRecord, RangeQuery, StoreError, TimeSeriesStore};

pub const DEFAULT_LIMIT: usize = 1000;
pub const MAX_LIMIT: usize = 10_000;
const INTERVALS: [&str; 5] = ["raw", "1m", "5m", "1h", "1d"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterError {
    pub parameter: &'static str,
    pub error: String,
    pub value: Option<String>,
}

impl ParameterError {
    fn new(parameter: &'static str, error: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            parameter,
            error: error.into(),
            value: value.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window: Option<AggregateWindow>,
    pub fields: Vec<SensorField>,
    pub limit: usize,
    pub offset: usize,
}

impl QueryParams {
    pub fn interval(&self) -> &'static str {
        self.window.map(AggregateWindow::as_str).unwrap_or("raw")
    }

    /// Validates every parameter and reports all problems at once. When a
    /// key repeats, the first occurrence wins. Empty time bounds count as
    /// absent; any other empty value is validated as given.
    pub fn parse(raw_query: Option<&str>, now: DateTime<Utc>) -> Result<Self, Vec<ParameterError>> {
        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in form_urlencoded::parse(raw_query.unwrap_or("").as_bytes()) {
            params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
        let given = |key: &str| params.get(key).map(String::as_str);
        let get = |key: &str| given(key).filter(|v| !v.is_empty());

        let mut errors = Vec::new();

        let start = match get("start_time") {
            None => {
                errors.push(ParameterError::new(
                    "start_time",
                    "Required parameter missing",
                    None,
                ));
                None
            }
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    errors.push(ParameterError::new(
                        "start_time",
                        "Invalid ISO 8601 format",
                        Some(raw),
                    ));
                }
                parsed
            }
        };

        let end = match get("end_time") {
            None => Some(now),
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    errors.push(ParameterError::new(
                        "end_time",
                        "Invalid ISO 8601 format",
                        Some(raw),
                    ));
                }
                parsed
            }
        };
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                errors.push(ParameterError::new(
                    "end_time",
                    "end_time must be after start_time",
                    Some(end.to_rfc3339().as_str()),
                ));
            }
        }

        let interval = given("interval").unwrap_or("raw");
        let window = match interval {
            "raw" => None,
            other => {
                let window = AggregateWindow::parse(other);
                if window.is_none() {
                    errors.push(ParameterError::new(
                        "interval",
                        format!(
                            "Invalid interval value. Must be one of: {}",
                            INTERVALS.join(", ")
                        ),
                        Some(other),
                    ));
                }
                window
            }
        };

        let fields_raw = given("fields").unwrap_or("all");
        let mut fields = Vec::new();
        if fields_raw == "all" {
            fields.extend(SensorField::ALL);
        } else {
            let mut invalid = Vec::new();
            for name in fields_raw.split(',').map(str::trim) {
                match SensorField::parse(name) {
                    Some(field) if !fields.contains(&field) => fields.push(field),
                    Some(_) => {}
                    None => invalid.push(name),
                }
            }
            if !invalid.is_empty() {
                errors.push(ParameterError::new(
                    "fields",
                    format!(
                        "Invalid fields: {}. Must be one of: temperature, pressure, speed",
                        invalid.join(", ")
                    ),
                    Some(fields_raw),
                ));
            }
        }

        let limit = match given("limit") {
            None => DEFAULT_LIMIT,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(value) if (1..=MAX_LIMIT as i64).contains(&value) => value as usize,
                Ok(_) => {
                    errors.push(ParameterError::new(
                        "limit",
                        format!("Limit must be between 1 and {MAX_LIMIT}"),
                        Some(raw),
                    ));
                    DEFAULT_LIMIT
                }
                Err(_) => {
                    errors.push(ParameterError::new("limit", "Limit must be an integer", Some(raw)));
                    DEFAULT_LIMIT
                }
            },
        };

        let offset = match given("offset") {
            None => 0,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(value) if value >= 0 => value as usize,
                Ok(_) => {
                    errors.push(ParameterError::new(
                        "offset",
                        "Offset must be non-negative",
                        Some(raw),
                    ));
                    0
                }
                Err(_) => {
                    errors.push(ParameterError::new("offset", "Offset must be an integer", Some(raw)));
                    0
                }
            },
        };

        match (start, end) {
            (Some(start), Some(end)) if errors.is_empty() => Ok(Self {
                start,
                end,
                window,
                fields,
                limit,
                offset,
            }),
            _ => Err(errors),
        }
    }
}

/// One timestamp with every requested field present at that instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataRow {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: BTreeMap<&'static str, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total_records: usize,
    pub returned_records: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Filters to `fields`, pivots into rows keyed by timestamp, sorts
/// ascending and slices `[offset, offset + limit)`.
pub fn assemble(
    records: Vec<FieldRecord>,
    fields: &[SensorField],
    limit: usize,
    offset: usize,
) -> (Vec<DataRow>, Pagination) {
    let mut rows: BTreeMap<DateTime<Utc>, BTreeMap<&'static str, f64>> = BTreeMap::new();
    for record in records.into_iter().filter(|r| fields.contains(&r.field)) {
        rows.entry(record.time)
            .or_default()
            .insert(record.field.as_str(), record.value);
    }

    let total_records = rows.len();
    let data: Vec<DataRow> = rows
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|(timestamp, values)| DataRow { timestamp, values })
        .collect();

    let pagination = Pagination {
        total_records,
        returned_records: data.len(),
        limit,
        offset,
        has_more: offset.saturating_add(limit) < total_records,
    };
    (data, pagination)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSummary {
    pub machine_id: Uuid,
    pub name: String,
    pub location: String,
    pub sensor_type: String,
}

impl From<&MachineDirectoryEntry> for MachineSummary {
    fn from(entry: &MachineDirectoryEntry) -> Self {
        Self {
            machine_id: entry.id,
            name: entry.name.clone(),
            location: entry.location.clone(),
            sensor_type: entry.sensor_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEcho {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval: &'static str,
    pub fields: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineData {
    pub status: &'static str,
    pub machine: MachineSummary,
    pub query: QueryEcho,
    pub data: Vec<DataRow>,
    pub pagination: Pagination,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("machine {0} not found")]
    MachineNotFound(Uuid),

    #[error("invalid query parameters")]
    InvalidParameters(Vec<ParameterError>),

    #[error(transparent)]
    Directory(ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct QueryEngine {
    resolver: MachineResolver,
    store: Arc<dyn TimeSeriesStore>,
}

impl QueryEngine {
    pub fn new(resolver: MachineResolver, store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { resolver, store }
    }

    /// The machine is resolved before parameters are checked, so an unknown
    /// machine reports 404 even alongside bad parameters.
    pub async fn run(
        &self,
        machine_id: Uuid,
        raw_query: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MachineData, QueryError> {
        let machine = match self.resolver.resolve(machine_id).await {
            Ok(machine) => machine,
            Err(ResolveError::NotFound(id)) => return Err(QueryError::MachineNotFound(id)),
            Err(err) => return Err(QueryError::Directory(err)),
        };
        let params = QueryParams::parse(raw_query, now).map_err(QueryError::InvalidParameters)?;

        let records = self
            .store
            .query_range(&RangeQuery {
                machine_id,
                start: params.start,
                stop: params.end,
                window: params.window,
            })
            .await?;
        let (data, pagination) = assemble(records, &params.fields, params.limit, params.offset);
        tracing::debug!(
            %machine_id,
            interval = params.interval(),
            total = pagination.total_records,
            returned = pagination.returned_records,
            "machine data query"
        );

        Ok(MachineData {
            status: "success",
            machine: MachineSummary::from(&machine),
            query: QueryEcho {
                start_time: params.start,
                end_time: params.end,
                interval: params.interval(),
                fields: params.fields.iter().map(|f| f.as_str()).collect(),
            },
            data,
            pagination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{machine_entry, CountingDirectory};
    use crate::tsdb::{MemoryStore, TimeSeriesPoint};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(minute: i64, field: SensorField, value: f64) -> FieldRecord {
        FieldRecord {
            time: now() + Duration::minutes(minute),
            field,
            value,
        }
    }

    #[test]
    fn defaults_apply_when_only_start_is_given() {
        let params = QueryParams::parse(Some("start_time=2025-06-01T00:00:00Z"), now()).unwrap();
        assert_eq!(params.end, now());
        assert_eq!(params.window, None);
        assert_eq!(params.fields, SensorField::ALL.to_vec());
        assert_eq!((params.limit, params.offset), (DEFAULT_LIMIT, 0));
        assert_eq!(params.interval(), "raw");
    }

    #[test]
    fn every_bad_parameter_is_reported() {
        let errors = QueryParams::parse(
            Some("interval=2h&fields=temperature,humidity&limit=0&offset=-1"),
            now(),
        )
        .unwrap_err();
        let names: Vec<_> = errors.iter().map(|e| e.parameter).collect();
        assert_eq!(names, vec!["start_time", "interval", "fields", "limit", "offset"]);
        assert!(errors[2].error.contains("humidity"));
    }

    #[test]
    fn non_numeric_and_reversed_range_are_rejected() {
        let errors = QueryParams::parse(
            Some("start_time=2025-06-01T10:00:00Z&end_time=2025-06-01T09:00:00Z&limit=ten"),
            now(),
        )
        .unwrap_err();
        assert_eq!(errors[0].parameter, "end_time");
        assert_eq!(errors[1].parameter, "limit");
        assert_eq!(errors[1].error, "Limit must be an integer");
    }

    #[test]
    fn empty_values_are_validated_except_time_bounds() {
        let params = QueryParams::parse(
            Some("start_time=2025-06-01T00:00:00Z&end_time="),
            now(),
        )
        .unwrap();
        assert_eq!(params.end, now());

        let errors = QueryParams::parse(
            Some("start_time=&interval=&fields=&limit=&offset="),
            now(),
        )
        .unwrap_err();
        let names: Vec<_> = errors.iter().map(|e| e.parameter).collect();
        assert_eq!(names, vec!["start_time", "interval", "fields", "limit", "offset"]);
        assert_eq!(errors[0].error, "Required parameter missing");
        assert_eq!(errors[1].value.as_deref(), Some(""));
    }

    #[test]
    fn first_occurrence_of_repeated_key_wins() {
        let params = QueryParams::parse(
            Some("start_time=2025-06-01T00:00:00Z&limit=5&limit=abc"),
            now(),
        )
        .unwrap();
        assert_eq!(params.limit, 5);
    }

    #[test]
    fn assemble_pivots_sorts_and_filters() {
        let records = vec![
            record(10, SensorField::Temperature, 21.0),
            record(0, SensorField::Temperature, 20.0),
            record(0, SensorField::Pressure, 101.0),
            record(0, SensorField::Speed, 900.0),
        ];
        let (rows, page) = assemble(
            records,
            &[SensorField::Temperature, SensorField::Pressure],
            10,
            0,
        );
        assert_eq!(page.total_records, 2);
        assert_eq!(rows[0].timestamp, now());
        assert_eq!(rows[0].values.len(), 2);
        assert!(!rows[0].values.contains_key("speed"));
        assert_eq!(rows[1].values["temperature"], 21.0);

        let json = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(json["timestamp"], "2025-06-01T12:00:00Z");
        assert_eq!(json["pressure"], 101.0);
    }

    #[test]
    fn pagination_bounds_hold() {
        let records: Vec<_> = (0..25)
            .map(|m| record(m, SensorField::Speed, m as f64))
            .collect();
        for (limit, offset) in [(10, 0), (10, 20), (10, 15), (5, 25), (3, 100)] {
            let (rows, page) = assemble(records.clone(), &SensorField::ALL, limit, offset);
            assert!(page.returned_records <= limit);
            assert_eq!(page.returned_records, rows.len());
            assert_eq!(page.has_more, offset + limit < page.total_records);
        }
        let (rows, page) = assemble(records, &SensorField::ALL, 10, 100);
        assert!(rows.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn hourly_interval_over_two_hours_has_at_most_two_rows() {
        let machine = machine_entry("Press", "Floor 1");
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        for step in 0..12 {
            store
                .write_point(&TimeSeriesPoint {
                    machine_id: machine.id,
                    sensor_type: "Temperature".to_string(),
                    location: "Floor 1".to_string(),
                    timestamp: start + Duration::minutes(10 * step),
                    fields: vec![(SensorField::Temperature, 70.0 + step as f64)],
                })
                .await
                .unwrap();
        }
        let resolver = MachineResolver::new(
            Arc::new(CountingDirectory::with(vec![machine.clone()])),
            None,
            std::time::Duration::from_secs(60),
        );
        let engine = QueryEngine::new(resolver, Arc::new(store));

        let raw = Some("start_time=2025-06-01T08:00:00Z&end_time=2025-06-01T10:00:00Z&interval=1h");
        let result = engine.run(machine.id, raw, now()).await.unwrap();
        assert!(result.data.len() <= 2);
        assert_eq!(result.query.interval, "1h");
        assert_eq!(result.machine.name, "Press");

        let raw_rows = engine
            .run(
                machine.id,
                Some("start_time=2025-06-01T08:00:00Z&end_time=2025-06-01T10:00:00Z&limit=5"),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(raw_rows.pagination.total_records, 12);
        assert!(raw_rows.pagination.has_more);
    }

    #[tokio::test]
    async fn unknown_machine_wins_over_bad_parameters() {
        let resolver = MachineResolver::new(
            Arc::new(CountingDirectory::with(vec![])),
            None,
            std::time::Duration::from_secs(60),
        );
        let engine = QueryEngine::new(resolver, Arc::new(MemoryStore::new()));
        let err = engine.run(Uuid::new_v4(), Some("limit=0"), now()).await.unwrap_err();
        assert!(matches!(err, QueryError::MachineNotFound(_)));
    }
}
