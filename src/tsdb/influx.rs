//! InfluxDB v2 HTTP adapter: line-protocol writes and Flux range queries.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use super::{FieldRecord, RangeQuery, StoreError, TimeSeriesPoint, TimeSeriesStore};
use crate::telemetry::SensorField;

#[derive(Clone)]
pub struct InfluxStore {
    http: Client,
    base_url: String,
    token: String,
    org: String,
    bucket: String,
    measurement: String,
}

impl InfluxStore {
    pub fn new(
        base_url: &str,
        token: &str,
        org: &str,
        bucket: &str,
        measurement: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            measurement: measurement.to_string(),
        })
    }

    fn line(&self, point: &TimeSeriesPoint) -> Result<String, StoreError> {
        encode_line(&self.measurement, point)
    }

    fn flux(&self, query: &RangeQuery) -> String {
        build_flux(&self.bucket, &self.measurement, query)
    }
}

fn map_transport(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

fn escape_measurement(raw: &str) -> String {
    raw.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(raw: &str) -> String {
    raw.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn flux_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn encode_line(measurement: &str, point: &TimeSeriesPoint) -> Result<String, StoreError> {
    if point.fields.is_empty() {
        return Err(StoreError::InvalidPoint("point has no fields".to_string()));
    }
    let nanos = point.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        StoreError::InvalidPoint(format!("timestamp {} out of range", point.timestamp))
    })?;

    // Tags sorted by key, as the line protocol recommends.
    let mut line = escape_measurement(measurement);
    let machine_id = point.machine_id.to_string();
    let tags = [
        ("location", point.location.as_str()),
        ("machine_id", machine_id.as_str()),
        ("sensor_type", point.sensor_type.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .map(|(key, value)| format!(",{key}={}", escape_tag(value)))
    .collect::<String>();
    line.push_str(&tags);

    let fields = point
        .fields
        .iter()
        .map(|(field, value)| format!("{}={value}", field.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    line.push(' ');
    line.push_str(&fields);
    line.push(' ');
    line.push_str(&nanos.to_string());
    Ok(line)
}

pub(crate) fn build_flux(bucket: &str, measurement: &str, query: &RangeQuery) -> String {
    let mut flux = format!(
        "from(bucket: \"{}\")\n  |> range(start: {}, stop: {})\n  |> filter(fn: (r) => r[\"_measurement\"] == \"{}\")\n  |> filter(fn: (r) => r[\"machine_id\"] == \"{}\")\n",
        flux_string(bucket),
        rfc3339(query.start),
        rfc3339(query.stop),
        flux_string(measurement),
        query.machine_id,
    );
    if let Some(window) = query.window {
        flux.push_str(&format!(
            "  |> aggregateWindow(every: {}, fn: mean, createEmpty: false)\n",
            window.as_str()
        ));
    }
    flux
}

/// Decodes the CSV body of `/api/v2/query`. Each table repeats its own
/// header row; rows without a parsable `_value` (empty windows) are skipped.
pub fn decode_query_csv(body: &str) -> Result<Vec<FieldRecord>, StoreError> {
    struct Columns {
        time: usize,
        value: usize,
        field: usize,
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut columns: Option<Columns> = None;
    let mut error_column: Option<usize> = None;
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row.map_err(|err| StoreError::Decode(err.to_string()))?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        let position = |name: &str| row.iter().position(|cell| cell == name);
        if let (Some(time), Some(value), Some(field)) =
            (position("_time"), position("_value"), position("_field"))
        {
            columns = Some(Columns { time, value, field });
            error_column = None;
            continue;
        }
        if let Some(idx) = position("error") {
            error_column = Some(idx);
            continue;
        }

        if let Some(idx) = error_column {
            let message = row.get(idx).unwrap_or("unknown query error").to_string();
            return Err(StoreError::Rejected {
                status: 200,
                body: message,
            });
        }

        let Some(cols) = columns.as_ref() else {
            continue;
        };
        let (Some(time), Some(value), Some(field)) =
            (row.get(cols.time), row.get(cols.value), row.get(cols.field))
        else {
            continue;
        };
        let Some(field) = SensorField::parse(field) else {
            continue;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            continue;
        };
        let time = DateTime::parse_from_rfc3339(time.trim())
            .map_err(|err| StoreError::Decode(format!("bad _time {time:?}: {err}")))?
            .with_timezone(&Utc);
        records.push(FieldRecord { time, field, value });
    }

    Ok(records)
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_point(&self, point: &TimeSeriesPoint) -> Result<(), StoreError> {
        let line = self.line(point)?;
        let response = self
            .http
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::trace!(machine_id = %point.machine_id, "wrote sensor point");
        Ok(())
    }

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<FieldRecord>, StoreError> {
        let payload = json!({
            "query": self.flux(query),
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
                "dateTimeFormat": "RFC3339Nano",
            },
        });
        let response = self
            .http
            .post(format!("{}/api/v2/query", self.base_url))
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/csv")
            .json(&payload)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let records = decode_query_csv(&body)?;
        tracing::debug!(
            machine_id = %query.machine_id,
            records = records.len(),
            "time-series query returned"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::AggregateWindow;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn line_protocol_escapes_tags_and_uses_nanoseconds() {
        let machine_id = Uuid::parse_str("d1c2084b-f16a-4eea-89d9-4402095d3af5").unwrap();
        let point = TimeSeriesPoint {
            machine_id,
            sensor_type: "Temperature".to_string(),
            location: "Floor 1, Zone=A".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 12, 13, 3, 38, 50).unwrap(),
            fields: vec![(SensorField::Temperature, 72.5), (SensorField::Speed, 1450.0)],
        };
        let line = encode_line("sensor_readings", &point).unwrap();
        assert_eq!(
            line,
            "sensor_readings,location=Floor\\ 1\\,\\ Zone\\=A,machine_id=d1c2084b-f16a-4eea-89d9-4402095d3af5,sensor_type=Temperature temperature=72.5,speed=1450 1765597130000000000"
        );
    }

    #[test]
    fn flux_adds_window_only_when_aggregating() {
        let mut query = RangeQuery {
            machine_id: Uuid::nil(),
            start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            stop: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
            window: None,
        };
        let raw = build_flux("sensor_data", "sensor_readings", &query);
        assert!(raw.contains("range(start: 2025-01-01T00:00:00Z, stop: 2025-01-02T00:00:00Z)"));
        assert!(!raw.contains("aggregateWindow"));

        query.window = Some(AggregateWindow::OneHour);
        let aggregated = build_flux("sensor_data", "sensor_readings", &query);
        assert!(aggregated.contains("aggregateWindow(every: 1h, fn: mean, createEmpty: false)"));
    }

    #[test]
    fn decodes_multiple_tables_and_skips_foreign_fields() {
        let body = "\
,result,table,_start,_stop,_time,_value,_field,_measurement,machine_id
,_result,0,2025-01-01T00:00:00Z,2025-01-02T00:00:00Z,2025-01-01T00:10:00Z,21.5,temperature,sensor_readings,m
,_result,0,2025-01-01T00:00:00Z,2025-01-02T00:00:00Z,2025-01-01T00:20:00Z,22,temperature,sensor_readings,m

,result,table,_start,_stop,_time,_value,_field,_measurement,machine_id
,_result,1,2025-01-01T00:00:00Z,2025-01-02T00:00:00Z,2025-01-01T00:10:00Z,101.3,pressure,sensor_readings,m
,_result,2,2025-01-01T00:00:00Z,2025-01-02T00:00:00Z,2025-01-01T00:10:00Z,3,humidity,sensor_readings,m
";
        let records = decode_query_csv(body).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].field, SensorField::Temperature);
        assert_eq!(records[1].value, 22.0);
        assert_eq!(records[2].field, SensorField::Pressure);
    }

    #[test]
    fn in_band_query_errors_are_surfaced() {
        let body = ",error,reference\n,bucket not found,\n";
        let err = decode_query_csv(body).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
    }
}
