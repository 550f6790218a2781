mod influx;
mod memory;

pub use influx::{decode_query_csv, InfluxStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::telemetry::{SensorField, SensorReading};

/// One appended point: three tags, one to three fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    pub machine_id: Uuid,
    pub sensor_type: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<(SensorField, f64)>,
}

impl TimeSeriesPoint {
    pub fn from_reading(
        machine_id: Uuid,
        sensor_type: &str,
        location: &str,
        reading: &SensorReading,
    ) -> Self {
        Self {
            machine_id,
            sensor_type: sensor_type.to_string(),
            location: location.to_string(),
            timestamp: reading.timestamp,
            fields: reading.values().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateWindow {
    OneMinute,
    FiveMinutes,
    OneHour,
    OneDay,
}

impl AggregateWindow {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1m" => Some(AggregateWindow::OneMinute),
            "5m" => Some(AggregateWindow::FiveMinutes),
            "1h" => Some(AggregateWindow::OneHour),
            "1d" => Some(AggregateWindow::OneDay),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregateWindow::OneMinute => "1m",
            AggregateWindow::FiveMinutes => "5m",
            AggregateWindow::OneHour => "1h",
            AggregateWindow::OneDay => "1d",
        }
    }

    pub fn duration(self) -> ChronoDuration {
        match self {
            AggregateWindow::OneMinute => ChronoDuration::minutes(1),
            AggregateWindow::FiveMinutes => ChronoDuration::minutes(5),
            AggregateWindow::OneHour => ChronoDuration::hours(1),
            AggregateWindow::OneDay => ChronoDuration::days(1),
        }
    }
}

/// Half-open `[start, stop)` range over one machine's points, optionally
/// reduced to the mean of each window.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub machine_id: Uuid,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub window: Option<AggregateWindow>,
}

/// A single field value at a single instant, as the store returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRecord {
    pub time: DateTime<Utc>,
    pub field: SensorField,
    pub value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("time-series store unreachable: {0}")]
    Unavailable(String),

    #[error("time-series store timed out")]
    Timeout,

    #[error("time-series store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to decode time-series response: {0}")]
    Decode(String),

    #[error("point cannot be encoded: {0}")]
    InvalidPoint(String),
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_point(&self, point: &TimeSeriesPoint) -> Result<(), StoreError>;

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<FieldRecord>, StoreError>;
}
