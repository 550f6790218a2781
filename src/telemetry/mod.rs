mod validate;

pub use validate::{
    parse_timestamp, validate_batch, validate_broker_message, validate_group, validate_reading,
    ValidationError, ValidationErrorKind,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

pub const MAX_BATCH_GROUPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorField {
    Temperature,
    Pressure,
    Speed,
}

impl SensorField {
    pub const ALL: [SensorField; 3] = [
        SensorField::Temperature,
        SensorField::Pressure,
        SensorField::Speed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorField::Temperature => "temperature",
            SensorField::Pressure => "pressure",
            SensorField::Speed => "speed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "temperature" => Some(SensorField::Temperature),
            "pressure" => Some(SensorField::Pressure),
            "speed" => Some(SensorField::Speed),
            _ => None,
        }
    }

    /// Inclusive physical bounds accepted on ingest.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            SensorField::Temperature => (-273.15, 1000.0),
            SensorField::Pressure => (0.0, 10_000.0),
            SensorField::Speed => (0.0, 100_000.0),
        }
    }
}

impl std::fmt::Display for SensorField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated reading: UTC timestamp plus at least one sensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub speed: Option<f64>,
}

impl SensorReading {
    pub fn value(&self, field: SensorField) -> Option<f64> {
        match field {
            SensorField::Temperature => self.temperature,
            SensorField::Pressure => self.pressure,
            SensorField::Speed => self.speed,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = (SensorField, f64)> + '_ {
        SensorField::ALL
            .into_iter()
            .filter_map(|field| self.value(field).map(|value| (field, value)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineGroup {
    pub machine_id: Uuid,
    pub sensor_type: String,
    pub location: String,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestBatch {
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
    pub groups: Vec<MachineGroup>,
}

impl IngestBatch {
    pub fn total_readings(&self) -> usize {
        self.groups.iter().map(|group| group.readings.len()).sum()
    }
}

/// Reading decoded from a broker message; the topic supplies the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerReading {
    pub sensor_type: String,
    pub reading: SensorReading,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReading {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMachineGroup {
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub readings: Option<Vec<RawReading>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawIngestBatch {
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub batch: Option<Vec<RawMachineGroup>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBrokerMessage {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}
