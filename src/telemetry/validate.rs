use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::ErrorDetail;

use super::{
    BrokerReading, IngestBatch, MachineGroup, RawBrokerMessage, RawIngestBatch, RawMachineGroup,
    RawReading, SensorField, SensorReading, MAX_BATCH_GROUPS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    MissingField,
    InvalidFormat,
    InvalidTimestamp,
    OutOfRange,
    NoSensorValue,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
    pub value: Option<String>,
}

impl ValidationError {
    fn new(
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            field: field.into(),
            kind,
            message: message.into(),
            value,
        }
    }

    fn missing(field: impl Into<String>) -> Self {
        Self::new(
            field,
            ValidationErrorKind::MissingField,
            "Field required",
            None,
        )
    }
}

impl From<ValidationError> for ErrorDetail {
    fn from(err: ValidationError) -> Self {
        ErrorDetail::new(err.field, err.message, err.value)
    }
}

/// Parses an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{path}.{field}")
    }
}

fn check_bounds(path: &str, field: SensorField, value: Option<f64>) -> Result<(), ValidationError> {
    let Some(value) = value else {
        return Ok(());
    };
    let (min, max) = field.bounds();
    if !value.is_finite() || value < min || value > max {
        return Err(ValidationError::new(
            join(path, field.as_str()),
            ValidationErrorKind::OutOfRange,
            format!("Value must be between {min} and {max}"),
            Some(value.to_string()),
        ));
    }
    Ok(())
}

/// Validates one reading. An empty reading is rejected before its
/// timestamp is looked at.
pub fn validate_reading(raw: &RawReading, path: &str) -> Result<SensorReading, ValidationError> {
    if raw.temperature.is_none() && raw.pressure.is_none() && raw.speed.is_none() {
        return Err(ValidationError::new(
            path,
            ValidationErrorKind::NoSensorValue,
            "At least one sensor value (temperature, pressure, or speed) is required",
            None,
        ));
    }

    let timestamp_field = join(path, "timestamp");
    let raw_timestamp = raw
        .timestamp
        .as_deref()
        .ok_or_else(|| ValidationError::missing(timestamp_field.clone()))?;
    let timestamp = parse_timestamp(raw_timestamp).ok_or_else(|| {
        ValidationError::new(
            timestamp_field,
            ValidationErrorKind::InvalidTimestamp,
            "Invalid ISO 8601 timestamp",
            Some(raw_timestamp.to_string()),
        )
    })?;

    for field in SensorField::ALL {
        let value = match field {
            SensorField::Temperature => raw.temperature,
            SensorField::Pressure => raw.pressure,
            SensorField::Speed => raw.speed,
        };
        check_bounds(path, field, value)?;
    }

    Ok(SensorReading {
        timestamp,
        temperature: raw.temperature,
        pressure: raw.pressure,
        speed: raw.speed,
    })
}

fn bounded_text(
    errors: &mut Vec<ValidationError>,
    field: String,
    value: Option<&str>,
    max_len: usize,
) -> Option<String> {
    let Some(value) = value else {
        errors.push(ValidationError::missing(field));
        return None;
    };
    let len = value.chars().count();
    if len == 0 || len > max_len {
        errors.push(ValidationError::new(
            field,
            ValidationErrorKind::InvalidFormat,
            format!("Length must be between 1 and {max_len} characters"),
            Some(value.to_string()),
        ));
        return None;
    }
    Some(value.to_string())
}

/// Validates a machine group and every reading in it, collecting all
/// problems rather than stopping at the first.
pub fn validate_group(raw: &RawMachineGroup, path: &str) -> Result<MachineGroup, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let machine_id_field = join(path, "machine_id");
    let machine_id = match raw.machine_id.as_deref() {
        None => {
            errors.push(ValidationError::missing(machine_id_field));
            None
        }
        Some(value) => match Uuid::parse_str(value.trim()) {
            Ok(id) => Some(id),
            Err(_) => {
                errors.push(ValidationError::new(
                    machine_id_field,
                    ValidationErrorKind::InvalidFormat,
                    "Input should be a valid UUID",
                    Some(value.to_string()),
                ));
                None
            }
        },
    };
    let sensor_type = bounded_text(
        &mut errors,
        join(path, "sensor_type"),
        raw.sensor_type.as_deref(),
        100,
    );
    let location = bounded_text(
        &mut errors,
        join(path, "location"),
        raw.location.as_deref(),
        500,
    );

    let readings_field = join(path, "readings");
    let mut readings = Vec::new();
    match raw.readings.as_deref() {
        None => errors.push(ValidationError::missing(readings_field)),
        Some([]) => errors.push(ValidationError::new(
            readings_field,
            ValidationErrorKind::InvalidFormat,
            "At least one reading is required",
            None,
        )),
        Some(raw_readings) => {
            for (idx, raw_reading) in raw_readings.iter().enumerate() {
                match validate_reading(raw_reading, &format!("{readings_field}.{idx}")) {
                    Ok(reading) => readings.push(reading),
                    Err(err) => errors.push(err),
                }
            }
        }
    }

    match (machine_id, sensor_type, location) {
        (Some(machine_id), Some(sensor_type), Some(location)) if errors.is_empty() => {
            Ok(MachineGroup {
                machine_id,
                sensor_type,
                location,
                readings,
            })
        }
        _ => Err(errors),
    }
}

/// Full schema validation of a batch request. Nothing is written unless
/// this succeeds.
pub fn validate_batch(raw: &RawIngestBatch) -> Result<IngestBatch, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let gateway_id = bounded_text(
        &mut errors,
        "gateway_id".to_string(),
        raw.gateway_id.as_deref(),
        255,
    );

    let timestamp = match raw.timestamp.as_deref() {
        None => {
            errors.push(ValidationError::missing("timestamp"));
            None
        }
        Some(value) => {
            let parsed = parse_timestamp(value);
            if parsed.is_none() {
                errors.push(ValidationError::new(
                    "timestamp",
                    ValidationErrorKind::InvalidTimestamp,
                    "Invalid ISO 8601 timestamp",
                    Some(value.to_string()),
                ));
            }
            parsed
        }
    };

    let mut groups = Vec::new();
    match raw.batch.as_deref() {
        None => errors.push(ValidationError::missing("batch")),
        Some(raw_groups) if raw_groups.is_empty() || raw_groups.len() > MAX_BATCH_GROUPS => {
            errors.push(ValidationError::new(
                "batch",
                ValidationErrorKind::OutOfRange,
                format!("Batch must contain between 1 and {MAX_BATCH_GROUPS} machine groups"),
                Some(raw_groups.len().to_string()),
            ))
        }
        Some(raw_groups) => {
            for (idx, raw_group) in raw_groups.iter().enumerate() {
                match validate_group(raw_group, &format!("batch.{idx}")) {
                    Ok(group) => groups.push(group),
                    Err(group_errors) => errors.extend(group_errors),
                }
            }
        }
    }

    match (gateway_id, timestamp) {
        (Some(gateway_id), Some(timestamp)) if errors.is_empty() => Ok(IngestBatch {
            gateway_id,
            timestamp,
            groups,
        }),
        _ => Err(errors),
    }
}

/// Validates a broker payload: `timestamp` and `sensor_type` must be
/// present, then the reading rules apply.
pub fn validate_broker_message(raw: &RawBrokerMessage) -> Result<BrokerReading, ValidationError> {
    if raw.timestamp.is_none() {
        return Err(ValidationError::missing("timestamp"));
    }
    let sensor_type = raw
        .sensor_type
        .as_deref()
        .ok_or_else(|| ValidationError::missing("sensor_type"))?
        .to_string();

    let reading = validate_reading(
        &RawReading {
            timestamp: raw.timestamp.clone(),
            temperature: raw.temperature,
            pressure: raw.pressure,
            speed: raw.speed,
        },
        "",
    )?;

    Ok(BrokerReading {
        sensor_type,
        reading,
    })
}
