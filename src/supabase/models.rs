use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::db::models::{or_zero, Circuit, HourlyConsumption, Reading};

// ---------------------------------------------------------------------------
// Error envelope
//
// PostgREST reports failures as:
//   { "code": "42703", "message": "...", "details": null, "hint": null }
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PostgrestError {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl PostgrestError {
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} (code {})",
            self.message.as_deref().unwrap_or("(no message)"),
            self.code.as_deref().unwrap_or("?")
        );
        if let Some(details) = self.details.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(": ");
            out.push_str(details);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// FieldValue
//
// Columns arrive as whatever the writer stored: numbers, numeric strings,
// sometimes booleans. Bool MUST come before the numeric variants.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(v) => v.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    /// Render as an opaque identifier. Ids are compared as strings everywhere.
    pub fn as_id(&self) -> Option<String> {
        match self {
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some((*v as i64).to_string()),
            FieldValue::Text(v) if !v.trim().is_empty() => Some(v.trim().to_owned()),
            _ => None,
        }
    }
}

fn number(value: Option<&FieldValue>) -> f64 {
    or_zero(value.and_then(FieldValue::as_f64))
}

/// Accepts RFC 3339 as well as the offset-less and short-offset forms
/// Postgres emits for `timestamp` columns. Offset-less values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// mediciones
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MeasurementRecord {
    #[serde(rename = "circuito_id")]
    pub circuit_id: Option<FieldValue>,
    #[serde(rename = "fecha_hora")]
    pub recorded_at: Option<String>,
    #[serde(rename = "potencia")]
    pub power: Option<FieldValue>,
    #[serde(rename = "energia")]
    pub energy: Option<FieldValue>,
    #[serde(rename = "voltaje")]
    pub voltage: Option<FieldValue>,
    #[serde(rename = "corriente")]
    pub current: Option<FieldValue>,
    #[serde(rename = "frecuencia")]
    pub frequency: Option<FieldValue>,
    #[serde(rename = "factor_potencia")]
    pub power_factor: Option<FieldValue>,
}

impl MeasurementRecord {
    /// `None` when the row has no usable circuit id or timestamp.
    pub fn into_reading(self) -> Option<Reading> {
        let circuit_id = self.circuit_id.as_ref().and_then(FieldValue::as_id)?;
        let timestamp = self.recorded_at.as_deref().and_then(parse_timestamp)?;
        Some(Reading {
            circuit_id,
            timestamp,
            power: number(self.power.as_ref()),
            energy: number(self.energy.as_ref()),
            voltage: number(self.voltage.as_ref()),
            current: number(self.current.as_ref()),
            frequency: number(self.frequency.as_ref()),
            power_factor: self
                .power_factor
                .as_ref()
                .and_then(FieldValue::as_f64)
                .filter(|v| v.is_finite()),
        })
    }
}

// ---------------------------------------------------------------------------
// circuitos
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CircuitRecord {
    pub id: Option<FieldValue>,
    #[serde(rename = "nombre")]
    pub name: Option<String>,
    #[serde(rename = "id_dispositivo")]
    pub device_id: Option<FieldValue>,
}

impl CircuitRecord {
    pub fn into_circuit(self, requested_device: &str) -> Option<Circuit> {
        let id = self.id.as_ref().and_then(FieldValue::as_id)?;
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        let device_id = self
            .device_id
            .as_ref()
            .and_then(FieldValue::as_id)
            .unwrap_or_else(|| requested_device.to_owned());
        Some(Circuit { id, name, device_id })
    }
}

// ---------------------------------------------------------------------------
// consumos_horarios
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HourlyRecord {
    #[serde(rename = "circuito_id")]
    pub circuit_id: Option<FieldValue>,
    #[serde(rename = "fecha")]
    pub date: Option<String>,
    #[serde(rename = "hora")]
    pub hour: Option<FieldValue>,
    #[serde(rename = "energia")]
    pub energy_kwh: Option<FieldValue>,
}

impl HourlyRecord {
    pub fn into_consumption(self) -> Option<HourlyConsumption> {
        let circuit_id = self.circuit_id.as_ref().and_then(FieldValue::as_id)?;
        let date = self
            .date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.get(..10).unwrap_or(d), "%Y-%m-%d").ok())?;
        let hour = self
            .hour
            .as_ref()
            .and_then(FieldValue::as_f64)
            .filter(|h| (0.0..24.0).contains(h))? as u32;
        Some(HourlyConsumption {
            circuit_id,
            date,
            hour,
            energy_kwh: number(self.energy_kwh.as_ref()),
        })
    }
}
