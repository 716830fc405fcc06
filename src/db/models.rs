use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// One telemetry sample for a circuit.
///
/// Numeric fields are always defined: anything missing or non-finite in the
/// remote row is coerced to `0.0` when the row is ingested (see [`or_zero`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    pub circuit_id: String,
    pub timestamp: DateTime<Utc>,
    /// Active power in W.
    pub power: f64,
    /// Accumulated energy in kWh.
    pub energy: f64,
    /// RMS voltage in V.
    pub voltage: f64,
    /// RMS current in A.
    pub current: f64,
    /// Line frequency in Hz.
    pub frequency: f64,
    pub power_factor: Option<f64>,
}

/// A tracked electrical sub-load belonging to a device (household).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Circuit {
    pub id: String,
    pub name: String,
    pub device_id: String,
}

/// Server-side pre-aggregated energy for one circuit and one local hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyConsumption {
    pub circuit_id: String,
    pub date: NaiveDate,
    /// Local hour of day, `0..=23`.
    pub hour: u32,
    pub energy_kwh: f64,
}

/// Coerce an optional, possibly non-finite measurement to a usable number.
pub(crate) fn or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Postgres row shapes
//
// Every column, keys included, is read as nullable so a sparse row never
// fails the whole query. The conversions below are the ingestion boundary:
// unkeyable rows are dropped there.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct MeasurementRow {
    pub circuit_id: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
}

impl MeasurementRow {
    /// `None` when the row has no circuit id or timestamp to key it by.
    pub fn into_reading(self) -> Option<Reading> {
        Some(Reading {
            circuit_id: self.circuit_id.filter(|id| !id.is_empty())?,
            timestamp: self.recorded_at?,
            power: or_zero(self.power),
            energy: or_zero(self.energy),
            voltage: or_zero(self.voltage),
            current: or_zero(self.current),
            frequency: or_zero(self.frequency),
            power_factor: self.power_factor.filter(|v| v.is_finite()),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CircuitRow {
    pub id: String,
    pub name: Option<String>,
    pub device_id: String,
}

impl From<CircuitRow> for Circuit {
    fn from(r: CircuitRow) -> Self {
        let name = r.name.unwrap_or_else(|| r.id.clone());
        Self { id: r.id, name, device_id: r.device_id }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct HourlyRow {
    pub circuit_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub hour: Option<i32>,
    pub energy_kwh: Option<f64>,
}

impl HourlyRow {
    /// Rows missing their key or with an hour outside `0..=23` cannot be
    /// placed on the day and are dropped.
    pub fn into_consumption(self) -> Option<HourlyConsumption> {
        let hour = u32::try_from(self.hour?).ok().filter(|h| *h < 24)?;
        Some(HourlyConsumption {
            circuit_id: self.circuit_id.filter(|id| !id.is_empty())?,
            date: self.date?,
            hour,
            energy_kwh: or_zero(self.energy_kwh),
        })
    }
}
