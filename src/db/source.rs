use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};

use super::models::{Circuit, CircuitRow, HourlyConsumption, HourlyRow, MeasurementRow, Reading};
use crate::source::{SourceError, TelemetrySource};

/// Reads the dashboard tables straight from Postgres.
///
/// Ids are compared as text and every measurement is read as nullable
/// `float8`, so the queries do not depend on the exact column types chosen
/// upstream.
#[derive(Debug, Clone)]
pub struct PgTelemetrySource {
    pool: PgPool,
}

impl PgTelemetrySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetrySource for PgTelemetrySource {
    async fn circuits_for_device(&self, device_id: &str) -> Result<Vec<Circuit>, SourceError> {
        let rows = sqlx::query_as::<_, CircuitRow>(
            r#"
            SELECT id::text             AS id,
                   nombre::text         AS name,
                   id_dispositivo::text AS device_id
            FROM circuitos
            WHERE id_dispositivo::text = $1
            ORDER BY indice ASC NULLS LAST, id ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn readings_since(
        &self,
        circuit_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, SourceError> {
        let rows = sqlx::query_as::<_, MeasurementRow>(
            r#"
            SELECT circuito_id::text        AS circuit_id,
                   fecha_hora::timestamptz  AS recorded_at,
                   potencia::float8         AS power,
                   energia::float8          AS energy,
                   voltaje::float8          AS voltage,
                   corriente::float8        AS current,
                   frecuencia::float8       AS frequency,
                   factor_potencia::float8  AS power_factor
            FROM mediciones
            WHERE circuito_id::text = ANY($1)
              AND fecha_hora >= $2
            ORDER BY fecha_hora ASC, circuito_id ASC
            "#,
        )
        .bind(circuit_ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let total = rows.len();
        let readings: Vec<Reading> = rows.into_iter().filter_map(MeasurementRow::into_reading).collect();
        if readings.len() < total {
            warn!(dropped = total - readings.len(), "Dropped measurements without circuit id or timestamp");
        }
        debug!(rows = total, since = %since, "Fetched measurements");
        Ok(readings)
    }

    async fn hourly_consumption_since(
        &self,
        circuit_ids: &[String],
        since: NaiveDate,
    ) -> Result<Vec<HourlyConsumption>, SourceError> {
        let rows = sqlx::query_as::<_, HourlyRow>(
            r#"
            SELECT circuito_id::text AS circuit_id,
                   fecha::date       AS date,
                   hora::int4        AS hour,
                   energia::float8   AS energy_kwh
            FROM consumos_horarios
            WHERE circuito_id::text = ANY($1)
              AND fecha >= $2
            ORDER BY fecha ASC, hora ASC
            "#,
        )
        .bind(circuit_ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let total = rows.len();
        let hourly: Vec<HourlyConsumption> = rows.into_iter().filter_map(HourlyRow::into_consumption).collect();
        if hourly.len() < total {
            warn!(dropped = total - hourly.len(), "Dropped hourly rows without circuit, date or valid hour");
        }
        Ok(hourly)
    }
}
