pub mod models;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    db::models::{Circuit, HourlyConsumption, Reading},
    source::{SourceError, TelemetrySource},
};

use self::models::{CircuitRecord, HourlyRecord, MeasurementRecord, PostgrestError};

const MEASUREMENT_COLUMNS: &str =
    "circuito_id,fecha_hora,potencia,energia,voltaje,corriente,frecuencia,factor_potencia";

/// Read-only client for the Supabase PostgREST API.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    /// `<project>/rest/v1`, without a trailing slash.
    rest_url: String,
    api_key: String,
    page_size: usize,
}

impl SupabaseClient {
    pub fn new(project_url: &str, api_key: &str, page_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: Client::new(),
                rest_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
                api_key: api_key.to_owned(),
                page_size: page_size.max(1),
            }),
        }
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url, SourceError> {
        Url::parse_with_params(&format!("{}/{}", self.inner.rest_url, table), params)
            .map_err(|e| SourceError::InvalidRequest(format!("bad URL for {table}: {e}")))
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap, SourceError> {
        let mut headers = HashMap::new();
        headers.insert("apikey".to_owned(), self.inner.api_key.clone());
        headers.insert("authorization".to_owned(), format!("Bearer {}", self.inner.api_key));
        headers.insert("accept".to_owned(), "application/json".to_owned());
        to_header_map(headers)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, SourceError> {
        debug!(url = %url, "PostgREST request");
        let response = self
            .inner
            .http
            .get(url)
            .headers(self.headers()?)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<PostgrestError>(&bytes)
                .map(|e| e.describe())
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(SourceError::Api { status: status.as_u16(), message });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetch every row matching `params`, one `limit`/`offset` page at a time,
    /// so the server-side row cap never truncates a result.
    async fn get_all<T: DeserializeOwned>(
        &self,
        table: &str,
        params: Vec<(&str, String)>,
    ) -> Result<Vec<T>, SourceError> {
        let page_size = self.inner.page_size;
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let mut page_params = params.clone();
            page_params.push(("limit", page_size.to_string()));
            page_params.push(("offset", offset.to_string()));

            let page: Vec<T> = self.get_json(self.table_url(table, &page_params)?).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }
}

#[async_trait]
impl TelemetrySource for SupabaseClient {
    async fn circuits_for_device(&self, device_id: &str) -> Result<Vec<Circuit>, SourceError> {
        let records: Vec<CircuitRecord> = self.get_all("circuitos", circuits_query(device_id)).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.into_circuit(device_id))
            .collect())
    }

    async fn readings_since(
        &self,
        circuit_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, SourceError> {
        let records: Vec<MeasurementRecord> = self
            .get_all("mediciones", readings_query(circuit_ids, since))
            .await?;
        let total = records.len();
        let readings: Vec<Reading> = records
            .into_iter()
            .filter_map(MeasurementRecord::into_reading)
            .collect();
        if readings.len() < total {
            warn!(dropped = total - readings.len(), "Dropped measurements without circuit id or timestamp");
        }
        Ok(readings)
    }

    async fn hourly_consumption_since(
        &self,
        circuit_ids: &[String],
        since: NaiveDate,
    ) -> Result<Vec<HourlyConsumption>, SourceError> {
        let records: Vec<HourlyRecord> = self
            .get_all("consumos_horarios", hourly_query(circuit_ids, since))
            .await?;
        Ok(records
            .into_iter()
            .filter_map(HourlyRecord::into_consumption)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Query builders
// ---------------------------------------------------------------------------

/// PostgREST `in` filter with every id quoted.
fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn circuits_query(device_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("select", "id,nombre,id_dispositivo,indice".to_owned()),
        ("id_dispositivo", format!("eq.{device_id}")),
        ("order", "indice.asc.nullslast,id.asc".to_owned()),
    ]
}

fn readings_query(circuit_ids: &[String], since: DateTime<Utc>) -> Vec<(&'static str, String)> {
    vec![
        ("select", MEASUREMENT_COLUMNS.to_owned()),
        ("circuito_id", in_filter(circuit_ids)),
        ("fecha_hora", format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true))),
        ("order", "fecha_hora.asc,circuito_id.asc".to_owned()),
    ]
}

fn hourly_query(circuit_ids: &[String], since: NaiveDate) -> Vec<(&'static str, String)> {
    vec![
        ("select", "circuito_id,fecha,hora,energia".to_owned()),
        ("circuito_id", in_filter(circuit_ids)),
        ("fecha", format!("gte.{}", since.format("%Y-%m-%d"))),
        ("order", "fecha.asc,hora.asc".to_owned()),
    ]
}

/// Convert our string `HashMap` into a `reqwest::header::HeaderMap`.
fn to_header_map(map: HashMap<String, String>) -> Result<reqwest::header::HeaderMap, SourceError> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (k, v) in map {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| SourceError::InvalidRequest(format!("invalid header name: {k}")))?;
        let value = reqwest::header::HeaderValue::from_str(&v)
            .map_err(|_| SourceError::InvalidRequest(format!("invalid header value for {k}")))?;
        header_map.insert(name, value);
    }
    Ok(header_map)
}
