use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::{Circuit, Reading},
    reading_cache::ReadingCache,
    summaries::{ConsumptionComparison, DailyEnergySummary, HourlyCostSummary},
};

/// Which slice of the cache is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ViewMode {
    /// Sum of every circuit under the active device.
    #[default]
    Aggregate,
    Single { circuit_id: String },
}

/// One minute of the rolling power chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MinuteBucket {
    /// Local `HH:MM`.
    pub label: String,
    /// Start of the minute.
    pub minute: DateTime<Utc>,
    /// Average power in W; `0.0` when the minute has no readings.
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TodaySummary {
    pub max_power_w: f64,
    pub average_power_w: f64,
    /// Whether the rendered slice is currently drawing power.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CircuitStatus {
    pub id: String,
    pub name: String,
    pub active: bool,
}

/// Everything the presentation layer needs, recomputed on every refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ViewModel {
    pub rendered_at: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub view_mode: ViewMode,
    pub power_series: Vec<MinuteBucket>,
    pub today: TodaySummary,
    /// Most recent reading in the rendered slice, for the instantaneous indicators.
    pub latest: Option<Reading>,
    pub circuits: Vec<CircuitStatus>,
    pub daily_energy: DailyEnergySummary,
    pub hourly_cost: HourlyCostSummary,
    pub comparison: ConsumptionComparison,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub(crate) fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub(crate) fn minute_label(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).format("%H:%M").to_string()
}

/// Midnight of the local day containing `now`, as a UTC instant.
pub(crate) fn start_of_local_day(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    now.with_timezone(&offset)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(offset).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Derivations
// ---------------------------------------------------------------------------

/// Per-minute totals since `from`: average power per circuit per minute,
/// summed across `circuit_ids`. Minutes without any reading are absent.
fn minute_totals(
    cache: &ReadingCache,
    circuit_ids: &[String],
    from: DateTime<Utc>,
) -> BTreeMap<DateTime<Utc>, f64> {
    let mut totals = BTreeMap::new();
    for id in circuit_ids {
        let mut per_minute: HashMap<DateTime<Utc>, (f64, u32)> = HashMap::new();
        for r in cache.circuit(id).iter().filter(|r| r.timestamp >= from) {
            let slot = per_minute.entry(minute_floor(r.timestamp)).or_insert((0.0, 0));
            slot.0 += r.power;
            slot.1 += 1;
        }
        for (minute, (sum, count)) in per_minute {
            *totals.entry(minute).or_insert(0.0) += sum / f64::from(count);
        }
    }
    totals
}

/// Exactly `window_minutes` buckets ending with the minute containing `now`.
pub fn minute_buckets(
    cache: &ReadingCache,
    circuit_ids: &[String],
    now: DateTime<Utc>,
    offset: FixedOffset,
    window_minutes: u32,
) -> Vec<MinuteBucket> {
    let last = minute_floor(now);
    let minutes: Vec<DateTime<Utc>> = (0..window_minutes)
        .rev()
        .map(|back| last - TimeDelta::minutes(i64::from(back)))
        .collect();

    let Some(first) = minutes.first().copied() else {
        return Vec::new();
    };
    let totals = minute_totals(cache, circuit_ids, first);

    minutes
        .into_iter()
        .map(|minute| MinuteBucket {
            label: minute_label(minute, offset),
            minute,
            value: totals.get(&minute).copied().unwrap_or(0.0),
        })
        .collect()
}

/// Today's max and average power for the rendered slice.
///
/// A single circuit is summarised over its raw readings. In aggregate mode
/// circuits report at different instants, so the summary runs over the
/// per-minute totals instead.
pub fn today_summary(
    cache: &ReadingCache,
    mode: &ViewMode,
    circuit_ids: &[String],
    now: DateTime<Utc>,
    offset: FixedOffset,
    active: bool,
) -> TodaySummary {
    let day_start = start_of_local_day(now, offset);
    let values: Vec<f64> = match mode {
        ViewMode::Single { circuit_id } => cache
            .circuit(circuit_id)
            .iter()
            .filter(|r| r.timestamp >= day_start)
            .map(|r| r.power)
            .collect(),
        ViewMode::Aggregate => minute_totals(cache, circuit_ids, day_start)
            .into_values()
            .collect(),
    };

    if values.is_empty() {
        return TodaySummary { active, ..TodaySummary::default() };
    }
    TodaySummary {
        max_power_w: values.iter().copied().fold(f64::MIN, f64::max),
        average_power_w: values.iter().sum::<f64>() / values.len() as f64,
        active,
    }
}

/// On/off classification per circuit after a refresh.
///
/// A circuit is on when the average power of its readings inside the recency
/// window exceeds `threshold_w`, or when any reading for it in `batch` that
/// falls inside the window does. The second rule keeps a circuit on for the
/// whole cycle even when sparse sampling put a zero first.
pub fn circuit_states(
    cache: &ReadingCache,
    batch: &[Reading],
    circuits: &[Circuit],
    now: DateTime<Utc>,
    recent_window: TimeDelta,
    threshold_w: f64,
) -> BTreeMap<String, bool> {
    let since = now - recent_window;
    circuits
        .iter()
        .map(|c| {
            let recent: Vec<f64> = cache
                .circuit(&c.id)
                .iter()
                .filter(|r| r.timestamp >= since)
                .map(|r| r.power)
                .collect();
            let average_on = !recent.is_empty()
                && recent.iter().sum::<f64>() / recent.len() as f64 > threshold_w;
            let batch_on = batch
                .iter()
                .any(|r| r.circuit_id == c.id && r.timestamp >= since && r.power > threshold_w);
            (c.id.clone(), average_on || batch_on)
        })
        .collect()
}
