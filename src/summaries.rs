//! Daily energy, hourly cost and day-over-day comparison.
//!
//! All of these are computed from the server-side hourly consumption rows,
//! never from the raw reading cache. Callers pass rows already restricted to
//! the circuits being rendered.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::HourlyConsumption;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DailyEnergy {
    pub date: NaiveDate,
    /// `YYYY-MM-DD`.
    pub label: String,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DailyEnergySummary {
    /// Oldest day first. Days without rows are present with `0.0`.
    pub days: Vec<DailyEnergy>,
    pub max_kwh: f64,
    pub average_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HourlyCost {
    pub hour: u32,
    /// `HH:00`.
    pub label: String,
    pub energy_kwh: f64,
    pub cost: f64,
    /// Running total of `cost` from midnight up to and including this hour.
    pub accumulated: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HourlyCostSummary {
    /// Midnight through the current local hour, zero-filled.
    pub hours: Vec<HourlyCost>,
    pub max_cost: f64,
    pub average_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConsumptionComparison {
    pub today_kwh: f64,
    pub yesterday_kwh: f64,
    /// `(today - yesterday) / yesterday * 100`; absent when yesterday is zero.
    pub difference_pct: Option<f64>,
}

fn energy_by_date(rows: &[HourlyConsumption]) -> BTreeMap<NaiveDate, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        *totals.entry(row.date).or_insert(0.0) += row.energy_kwh;
    }
    totals
}

fn max_and_mean(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let count = values.clone().count();
    if count == 0 {
        return (0.0, 0.0);
    }
    let max = values.clone().fold(f64::MIN, f64::max);
    let mean = values.sum::<f64>() / count as f64;
    (max, mean)
}

/// Energy per local day for the `days` days ending with `today`.
pub fn daily_energy(rows: &[HourlyConsumption], today: NaiveDate, days: u32) -> DailyEnergySummary {
    let totals = energy_by_date(rows);
    let days: Vec<DailyEnergy> = (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_signed(TimeDelta::days(i64::from(back))))
        .map(|date| DailyEnergy {
            date,
            label: date.format("%Y-%m-%d").to_string(),
            energy_kwh: totals.get(&date).copied().unwrap_or(0.0),
        })
        .collect();

    let (max_kwh, average_kwh) = max_and_mean(days.iter().map(|d| d.energy_kwh));
    DailyEnergySummary { days, max_kwh, average_kwh }
}

/// Cost per hour of the current local day, priced at `cost_per_kwh`.
pub fn hourly_cost(
    rows: &[HourlyConsumption],
    now_local: NaiveDateTime,
    cost_per_kwh: f64,
) -> HourlyCostSummary {
    let today = now_local.date();
    let mut per_hour = [0.0_f64; 24];
    for row in rows.iter().filter(|r| r.date == today && r.hour < 24) {
        per_hour[row.hour as usize] += row.energy_kwh;
    }

    let mut accumulated = 0.0;
    let hours: Vec<HourlyCost> = (0..=now_local.hour())
        .map(|hour| {
            let energy_kwh = per_hour[hour as usize];
            let cost = energy_kwh * cost_per_kwh;
            accumulated += cost;
            HourlyCost {
                hour,
                label: format!("{hour:02}:00"),
                energy_kwh,
                cost,
                accumulated,
            }
        })
        .collect();

    let (max_cost, average_cost) = max_and_mean(hours.iter().map(|h| h.cost));
    HourlyCostSummary { hours, max_cost, average_cost }
}

pub fn comparison(rows: &[HourlyConsumption], today: NaiveDate) -> ConsumptionComparison {
    let totals = energy_by_date(rows);
    let today_kwh = totals.get(&today).copied().unwrap_or(0.0);
    let yesterday_kwh = today
        .pred_opt()
        .and_then(|d| totals.get(&d).copied())
        .unwrap_or(0.0);
    let difference_pct =
        (yesterday_kwh > 0.0).then(|| (today_kwh - yesterday_kwh) / yesterday_kwh * 100.0);

    ConsumptionComparison { today_kwh, yesterday_kwh, difference_pct }
}
