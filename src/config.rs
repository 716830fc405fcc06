use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{FixedOffset, TimeDelta};

use crate::aggregator::AggregatorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rest,
    Postgres,
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" | "supabase" => Ok(Self::Rest),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(anyhow!("unknown SOURCE_KIND: {other} (expected rest or postgres)")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceConfig {
    /// Supabase PostgREST endpoint.
    Rest { url: String, api_key: String },
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub server_host: String,
    pub server_port: u16,
    /// Device selected at startup, if any.
    pub device_id: Option<String>,
    /// Rows per PostgREST page
    pub page_size: usize,
    pub aggregator: AggregatorSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);

        let source = match env.optional("SOURCE_KIND", "rest").parse::<SourceKind>()? {
            SourceKind::Rest => SourceConfig::Rest {
                url: env.required("SUPABASE_URL")?,
                api_key: env.required("SUPABASE_ANON_KEY")?,
            },
            SourceKind::Postgres => SourceConfig::Postgres {
                database_url: env.required("DATABASE_URL")?,
            },
        };

        let aggregator = AggregatorSettings {
            poll_interval: Duration::from_millis(env.parsed("POLL_INTERVAL_MS", "2000")?),
            load_timeout: Duration::from_millis(env.parsed("LOAD_TIMEOUT_MS", "8000")?),
            poll_timeout: Duration::from_millis(env.parsed("POLL_TIMEOUT_MS", "5000")?),
            lookback: TimeDelta::minutes(i64::from(env.parsed::<u32>("LOOKBACK_MINUTES", "10")?)),
            recent_window: TimeDelta::seconds(i64::from(env.parsed::<u32>("RECENT_WINDOW_SECS", "20")?)),
            retention: TimeDelta::minutes(i64::from(env.parsed::<u32>("RETENTION_MINUTES", "60")?)),
            window_minutes: env.parsed("WINDOW_MINUTES", "10")?,
            active_threshold_w: env.parsed("ACTIVE_THRESHOLD_W", "0.5")?,
            cost_per_kwh: env.parsed("COST_PER_KWH", "650")?,
            local_offset: parse_utc_offset(&env.optional("LOCAL_UTC_OFFSET", "-05:00"))?,
            summary_days: env.parsed("SUMMARY_DAYS", "7")?,
        };

        let config = Self {
            source,
            server_host: env.optional("SERVER_HOST", "0.0.0.0"),
            server_port: env
                .optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            device_id: env.get("DEVICE_ID").filter(|id| !id.trim().is_empty()),
            page_size: env.parsed("PAGE_SIZE", "1000")?,
            aggregator,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let a = &self.aggregator;
        if a.poll_interval.is_zero() || a.load_timeout.is_zero() || a.poll_timeout.is_zero() {
            bail!("POLL_INTERVAL_MS, LOAD_TIMEOUT_MS and POLL_TIMEOUT_MS must be non-zero");
        }
        if a.lookback <= TimeDelta::zero() || a.recent_window <= TimeDelta::zero() {
            bail!("LOOKBACK_MINUTES and RECENT_WINDOW_SECS must be non-zero");
        }
        if a.retention < a.lookback {
            bail!("RETENTION_MINUTES must be at least LOOKBACK_MINUTES");
        }
        if a.window_minutes == 0 || a.summary_days == 0 || self.page_size == 0 {
            bail!("WINDOW_MINUTES, SUMMARY_DAYS and PAGE_SIZE must be non-zero");
        }
        if !a.cost_per_kwh.is_finite() || a.cost_per_kwh < 0.0 {
            bail!("COST_PER_KWH must be a non-negative number");
        }
        Ok(())
    }
}

/// Parse `±HH:MM` (or `Z`) into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).context("zero offset");
    }

    let invalid = || anyhow!("LOCAL_UTC_OFFSET must look like -05:00, got {raw:?}");
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("missing required env var: {key}"))
    }

    fn optional(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parsed<T>(&self, key: &str, default: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.optional(key, default)
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number"))
    }
}
