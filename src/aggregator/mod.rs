pub mod view;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Utc};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    db::models::{Circuit, HourlyConsumption, Reading},
    reading_cache::ReadingCache,
    source::TelemetrySource,
    summaries,
};

use self::view::{CircuitStatus, ViewMode, ViewModel};

/// Tunables for one aggregator. `Default` matches the production dashboard.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub poll_interval: Duration,
    pub load_timeout: Duration,
    pub poll_timeout: Duration,
    /// How far back `load_initial` reaches.
    pub lookback: TimeDelta,
    /// How far back each poll reaches; also the circuit-state window.
    pub recent_window: TimeDelta,
    pub retention: TimeDelta,
    pub window_minutes: u32,
    pub active_threshold_w: f64,
    pub cost_per_kwh: f64,
    pub local_offset: FixedOffset,
    pub summary_days: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            load_timeout: Duration::from_millis(8000),
            poll_timeout: Duration::from_millis(5000),
            lookback: TimeDelta::minutes(10),
            recent_window: TimeDelta::seconds(20),
            retention: TimeDelta::minutes(60),
            window_minutes: 10,
            active_threshold_w: 0.5,
            cost_per_kwh: 650.0,
            local_offset: FixedOffset::west_opt(5 * 3600).unwrap_or_else(|| Utc.fix()),
            summary_days: 7,
        }
    }
}

/// What a single refresh did. Never an error: failures are absorbed and
/// retried on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied { readings: usize },
    /// A previous refresh of the same kind was still in flight.
    Skipped,
    TimedOut,
    Failed,
    /// The device selection changed (or the aggregator stopped) while fetching.
    Discarded,
    NoDevice,
}

#[derive(Debug, Error)]
pub enum ViewModeError {
    #[error("circuit {0} does not belong to the active device")]
    UnknownCircuit(String),
}

#[derive(Debug, Default)]
struct State {
    /// Bumped whenever in-flight fetches must not be applied.
    epoch: u64,
    /// Bumped by every `select_device` call; only the latest may apply.
    selection: u64,
    /// Bumped by `start`, `stop` and `set_visibility`. A reload only resumes
    /// polling if no later transition happened while it was fetching.
    transition: u64,
    running: bool,
    visible: bool,
    device_id: Option<String>,
    circuits: Vec<Circuit>,
    view_mode: ViewMode,
    cache: ReadingCache,
    circuit_states: BTreeMap<String, bool>,
    hourly: Vec<HourlyConsumption>,
}

impl State {
    fn circuit_ids(&self) -> Vec<String> {
        self.circuits.iter().map(|c| c.id.clone()).collect()
    }

    fn rendered_ids(&self) -> Vec<String> {
        match &self.view_mode {
            ViewMode::Single { circuit_id } => vec![circuit_id.clone()],
            ViewMode::Aggregate => self.circuit_ids(),
        }
    }

    fn statuses(&self) -> Vec<CircuitStatus> {
        self.circuits
            .iter()
            .map(|c| CircuitStatus {
                id: c.id.clone(),
                name: c.name.clone(),
                active: self.circuit_states.get(&c.id).copied().unwrap_or(false),
            })
            .collect()
    }
}

/// Clears the flag it was acquired from when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls a [`TelemetrySource`] for the circuits of one device, keeps a bounded
/// cache of recent readings and publishes a freshly rendered [`ViewModel`]
/// after every change.
pub struct TelemetryAggregator {
    source: Arc<dyn TelemetrySource>,
    clock: Arc<dyn Clock>,
    settings: AggregatorSettings,
    state: RwLock<State>,
    poll_in_flight: AtomicBool,
    summary_in_flight: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    view_tx: watch::Sender<ViewModel>,
}

impl TelemetryAggregator {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        clock: Arc<dyn Clock>,
        settings: AggregatorSettings,
    ) -> Self {
        let (view_tx, _) = watch::channel(ViewModel::default());
        Self {
            source,
            clock,
            settings,
            state: RwLock::new(State { visible: true, ..State::default() }),
            poll_in_flight: AtomicBool::new(false),
            summary_in_flight: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            view_tx,
        }
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Replace the cache with everything inside the look-back window.
    pub async fn load_initial(&self) -> RefreshOutcome {
        let (epoch, ids) = {
            let state = self.state.read().await;
            if state.device_id.is_none() {
                return RefreshOutcome::NoDevice;
            }
            (state.epoch, state.circuit_ids())
        };

        let since = self.clock.now() - self.settings.lookback;
        let readings = match self
            .fetch_readings(&ids, since, self.settings.load_timeout)
            .await
        {
            Ok(readings) => readings,
            Err(outcome) => {
                warn!(?outcome, "Initial load failed; cache left unchanged");
                return outcome;
            }
        };

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return RefreshOutcome::Discarded;
        }
        let count = readings.len();
        let now = self.clock.now();
        state.cache.replace(readings.iter().cloned());
        state.cache.prune(now - self.settings.retention);
        state.cache.rebuild_index();
        self.update_states(&mut state, &readings, now);
        self.publish(&state, now);

        info!(
            readings = count,
            circuits = ids.len(),
            oldest = ?state.cache.oldest(),
            "Initial load complete"
        );
        RefreshOutcome::Applied { readings: count }
    }

    /// Merge readings from the recency window into the cache.
    ///
    /// At most one poll runs at a time; a call made while another is
    /// outstanding returns [`RefreshOutcome::Skipped`] without fetching.
    pub async fn poll_recent(&self) -> RefreshOutcome {
        let Some(_guard) = InFlight::try_acquire(&self.poll_in_flight) else {
            debug!("Previous poll still in flight; skipping tick");
            return RefreshOutcome::Skipped;
        };

        let (epoch, ids) = {
            let state = self.state.read().await;
            if state.device_id.is_none() {
                return RefreshOutcome::NoDevice;
            }
            (state.epoch, state.circuit_ids())
        };

        let since = self.clock.now() - self.settings.recent_window;
        let batch = match self
            .fetch_readings(&ids, since, self.settings.poll_timeout)
            .await
        {
            Ok(batch) => batch,
            Err(outcome) => return outcome,
        };

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            debug!("Device selection changed during poll; discarding batch");
            return RefreshOutcome::Discarded;
        }
        let now = self.clock.now();
        let added = state.cache.merge(batch.iter().cloned());
        let evicted = state.cache.prune(now - self.settings.retention);
        state.cache.rebuild_index();
        self.update_states(&mut state, &batch, now);
        self.publish(&state, now);

        debug!(fetched = batch.len(), added, evicted, cached = state.cache.len(), "Poll merged");
        RefreshOutcome::Applied { readings: batch.len() }
    }

    /// Reload the hourly consumption rows behind the daily and hourly summaries.
    pub async fn refresh_summaries(&self) -> RefreshOutcome {
        let Some(_guard) = InFlight::try_acquire(&self.summary_in_flight) else {
            return RefreshOutcome::Skipped;
        };

        let (epoch, ids) = {
            let state = self.state.read().await;
            if state.device_id.is_none() {
                return RefreshOutcome::NoDevice;
            }
            (state.epoch, state.circuit_ids())
        };
        if ids.is_empty() {
            return RefreshOutcome::Applied { readings: 0 };
        }

        let today = self
            .clock
            .now()
            .with_timezone(&self.settings.local_offset)
            .date_naive();
        let back = TimeDelta::days(i64::from(self.settings.summary_days.saturating_sub(1)));
        let since = today.checked_sub_signed(back).unwrap_or(today);

        let fetched = time::timeout(
            self.settings.poll_timeout,
            self.source.hourly_consumption_since(&ids, since),
        )
        .await;
        let rows = match fetched {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to refresh consumption summaries");
                return RefreshOutcome::Failed;
            }
            Err(_) => {
                warn!("Consumption summary refresh timed out");
                return RefreshOutcome::TimedOut;
            }
        };

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return RefreshOutcome::Discarded;
        }
        let count = rows.len();
        state.hourly = rows;
        self.publish(&state, self.clock.now());
        RefreshOutcome::Applied { readings: count }
    }

    async fn fetch_readings(
        &self,
        ids: &[String],
        since: DateTime<Utc>,
        limit: Duration,
    ) -> Result<Vec<Reading>, RefreshOutcome> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        match time::timeout(limit, self.source.readings_since(ids, since)).await {
            Ok(Ok(readings)) => Ok(readings),
            Ok(Err(e)) => {
                warn!(error = %e, since = %since, "Failed to fetch readings");
                Err(RefreshOutcome::Failed)
            }
            Err(_) => {
                debug!(timeout_ms = limit.as_millis() as u64, "Readings fetch timed out");
                Err(RefreshOutcome::TimedOut)
            }
        }
    }

    fn update_states(&self, state: &mut State, batch: &[Reading], now: DateTime<Utc>) {
        state.circuit_states = view::circuit_states(
            &state.cache,
            batch,
            &state.circuits,
            now,
            self.settings.recent_window,
            self.settings.active_threshold_w,
        );
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    fn build_view(&self, state: &State, now: DateTime<Utc>) -> ViewModel {
        let s = &self.settings;
        let ids = state.rendered_ids();
        let active = ids
            .iter()
            .any(|id| state.circuit_states.get(id).copied().unwrap_or(false));

        let local_now = now.with_timezone(&s.local_offset).naive_local();
        let today = local_now.date();
        let hourly: Vec<HourlyConsumption> = state
            .hourly
            .iter()
            .filter(|r| ids.contains(&r.circuit_id))
            .cloned()
            .collect();

        ViewModel {
            rendered_at: Some(now),
            device_id: state.device_id.clone(),
            view_mode: state.view_mode.clone(),
            power_series: view::minute_buckets(&state.cache, &ids, now, s.local_offset, s.window_minutes),
            today: view::today_summary(&state.cache, &state.view_mode, &ids, now, s.local_offset, active),
            latest: state.cache.latest(&ids).cloned(),
            circuits: state.statuses(),
            daily_energy: summaries::daily_energy(&hourly, today, s.summary_days),
            hourly_cost: summaries::hourly_cost(&hourly, local_now, s.cost_per_kwh),
            comparison: summaries::comparison(&hourly, today),
        }
    }

    fn publish(&self, state: &State, now: DateTime<Utc>) -> ViewModel {
        let view = self.build_view(state, now);
        self.view_tx.send_replace(view.clone());
        view
    }

    /// Recompute the view model from the current cache and publish it.
    pub async fn render(&self) -> ViewModel {
        let state = self.state.read().await;
        self.publish(&state, self.clock.now())
    }

    /// Last published view model.
    pub fn view(&self) -> ViewModel {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.view_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Switch between the aggregate and single-circuit slice. No I/O.
    pub async fn set_view_mode(&self, mode: ViewMode) -> Result<ViewModel, ViewModeError> {
        let mut state = self.state.write().await;
        if let ViewMode::Single { circuit_id } = &mode {
            if !state.circuits.iter().any(|c| &c.id == circuit_id) {
                return Err(ViewModeError::UnknownCircuit(circuit_id.clone()));
            }
        }
        debug!(mode = ?mode, "View mode changed");
        state.view_mode = mode;
        Ok(self.publish(&state, self.clock.now()))
    }

    /// Make `device_id` the active device and reload everything for it.
    ///
    /// If its circuits cannot be fetched the previous selection is kept. When
    /// calls overlap, the one made last wins and earlier ones return
    /// [`RefreshOutcome::Discarded`].
    pub async fn select_device(&self, device_id: &str) -> RefreshOutcome {
        let selection = {
            let mut state = self.state.write().await;
            state.selection += 1;
            state.selection
        };

        let fetched = time::timeout(
            self.settings.load_timeout,
            self.source.circuits_for_device(device_id),
        )
        .await;
        let circuits = match fetched {
            Ok(Ok(circuits)) => circuits,
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Failed to fetch circuits; keeping previous device");
                return RefreshOutcome::Failed;
            }
            Err(_) => {
                warn!(device_id = %device_id, "Circuit fetch timed out; keeping previous device");
                return RefreshOutcome::TimedOut;
            }
        };

        {
            let mut state = self.state.write().await;
            if state.selection != selection {
                debug!(device_id = %device_id, "Superseded by a later device selection");
                return RefreshOutcome::Discarded;
            }
            state.epoch += 1;
            state.device_id = Some(device_id.to_owned());
            state.circuits = circuits;
            state.view_mode = ViewMode::Aggregate;
            state.cache.clear();
            state.circuit_states.clear();
            state.hourly.clear();
            info!(device_id = %device_id, circuits = state.circuits.len(), "Device selected");
            self.publish(&state, self.clock.now());
        }

        let outcome = self.load_initial().await;
        self.refresh_summaries().await;
        outcome
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin serving: load the selected device (if any) and start polling
    /// unless the view is hidden.
    pub async fn start(self: &Arc<Self>) {
        let (transition, has_device) = {
            let mut state = self.state.write().await;
            state.running = true;
            state.transition += 1;
            (state.transition, state.device_id.is_some())
        };
        info!("Aggregator started");

        if has_device && self.load_initial().await != RefreshOutcome::Discarded {
            self.refresh_summaries().await;
        }
        self.resume_polling(transition).await;
    }

    /// Stop polling and discard the cache and derived views.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            state.running = false;
            state.transition += 1;
            state.epoch += 1;
            state.cache.clear();
            state.circuit_states.clear();
            state.hourly.clear();
            self.publish(&state, self.clock.now());
        }
        self.stop_polling().await;
        info!("Aggregator stopped");
    }

    /// Start the fixed-interval poll timer, replacing any running one.
    ///
    /// Each tick runs a poll and a summary refresh on their own task, so a
    /// slow fetch never delays the timer.
    pub async fn start_polling(self: &Arc<Self>) {
        let mut task = self.poll_task.lock().await;
        self.spawn_timer(&mut task);
    }

    /// Start the timer unless the aggregator was stopped or hidden since
    /// `transition`, or is not running and visible now.
    ///
    /// The state is read under the timer lock, so a concurrent `stop` or
    /// hide either prevents the start or aborts the timer afterwards.
    async fn resume_polling(self: &Arc<Self>, transition: u64) {
        let mut task = self.poll_task.lock().await;
        {
            let state = self.state.read().await;
            if state.transition != transition || !state.running || !state.visible {
                debug!("Stopped or hidden during reload; polling stays off");
                return;
            }
        }
        self.spawn_timer(&mut task);
    }

    fn spawn_timer(self: &Arc<Self>, task: &mut Option<JoinHandle<()>>) {
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(self);
        let period = self.settings.poll_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    tokio::join!(this.poll_recent(), this.refresh_summaries());
                });
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Polling started");
    }

    /// Cancel the poll timer. A fetch already in flight still completes.
    pub async fn stop_polling(&self) {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
            info!("Polling stopped");
        }
    }

    pub async fn is_polling(&self) -> bool {
        self.poll_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Hidden suspends polling; visible reloads the look-back window and resumes.
    pub async fn set_visibility(self: &Arc<Self>, visible: bool) {
        let (transition, running) = {
            let mut state = self.state.write().await;
            state.visible = visible;
            state.transition += 1;
            (state.transition, state.running)
        };

        if !visible {
            info!("View hidden; suspending polling");
            self.stop_polling().await;
            return;
        }
        if running {
            info!("View visible; reloading");
            self.load_initial().await;
            self.resume_polling(transition).await;
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub async fn device_id(&self) -> Option<String> {
        self.state.read().await.device_id.clone()
    }

    pub async fn view_mode(&self) -> ViewMode {
        self.state.read().await.view_mode.clone()
    }

    pub async fn is_visible(&self) -> bool {
        self.state.read().await.visible
    }

    /// Circuits of the active device with their current on/off state.
    pub async fn circuits(&self) -> Vec<CircuitStatus> {
        self.state.read().await.statuses()
    }

    /// Snapshot of the cache, ordered by `(circuit_id, timestamp)`.
    pub async fn cached_readings(&self) -> Vec<Reading> {
        self.state.read().await.cache.all().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::{clock::ManualClock, source::testing::FakeSource};

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, hour, minute, second).unwrap()
    }

    fn reading(circuit_id: &str, ts: DateTime<Utc>, power: f64) -> Reading {
        Reading {
            circuit_id: circuit_id.to_owned(),
            timestamp: ts,
            power,
            energy: 0.0,
            voltage: 120.0,
            current: power / 120.0,
            frequency: 60.0,
            power_factor: Some(0.95),
        }
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings {
            // Tests drive refreshes by hand.
            poll_interval: Duration::from_secs(3600),
            load_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(100),
            window_minutes: 2,
            local_offset: FixedOffset::east_opt(0).unwrap(),
            ..AggregatorSettings::default()
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        clock: Arc<ManualClock>,
        aggregator: Arc<TelemetryAggregator>,
    }

    fn harness(now: DateTime<Utc>) -> Harness {
        harness_with(now, settings())
    }

    /// Fetches held open by the fake source must not hit the short test timeouts.
    fn patient() -> AggregatorSettings {
        AggregatorSettings {
            load_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(5),
            ..settings()
        }
    }

    fn harness_with(now: DateTime<Utc>, settings: AggregatorSettings) -> Harness {
        let source = Arc::new(
            FakeSource::new()
                .with_device("d1", &["c1", "c2"])
                .with_device("d2", &["c9"]),
        );
        let clock = Arc::new(ManualClock::new(now));
        let aggregator = Arc::new(TelemetryAggregator::new(
            source.clone(),
            clock.clone(),
            settings,
        ));
        Harness { source, clock, aggregator }
    }

    #[tokio::test]
    async fn load_renders_minute_window() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 0, 0), 100.0), reading("c1", at(9, 1, 0), 0.0)]);

        let outcome = h.aggregator.select_device("d1").await;
        assert_eq!(outcome, RefreshOutcome::Applied { readings: 2 });

        let view = h.aggregator.view();
        let series: Vec<(&str, f64)> = view
            .power_series
            .iter()
            .map(|b| (b.label.as_str(), b.value))
            .collect();
        assert_eq!(series, vec![("09:00", 100.0), ("09:01", 0.0)]);
        assert_eq!(view.latest.unwrap().timestamp, at(9, 1, 0));
        assert_eq!(view.device_id.as_deref(), Some("d1"));
        assert_eq!(h.source.last_since(), Some(at(8, 51, 30)));
    }

    #[tokio::test]
    async fn load_without_device_does_nothing() {
        let h = harness(at(9, 0, 0));
        assert_eq!(h.aggregator.load_initial().await, RefreshOutcome::NoDevice);
        assert_eq!(h.aggregator.poll_recent().await, RefreshOutcome::NoDevice);
        assert_eq!(h.source.reading_calls(), 0);
    }

    #[tokio::test]
    async fn failed_load_leaves_cache_unchanged() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 0, 0), 100.0)]);
        h.aggregator.select_device("d1").await;
        let before = h.aggregator.cached_readings().await;

        h.source.push([reading("c1", at(9, 1, 0), 5.0)]);
        h.source.set_failing(true);
        assert_eq!(h.aggregator.load_initial().await, RefreshOutcome::Failed);
        assert_eq!(h.aggregator.poll_recent().await, RefreshOutcome::Failed);
        assert_eq!(h.aggregator.cached_readings().await, before);
    }

    #[tokio::test]
    async fn timed_out_load_leaves_cache_unchanged() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 0, 0), 100.0)]);
        h.aggregator.select_device("d1").await;

        h.source.push([reading("c2", at(9, 1, 0), 5.0)]);
        h.source.set_delay(Some(Duration::from_millis(500)));
        assert_eq!(h.aggregator.load_initial().await, RefreshOutcome::TimedOut);
        assert_eq!(h.aggregator.cached_readings().await.len(), 1);
    }

    #[tokio::test]
    async fn later_poll_wins_for_same_key() {
        let h = harness(at(9, 2, 5));
        h.aggregator.select_device("d1").await;

        h.source.push([reading("c1", at(9, 2, 0), 50.0)]);
        h.aggregator.poll_recent().await;
        h.source.push([reading("c1", at(9, 2, 0), 80.0)]);
        h.aggregator.poll_recent().await;

        let cached = h.aggregator.cached_readings().await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].power, 80.0);
    }

    #[tokio::test]
    async fn poll_is_skipped_while_another_is_in_flight() {
        let h = harness(at(9, 0, 10));
        h.aggregator.select_device("d1").await;
        h.source.push([reading("c1", at(9, 0, 5), 10.0)]);
        h.source.hold_readings();

        let first = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.poll_recent().await }
        });
        while h.source.reading_calls() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.aggregator.poll_recent().await, RefreshOutcome::Skipped);
        assert_eq!(h.source.reading_calls(), 2);

        h.source.release();
        assert_eq!(first.await.unwrap(), RefreshOutcome::Applied { readings: 1 });

        // The guard is released once the first poll finishes.
        h.source.release();
        assert_eq!(h.aggregator.poll_recent().await, RefreshOutcome::Applied { readings: 1 });
    }

    #[tokio::test]
    async fn poll_prunes_to_retention() {
        let h = harness(at(9, 0, 0));
        h.source.push([reading("c1", at(8, 55, 0), 10.0), reading("c2", at(8, 59, 50), 3.0)]);
        h.aggregator.select_device("d1").await;
        assert_eq!(h.aggregator.cached_readings().await.len(), 2);

        h.clock.set(at(9, 55, 0));
        h.source.push([reading("c1", at(9, 54, 50), 20.0)]);
        h.aggregator.poll_recent().await;

        let now = h.clock.now();
        let cached = h.aggregator.cached_readings().await;
        assert_eq!(cached.len(), 2);
        assert!(cached.iter().all(|r| now - r.timestamp < TimeDelta::minutes(60)));

        h.clock.set(at(9, 59, 50));
        h.aggregator.poll_recent().await;
        let cached = h.aggregator.cached_readings().await;
        assert!(cached.iter().all(|r| r.timestamp > at(8, 59, 50)));
    }

    #[tokio::test]
    async fn view_mode_switch_performs_no_io() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 1, 0), 100.0), reading("c2", at(9, 1, 10), 40.0)]);
        h.aggregator.select_device("d1").await;
        let calls = (h.source.circuit_calls(), h.source.reading_calls(), h.source.hourly_calls());

        let single = h
            .aggregator
            .set_view_mode(ViewMode::Single { circuit_id: "c2".into() })
            .await
            .unwrap();
        assert_eq!(single.power_series[1].value, 40.0);

        let aggregate = h.aggregator.set_view_mode(ViewMode::Aggregate).await.unwrap();
        assert_eq!(aggregate.power_series[1].value, 140.0);

        assert_eq!(
            (h.source.circuit_calls(), h.source.reading_calls(), h.source.hourly_calls()),
            calls
        );
    }

    #[tokio::test]
    async fn unknown_circuit_is_rejected() {
        let h = harness(at(9, 0, 0));
        h.aggregator.select_device("d1").await;

        let err = h
            .aggregator
            .set_view_mode(ViewMode::Single { circuit_id: "c9".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ViewModeError::UnknownCircuit(id) if id == "c9"));
        assert_eq!(h.aggregator.view_mode().await, ViewMode::Aggregate);
    }

    #[tokio::test]
    async fn selecting_device_reloads_and_resets_mode() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 1, 0), 100.0), reading("c9", at(9, 1, 0), 7.0)]);
        h.aggregator.select_device("d1").await;
        h.aggregator
            .set_view_mode(ViewMode::Single { circuit_id: "c1".into() })
            .await
            .unwrap();

        h.aggregator.select_device("d2").await;

        assert_eq!(h.aggregator.view_mode().await, ViewMode::Aggregate);
        let cached = h.aggregator.cached_readings().await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].circuit_id, "c9");
        let ids: Vec<String> = h.aggregator.circuits().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c9"]);
    }

    #[tokio::test]
    async fn failed_device_switch_keeps_previous_selection() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 1, 0), 100.0)]);
        h.aggregator.select_device("d1").await;

        h.source.set_failing(true);
        assert_eq!(h.aggregator.select_device("d2").await, RefreshOutcome::Failed);
        assert_eq!(h.aggregator.device_id().await.as_deref(), Some("d1"));
        assert_eq!(h.aggregator.cached_readings().await.len(), 1);
    }

    #[tokio::test]
    async fn poll_started_before_device_switch_is_discarded() {
        let h = harness(at(9, 0, 10));
        h.source.push([reading("c1", at(9, 0, 5), 10.0)]);
        h.aggregator.select_device("d1").await;
        h.source.hold_readings();

        let poll = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.poll_recent().await }
        });
        while h.source.reading_calls() < 2 {
            tokio::task::yield_now().await;
        }

        let switch = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.select_device("d2").await }
        });
        while h.source.circuit_calls() < 2 || h.aggregator.device_id().await.as_deref() != Some("d2") {
            tokio::task::yield_now().await;
        }

        h.source.release();
        assert_eq!(poll.await.unwrap(), RefreshOutcome::Discarded);
        h.source.release();
        switch.await.unwrap();
        assert!(h.aggregator.cached_readings().await.iter().all(|r| r.circuit_id == "c9"));
    }

    #[tokio::test]
    async fn latest_device_selection_wins() {
        let h = harness_with(at(9, 1, 30), patient());
        h.source.push([reading("c1", at(9, 1, 0), 100.0), reading("c9", at(9, 1, 0), 7.0)]);
        h.source.hold_circuits("d1");

        let first = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.select_device("d1").await }
        });
        while h.source.circuit_calls() < 1 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.aggregator.select_device("d2").await, RefreshOutcome::Applied { readings: 1 });
        h.source.release_circuits();
        assert_eq!(first.await.unwrap(), RefreshOutcome::Discarded);

        assert_eq!(h.aggregator.device_id().await.as_deref(), Some("d2"));
        let ids: Vec<String> = h.aggregator.circuits().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c9"]);
        assert!(h.aggregator.cached_readings().await.iter().all(|r| r.circuit_id == "c9"));
    }

    #[tokio::test]
    async fn summary_refresh_is_skipped_while_another_is_in_flight() {
        let h = harness_with(at(10, 15, 0), patient());
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        h.source.push_hourly([HourlyConsumption { circuit_id: "c1".into(), date: today, hour: 9, energy_kwh: 1.0 }]);
        h.aggregator.select_device("d1").await;
        h.source.hold_hourly();
        let calls = h.source.hourly_calls();

        let first = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.refresh_summaries().await }
        });
        while h.source.hourly_calls() == calls {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.aggregator.refresh_summaries().await, RefreshOutcome::Skipped);
        assert_eq!(h.source.hourly_calls(), calls + 1);

        h.source.release_hourly();
        assert_eq!(first.await.unwrap(), RefreshOutcome::Applied { readings: 1 });

        h.source.release_hourly();
        assert_eq!(h.aggregator.refresh_summaries().await, RefreshOutcome::Applied { readings: 1 });
    }

    #[tokio::test]
    async fn failed_summary_refresh_keeps_previous_rows() {
        let h = harness(at(10, 15, 0));
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        h.source.push_hourly([HourlyConsumption { circuit_id: "c1".into(), date: today, hour: 9, energy_kwh: 1.0 }]);
        h.aggregator.select_device("d1").await;
        assert!((h.aggregator.view().comparison.today_kwh - 1.0).abs() < 1e-9);

        h.source.push_hourly([HourlyConsumption { circuit_id: "c1".into(), date: today, hour: 10, energy_kwh: 2.0 }]);
        h.source.set_failing(true);
        assert_eq!(h.aggregator.refresh_summaries().await, RefreshOutcome::Failed);

        h.source.set_failing(false);
        h.source.set_delay(Some(Duration::from_millis(500)));
        assert_eq!(h.aggregator.refresh_summaries().await, RefreshOutcome::TimedOut);
        h.source.set_delay(None);

        let view = h.aggregator.render().await;
        assert!((view.comparison.today_kwh - 1.0).abs() < 1e-9);
        assert!((view.hourly_cost.hours[9].cost - 650.0).abs() < 1e-9);
        assert_eq!(view.hourly_cost.hours[10].cost, 0.0);
    }

    #[tokio::test]
    async fn summary_refresh_started_before_device_switch_is_discarded() {
        let h = harness_with(at(10, 15, 0), patient());
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        h.source.push_hourly([HourlyConsumption { circuit_id: "c1".into(), date: today, hour: 9, energy_kwh: 1.0 }]);
        h.aggregator.select_device("d1").await;
        h.source.hold_hourly();
        let calls = h.source.hourly_calls();

        let refresh = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.refresh_summaries().await }
        });
        while h.source.hourly_calls() == calls {
            tokio::task::yield_now().await;
        }

        // The switch's own summary refresh is skipped while the held one is in flight.
        h.aggregator.select_device("d2").await;
        h.source.release_hourly();
        assert_eq!(refresh.await.unwrap(), RefreshOutcome::Discarded);
        assert_eq!(h.aggregator.view().comparison.today_kwh, 0.0);
    }

    #[tokio::test]
    async fn hiding_during_visible_reload_keeps_polling_off() {
        let h = harness_with(at(9, 0, 10), patient());
        h.source.push([reading("c1", at(9, 0, 5), 10.0)]);
        h.aggregator.select_device("d1").await;
        h.aggregator.start().await;
        h.aggregator.set_visibility(false).await;
        h.source.hold_readings();
        let calls = h.source.reading_calls();

        let show = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.set_visibility(true).await }
        });
        while h.source.reading_calls() == calls {
            tokio::task::yield_now().await;
        }

        h.aggregator.set_visibility(false).await;
        h.source.release();
        show.await.unwrap();

        assert!(!h.aggregator.is_visible().await);
        assert!(!h.aggregator.is_polling().await);
    }

    #[tokio::test]
    async fn stopping_during_visible_reload_keeps_polling_off() {
        let h = harness_with(at(9, 0, 10), patient());
        h.source.push([reading("c1", at(9, 0, 5), 10.0)]);
        h.aggregator.select_device("d1").await;
        h.aggregator.start().await;
        h.aggregator.set_visibility(false).await;
        h.source.hold_readings();
        let calls = h.source.reading_calls();

        let show = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.set_visibility(true).await }
        });
        while h.source.reading_calls() == calls {
            tokio::task::yield_now().await;
        }

        h.aggregator.stop().await;
        h.source.release();
        show.await.unwrap();

        assert!(!h.aggregator.is_polling().await);
        assert!(h.aggregator.cached_readings().await.is_empty());
    }

    #[tokio::test]
    async fn stopping_during_start_keeps_polling_off() {
        let h = harness_with(at(9, 0, 10), patient());
        h.source.push([reading("c1", at(9, 0, 5), 10.0)]);
        h.aggregator.select_device("d1").await;
        h.source.hold_readings();
        let calls = h.source.reading_calls();
        let hourly_calls = h.source.hourly_calls();

        let start = tokio::spawn({
            let aggregator = h.aggregator.clone();
            async move { aggregator.start().await }
        });
        while h.source.reading_calls() == calls {
            tokio::task::yield_now().await;
        }

        h.aggregator.stop().await;
        h.source.release();
        start.await.unwrap();

        assert!(!h.aggregator.is_polling().await);
        assert!(h.aggregator.cached_readings().await.is_empty());
        // The discarded load also skips the summary refresh.
        assert_eq!(h.source.hourly_calls(), hourly_calls);
    }

    #[tokio::test]
    async fn hidden_then_visible_reloads_lookback_window() {
        let h = harness(at(9, 0, 0));
        h.source.push([reading("c1", at(8, 55, 0), 10.0)]);
        h.aggregator.select_device("d1").await;
        h.aggregator.start().await;
        assert!(h.aggregator.is_polling().await);

        h.aggregator.set_visibility(false).await;
        assert!(!h.aggregator.is_polling().await);
        assert!(!h.aggregator.is_visible().await);

        h.clock.advance(TimeDelta::minutes(30));
        h.source.push([reading("c1", at(9, 25, 0), 30.0), reading("c2", at(9, 29, 0), 5.0)]);
        let calls = h.source.reading_calls();
        h.aggregator.set_visibility(true).await;

        assert_eq!(h.source.reading_calls(), calls + 1);
        let lookback_start = at(9, 20, 0);
        assert_eq!(h.source.last_since(), Some(lookback_start));
        let cached = h.aggregator.cached_readings().await;
        assert_eq!(cached.len(), 2);
        assert!(cached.iter().all(|r| r.timestamp >= lookback_start));
        assert!(h.aggregator.is_polling().await);

        h.aggregator.stop().await;
    }

    #[tokio::test]
    async fn starting_twice_keeps_a_single_timer() {
        let h = harness(at(9, 0, 0));
        h.aggregator.start().await;
        h.aggregator.start().await;
        h.aggregator.start_polling().await;
        assert!(h.aggregator.is_polling().await);

        h.aggregator.stop_polling().await;
        assert!(!h.aggregator.is_polling().await);
        h.aggregator.stop_polling().await;
        assert!(!h.aggregator.is_polling().await);
    }

    #[tokio::test]
    async fn timer_drives_polls() {
        let source = Arc::new(FakeSource::new().with_device("d1", &["c1"]));
        let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
        let aggregator = Arc::new(TelemetryAggregator::new(
            source.clone(),
            clock,
            AggregatorSettings { poll_interval: Duration::from_millis(10), ..settings() },
        ));
        aggregator.select_device("d1").await;
        aggregator.start().await;

        let calls = source.reading_calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.reading_calls() > calls + 1);
        aggregator.stop().await;
    }

    #[tokio::test]
    async fn stop_discards_cache() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 1, 0), 100.0)]);
        h.aggregator.select_device("d1").await;
        h.aggregator.start().await;

        h.aggregator.stop().await;
        assert!(!h.aggregator.is_polling().await);
        assert!(h.aggregator.cached_readings().await.is_empty());
        assert!(h.aggregator.view().latest.is_none());
    }

    #[tokio::test]
    async fn circuit_states_follow_recent_power() {
        let h = harness(at(9, 0, 30));
        h.source.push([
            reading("c1", at(9, 0, 20), 60.0),
            reading("c2", at(9, 0, 0), 60.0),
            reading("c2", at(9, 0, 25), 0.1),
        ]);
        h.aggregator.select_device("d1").await;

        let states: Vec<(String, bool)> = h
            .aggregator
            .circuits()
            .await
            .into_iter()
            .map(|c| (c.id, c.active))
            .collect();
        assert_eq!(states, vec![("c1".to_owned(), true), ("c2".to_owned(), false)]);
        assert!(h.aggregator.view().today.active);
    }

    #[tokio::test]
    async fn summaries_are_restricted_to_rendered_slice() {
        let h = harness(at(10, 15, 0));
        let today = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        h.source.push_hourly([
            HourlyConsumption { circuit_id: "c1".into(), date: today, hour: 9, energy_kwh: 1.0 },
            HourlyConsumption { circuit_id: "c2".into(), date: today, hour: 9, energy_kwh: 0.5 },
        ]);
        h.aggregator.select_device("d1").await;

        let view = h.aggregator.view();
        assert_eq!(view.hourly_cost.hours.len(), 11);
        assert!((view.hourly_cost.hours[9].cost - 975.0).abs() < 1e-9);
        assert!((view.comparison.today_kwh - 1.5).abs() < 1e-9);

        let single = h
            .aggregator
            .set_view_mode(ViewMode::Single { circuit_id: "c2".into() })
            .await
            .unwrap();
        assert!((single.daily_energy.days.last().unwrap().energy_kwh - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn render_slides_window_without_fetching() {
        let h = harness(at(9, 1, 30));
        h.source.push([reading("c1", at(9, 1, 0), 100.0)]);
        h.aggregator.select_device("d1").await;
        let calls = h.source.reading_calls();

        h.clock.advance(TimeDelta::minutes(1));
        let view = h.aggregator.render().await;

        let labels: Vec<&str> = view.power_series.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["09:01", "09:02"]);
        assert_eq!(view.power_series[0].value, 100.0);
        assert_eq!(h.source.reading_calls(), calls);
        assert_eq!(h.aggregator.view(), view);
    }

    #[tokio::test]
    async fn subscribers_see_new_views() {
        let h = harness(at(9, 1, 30));
        let mut rx = h.aggregator.subscribe();
        h.source.push([reading("c1", at(9, 1, 0), 100.0)]);
        h.aggregator.select_device("d1").await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().latest.as_ref().unwrap().power, 100.0);
    }
}
