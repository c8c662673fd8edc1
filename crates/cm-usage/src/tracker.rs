use chrono::{DateTime, Local, NaiveDate};
use cm_config::{MentorConfig, ModelLimits, ModelTable};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::client::{persisted_from_snapshot, UsageBackend};
use crate::metrics;
use crate::record::{AlertLevel, CallEvent};
use crate::reducer::{reduce, UsageAction};
use crate::state::UsageState;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub model: String,
    pub models: ModelTable,
    pub metrics_interval: Duration,
    pub auto_reset: bool,
}

impl TrackerOptions {
    pub fn from_config(config: &MentorConfig) -> Self {
        Self {
            model: config.model.clone(),
            models: config.model_table(),
            metrics_interval: Duration::from_secs(config.metrics_interval_secs),
            auto_reset: config.auto_reset,
        }
    }
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::from_config(&MentorConfig::default())
    }
}

struct Ticker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Owns the session's [`UsageState`] and is the only place that performs
/// usage I/O. Reducer transitions run synchronously under a short lock;
/// syncing with the backend happens on spawned tasks.
pub struct UsageTracker {
    state: Arc<Mutex<UsageState>>,
    models: ModelTable,
    options: TrackerOptions,
    backend: Arc<dyn UsageBackend>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    ticker: Option<Ticker>,
}

fn lock_state(state: &Mutex<UsageState>) -> MutexGuard<'_, UsageState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `action` at `now`, then refresh the derived time metrics.
fn dispatch(
    state: &mut UsageState,
    models: &ModelTable,
    action: UsageAction,
    now: DateTime<Local>,
) {
    let next = reduce(std::mem::take(state), action, now);
    let timezone = models.config_for(&next.current_model).reset_timezone;
    let metrics = metrics::compute(&next, timezone, now);
    *state = reduce(next, UsageAction::UpdateTimeMetrics(metrics), now);
}

/// One ticker step: reset when the local date has moved past `day`,
/// otherwise recompute the time metrics.
fn tick(
    state: &Mutex<UsageState>,
    models: &ModelTable,
    auto_reset: bool,
    day: &mut NaiveDate,
    now: DateTime<Local>,
) {
    let today = now.date_naive();
    let mut guard = lock_state(state);
    if auto_reset && today > *day {
        tracing::info!("Local date changed to {}, resetting daily usage counter", today);
        *day = today;
        dispatch(&mut guard, models, UsageAction::ResetDailyCounter, now);
    } else {
        let timezone = models.config_for(&guard.current_model).reset_timezone;
        guard.metrics = metrics::compute(&guard, timezone, now);
    }
}

async fn run_ticker(
    state: Weak<Mutex<UsageState>>,
    models: ModelTable,
    period: Duration,
    auto_reset: bool,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first tick (immediate)
    timer.tick().await;
    let mut day = Local::now().date_naive();

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Some(state) = state.upgrade() else {
                    break;
                };
                tick(&state, &models, auto_reset, &mut day, Local::now());
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }
    tracing::debug!("usage metrics ticker stopped");
}

impl UsageTracker {
    /// Build a tracker for the configured model without touching the backend.
    pub fn new(options: TrackerOptions, backend: Arc<dyn UsageBackend>) -> Self {
        let models = options.models.clone();
        let daily_limit = models.limit_for(&options.model);
        if models.get(&options.model).is_none() {
            tracing::warn!(
                "Unknown model {}, using default limit of {} calls",
                options.model,
                daily_limit
            );
        }

        let mut state = UsageState::default();
        dispatch(
            &mut state,
            &models,
            UsageAction::Initialize {
                model: options.model.clone(),
                daily_limit,
            },
            Local::now(),
        );
        tracing::info!(model = %options.model, daily_limit, "usage tracker initialized");

        Self {
            state: Arc::new(Mutex::new(state)),
            models,
            options,
            backend,
            pending: Mutex::new(Vec::new()),
            ticker: None,
        }
    }

    /// Initialize, load the persisted snapshot, and start the metrics ticker.
    pub async fn start(options: TrackerOptions, backend: Arc<dyn UsageBackend>) -> Self {
        let mut tracker = Self::new(options, backend);
        tracker.load_persisted().await;
        tracker.start_ticker();
        tracker
    }

    /// Merge the backend snapshot. Failures are logged and the defaults kept.
    pub async fn load_persisted(&self) {
        match self.backend.fetch_snapshot().await {
            Ok(snapshot) => {
                self.apply(UsageAction::LoadPersistedData(persisted_from_snapshot(
                    &snapshot,
                )));
                tracing::info!(
                    calls_today = self.state().calls_today,
                    "loaded persisted usage"
                );
            }
            Err(e) => {
                tracing::warn!("Failed to load usage stats: {}", e);
            }
        }
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_ticker(
            Arc::downgrade(&self.state),
            self.models.clone(),
            self.options.metrics_interval,
            self.options.auto_reset,
            shutdown_rx,
        ));
        self.ticker = Some(Ticker {
            shutdown_tx: Some(shutdown_tx),
            handle,
        });
    }

    fn apply(&self, action: UsageAction) {
        let mut guard = lock_state(&self.state);
        dispatch(&mut guard, &self.models, action, Local::now());
    }

    /// Count a call locally, then sync it to the backend in the background.
    /// Sync failures are logged; the local count is never rolled back.
    pub fn record_api_call(&self, operation: &str, success: bool, response_time: Option<u64>) {
        let model = {
            let mut guard = lock_state(&self.state);
            dispatch(
                &mut guard,
                &self.models,
                UsageAction::RecordCall {
                    operation: operation.to_string(),
                    success,
                    response_time,
                },
                Local::now(),
            );
            tracing::debug!(
                calls_today = guard.calls_today,
                alert_level = guard.alert_level.as_str(),
                "recorded {} call",
                operation
            );
            guard.current_model.clone()
        };

        let event = CallEvent {
            model,
            operation: operation.to_string(),
            success,
            response_time,
            tokens_in: None,
            tokens_out: None,
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No async runtime available, {} call not synced", event.operation);
                return;
            }
        };
        let backend = Arc::clone(&self.backend);
        let task = runtime.spawn(async move {
            if let Err(e) = backend.record_call(&event).await {
                tracing::warn!("Failed to sync API call: {}", e);
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(task);
    }

    pub fn update_model(&self, model: &str) {
        let daily_limit = self.models.limit_for(model);
        self.apply(UsageAction::UpdateModel {
            model: model.to_string(),
            daily_limit,
        });
        tracing::info!(model, daily_limit, "switched usage model");
    }

    pub fn dismiss_warning(&self) {
        self.apply(UsageAction::DismissWarning);
    }

    pub fn reset_daily_counter(&self) {
        self.apply(UsageAction::ResetDailyCounter);
    }

    pub fn set_alert_level(&self, level: AlertLevel, show_warning: Option<bool>) {
        self.apply(UsageAction::SetAlertLevel {
            level,
            show_warning,
        });
    }

    /// Point-in-time copy of the full usage state.
    pub fn state(&self) -> UsageState {
        lock_state(&self.state).clone()
    }

    pub fn usage_percentage(&self) -> f64 {
        lock_state(&self.state).usage_percentage()
    }

    pub fn is_near_limit(&self) -> bool {
        lock_state(&self.state).is_near_limit()
    }

    pub fn can_make_call(&self) -> bool {
        lock_state(&self.state).can_make_call()
    }

    pub fn current_model_config(&self) -> ModelLimits {
        let model = lock_state(&self.state).current_model.clone();
        self.models.config_for(&model)
    }

    /// Wait for every in-flight sync to finish.
    pub async fn flush(&self) {
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!("Usage sync task failed: {}", e);
            }
        }
    }

    /// Stop the metrics ticker and drain pending syncs.
    pub async fn shutdown(mut self) {
        if let Some(mut ticker) = self.ticker.take() {
            if let Some(tx) = ticker.shutdown_tx.take() {
                let _ = tx.send(());
            }
            let _ = ticker.handle.await;
        }
        self.flush().await;
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncError;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::{json, Value};

    struct OfflineBackend;

    #[async_trait]
    impl UsageBackend for OfflineBackend {
        async fn fetch_snapshot(&self) -> Result<Value, SyncError> {
            Err(SyncError::Network("offline".to_string()))
        }

        async fn record_call(&self, _event: &CallEvent) -> Result<(), SyncError> {
            Err(SyncError::Network("offline".to_string()))
        }
    }

    fn morning() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap()
    }

    fn seeded(calls_today: u64) -> Mutex<UsageState> {
        let models = ModelTable::builtin();
        let mut state = UsageState::default();
        dispatch(
            &mut state,
            &models,
            UsageAction::Initialize {
                model: "gemini-2.5-flash".to_string(),
                daily_limit: 1500,
            },
            morning(),
        );
        dispatch(
            &mut state,
            &models,
            UsageAction::LoadPersistedData(json!({ "callsToday": calls_today })),
            morning(),
        );
        // leave metrics unset so a tick is observable
        state.metrics = metrics::TimeMetrics::default();
        Mutex::new(state)
    }

    #[test]
    fn tick_resets_after_local_date_change() {
        let state = seeded(1200);
        assert_eq!(lock_state(&state).alert_level, AlertLevel::Warning);
        let mut day = morning().date_naive() - ChronoDuration::days(1);

        tick(&state, &ModelTable::builtin(), true, &mut day, morning());

        let guard = lock_state(&state);
        assert_eq!(day, morning().date_naive());
        assert_eq!(guard.calls_today, 0);
        assert_eq!(guard.remaining_calls, 1500);
        assert_eq!(guard.alert_level, AlertLevel::Safe);
        assert!(!guard.show_warning);
        assert!(guard.last_reset_date.is_some());
        assert!(guard.metrics.time_until_reset.is_some());
    }

    #[test]
    fn tick_on_same_day_only_refreshes_metrics() {
        let state = seeded(40);
        let mut day = morning().date_naive();

        tick(&state, &ModelTable::builtin(), true, &mut day, morning());

        let guard = lock_state(&state);
        assert_eq!(guard.calls_today, 40);
        assert!(guard.last_reset_date.is_none());
        assert!(guard.metrics.time_until_reset.is_some());
    }

    #[test]
    fn tick_without_auto_reset_keeps_counts_across_days() {
        let state = seeded(40);
        let yesterday = morning().date_naive() - ChronoDuration::days(1);
        let mut day = yesterday;

        tick(&state, &ModelTable::builtin(), false, &mut day, morning());

        assert_eq!(day, yesterday);
        assert_eq!(lock_state(&state).calls_today, 40);
        assert!(lock_state(&state).metrics.next_reset_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_recomputes_each_period_until_signalled() {
        let state = Arc::new(seeded(3));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_ticker(
            Arc::downgrade(&state),
            ModelTable::builtin(),
            Duration::from_secs(60),
            true,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(lock_state(&state).metrics.time_until_reset.is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(lock_state(&state).metrics.time_until_reset.is_some());

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker should stop after the shutdown signal")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_once_state_is_gone() {
        let state = Arc::new(seeded(3));
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_ticker(
            Arc::downgrade(&state),
            ModelTable::builtin(),
            Duration::from_secs(60),
            true,
            shutdown_rx,
        ));
        drop(state);

        tokio::time::timeout(Duration::from_secs(120), handle)
            .await
            .expect("ticker should stop when the state is dropped")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_tracker_aborts_ticker() {
        let tracker =
            UsageTracker::start(TrackerOptions::default(), Arc::new(OfflineBackend)).await;
        let abort = tracker
            .ticker
            .as_ref()
            .map(|t| t.handle.abort_handle())
            .unwrap();
        assert!(!abort.is_finished());

        drop(tracker);
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_ticker() {
        let tracker =
            UsageTracker::start(TrackerOptions::default(), Arc::new(OfflineBackend)).await;
        assert!(tracker.ticker.is_some());
        tokio::time::timeout(Duration::from_secs(1), tracker.shutdown())
            .await
            .expect("shutdown should stop the ticker");
    }
}
