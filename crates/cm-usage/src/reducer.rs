//! Pure state transitions over [`UsageState`].
//!
//! `reduce` never performs I/O and never reads the clock; the caller passes
//! `now` so every transition is reproducible.

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use crate::metrics::TimeMetrics;
use crate::record::{AlertLevel, CallRecord};
use crate::state::{UsageState, HISTORY_LIMIT};

/// Largest `calls_today` the reducer keeps, so `remaining_calls` stays representable.
pub const MAX_CALLS: u64 = i64::MAX as u64;

#[derive(Debug, Clone, PartialEq)]
pub enum UsageAction {
    /// Select the active model at startup. `daily_limit` comes from the model table.
    Initialize { model: String, daily_limit: u32 },
    RecordCall {
        operation: String,
        success: bool,
        response_time: Option<u64>,
    },
    /// Switch models mid-day. Counters are kept against the new ceiling.
    UpdateModel { model: String, daily_limit: u32 },
    ResetDailyCounter,
    UpdateTimeMetrics(TimeMetrics),
    SetAlertLevel {
        level: AlertLevel,
        show_warning: Option<bool>,
    },
    DismissWarning,
    /// Merge an externally fetched snapshot with `callsToday` and `callHistory` keys.
    LoadPersistedData(Value),
}

/// Alert level for the given remaining calls. Exhaustion takes precedence
/// over the percentage thresholds; a zero limit is always safe.
pub fn alert_level_for(remaining_calls: i64, daily_limit: u32) -> AlertLevel {
    if daily_limit == 0 {
        return AlertLevel::Safe;
    }
    if remaining_calls <= 0 {
        return AlertLevel::Exhausted;
    }
    let limit = i64::from(daily_limit);
    let used = limit - remaining_calls;
    // used / limit >= pct / 100, kept in integers
    if used * 100 >= limit * 90 {
        AlertLevel::Critical
    } else if used * 100 >= limit * 75 {
        AlertLevel::Warning
    } else {
        AlertLevel::Safe
    }
}

pub fn reduce(mut state: UsageState, action: UsageAction, now: DateTime<Local>) -> UsageState {
    let now_utc = now.with_timezone(&Utc);
    match action {
        UsageAction::Initialize { model, daily_limit }
        | UsageAction::UpdateModel { model, daily_limit } => {
            state.current_model = model;
            state.daily_limit = daily_limit;
            rederive(&mut state);
        }
        UsageAction::RecordCall {
            operation,
            success,
            response_time,
        } => {
            state.calls_today = state.calls_today.saturating_add(1).min(MAX_CALLS);
            state.session_calls = state.session_calls.saturating_add(1);
            state.call_history.push(CallRecord {
                timestamp: now_utc,
                model: state.current_model.clone(),
                operation,
                success,
                response_time,
            });
            truncate_history(&mut state.call_history);
            state.last_call_time = Some(now_utc);
            rederive(&mut state);
        }
        UsageAction::ResetDailyCounter => {
            state.calls_today = 0;
            state.remaining_calls = i64::from(state.daily_limit);
            state.alert_level = AlertLevel::Safe;
            state.show_warning = false;
            state.last_reset_date = Some(now_utc);
            let today = now.date_naive();
            state
                .call_history
                .retain(|call| call.timestamp.with_timezone(&Local).date_naive() == today);
        }
        UsageAction::UpdateTimeMetrics(metrics) => {
            state.metrics = metrics;
        }
        UsageAction::SetAlertLevel {
            level,
            show_warning,
        } => {
            state.alert_level = level;
            if let Some(show) = show_warning {
                state.show_warning = show;
            }
        }
        UsageAction::DismissWarning => {
            state.show_warning = false;
        }
        UsageAction::LoadPersistedData(data) => {
            if let Some(calls) = data.get("callsToday").and_then(as_call_count) {
                state.calls_today = calls;
            }
            if let Some(items) = data.get("callHistory").and_then(Value::as_array) {
                state.call_history = decode_history(items);
            }
            state.session_calls = 0;
            rederive(&mut state);
        }
    }
    state
}

/// Recompute `remaining_calls` and `alert_level`, raising `show_warning`
/// only when the level leaves `safe`. The level never drops here; only
/// `ResetDailyCounter` lowers it.
fn rederive(state: &mut UsageState) {
    state.calls_today = state.calls_today.min(MAX_CALLS);
    let calls = i64::try_from(state.calls_today).unwrap_or(i64::MAX);
    state.remaining_calls = i64::from(state.daily_limit).saturating_sub(calls);
    let previous = state.alert_level;
    state.alert_level = previous.max(alert_level_for(state.remaining_calls, state.daily_limit));
    if previous == AlertLevel::Safe && state.alert_level != AlertLevel::Safe {
        state.show_warning = true;
    }
}

fn truncate_history(history: &mut Vec<CallRecord>) {
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// Whole, non-negative counts up to [`MAX_CALLS`]; anything else is rejected.
fn as_call_count(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return (n <= MAX_CALLS).then_some(n);
    }
    value
        .as_f64()
        // MAX_CALLS as f64 rounds up to 2^63
        .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f < MAX_CALLS as f64)
        .map(|f| f as u64)
}

/// Entries that do not decode are dropped; the result is chronological and bounded.
fn decode_history(items: &[Value]) -> Vec<CallRecord> {
    let mut history: Vec<CallRecord> = items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect();
    history.sort_by_key(|c| c.timestamp);
    truncate_history(&mut history);
    history
}
