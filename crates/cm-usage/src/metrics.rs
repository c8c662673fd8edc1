//! Reset countdown and burn-rate estimates derived from a [`UsageState`].

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use cm_config::ResetTimezone;
use serde::{Deserialize, Serialize};

use crate::record::CallRecord;
use crate::state::UsageState;

/// Countdown text shown once the reset instant has already passed.
pub const RESETTING: &str = "Resetting...";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeMetrics {
    pub next_reset_time: Option<DateTime<Utc>>,
    pub time_until_reset: Option<String>,
    /// Rounded to one decimal.
    pub average_calls_per_hour: f64,
    pub estimated_exhaustion_time: Option<DateTime<Utc>>,
}

/// Midnight at the start of the calendar day after `now`.
pub fn next_reset_after(now: DateTime<Local>, timezone: ResetTimezone) -> DateTime<Utc> {
    let fallback = now.with_timezone(&Utc) + Duration::days(1);
    match timezone {
        ResetTimezone::Local => next_midnight(now.date_naive())
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(fallback),
        ResetTimezone::Utc => next_midnight(now.with_timezone(&Utc).date_naive())
            .map(|naive| naive.and_utc())
            .unwrap_or(fallback),
    }
}

fn next_midnight(today: NaiveDate) -> Option<chrono::NaiveDateTime> {
    today.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// `{h}h {m}m`, `{m}m`, or [`RESETTING`] when `reset_at` is not in the future.
pub fn format_time_until_reset(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = reset_at - now;
    if diff <= Duration::zero() {
        return RESETTING.to_string();
    }
    let hours = diff.num_hours();
    let minutes = diff.num_minutes() % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Calls in the trailing 24 hours, spread over 24 hours. Unrounded.
pub fn average_calls_per_hour(history: &[CallRecord], now: DateTime<Utc>) -> f64 {
    let cutoff = now - Duration::hours(24);
    let recent = history.iter().filter(|c| c.timestamp > cutoff).count();
    recent as f64 / 24.0
}

/// Projected exhaustion instant, or `None` when idle or already exhausted.
pub fn estimate_exhaustion(
    remaining_calls: i64,
    calls_per_hour: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if calls_per_hour <= 0.0 || remaining_calls <= 0 {
        return None;
    }
    let hours = remaining_calls as f64 / calls_per_hour;
    let millis = (hours * 3_600_000.0).round();
    if !millis.is_finite() || millis > i64::MAX as f64 {
        return None;
    }
    now.checked_add_signed(Duration::milliseconds(millis as i64))
}

pub fn compute(state: &UsageState, timezone: ResetTimezone, now: DateTime<Local>) -> TimeMetrics {
    let now_utc = now.with_timezone(&Utc);
    let next_reset = next_reset_after(now, timezone);
    let rate = average_calls_per_hour(&state.call_history, now_utc);
    TimeMetrics {
        next_reset_time: Some(next_reset),
        time_until_reset: Some(format_time_until_reset(next_reset, now_utc)),
        average_calls_per_hour: (rate * 10.0).round() / 10.0,
        estimated_exhaustion_time: estimate_exhaustion(state.remaining_calls, rate, now_utc),
    }
}
