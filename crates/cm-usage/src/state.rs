use chrono::{DateTime, Utc};
use cm_config::{DEFAULT_DAILY_LIMIT, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};

use crate::metrics::TimeMetrics;
use crate::record::{AlertLevel, CallRecord};

/// Maximum number of calls kept in [`UsageState::call_history`].
pub const HISTORY_LIMIT: usize = 50;

/// Quota counters for the current session.
///
/// Rebuilt on every start from the persisted snapshot plus the model table;
/// only [`crate::reduce`] mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageState {
    pub calls_today: u64,
    pub daily_limit: u32,
    /// `daily_limit - calls_today`. Negative means exhausted.
    pub remaining_calls: i64,
    pub current_model: String,
    pub last_reset_date: Option<DateTime<Utc>>,
    pub last_call_time: Option<DateTime<Utc>>,
    pub session_calls: u64,
    pub call_history: Vec<CallRecord>,
    pub alert_level: AlertLevel,
    pub show_warning: bool,
    #[serde(flatten)]
    pub metrics: TimeMetrics,
}

impl Default for UsageState {
    fn default() -> Self {
        Self {
            calls_today: 0,
            daily_limit: DEFAULT_DAILY_LIMIT,
            remaining_calls: i64::from(DEFAULT_DAILY_LIMIT),
            current_model: DEFAULT_MODEL.to_string(),
            last_reset_date: None,
            last_call_time: None,
            session_calls: 0,
            call_history: Vec::new(),
            alert_level: AlertLevel::Safe,
            show_warning: false,
            metrics: TimeMetrics::default(),
        }
    }
}

impl UsageState {
    /// Share of the daily limit already used. A zero limit reads as 0 %.
    pub fn usage_percentage(&self) -> f64 {
        if self.daily_limit == 0 {
            return 0.0;
        }
        let limit = f64::from(self.daily_limit);
        (limit - self.remaining_calls as f64) / limit * 100.0
    }

    pub fn is_near_limit(&self) -> bool {
        let threshold = f64::max(10.0, f64::from(self.daily_limit) * 0.1);
        self.remaining_calls as f64 <= threshold
    }

    pub fn can_make_call(&self) -> bool {
        self.remaining_calls > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(daily_limit: u32, calls_today: u64) -> UsageState {
        UsageState {
            calls_today,
            daily_limit,
            remaining_calls: i64::from(daily_limit) - calls_today as i64,
            ..UsageState::default()
        }
    }

    #[test]
    fn default_state_is_full_quota() {
        let state = UsageState::default();
        assert_eq!(state.daily_limit, 1500);
        assert_eq!(state.remaining_calls, 1500);
        assert_eq!(state.current_model, "gemini-2.5-flash");
        assert_eq!(state.alert_level, AlertLevel::Safe);
        assert!(state.can_make_call());
    }

    #[test]
    fn usage_percentage_tracks_remaining() {
        assert_eq!(state_with(1500, 0).usage_percentage(), 0.0);
        assert_eq!(state_with(1500, 750).usage_percentage(), 50.0);
        assert!(state_with(25, 1000).usage_percentage() > 100.0);
    }

    #[test]
    fn usage_percentage_with_zero_limit_is_zero() {
        assert_eq!(state_with(0, 12).usage_percentage(), 0.0);
    }

    #[test]
    fn near_limit_uses_ten_call_floor() {
        // 10% of 25 is 2.5, so the floor of 10 applies
        assert!(!state_with(25, 14).is_near_limit());
        assert!(state_with(25, 15).is_near_limit());
    }

    #[test]
    fn near_limit_uses_ten_percent_for_large_quotas() {
        assert!(!state_with(1500, 1349).is_near_limit());
        assert!(state_with(1500, 1350).is_near_limit());
    }

    #[test]
    fn can_make_call_requires_positive_remaining() {
        assert!(state_with(25, 24).can_make_call());
        assert!(!state_with(25, 25).can_make_call());
        assert!(!state_with(25, 40).can_make_call());
    }

    #[test]
    fn serializes_with_camel_case_and_flattened_metrics() {
        let json = serde_json::to_value(UsageState::default()).unwrap();
        assert_eq!(json["callsToday"], 0);
        assert_eq!(json["alertLevel"], "safe");
        assert_eq!(json["averageCallsPerHour"], 0.0);
        assert!(json["timeUntilReset"].is_null());
    }
}
