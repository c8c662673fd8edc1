//! Shared helpers used by the `mentord` binary.

use chrono::Local;
use cm_usage::{AlertLevel, Session, UsageState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Build-time version string, overridable through `MENTORD_VERSION`.
pub const MENTORD_VERSION: &str = match option_env!("MENTORD_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

// ---------------------------------------------------------------------------
// Session token file
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct StoredSession {
    user_id: String,
    token: String,
}

/// Reads the saved client session, returning `None` if missing or unreadable.
pub fn read_session(path: &Path) -> Option<Session> {
    let content = fs::read_to_string(path).ok()?;
    let stored: StoredSession = serde_json::from_str(&content).ok()?;
    if stored.token.is_empty() {
        return None;
    }
    Some(Session {
        user_id: stored.user_id,
        token: stored.token,
    })
}

pub fn write_session(path: &Path, session: &Session) -> anyhow::Result<()> {
    let stored = StoredSession {
        user_id: session.user_id.clone(),
        token: session.token.clone(),
    };
    fs::write(path, serde_json::to_string_pretty(&stored)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage report
// ---------------------------------------------------------------------------

fn alert_message(level: AlertLevel) -> Option<&'static str> {
    match level {
        AlertLevel::Safe => None,
        AlertLevel::Warning => Some("Usage is above 75% of the daily limit"),
        AlertLevel::Critical => Some("Usage is above 90% of the daily limit"),
        AlertLevel::Exhausted => Some("Daily limit reached, further calls may be rejected"),
    }
}

/// Human-readable summary of a usage snapshot.
pub fn render_usage_report(state: &UsageState) -> String {
    let mut lines = vec![
        format!("Model:        {}", state.current_model),
        format!(
            "Calls today:  {} / {} ({:.1}%)",
            state.calls_today,
            state.daily_limit,
            state.usage_percentage()
        ),
        format!("Remaining:    {}", state.remaining_calls),
        format!("Alert level:  {}", state.alert_level.as_str()),
        format!("Session:      {} calls", state.session_calls),
        format!(
            "Burn rate:    {:.1} calls/hour",
            state.metrics.average_calls_per_hour
        ),
    ];

    if let Some(until) = &state.metrics.time_until_reset {
        lines.push(format!("Resets in:    {}", until));
    }
    match state.metrics.estimated_exhaustion_time {
        Some(at) => lines.push(format!(
            "Exhaustion:   {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        )),
        None => lines.push("Exhaustion:   not projected".to_string()),
    }

    if state.show_warning {
        if let Some(message) = alert_message(state.alert_level) {
            lines.push(String::new());
            lines.push(format!("! {}", message));
        }
    }

    lines.join("\n")
}
