use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::migrations;
use crate::record::{CallEvent, CallRecord, RequestOrigin};
use crate::state::HISTORY_LIMIT;

/// Response body of `GET /api/usage/stats`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub calls_today: u64,
    pub failed_calls: u64,
    /// Most recent calls, oldest first.
    pub history: Vec<CallRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyTotal {
    pub date: String,
    pub model: String,
    pub call_count: u64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

pub struct UsageStore {
    conn: Mutex<Connection>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

impl UsageStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("usage store lock poisoned"))
    }

    /// Append a call log row and bump the per-day aggregate. Returns the row id.
    pub fn record_call(
        &self,
        user_id: &str,
        event: &CallEvent,
        origin: &RequestOrigin,
        at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let created_at = timestamp(at);
        let tokens_in = event.tokens_in.unwrap_or(0);
        let tokens_out = event.tokens_out.unwrap_or(0);

        tx.execute(
            "INSERT INTO api_usage_logs
                (user_id, model, operation, tokens_in, tokens_out, success, response_time_ms, ip_address, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                user_id,
                event.model,
                event.operation,
                tokens_in,
                tokens_out,
                event.success,
                event.response_time.map(|ms| ms as i64),
                origin.ip_address,
                origin.user_agent,
                created_at,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO api_usage_daily_stats
                (user_id, date, model, call_count, token_count_in, token_count_out, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
             ON CONFLICT(user_id, date, model) DO UPDATE SET
                call_count = call_count + 1,
                token_count_in = token_count_in + excluded.token_count_in,
                token_count_out = token_count_out + excluded.token_count_out,
                updated_at = excluded.updated_at",
            rusqlite::params![
                user_id,
                at.date_naive().to_string(),
                event.model,
                tokens_in,
                tokens_out,
                created_at,
            ],
        )?;

        tx.commit()?;
        tracing::debug!(user_id, model = %event.model, id, "recorded API call");
        Ok(id)
    }

    /// Calls on the UTC date of `now`, plus the latest history.
    pub fn stats(&self, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<UsageStats> {
        let conn = self.lock()?;
        let today = now.date_naive().to_string();

        let (calls_today, failed_calls): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0)
             FROM api_usage_logs
             WHERE user_id = ?1 AND substr(created_at, 1, 10) = ?2",
            rusqlite::params![user_id, today],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT timestamp, model, operation, success, response_time_ms FROM (
                SELECT id, created_at AS timestamp, model, operation, success, response_time_ms
                FROM api_usage_logs
                WHERE user_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
             ) ORDER BY timestamp ASC, id ASC",
        )?;
        let history = stmt
            .query_map(rusqlite::params![user_id, HISTORY_LIMIT as i64], |row| {
                Ok(CallRecord {
                    timestamp: parse_timestamp(0, row.get(0)?)?,
                    model: row.get(1)?,
                    operation: row.get(2)?,
                    success: row.get(3)?,
                    response_time: row.get::<_, Option<i64>>(4)?.map(|ms| ms.max(0) as u64),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UsageStats {
            calls_today: calls_today.max(0) as u64,
            failed_calls: failed_calls.max(0) as u64,
            history,
        })
    }

    /// Per-day, per-model aggregates, newest day first.
    pub fn daily_totals(&self, user_id: &str, days: u32) -> anyhow::Result<Vec<DailyTotal>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT date, model, call_count, token_count_in, token_count_out
             FROM api_usage_daily_stats
             WHERE user_id = ?1 AND date IN (
                SELECT DISTINCT date FROM api_usage_daily_stats
                WHERE user_id = ?1 ORDER BY date DESC LIMIT ?2
             )
             ORDER BY date DESC, model ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![user_id, days], |row| {
                Ok(DailyTotal {
                    date: row.get(0)?,
                    model: row.get(1)?,
                    call_count: row.get::<_, i64>(2)?.max(0) as u64,
                    tokens_in: row.get(3)?,
                    tokens_out: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn event(model: &str, success: bool) -> CallEvent {
        CallEvent {
            model: model.to_string(),
            operation: "generateIRP".to_string(),
            success,
            response_time: Some(250),
            tokens_in: Some(100),
            tokens_out: Some(40),
        }
    }

    #[test]
    fn stats_count_only_today() {
        let store = UsageStore::in_memory().unwrap();
        let origin = RequestOrigin::default();
        let now = utc("2026-10-14T12:00:00Z");

        store
            .record_call("u1", &event("gemini-2.5-flash", true), &origin, now - Duration::days(1))
            .unwrap();
        store
            .record_call("u1", &event("gemini-2.5-flash", true), &origin, now - Duration::hours(2))
            .unwrap();
        store
            .record_call("u1", &event("gemini-2.5-flash", false), &origin, now)
            .unwrap();
        store
            .record_call("u2", &event("gemini-2.5-flash", true), &origin, now)
            .unwrap();

        let stats = store.stats("u1", now).unwrap();
        assert_eq!(stats.calls_today, 2);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.history.len(), 3);
    }

    #[test]
    fn stats_for_unknown_user_are_empty() {
        let store = UsageStore::in_memory().unwrap();
        let stats = store.stats("nobody", Utc::now()).unwrap();
        assert_eq!(stats.calls_today, 0);
        assert_eq!(stats.failed_calls, 0);
        assert!(stats.history.is_empty());
    }

    #[test]
    fn history_is_latest_fifty_oldest_first() {
        let store = UsageStore::in_memory().unwrap();
        let origin = RequestOrigin::default();
        let start = utc("2026-10-14T00:00:00Z");
        for i in 0..60 {
            let mut ev = event("gemini-2.5-flash", true);
            ev.operation = format!("op-{i}");
            store
                .record_call("u1", &ev, &origin, start + Duration::minutes(i))
                .unwrap();
        }

        let stats = store.stats("u1", start + Duration::hours(2)).unwrap();
        assert_eq!(stats.calls_today, 60);
        assert_eq!(stats.history.len(), 50);
        assert_eq!(stats.history[0].operation, "op-10");
        assert_eq!(stats.history[49].operation, "op-59");
        assert_eq!(stats.history[0].timestamp, start + Duration::minutes(10));
        assert_eq!(stats.history[0].response_time, Some(250));
    }

    #[test]
    fn record_call_returns_increasing_ids() {
        let store = UsageStore::in_memory().unwrap();
        let origin = RequestOrigin {
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: Some("mentord-test".to_string()),
        };
        let first = store
            .record_call("u1", &event("gemini-2.5-pro", true), &origin, Utc::now())
            .unwrap();
        let second = store
            .record_call("u1", &event("gemini-2.5-pro", true), &origin, Utc::now())
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn daily_totals_aggregate_per_model() {
        let store = UsageStore::in_memory().unwrap();
        let origin = RequestOrigin::default();
        let day1 = utc("2026-10-13T09:00:00Z");
        let day2 = utc("2026-10-14T09:00:00Z");

        store.record_call("u1", &event("gemini-2.5-flash", true), &origin, day1).unwrap();
        store.record_call("u1", &event("gemini-2.5-flash", true), &origin, day2).unwrap();
        store.record_call("u1", &event("gemini-2.5-flash", false), &origin, day2).unwrap();
        store.record_call("u1", &event("gemini-2.5-pro", true), &origin, day2).unwrap();

        let totals = store.daily_totals("u1", 7).unwrap();
        assert_eq!(totals.len(), 3);
        assert_eq!(totals[0].date, "2026-10-14");
        assert_eq!(totals[0].model, "gemini-2.5-flash");
        assert_eq!(totals[0].call_count, 2);
        assert_eq!(totals[0].tokens_in, 200);
        assert_eq!(totals[1].model, "gemini-2.5-pro");
        assert_eq!(totals[2].date, "2026-10-13");

        let latest = store.daily_totals("u1", 1).unwrap();
        assert!(latest.iter().all(|t| t.date == "2026-10-14"));
    }

    #[test]
    fn open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        {
            let store = UsageStore::open(&path).unwrap();
            store
                .record_call(
                    "u1",
                    &event("gemini-2.5-flash", true),
                    &RequestOrigin::default(),
                    Utc::now(),
                )
                .unwrap();
        }
        let store = UsageStore::open(&path).unwrap();
        assert_eq!(store.stats("u1", Utc::now()).unwrap().calls_today, 1);
    }
}
