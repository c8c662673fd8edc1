use rusqlite::Connection;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS api_usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                operation TEXT NOT NULL DEFAULT 'unknown',
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 1,
                response_time_ms INTEGER,
                ip_address TEXT,
                user_agent TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_usage_user_date ON api_usage_logs(user_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS api_usage_daily_stats (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                model TEXT NOT NULL,
                call_count INTEGER NOT NULL DEFAULT 0,
                token_count_in INTEGER NOT NULL DEFAULT 0,
                token_count_out INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, date, model)
            );
        "#,
    },
];

pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("Running usage migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
