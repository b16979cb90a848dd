use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules` and `schedule_runs` tables (idempotent). The
/// unique constraint on `(schedule_id, run_number)` is the database-level
/// guard against duplicate firings, and the index on `(is_active,
/// next_run_at)` keeps the due-scan cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id                    TEXT    NOT NULL PRIMARY KEY,
            template_id           TEXT    NOT NULL,
            target                TEXT    NOT NULL,   -- JSON TargetContext
            cron_expression       TEXT,               -- exactly one of cron_expression /
            interval_days         INTEGER,            -- interval_days is set
            interval_config       TEXT,               -- JSON {at_hour, at_minute}
            timezone              TEXT    NOT NULL DEFAULT 'UTC',
            parameters            TEXT    NOT NULL DEFAULT '{}',
            is_active             INTEGER NOT NULL DEFAULT 1,
            next_run_at           TEXT,               -- RFC 3339 UTC; NULL when inactive
            last_run_at           TEXT,
            consecutive_failures  INTEGER NOT NULL DEFAULT 0,
            failure_threshold     INTEGER NOT NULL DEFAULT 3,
            auto_pause_on_failure INTEGER NOT NULL DEFAULT 1,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL,
            CHECK (cron_expression IS NOT NULL OR interval_days IS NOT NULL)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_due
            ON schedules (is_active, next_run_at);

        CREATE TABLE IF NOT EXISTS schedule_runs (
            id               TEXT    NOT NULL PRIMARY KEY,
            schedule_id      TEXT    NOT NULL,
            run_number       INTEGER NOT NULL,
            status           TEXT    NOT NULL DEFAULT 'pending',
            execution_count  INTEGER NOT NULL DEFAULT 0,
            successful_count INTEGER NOT NULL DEFAULT 0,
            failed_count     INTEGER NOT NULL DEFAULT 0,
            total_rows       INTEGER NOT NULL DEFAULT 0,
            total_cost       REAL    NOT NULL DEFAULT 0.0,
            error_summary    TEXT,
            started_at       TEXT    NOT NULL,
            finished_at      TEXT,
            UNIQUE (schedule_id, run_number)
        ) STRICT;
        ",
    )?;
    Ok(())
}
