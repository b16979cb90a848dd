use rusqlite::Connection;

use crate::error::Result;

/// Initialise the execution schema in `conn`.
///
/// Creates the `workflow_templates` and `executions` tables (idempotent) and
/// indexes supporting the run-aggregation and status queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS workflow_templates (
            id           TEXT    NOT NULL PRIMARY KEY,
            name         TEXT    NOT NULL,
            sql_template TEXT    NOT NULL,
            parameters   TEXT    NOT NULL,   -- JSON-encoded parameter specs
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS executions (
            id                    TEXT    NOT NULL PRIMARY KEY,
            schedule_run_id       TEXT,               -- NULL for manual runs
            backend_execution_id  TEXT,
            status                TEXT    NOT NULL DEFAULT 'pending',
            retry_count           INTEGER NOT NULL DEFAULT 0,
            result_columns        TEXT,               -- JSON array
            result_rows           TEXT,               -- JSON
            result_total_rows     INTEGER,
            query_runtime_seconds REAL,
            data_scanned_gb       REAL,
            cost_estimate_usd     REAL,
            error_message         TEXT,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_run ON executions (schedule_run_id);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status);
        ",
    )?;
    Ok(())
}
