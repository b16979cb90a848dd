use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use drumline_backend::ResultMetadata;
use drumline_template::ParameterSpec;

use crate::db::init_db;
use crate::error::{ExecError, Result};
use crate::types::{Execution, ExecutionStatus, WorkflowTemplate};

/// Persistence for execution records.
///
/// Thread-safe: wraps the SQLite connection in a Mutex, one store per
/// connection. Terminal states are written through guarded updates so a
/// repeated poll or a stale writer can never overwrite a terminal row.
pub struct ExecutionStore {
    conn: Mutex<Connection>,
}

impl ExecutionStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a pending execution row, optionally linked to a schedule run.
    pub fn create(&self, schedule_run_id: Option<&str>) -> Result<Execution> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO executions (id, schedule_run_id, status, retry_count, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
            rusqlite::params![id, schedule_run_id, now],
        )?;
        self.get_locked(&conn, &id)
    }

    pub fn get(&self, id: &str) -> Result<Execution> {
        let conn = self.conn.lock().unwrap();
        self.get_locked(&conn, id)
    }

    pub fn status(&self, id: &str) -> Result<ExecutionStatus> {
        Ok(self.get(id)?.status)
    }

    /// Transition pending → running once the backend accepts the submission.
    pub fn mark_running(
        &self,
        id: &str,
        backend_execution_id: &str,
        retry_count: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE executions
             SET status = 'running', backend_execution_id = ?1, retry_count = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            rusqlite::params![backend_execution_id, retry_count, now, id],
        )?;
        Ok(())
    }

    /// Record a successful terminal result. Returns false when the row was
    /// already terminal, in which case nothing is written.
    pub fn mark_succeeded(&self, id: &str, result: &ResultMetadata) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let columns = serde_json::to_string(&result.columns)?;
        let rows = serde_json::to_string(&result.rows)?;
        let n = conn.execute(
            "UPDATE executions
             SET status = 'succeeded', result_columns = ?1, result_rows = ?2,
                 result_total_rows = ?3, query_runtime_seconds = ?4,
                 data_scanned_gb = ?5, cost_estimate_usd = ?6, updated_at = ?7
             WHERE id = ?8 AND status IN ('pending', 'running')",
            rusqlite::params![
                columns,
                rows,
                result.total_rows as i64,
                result.query_runtime_seconds,
                result.data_scanned_gb,
                result.cost_estimate_usd,
                now,
                id
            ],
        )?;
        Ok(n > 0)
    }

    /// Record a terminal failure. Returns false when the row was already
    /// terminal.
    pub fn mark_failed(&self, id: &str, error_message: &str, retry_count: u32) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE executions
             SET status = 'failed', error_message = ?1, retry_count = ?2, updated_at = ?3
             WHERE id = ?4 AND status IN ('pending', 'running')",
            rusqlite::params![error_message, retry_count, now, id],
        )?;
        Ok(n > 0)
    }

    /// Record a cancellation. Guarded like the other terminal writes: a row
    /// already succeeded/failed/cancelled stays as it is.
    pub fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = conn.execute(
            "UPDATE executions
             SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'running')",
            rusqlite::params![now, id],
        )?;
        if n > 0 {
            debug!(execution_id = %id, "execution cancelled");
        }
        Ok(n > 0)
    }

    fn get_locked(&self, conn: &Connection, id: &str) -> Result<Execution> {
        conn.query_row(
            "SELECT id, schedule_run_id, backend_execution_id, status, retry_count,
                    result_columns, result_rows, result_total_rows,
                    query_runtime_seconds, data_scanned_gb, cost_estimate_usd,
                    error_message, created_at, updated_at
             FROM executions WHERE id = ?1",
            [id],
            map_execution_row,
        )
        .optional()?
        .ok_or_else(|| ExecError::NotFound { id: id.to_string() })
    }
}

fn map_execution_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status_str: String = row.get(3)?;
    let status = ExecutionStatus::from_str(&status_str).unwrap_or(ExecutionStatus::Failed);
    let result_columns: Option<String> = row.get(5)?;
    let result_rows: Option<String> = row.get(6)?;
    Ok(Execution {
        id: row.get(0)?,
        schedule_run_id: row.get(1)?,
        backend_execution_id: row.get(2)?,
        status,
        retry_count: row.get::<_, i64>(4)? as u32,
        result_columns: result_columns.and_then(|s| serde_json::from_str(&s).ok()),
        result_rows: result_rows.and_then(|s| serde_json::from_str(&s).ok()),
        result_total_rows: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
        query_runtime_seconds: row.get(8)?,
        data_scanned_gb: row.get(9)?,
        cost_estimate_usd: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Persistence for workflow templates.
pub struct TemplateStore {
    conn: Mutex<Connection>,
}

impl TemplateStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(
        &self,
        name: &str,
        sql_template: &str,
        parameters: &[ParameterSpec],
    ) -> Result<WorkflowTemplate> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let params_json = serde_json::to_string(parameters)?;
        conn.execute(
            "INSERT INTO workflow_templates (id, name, sql_template, parameters, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![id, name, sql_template, params_json, now],
        )?;
        self.get_locked(&conn, &id)
    }

    pub fn get(&self, id: &str) -> Result<WorkflowTemplate> {
        let conn = self.conn.lock().unwrap();
        self.get_locked(&conn, id)
    }

    fn get_locked(&self, conn: &Connection, id: &str) -> Result<WorkflowTemplate> {
        conn.query_row(
            "SELECT id, name, sql_template, parameters, created_at, updated_at
             FROM workflow_templates WHERE id = ?1",
            [id],
            |row| {
                let params_json: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    params_json,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(id, name, sql_template, params_json, created_at, updated_at)| {
            let parameters = serde_json::from_str(&params_json).unwrap_or_default();
            WorkflowTemplate {
                id,
                name,
                sql_template,
                parameters,
                created_at,
                updated_at,
            }
        })
        .ok_or_else(|| ExecError::TemplateNotFound { id: id.to_string() })
    }
}
