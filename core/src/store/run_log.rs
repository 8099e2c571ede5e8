use super::{bool_col, dec_col, dec_text, CollectionsStore};
use crate::{error::CollectionsResult, orchestrator::RunLog};
use chrono::NaiveDate;
use rusqlite::params;

const RUN_LOG_COLUMNS: &str = "run_id, as_of, executed_at, config_version,
    installments_processed, installments_with_delinquency, alerts_generated, alerts_updated,
    alerts_resolved, notifications_sent, promises_broken, agreements_breached, clients_blocked,
    failed_installments, total_penalty_amount, total_penalty_applied, succeeded, error_detail,
    duration_ms";

fn run_log_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunLog> {
    Ok(RunLog {
        run_id: row.get(0)?,
        as_of: row.get(1)?,
        executed_at: row.get(2)?,
        config_version: row.get(3)?,
        installments_processed: row.get(4)?,
        installments_with_delinquency: row.get(5)?,
        alerts_generated: row.get(6)?,
        alerts_updated: row.get(7)?,
        alerts_resolved: row.get(8)?,
        notifications_sent: row.get(9)?,
        promises_broken: row.get(10)?,
        agreements_breached: row.get(11)?,
        clients_blocked: row.get(12)?,
        failed_installments: row.get(13)?,
        total_penalty_amount: dec_col(row, 14)?,
        total_penalty_applied: dec_col(row, 15)?,
        succeeded: bool_col(row, 16)?,
        error_detail: row.get(17)?,
        duration_ms: row.get::<_, i64>(18)? as u64,
    })
}

impl CollectionsStore {
    // ── Run log (append-only) ──────────────────────────────────

    pub fn append_run_log(&self, r: &RunLog) -> CollectionsResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO run_log ({RUN_LOG_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19)"
            ),
            params![
                &r.run_id,
                r.as_of,
                r.executed_at,
                r.config_version,
                r.installments_processed,
                r.installments_with_delinquency,
                r.alerts_generated,
                r.alerts_updated,
                r.alerts_resolved,
                r.notifications_sent,
                r.promises_broken,
                r.agreements_breached,
                r.clients_blocked,
                r.failed_installments,
                dec_text(r.total_penalty_amount),
                dec_text(r.total_penalty_applied),
                r.succeeded as i32,
                r.error_detail.as_deref(),
                r.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn run_logs_for(&self, as_of: NaiveDate) -> CollectionsResult<Vec<RunLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_LOG_COLUMNS} FROM run_log WHERE as_of = ?1 ORDER BY executed_at, rowid"
        ))?;
        let rows = stmt.query_map(params![as_of], run_log_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Whether a successful run exists for `as_of`.
    pub fn has_completed_run(&self, as_of: NaiveDate) -> CollectionsResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM run_log WHERE as_of = ?1 AND succeeded = 1",
            params![as_of],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
