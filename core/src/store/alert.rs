use super::{bool_col, dec_col, dec_text, opt_dec_col, CollectionsStore};
use crate::{
    alerts::{Alert, AlertType},
    config::NotificationChannel,
    error::{CollectionsError, CollectionsResult},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};

const ALERT_COLUMNS: &str = "alert_id, installment_id, credit_id, client_id, alert_type, message,
    computed_penalty_amount, overdue_amount, total_amount, overdue_installment_count,
    days_overdue, raised_at, priority, override_baseline, management_state,
    assigned_agent_id, assigned_at, promise_date, promise_amount, notifications_sent,
    last_notified_at, resolved, resolved_at, resolution_reason, version";

fn alert_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        alert_id: row.get(0)?,
        installment_id: row.get(1)?,
        credit_id: row.get(2)?,
        client_id: row.get(3)?,
        alert_type: row.get(4)?,
        message: row.get(5)?,
        computed_penalty_amount: dec_col(row, 6)?,
        overdue_amount: dec_col(row, 7)?,
        total_amount: dec_col(row, 8)?,
        overdue_installment_count: row.get(9)?,
        days_overdue: row.get(10)?,
        raised_at: row.get(11)?,
        priority: row.get(12)?,
        override_baseline: row.get(13)?,
        management_state: row.get(14)?,
        assigned_agent_id: row.get(15)?,
        assigned_at: row.get(16)?,
        promise_date: row.get(17)?,
        promise_amount: opt_dec_col(row, 18)?,
        notifications_sent: row.get(19)?,
        last_notified_at: row.get(20)?,
        resolved: bool_col(row, 21)?,
        resolved_at: row.get(22)?,
        resolution_reason: row.get(23)?,
        version: row.get(24)?,
    })
}

impl CollectionsStore {
    // ── Alert ──────────────────────────────────────────────────

    pub fn insert_alert(&self, a: &Alert) -> CollectionsResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO alert ({ALERT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
            ),
            params![
                &a.alert_id,
                a.installment_id.as_deref(),
                &a.credit_id,
                &a.client_id,
                a.alert_type,
                &a.message,
                dec_text(a.computed_penalty_amount),
                dec_text(a.overdue_amount),
                dec_text(a.total_amount),
                a.overdue_installment_count,
                a.days_overdue,
                a.raised_at,
                a.priority,
                a.override_baseline,
                a.management_state,
                a.assigned_agent_id.as_deref(),
                a.assigned_at,
                a.promise_date,
                a.promise_amount.map(dec_text),
                a.notifications_sent,
                a.last_notified_at,
                a.resolved as i32,
                a.resolved_at,
                a.resolution_reason.as_deref(),
                a.version,
            ],
        )?;
        Ok(())
    }

    /// Compare-and-swap on `version`; returns the alert with its new version.
    pub fn update_alert(&self, a: &Alert) -> CollectionsResult<Alert> {
        let changed = self.conn.execute(
            "UPDATE alert SET message = ?1, computed_penalty_amount = ?2, overdue_amount = ?3,
                total_amount = ?4, overdue_installment_count = ?5, days_overdue = ?6,
                priority = ?7, override_baseline = ?8, management_state = ?9,
                assigned_agent_id = ?10, assigned_at = ?11, promise_date = ?12,
                promise_amount = ?13, notifications_sent = ?14, last_notified_at = ?15,
                resolved = ?16, resolved_at = ?17, resolution_reason = ?18,
                version = version + 1
             WHERE alert_id = ?19 AND version = ?20",
            params![
                &a.message,
                dec_text(a.computed_penalty_amount),
                dec_text(a.overdue_amount),
                dec_text(a.total_amount),
                a.overdue_installment_count,
                a.days_overdue,
                a.priority,
                a.override_baseline,
                a.management_state,
                a.assigned_agent_id.as_deref(),
                a.assigned_at,
                a.promise_date,
                a.promise_amount.map(dec_text),
                a.notifications_sent,
                a.last_notified_at,
                a.resolved as i32,
                a.resolved_at,
                a.resolution_reason.as_deref(),
                &a.alert_id,
                a.version,
            ],
        )?;
        if changed == 0 {
            return Err(CollectionsError::ConcurrentModification {
                entity: "alert",
                id: a.alert_id.clone(),
                expected_version: a.version,
            });
        }
        Ok(Alert {
            version: a.version + 1,
            ..a.clone()
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> CollectionsResult<Alert> {
        self.conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alert WHERE alert_id = ?1"),
                params![alert_id],
                alert_row_mapper,
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("alert", alert_id))
    }

    pub fn open_alert_for_installment(&self, installment_id: &str) -> CollectionsResult<Option<Alert>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alert
                     WHERE installment_id = ?1 AND resolved = 0"
                ),
                params![installment_id],
                alert_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn open_credit_alert(
        &self,
        credit_id: &str,
        alert_type: AlertType,
    ) -> CollectionsResult<Option<Alert>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alert
                     WHERE credit_id = ?1 AND alert_type = ?2
                       AND installment_id IS NULL AND resolved = 0"
                ),
                params![credit_id, alert_type],
                alert_row_mapper,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn alerts_for_installment(&self, installment_id: &str) -> CollectionsResult<Vec<Alert>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert WHERE installment_id = ?1 ORDER BY raised_at"
        ))?;
        let rows = stmt.query_map(params![installment_id], alert_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn open_alerts(&self) -> CollectionsResult<Vec<Alert>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert WHERE resolved = 0 ORDER BY credit_id, raised_at"
        ))?;
        let rows = stmt.query_map([], alert_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Unresolved alerts holding a promise dated before `today`.
    pub fn alerts_with_promise_due_before(&self, today: NaiveDate) -> CollectionsResult<Vec<Alert>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert
             WHERE resolved = 0 AND management_state = 'promise_made'
               AND promise_date IS NOT NULL AND promise_date < ?1
             ORDER BY promise_date, alert_id"
        ))?;
        let rows = stmt.query_map(params![today], alert_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Notification log ───────────────────────────────────────

    pub fn insert_notification(
        &self,
        alert: &Alert,
        channel: NotificationChannel,
        template_key: &str,
        message_id: &str,
        sent_at: NaiveDateTime,
    ) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO notification_log (
                alert_id, client_id, channel, template_key, message_id, sent_at, sent_on
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &alert.alert_id,
                &alert.client_id,
                channel.as_str(),
                template_key,
                message_id,
                sent_at,
                sent_at.date(),
            ],
        )?;
        Ok(())
    }

    pub fn notifications_sent_on(&self, client_id: &str, day: NaiveDate) -> CollectionsResult<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM notification_log WHERE client_id = ?1 AND sent_on = ?2",
            params![client_id, day],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
