use super::{dec_text, opt_dec_col, CollectionsStore};
use crate::{error::CollectionsResult, workflow::ContactHistory};
use chrono::NaiveDateTime;
use rusqlite::params;

fn contact_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactHistory> {
    Ok(ContactHistory {
        contact_id: row.get(0)?,
        alert_id: row.get(1)?,
        client_id: row.get(2)?,
        agent_id: row.get(3)?,
        contacted_at: row.get(4)?,
        channel: row.get(5)?,
        outcome: row.get(6)?,
        notes: row.get(7)?,
        promise_date: row.get(8)?,
        promise_amount: opt_dec_col(row, 9)?,
        next_contact_date: row.get(10)?,
    })
}

impl CollectionsStore {
    // ── Contact history (append-only) ──────────────────────────

    pub fn insert_contact(&self, c: &ContactHistory) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO contact_history (
                contact_id, alert_id, client_id, agent_id, contacted_at, channel, outcome,
                notes, promise_date, promise_amount, next_contact_date
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &c.contact_id,
                &c.alert_id,
                &c.client_id,
                &c.agent_id,
                c.contacted_at,
                c.channel,
                c.outcome,
                c.notes.as_deref(),
                c.promise_date,
                c.promise_amount.map(dec_text),
                c.next_contact_date,
            ],
        )?;
        Ok(())
    }

    pub fn contacts_for_alert(&self, alert_id: &str) -> CollectionsResult<Vec<ContactHistory>> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id, alert_id, client_id, agent_id, contacted_at, channel, outcome,
                    notes, promise_date, promise_amount, next_contact_date
             FROM contact_history WHERE alert_id = ?1
             ORDER BY contacted_at, rowid",
        )?;
        let rows = stmt.query_map(params![alert_id], contact_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// When the alert's most recent promise to pay was recorded.
    pub fn latest_promise_contact_at(&self, alert_id: &str) -> CollectionsResult<Option<NaiveDateTime>> {
        let at: Option<NaiveDateTime> = self.conn.query_row(
            "SELECT MAX(contacted_at) FROM contact_history
             WHERE alert_id = ?1 AND outcome = 'promise_to_pay'",
            params![alert_id],
            |row| row.get(0),
        )?;
        Ok(at)
    }
}
