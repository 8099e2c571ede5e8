use super::{bool_col, dec_col, dec_text, CollectionsStore};
use crate::{
    error::{CollectionsError, CollectionsResult},
    scoring::{ScoreAdjustment, ScoreMovement, ScoreStore},
};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

impl ScoreStore for CollectionsStore {
    fn get_score(&self, client_id: &str) -> CollectionsResult<Decimal> {
        self.conn
            .query_row(
                "SELECT score FROM client_standing WHERE client_id = ?1",
                params![client_id],
                |row| dec_col(row, 0),
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("client", client_id))
    }

    fn apply_score_delta(
        &self,
        client_id: &str,
        delta: Decimal,
        reason: &str,
        at: NaiveDateTime,
    ) -> CollectionsResult<Decimal> {
        self.atomically(|store| {
            let current = store.get_score(client_id)?;
            let score = (current + delta).max(Decimal::ZERO);
            store.conn.execute(
                "UPDATE client_standing SET score = ?1, updated_at = ?2 WHERE client_id = ?3",
                params![dec_text(score), at, client_id],
            )?;
            store.conn.execute(
                "INSERT INTO score_movement (client_id, delta, score_after, reason, moved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![client_id, dec_text(score - current), dec_text(score), reason, at],
            )?;
            Ok(score)
        })
    }
}

impl CollectionsStore {
    // ── Client standing ────────────────────────────────────────

    /// Register a client with its opening score; a known client is left alone.
    pub fn ensure_client_standing(
        &self,
        client_id: &str,
        score: Decimal,
        at: NaiveDateTime,
    ) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO client_standing (client_id, score, blocked, updated_at)
             VALUES (?1, ?2, 0, ?3)",
            params![client_id, dec_text(score), at],
        )?;
        Ok(())
    }

    pub fn is_client_blocked(&self, client_id: &str) -> CollectionsResult<bool> {
        let blocked = self
            .conn
            .query_row(
                "SELECT blocked FROM client_standing WHERE client_id = ?1",
                params![client_id],
                |row| bool_col(row, 0),
            )
            .optional()?;
        Ok(blocked.unwrap_or(false))
    }

    /// `Some(reason)` blocks the client, `None` lifts the block.
    pub fn set_client_block(
        &self,
        client_id: &str,
        reason: Option<&str>,
        at: NaiveDateTime,
    ) -> CollectionsResult<()> {
        let changed = self.conn.execute(
            "UPDATE client_standing SET blocked = ?1, block_reason = ?2, updated_at = ?3
             WHERE client_id = ?4",
            params![reason.is_some() as i32, reason, at, client_id],
        )?;
        if changed == 0 {
            return Err(CollectionsError::not_found("client", client_id));
        }
        Ok(())
    }

    pub fn blocked_clients(&self) -> CollectionsResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id FROM client_standing WHERE blocked = 1 ORDER BY client_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn score_movements(&self, client_id: &str) -> CollectionsResult<Vec<ScoreMovement>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id, delta, score_after, reason, moved_at
             FROM score_movement WHERE client_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok(ScoreMovement {
                client_id: row.get(0)?,
                delta: dec_col(row, 1)?,
                score_after: dec_col(row, 2)?,
                reason: row.get(3)?,
                moved_at: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Score adjustment per installment ───────────────────────

    pub fn get_score_adjustment(&self, installment_id: &str) -> CollectionsResult<Option<ScoreAdjustment>> {
        self.conn
            .query_row(
                "SELECT installment_id, client_id, applied_delta, pre_penalty_score, recovered,
                        recovered_delta
                 FROM score_adjustment WHERE installment_id = ?1",
                params![installment_id],
                |row| {
                    Ok(ScoreAdjustment {
                        installment_id: row.get(0)?,
                        client_id: row.get(1)?,
                        applied_delta: dec_col(row, 2)?,
                        pre_penalty_score: dec_col(row, 3)?,
                        recovered: bool_col(row, 4)?,
                        recovered_delta: dec_col(row, 5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn save_score_adjustment(&self, a: &ScoreAdjustment) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO score_adjustment (
                installment_id, client_id, applied_delta, pre_penalty_score, recovered,
                recovered_delta
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(installment_id) DO UPDATE SET
                applied_delta = excluded.applied_delta,
                recovered = excluded.recovered,
                recovered_delta = excluded.recovered_delta",
            params![
                &a.installment_id,
                &a.client_id,
                dec_text(a.applied_delta),
                dec_text(a.pre_penalty_score),
                a.recovered as i32,
                dec_text(a.recovered_delta),
            ],
        )?;
        Ok(())
    }
}
