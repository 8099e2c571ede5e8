use super::{bool_col, dec_col, dec_text, CollectionsStore};
use crate::{
    error::{CollectionsError, CollectionsResult},
    restructuring::{AgreementInstallment, AgreementState, PaymentAgreement},
};
use rusqlite::{params, OptionalExtension};

const AGREEMENT_COLUMNS: &str = "agreement_id, alert_id, client_id, credit_id, number, created_at,
    activated_at, state, original_debt, original_penalty, condoned_amount, total_agreed,
    upfront_amount, upfront_paid, requires_upfront, installment_count, first_installment_date,
    agreement_installment_amount, created_by, approved_by, version";

fn agreement_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentAgreement> {
    Ok(PaymentAgreement {
        agreement_id: row.get(0)?,
        alert_id: row.get(1)?,
        client_id: row.get(2)?,
        credit_id: row.get(3)?,
        number: row.get(4)?,
        created_at: row.get(5)?,
        activated_at: row.get(6)?,
        state: row.get(7)?,
        original_debt: dec_col(row, 8)?,
        original_penalty: dec_col(row, 9)?,
        condoned_amount: dec_col(row, 10)?,
        total_agreed: dec_col(row, 11)?,
        upfront_amount: dec_col(row, 12)?,
        upfront_paid: bool_col(row, 13)?,
        requires_upfront: bool_col(row, 14)?,
        installment_count: row.get(15)?,
        first_installment_date: row.get(16)?,
        agreement_installment_amount: dec_col(row, 17)?,
        created_by: row.get(18)?,
        approved_by: row.get(19)?,
        // Filled from agreement_source by the caller.
        source_installment_ids: Vec::new(),
        version: row.get(20)?,
    })
}

fn agreement_installment_row_mapper(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<AgreementInstallment> {
    Ok(AgreementInstallment {
        installment_id: row.get(0)?,
        agreement_id: row.get(1)?,
        number: row.get(2)?,
        capital: dec_col(row, 3)?,
        penalty: dec_col(row, 4)?,
        total: dec_col(row, 5)?,
        due_date: row.get(6)?,
        paid_date: row.get(7)?,
        paid_amount: dec_col(row, 8)?,
        state: row.get(9)?,
    })
}

impl CollectionsStore {
    // ── Payment agreement ──────────────────────────────────────

    pub fn insert_agreement(&self, a: &PaymentAgreement) -> CollectionsResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO payment_agreement ({AGREEMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                &a.agreement_id,
                &a.alert_id,
                &a.client_id,
                &a.credit_id,
                a.number,
                a.created_at,
                a.activated_at,
                a.state,
                dec_text(a.original_debt),
                dec_text(a.original_penalty),
                dec_text(a.condoned_amount),
                dec_text(a.total_agreed),
                dec_text(a.upfront_amount),
                a.upfront_paid as i32,
                a.requires_upfront as i32,
                a.installment_count,
                a.first_installment_date,
                dec_text(a.agreement_installment_amount),
                &a.created_by,
                a.approved_by.as_deref(),
                a.version,
            ],
        )?;
        for installment_id in &a.source_installment_ids {
            self.conn.execute(
                "INSERT INTO agreement_source (agreement_id, installment_id) VALUES (?1, ?2)",
                params![&a.agreement_id, installment_id],
            )?;
        }
        Ok(())
    }

    /// Compare-and-swap on `version`; returns the agreement with its new version.
    pub fn update_agreement(&self, a: &PaymentAgreement) -> CollectionsResult<PaymentAgreement> {
        let changed = self.conn.execute(
            "UPDATE payment_agreement SET activated_at = ?1, state = ?2, upfront_paid = ?3,
                approved_by = ?4, version = version + 1
             WHERE agreement_id = ?5 AND version = ?6",
            params![
                a.activated_at,
                a.state,
                a.upfront_paid as i32,
                a.approved_by.as_deref(),
                &a.agreement_id,
                a.version,
            ],
        )?;
        if changed == 0 {
            return Err(CollectionsError::ConcurrentModification {
                entity: "agreement",
                id: a.agreement_id.clone(),
                expected_version: a.version,
            });
        }
        Ok(PaymentAgreement {
            version: a.version + 1,
            ..a.clone()
        })
    }

    pub fn get_agreement(&self, agreement_id: &str) -> CollectionsResult<PaymentAgreement> {
        let mut agreement = self
            .conn
            .query_row(
                &format!("SELECT {AGREEMENT_COLUMNS} FROM payment_agreement WHERE agreement_id = ?1"),
                params![agreement_id],
                agreement_row_mapper,
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("agreement", agreement_id))?;
        agreement.source_installment_ids = self.agreement_sources(agreement_id)?;
        Ok(agreement)
    }

    pub fn agreements_in_state(&self, state: AgreementState) -> CollectionsResult<Vec<PaymentAgreement>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGREEMENT_COLUMNS} FROM payment_agreement
             WHERE state = ?1 ORDER BY credit_id, number"
        ))?;
        let mut agreements = stmt
            .query_map(params![state], agreement_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        for a in agreements.iter_mut() {
            a.source_installment_ids = self.agreement_sources(&a.agreement_id)?;
        }
        Ok(agreements)
    }

    pub fn agreement_count_for_credit(&self, credit_id: &str) -> CollectionsResult<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM payment_agreement WHERE credit_id = ?1",
            params![credit_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Whether a Draft or Active agreement already absorbs the installment.
    pub fn installment_in_open_agreement(&self, installment_id: &str) -> CollectionsResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agreement_source s
             JOIN payment_agreement a ON a.agreement_id = s.agreement_id
             WHERE s.installment_id = ?1 AND a.state IN ('draft', 'active')",
            params![installment_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Unpaid installments of the credit's Active or Breached agreements.
    pub fn unpaid_agreement_installment_count(&self, credit_id: &str) -> CollectionsResult<u32> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM agreement_installment q
             JOIN payment_agreement a ON a.agreement_id = q.agreement_id
             WHERE a.credit_id = ?1 AND a.state IN ('active', 'breached') AND q.state != 'paid'",
            params![credit_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn agreement_sources(&self, agreement_id: &str) -> CollectionsResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.installment_id FROM agreement_source s
             JOIN installment i ON i.installment_id = s.installment_id
             WHERE s.agreement_id = ?1 ORDER BY i.number",
        )?;
        let rows = stmt.query_map(params![agreement_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Agreement installment ──────────────────────────────────

    pub fn insert_agreement_installment(&self, q: &AgreementInstallment) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO agreement_installment (
                installment_id, agreement_id, number, capital, penalty, total, due_date,
                paid_date, paid_amount, state
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &q.installment_id,
                &q.agreement_id,
                q.number,
                dec_text(q.capital),
                dec_text(q.penalty),
                dec_text(q.total),
                q.due_date,
                q.paid_date,
                dec_text(q.paid_amount),
                q.state,
            ],
        )?;
        Ok(())
    }

    pub fn update_agreement_installment(&self, q: &AgreementInstallment) -> CollectionsResult<()> {
        self.conn.execute(
            "UPDATE agreement_installment SET paid_date = ?1, paid_amount = ?2, state = ?3
             WHERE installment_id = ?4",
            params![q.paid_date, dec_text(q.paid_amount), q.state, &q.installment_id],
        )?;
        Ok(())
    }

    pub fn agreement_installments(&self, agreement_id: &str) -> CollectionsResult<Vec<AgreementInstallment>> {
        let mut stmt = self.conn.prepare(
            "SELECT installment_id, agreement_id, number, capital, penalty, total, due_date,
                    paid_date, paid_amount, state
             FROM agreement_installment WHERE agreement_id = ?1 ORDER BY number",
        )?;
        let rows = stmt.query_map(params![agreement_id], agreement_installment_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
