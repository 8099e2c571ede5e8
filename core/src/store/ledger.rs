use super::{dec_col, dec_text, CollectionsStore};
use crate::{
    error::{CollectionsError, CollectionsResult},
    ledger::{Credit, Installment, Payment},
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

const CREDIT_COLUMNS: &str = "credit_id, client_id, principal_requested, principal_approved,
    nominal_rate, installment_count, installment_amount, total_cost_rate, total_payable,
    outstanding_balance, state, request_date, approval_date, close_date,
    first_installment_date, initial_risk_score, guarantor_id";

const INSTALLMENT_COLUMNS: &str = "i.installment_id, i.credit_id, i.number, i.capital_amount,
    i.interest_amount, i.total_amount, i.due_date, i.paid_date, i.paid_amount,
    i.penalty_amount, i.state, i.payment_method";

const COLLECTIBLE: &str = "('disbursed', 'active', 'defaulted')";
const CLOSED_INSTALLMENT: &str = "('paid', 'written_off')";

fn credit_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credit> {
    Ok(Credit {
        credit_id: row.get(0)?,
        client_id: row.get(1)?,
        principal_requested: dec_col(row, 2)?,
        principal_approved: dec_col(row, 3)?,
        nominal_rate: dec_col(row, 4)?,
        installment_count: row.get(5)?,
        installment_amount: dec_col(row, 6)?,
        total_cost_rate: dec_col(row, 7)?,
        total_payable: dec_col(row, 8)?,
        outstanding_balance: dec_col(row, 9)?,
        state: row.get(10)?,
        request_date: row.get(11)?,
        approval_date: row.get(12)?,
        close_date: row.get(13)?,
        first_installment_date: row.get(14)?,
        initial_risk_score: dec_col(row, 15)?,
        guarantor_id: row.get(16)?,
    })
}

fn installment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Installment> {
    Ok(Installment {
        installment_id: row.get(0)?,
        credit_id: row.get(1)?,
        number: row.get(2)?,
        capital_amount: dec_col(row, 3)?,
        interest_amount: dec_col(row, 4)?,
        total_amount: dec_col(row, 5)?,
        due_date: row.get(6)?,
        paid_date: row.get(7)?,
        paid_amount: dec_col(row, 8)?,
        penalty_amount: dec_col(row, 9)?,
        state: row.get(10)?,
        payment_method: row.get(11)?,
    })
}

fn payment_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        payment_id: row.get(0)?,
        installment_id: row.get(1)?,
        credit_id: row.get(2)?,
        amount: dec_col(row, 3)?,
        paid_at: row.get(4)?,
        method: row.get(5)?,
        reverses_payment_id: row.get(6)?,
        reason: row.get(7)?,
    })
}

impl CollectionsStore {
    // ── Credit ─────────────────────────────────────────────────

    pub fn insert_credit(&self, c: &Credit) -> CollectionsResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO credit ({CREDIT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                &c.credit_id,
                &c.client_id,
                dec_text(c.principal_requested),
                dec_text(c.principal_approved),
                dec_text(c.nominal_rate),
                c.installment_count,
                dec_text(c.installment_amount),
                dec_text(c.total_cost_rate),
                dec_text(c.total_payable),
                dec_text(c.outstanding_balance),
                c.state,
                c.request_date,
                c.approval_date,
                c.close_date,
                c.first_installment_date,
                dec_text(c.initial_risk_score),
                c.guarantor_id.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn update_credit(&self, c: &Credit) -> CollectionsResult<()> {
        let changed = self.conn.execute(
            "UPDATE credit SET outstanding_balance = ?1, state = ?2, approval_date = ?3,
                close_date = ?4
             WHERE credit_id = ?5",
            params![
                dec_text(c.outstanding_balance),
                c.state,
                c.approval_date,
                c.close_date,
                &c.credit_id,
            ],
        )?;
        if changed == 0 {
            return Err(CollectionsError::not_found("credit", &c.credit_id));
        }
        Ok(())
    }

    pub fn get_credit(&self, credit_id: &str) -> CollectionsResult<Credit> {
        self.conn
            .query_row(
                &format!("SELECT {CREDIT_COLUMNS} FROM credit WHERE credit_id = ?1"),
                params![credit_id],
                credit_row_mapper,
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("credit", credit_id))
    }

    pub fn all_credits(&self) -> CollectionsResult<Vec<Credit>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CREDIT_COLUMNS} FROM credit ORDER BY credit_id"))?;
        let rows = stmt.query_map([], credit_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Installment ────────────────────────────────────────────

    pub fn insert_installment(&self, i: &Installment) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO installment (
                installment_id, credit_id, number, capital_amount, interest_amount,
                total_amount, due_date, paid_date, paid_amount, penalty_amount, state,
                payment_method
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &i.installment_id,
                &i.credit_id,
                i.number,
                dec_text(i.capital_amount),
                dec_text(i.interest_amount),
                dec_text(i.total_amount),
                i.due_date,
                i.paid_date,
                dec_text(i.paid_amount),
                dec_text(i.penalty_amount),
                i.state,
                i.payment_method.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn update_installment(&self, i: &Installment) -> CollectionsResult<()> {
        let changed = self.conn.execute(
            "UPDATE installment SET paid_date = ?1, paid_amount = ?2, penalty_amount = ?3,
                state = ?4, payment_method = ?5
             WHERE installment_id = ?6",
            params![
                i.paid_date,
                dec_text(i.paid_amount),
                dec_text(i.penalty_amount),
                i.state,
                i.payment_method.as_deref(),
                &i.installment_id,
            ],
        )?;
        if changed == 0 {
            return Err(CollectionsError::not_found("installment", &i.installment_id));
        }
        Ok(())
    }

    pub fn get_installment(&self, installment_id: &str) -> CollectionsResult<Installment> {
        self.conn
            .query_row(
                &format!("SELECT {INSTALLMENT_COLUMNS} FROM installment i WHERE i.installment_id = ?1"),
                params![installment_id],
                installment_row_mapper,
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("installment", installment_id))
    }

    pub fn installments_for_credit(&self, credit_id: &str) -> CollectionsResult<Vec<Installment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTALLMENT_COLUMNS} FROM installment i
             WHERE i.credit_id = ?1 ORDER BY i.number"
        ))?;
        let rows = stmt.query_map(params![credit_id], installment_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Open installments of collectible credits due on or before `as_of`.
    pub fn installments_due_or_overdue(&self, as_of: NaiveDate) -> CollectionsResult<Vec<Installment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTALLMENT_COLUMNS} FROM installment i
             JOIN credit c ON c.credit_id = i.credit_id
             WHERE c.state IN {COLLECTIBLE}
               AND i.state NOT IN {CLOSED_INSTALLMENT}
               AND i.due_date <= ?1
             ORDER BY i.credit_id, i.number"
        ))?;
        let rows = stmt.query_map(params![as_of], installment_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn open_installments_for_client(
        &self,
        client_id: &str,
        as_of: NaiveDate,
    ) -> CollectionsResult<Vec<Installment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTALLMENT_COLUMNS} FROM installment i
             JOIN credit c ON c.credit_id = i.credit_id
             WHERE c.client_id = ?1
               AND c.state IN {COLLECTIBLE}
               AND i.state NOT IN {CLOSED_INSTALLMENT}
               AND i.due_date <= ?2
             ORDER BY i.credit_id, i.number"
        ))?;
        let rows = stmt.query_map(params![client_id, as_of], installment_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn installment_numbers(&self, credit_id: &str) -> CollectionsResult<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT number FROM installment WHERE credit_id = ?1 ORDER BY number")?;
        let rows = stmt.query_map(params![credit_id], |row| row.get::<_, u32>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn open_installment_count(&self, credit_id: &str) -> CollectionsResult<u32> {
        let count: u32 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM installment
                 WHERE credit_id = ?1 AND state NOT IN {CLOSED_INSTALLMENT}"
            ),
            params![credit_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Payment ────────────────────────────────────────────────

    pub fn insert_payment(&self, p: &Payment) -> CollectionsResult<()> {
        self.conn.execute(
            "INSERT INTO payment (
                payment_id, installment_id, credit_id, amount, paid_at, method,
                reverses_payment_id, reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &p.payment_id,
                &p.installment_id,
                &p.credit_id,
                dec_text(p.amount),
                p.paid_at,
                p.method.as_deref(),
                p.reverses_payment_id.as_deref(),
                p.reason.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub fn get_payment(&self, payment_id: &str) -> CollectionsResult<Payment> {
        self.conn
            .query_row(
                "SELECT payment_id, installment_id, credit_id, amount, paid_at, method,
                        reverses_payment_id, reason
                 FROM payment WHERE payment_id = ?1",
                params![payment_id],
                payment_row_mapper,
            )
            .optional()?
            .ok_or_else(|| CollectionsError::not_found("payment", payment_id))
    }

    pub fn is_payment_reversed(&self, payment_id: &str) -> CollectionsResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM payment WHERE reverses_payment_id = ?1",
            params![payment_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn payments_for_installment(&self, installment_id: &str) -> CollectionsResult<Vec<Payment>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, installment_id, credit_id, amount, paid_at, method,
                    reverses_payment_id, reason
             FROM payment WHERE installment_id = ?1
             ORDER BY paid_at, rowid",
        )?;
        let rows = stmt.query_map(params![installment_id], payment_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Net money (reversals included) received on an installment since `since`.
    pub fn payments_for_installment_since(
        &self,
        installment_id: &str,
        since: NaiveDateTime,
    ) -> CollectionsResult<Decimal> {
        self.sum_payments(
            "SELECT amount FROM payment WHERE installment_id = ?1 AND paid_at >= ?2",
            installment_id,
            since,
        )
    }

    /// Net money received on any installment of a credit since `since`.
    pub fn payments_for_credit_since(
        &self,
        credit_id: &str,
        since: NaiveDateTime,
    ) -> CollectionsResult<Decimal> {
        self.sum_payments(
            "SELECT amount FROM payment WHERE credit_id = ?1 AND paid_at >= ?2",
            credit_id,
            since,
        )
    }

    fn sum_payments(&self, sql: &str, key: &str, since: NaiveDateTime) -> CollectionsResult<Decimal> {
        let mut stmt = self.conn.prepare(sql)?;
        let amounts = stmt
            .query_map(params![key, since], |row| dec_col(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(amounts.into_iter().sum())
    }
}
