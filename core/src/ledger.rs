//! Installment ledger: credits, installments and payments.
//!
//! RULE: The ledger is the only component that mutates Credit and
//! Installment rows. Everything else reads them or asks the ledger.
//!
//! Payments are append-only. A correction is a reversal entry, never an
//! in-place edit, and no payment operation touches an installment's
//! accrued penalty.

use crate::{
    calculator::DelinquencyResult,
    error::{CollectionsError, CollectionsResult},
    event::CollectionsEvent,
    store::CollectionsStore,
    types::{new_id, split_evenly, storage_enum, EntityId},
};
use chrono::{Months, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

storage_enum! {
    pub enum CreditState {
        Requested => "requested",
        Approved => "approved",
        Disbursed => "disbursed",
        Active => "active",
        Completed => "completed",
        Defaulted => "defaulted",
        Cancelled => "cancelled",
    }
}

impl CreditState {
    /// Forward-only lifecycle. Terminal states never move again.
    pub fn can_transition_to(self, next: CreditState) -> bool {
        use CreditState::*;
        matches!(
            (self, next),
            (Requested, Approved)
                | (Requested, Cancelled)
                | (Approved, Disbursed)
                | (Approved, Cancelled)
                | (Disbursed, Active)
                | (Active, Completed)
                | (Active, Defaulted)
                | (Defaulted, Completed)
        )
    }

    /// Credits whose installments the batch keeps evaluating.
    pub fn is_collectible(self) -> bool {
        matches!(
            self,
            CreditState::Disbursed | CreditState::Active | CreditState::Defaulted
        )
    }
}

storage_enum! {
    pub enum InstallmentState {
        Pending => "pending",
        Due => "due",
        Overdue => "overdue",
        PartiallyPaid => "partially_paid",
        Paid => "paid",
        WrittenOff => "written_off",
    }
}

impl InstallmentState {
    pub fn is_open(self) -> bool {
        !matches!(self, InstallmentState::Paid | InstallmentState::WrittenOff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub credit_id: EntityId,
    pub client_id: EntityId,
    pub principal_requested: Decimal,
    pub principal_approved: Decimal,
    pub nominal_rate: Decimal,
    pub installment_count: u32,
    pub installment_amount: Decimal,
    /// CFTEA: total effective annual cost rate.
    pub total_cost_rate: Decimal,
    pub total_payable: Decimal,
    pub outstanding_balance: Decimal,
    pub state: CreditState,
    pub request_date: NaiveDate,
    pub approval_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub first_installment_date: NaiveDate,
    pub initial_risk_score: Decimal,
    pub guarantor_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub installment_id: EntityId,
    pub credit_id: EntityId,
    pub number: u32,
    pub capital_amount: Decimal,
    pub interest_amount: Decimal,
    pub total_amount: Decimal,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub paid_amount: Decimal,
    pub penalty_amount: Decimal,
    pub state: InstallmentState,
    pub payment_method: Option<String>,
}

impl Installment {
    /// Capital + interest still unpaid. Payments settle this before penalty.
    pub fn remaining_total(&self) -> Decimal {
        (self.total_amount - self.paid_amount).max(Decimal::ZERO)
    }

    /// Everything still owed, penalty included.
    pub fn amount_owed(&self) -> Decimal {
        (self.total_amount + self.penalty_amount - self.paid_amount).max(Decimal::ZERO)
    }

    pub fn is_settled(&self) -> bool {
        self.paid_amount >= self.total_amount + self.penalty_amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: EntityId,
    pub installment_id: EntityId,
    pub credit_id: EntityId,
    /// Negative for reversal entries.
    pub amount: Decimal,
    pub paid_at: NaiveDateTime,
    pub method: Option<String>,
    pub reverses_payment_id: Option<EntityId>,
    pub reason: Option<String>,
}

/// Result of recording one payment.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub installment: Installment,
    pub previous_state: InstallmentState,
    pub outstanding_decrement: Decimal,
    pub credit_completed: bool,
}

impl PaymentReceipt {
    pub fn settled_installment(&self) -> bool {
        self.installment.state == InstallmentState::Paid
    }
}

/// What applying one day's delinquency result changed on an installment.
#[derive(Debug, Clone)]
pub struct InstallmentUpdate {
    pub installment: Installment,
    pub previous_state: InstallmentState,
    pub previous_penalty: Decimal,
}

impl InstallmentUpdate {
    /// Penalty newly accrued by this update (zero on an idempotent re-run).
    pub fn penalty_increment(&self) -> Decimal {
        self.installment.penalty_amount - self.previous_penalty
    }

    pub fn changed(&self) -> bool {
        self.previous_state != self.installment.state
            || self.previous_penalty != self.installment.penalty_amount
    }
}

/// Build an evenly split monthly schedule for a new credit.
///
/// Capital and interest are split separately; the last installment absorbs
/// the rounding remainder of both.
pub fn level_schedule(
    credit_id: &str,
    capital: Decimal,
    interest: Decimal,
    count: u32,
    first_due: NaiveDate,
) -> CollectionsResult<Vec<Installment>> {
    let capital_parts = split_evenly(capital, count);
    let interest_parts = split_evenly(interest, count);
    let mut schedule = Vec::with_capacity(count as usize);
    for (i, (cap, int)) in capital_parts.into_iter().zip(interest_parts).enumerate() {
        let due_date = first_due
            .checked_add_months(Months::new(i as u32))
            .ok_or_else(|| anyhow::anyhow!("Due date overflow for installment {}", i + 1))?;
        schedule.push(Installment {
            installment_id: new_id("cuo"),
            credit_id: credit_id.to_string(),
            number: i as u32 + 1,
            capital_amount: cap,
            interest_amount: int,
            total_amount: cap + int,
            due_date,
            paid_date: None,
            paid_amount: Decimal::ZERO,
            penalty_amount: Decimal::ZERO,
            state: InstallmentState::Pending,
            payment_method: None,
        });
    }
    Ok(schedule)
}

/// Verify that `numbers` (in any order) form the gap-free sequence 1..=N.
pub fn check_sequence(owner: &str, numbers: &[u32]) -> CollectionsResult<()> {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    for (i, found) in sorted.into_iter().enumerate() {
        let expected = i as u32 + 1;
        if found != expected {
            return Err(CollectionsError::SequenceGap {
                owner: owner.to_string(),
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Next state and penalty for an installment given one evaluation.
///
/// Penalty is set to the freshly computed value, never lowered: a later
/// evaluation can only confirm or raise what was already accrued.
pub fn plan_delinquency_update(
    installment: &Installment,
    result: &DelinquencyResult,
    as_of: NaiveDate,
) -> Installment {
    let mut next = installment.clone();
    if !installment.state.is_open() {
        return next;
    }
    if result.is_delinquent {
        next.penalty_amount = installment.penalty_amount.max(result.penalty);
        if installment.state != InstallmentState::PartiallyPaid {
            next.state = InstallmentState::Overdue;
        }
    } else if installment.state == InstallmentState::Pending && as_of >= installment.due_date {
        next.state = InstallmentState::Due;
    }
    next
}

pub struct InstallmentLedger<'a> {
    scope: &'a str,
    store: &'a CollectionsStore,
}

impl<'a> InstallmentLedger<'a> {
    pub fn new(scope: &'a str, store: &'a CollectionsStore) -> Self {
        Self { scope, store }
    }

    /// Persist a credit together with its full installment schedule.
    pub fn open_credit(&self, credit: &Credit, schedule: &[Installment]) -> CollectionsResult<()> {
        let numbers: Vec<u32> = schedule.iter().map(|i| i.number).collect();
        check_sequence(&format!("credit {}", credit.credit_id), &numbers)?;
        if let Some(stray) = schedule.iter().find(|i| i.credit_id != credit.credit_id) {
            return Err(anyhow::anyhow!(
                "Installment {} belongs to credit {}, not {}",
                stray.installment_id,
                stray.credit_id,
                credit.credit_id
            )
            .into());
        }
        self.store.atomically(|store| {
            store.ensure_client_standing(
                &credit.client_id,
                credit.initial_risk_score,
                credit.request_date.and_time(NaiveTime::default()),
            )?;
            store.insert_credit(credit)?;
            for installment in schedule {
                store.insert_installment(installment)?;
            }
            Ok(())
        })
    }

    pub fn credit(&self, credit_id: &str) -> CollectionsResult<Credit> {
        self.store.get_credit(credit_id)
    }

    pub fn installment(&self, installment_id: &str) -> CollectionsResult<Installment> {
        self.store.get_installment(installment_id)
    }

    /// Move a credit forward in its lifecycle.
    pub fn transition_credit(
        &self,
        credit_id: &str,
        to: CreditState,
        on: NaiveDate,
    ) -> CollectionsResult<Credit> {
        let mut credit = self.store.get_credit(credit_id)?;
        if !credit.state.can_transition_to(to) {
            return Err(CollectionsError::InvalidTransition {
                entity: "credit",
                from: credit.state.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            CreditState::Approved => credit.approval_date = Some(on),
            CreditState::Completed | CreditState::Cancelled => credit.close_date = Some(on),
            _ => {}
        }
        credit.state = to;
        self.store.update_credit(&credit)?;
        log::info!("credit {credit_id} -> {to}");
        Ok(credit)
    }

    /// Open installments of collectible credits with `due_date <= as_of`,
    /// ordered by credit then installment number.
    pub fn find_due_or_overdue(&self, as_of: NaiveDate) -> CollectionsResult<Vec<Installment>> {
        self.store.installments_due_or_overdue(as_of)
    }

    /// Fail with `SequenceGap` if the credit's numbering has a hole.
    pub fn verify_sequence(&self, credit_id: &str) -> CollectionsResult<()> {
        let numbers = self.store.installment_numbers(credit_id)?;
        check_sequence(&format!("credit {credit_id}"), &numbers)
    }

    /// Write the day's penalty and state onto the installment.
    pub fn apply_delinquency_result(
        &self,
        installment: &Installment,
        result: &DelinquencyResult,
        as_of: NaiveDate,
    ) -> CollectionsResult<InstallmentUpdate> {
        let next = plan_delinquency_update(installment, result, as_of);
        let update = InstallmentUpdate {
            previous_state: installment.state,
            previous_penalty: installment.penalty_amount,
            installment: next,
        };
        if update.changed() {
            self.store.update_installment(&update.installment)?;
        }
        Ok(update)
    }

    /// Record a payment against one installment, transactionally with the
    /// credit's outstanding balance.
    pub fn record_payment(
        &self,
        installment_id: &str,
        amount: Decimal,
        paid_at: NaiveDateTime,
        method: Option<&str>,
    ) -> CollectionsResult<PaymentReceipt> {
        if amount <= Decimal::ZERO {
            return Err(CollectionsError::InvalidPayment {
                reason: format!("amount must be positive, got {amount}"),
            });
        }
        self.store.atomically(|store| {
            let mut installment = store.get_installment(installment_id)?;
            if !installment.state.is_open() {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!(
                        "installment {installment_id} is {} and accepts no payments",
                        installment.state
                    ),
                });
            }
            let owed = installment.amount_owed();
            if amount > owed {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("payment {amount} exceeds amount owed {owed}"),
                });
            }

            let mut credit = store.get_credit(&installment.credit_id)?;
            let previous_state = installment.state;
            let remaining_before = installment.remaining_total();

            installment.paid_amount += amount;
            installment.paid_date = Some(paid_at.date());
            installment.payment_method = method.map(String::from);
            installment.state = if installment.is_settled() {
                InstallmentState::Paid
            } else {
                InstallmentState::PartiallyPaid
            };

            let outstanding_decrement = remaining_before - installment.remaining_total();
            credit.outstanding_balance =
                (credit.outstanding_balance - outstanding_decrement).max(Decimal::ZERO);

            let payment = Payment {
                payment_id: new_id("pay"),
                installment_id: installment.installment_id.clone(),
                credit_id: credit.credit_id.clone(),
                amount,
                paid_at,
                method: method.map(String::from),
                reverses_payment_id: None,
                reason: None,
            };
            store.insert_payment(&payment)?;
            store.update_installment(&installment)?;

            let credit_completed = installment.state == InstallmentState::Paid
                && credit.state.can_transition_to(CreditState::Completed)
                && store.open_installment_count(&credit.credit_id)? == 0
                && store.unpaid_agreement_installment_count(&credit.credit_id)? == 0;
            if credit_completed {
                credit.state = CreditState::Completed;
                credit.close_date = Some(paid_at.date());
                credit.outstanding_balance = Decimal::ZERO;
            }
            store.update_credit(&credit)?;

            store.record_event(
                self.scope,
                paid_at,
                &CollectionsEvent::PaymentRecorded {
                    payment_id: payment.payment_id.clone(),
                    installment_id: installment.installment_id.clone(),
                    credit_id: credit.credit_id.clone(),
                    amount,
                    installment_state: installment.state,
                },
            )?;
            log::info!(
                "payment {} of {amount} on installment {} -> {}",
                payment.payment_id,
                installment.installment_id,
                installment.state
            );

            Ok(PaymentReceipt {
                payment,
                installment,
                previous_state,
                outstanding_decrement,
                credit_completed,
            })
        })
    }

    /// Append a reversal entry for an earlier payment.
    pub fn reverse_payment(
        &self,
        payment_id: &str,
        reason: &str,
        at: NaiveDateTime,
    ) -> CollectionsResult<Payment> {
        self.store.atomically(|store| {
            let original = store.get_payment(payment_id)?;
            if original.reverses_payment_id.is_some() {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("{payment_id} is itself a reversal"),
                });
            }
            if store.is_payment_reversed(payment_id)? {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("{payment_id} was already reversed"),
                });
            }
            let mut installment = store.get_installment(&original.installment_id)?;
            let mut credit = store.get_credit(&original.credit_id)?;
            if !credit.state.is_collectible() {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!(
                        "credit {} is {} and cannot take reversals",
                        credit.credit_id, credit.state
                    ),
                });
            }
            if installment.state == InstallmentState::WrittenOff {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!(
                        "installment {} was restructured",
                        installment.installment_id
                    ),
                });
            }

            let remaining_before = installment.remaining_total();
            installment.paid_amount = (installment.paid_amount - original.amount).max(Decimal::ZERO);
            installment.state = if installment.paid_amount > Decimal::ZERO {
                InstallmentState::PartiallyPaid
            } else if installment.penalty_amount > Decimal::ZERO {
                InstallmentState::Overdue
            } else if installment.due_date <= at.date() {
                InstallmentState::Due
            } else {
                InstallmentState::Pending
            };
            if installment.paid_amount.is_zero() {
                installment.paid_date = None;
            }
            let increment = installment.remaining_total() - remaining_before;
            credit.outstanding_balance =
                (credit.outstanding_balance + increment).min(credit.total_payable);

            let reversal = Payment {
                payment_id: new_id("pay"),
                installment_id: original.installment_id.clone(),
                credit_id: original.credit_id.clone(),
                amount: -original.amount,
                paid_at: at,
                method: original.method.clone(),
                reverses_payment_id: Some(original.payment_id.clone()),
                reason: Some(reason.to_string()),
            };
            store.insert_payment(&reversal)?;
            store.update_installment(&installment)?;
            store.update_credit(&credit)?;
            store.record_event(
                self.scope,
                at,
                &CollectionsEvent::PaymentReversed {
                    payment_id: original.payment_id.clone(),
                    reversal_id: reversal.payment_id.clone(),
                    installment_id: installment.installment_id.clone(),
                    amount: original.amount,
                },
            )?;
            log::warn!("payment {payment_id} reversed: {reason}");
            Ok(reversal)
        })
    }

    /// Absorb an installment into a payment agreement.
    pub(crate) fn write_off(&self, installment_id: &str) -> CollectionsResult<Installment> {
        let mut installment = self.store.get_installment(installment_id)?;
        if !installment.state.is_open() {
            return Err(CollectionsError::InvalidTransition {
                entity: "installment",
                from: installment.state.to_string(),
                to: InstallmentState::WrittenOff.to_string(),
            });
        }
        installment.state = InstallmentState::WrittenOff;
        self.store.update_installment(&installment)?;
        Ok(installment)
    }

    /// Apply money received through a payment agreement to the credit.
    pub(crate) fn apply_agreement_payment(
        &self,
        credit_id: &str,
        capital: Decimal,
    ) -> CollectionsResult<Credit> {
        let mut credit = self.store.get_credit(credit_id)?;
        credit.outstanding_balance = (credit.outstanding_balance - capital).max(Decimal::ZERO);
        self.store.update_credit(&credit)?;
        Ok(credit)
    }

    /// Close the credit once an agreement settled everything left on it.
    pub(crate) fn complete_if_settled(
        &self,
        credit_id: &str,
        on: NaiveDate,
    ) -> CollectionsResult<Option<Credit>> {
        let mut credit = self.store.get_credit(credit_id)?;
        if !credit.state.can_transition_to(CreditState::Completed)
            || self.store.open_installment_count(credit_id)? > 0
            || self.store.unpaid_agreement_installment_count(credit_id)? > 0
        {
            return Ok(None);
        }
        credit.state = CreditState::Completed;
        credit.close_date = Some(on);
        credit.outstanding_balance = Decimal::ZERO;
        self.store.update_credit(&credit)?;
        Ok(Some(credit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn credit_states_only_move_forward() {
        assert!(CreditState::Requested.can_transition_to(CreditState::Approved));
        assert!(CreditState::Active.can_transition_to(CreditState::Completed));
        assert!(!CreditState::Active.can_transition_to(CreditState::Approved));
        assert!(!CreditState::Completed.can_transition_to(CreditState::Active));
        assert!(!CreditState::Cancelled.can_transition_to(CreditState::Requested));
    }

    #[test]
    fn schedule_is_gap_free_and_sums_to_totals() {
        let first = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        let schedule = level_schedule("cr-1", dec!(1000), dec!(100), 3, first).unwrap();
        assert_eq!(schedule.len(), 3);
        let numbers: Vec<u32> = schedule.iter().map(|i| i.number).collect();
        check_sequence("cr-1", &numbers).unwrap();
        let capital: Decimal = schedule.iter().map(|i| i.capital_amount).sum();
        let total: Decimal = schedule.iter().map(|i| i.total_amount).sum();
        assert_eq!(capital, dec!(1000));
        assert_eq!(total, dec!(1100));
        // Month-end clamps instead of overflowing into the next month.
        assert_eq!(schedule[1].due_date, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    }

    #[test]
    fn sequence_gap_is_reported() {
        let err = check_sequence("cr-9", &[1, 2, 4]).unwrap_err();
        match err {
            CollectionsError::SequenceGap { expected, found, .. } => {
                assert_eq!(expected, 3);
                assert_eq!(found, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn amounts_owed_include_penalty() {
        let first = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let mut inst = level_schedule("cr-1", dec!(100), dec!(0), 1, first).unwrap().remove(0);
        inst.penalty_amount = dec!(5);
        inst.paid_amount = dec!(60);
        assert_eq!(inst.remaining_total(), dec!(40));
        assert_eq!(inst.amount_owed(), dec!(45));
        assert!(!inst.is_settled());
    }
}
