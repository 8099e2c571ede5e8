//! Restructuring engine: payment agreements (acuerdos de pago).
//!
//! RULE: The restructuring engine is the only component that mutates
//! PaymentAgreement and AgreementInstallment rows. Source installments
//! are written off through the ledger, and the originating alert is
//! resolved through the alert manager.
//!
//! An agreement consolidates the unpaid balance of some overdue
//! installments, optionally forgives part of their penalty, and
//! refinances the rest over a new gap-free schedule:
//!
//!   total_agreed = original_debt + original_penalty − condoned
//!   financed     = total_agreed − upfront

use crate::{
    alerts::{check_version, AlertManager, AlertType, RESOLUTION_PAID, RESOLUTION_RESTRUCTURED},
    calculator::classify,
    config::{DelinquencyConfig, RestructuringPolicy},
    error::{CollectionsError, CollectionsResult},
    event::CollectionsEvent,
    ledger::{check_sequence, CreditState, Installment, InstallmentLedger},
    store::CollectionsStore,
    types::{new_id, round_money, split_evenly, storage_enum, EntityId},
};
use chrono::{Months, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

storage_enum! {
    pub enum AgreementState {
        Draft => "draft",
        Active => "active",
        Completed => "completed",
        Breached => "breached",
        Cancelled => "cancelled",
    }
}

impl AgreementState {
    pub fn can_transition_to(self, next: AgreementState) -> bool {
        use AgreementState::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Cancelled)
                | (Active, Completed)
                | (Active, Breached)
                | (Breached, Completed)
        )
    }

    /// A breached agreement stays collectible: its unpaid installments are
    /// what the credit still owes.
    pub fn accepts_payments(self) -> bool {
        matches!(self, AgreementState::Active | AgreementState::Breached)
    }
}

storage_enum! {
    pub enum AgreementInstallmentState {
        Pending => "pending",
        Overdue => "overdue",
        PartiallyPaid => "partially_paid",
        Paid => "paid",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAgreement {
    pub agreement_id: EntityId,
    pub alert_id: EntityId,
    pub client_id: EntityId,
    pub credit_id: EntityId,
    /// Sequence of this agreement within its credit, starting at 1.
    pub number: u32,
    pub created_at: NaiveDateTime,
    pub activated_at: Option<NaiveDateTime>,
    pub state: AgreementState,
    pub original_debt: Decimal,
    pub original_penalty: Decimal,
    pub condoned_amount: Decimal,
    pub total_agreed: Decimal,
    pub upfront_amount: Decimal,
    pub upfront_paid: bool,
    /// Policy in force when proposed; activation does not re-read config.
    pub requires_upfront: bool,
    pub installment_count: u32,
    pub first_installment_date: NaiveDate,
    pub agreement_installment_amount: Decimal,
    pub created_by: EntityId,
    pub approved_by: Option<EntityId>,
    pub source_installment_ids: Vec<EntityId>,
    pub version: i64,
}

impl PaymentAgreement {
    /// Penalty still owed after condonation.
    pub fn net_penalty(&self) -> Decimal {
        self.original_penalty - self.condoned_amount
    }

    pub fn financed_amount(&self) -> Decimal {
        self.total_agreed - self.upfront_amount
    }

    fn ready_to_activate(&self) -> bool {
        self.state == AgreementState::Draft
            && self.approved_by.is_some()
            && (!self.requires_upfront || self.upfront_paid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementInstallment {
    pub installment_id: EntityId,
    pub agreement_id: EntityId,
    pub number: u32,
    /// Refinanced capital and interest.
    pub capital: Decimal,
    pub penalty: Decimal,
    pub total: Decimal,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub paid_amount: Decimal,
    pub state: AgreementInstallmentState,
}

impl AgreementInstallment {
    pub fn remaining(&self) -> Decimal {
        (self.total - self.paid_amount).max(Decimal::ZERO)
    }

    fn is_unpaid_on(&self, today: NaiveDate) -> bool {
        self.state != AgreementInstallmentState::Paid && self.due_date < today
    }
}

/// Operator request to restructure part of a credit's debt.
#[derive(Debug, Clone)]
pub struct AgreementProposal {
    pub alert_id: EntityId,
    pub installment_ids: Vec<EntityId>,
    pub condonation_requested: Decimal,
    pub upfront_amount: Decimal,
    pub installment_count: u32,
    pub first_installment_date: NaiveDate,
    pub created_by: EntityId,
}

/// What one lifecycle sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgreementSweep {
    pub installments_marked_overdue: u32,
    pub breached: Vec<EntityId>,
}

/// Validate a proposal against `policy` and lay out its schedule.
///
/// Pure: nothing is persisted. `installments` are the source installments
/// as currently stored; `number` is the agreement's sequence on the credit.
pub fn build_agreement(
    proposal: &AgreementProposal,
    client_id: &str,
    installments: &[Installment],
    policy: &RestructuringPolicy,
    number: u32,
    now: NaiveDateTime,
) -> CollectionsResult<(PaymentAgreement, Vec<AgreementInstallment>)> {
    let Some(first) = installments.first() else {
        return Err(anyhow::anyhow!("An agreement needs at least one source installment").into());
    };
    if proposal.installment_count == 0 || proposal.installment_count > policy.max_installments {
        return Err(anyhow::anyhow!(
            "Agreement installment count {} outside 1..={}",
            proposal.installment_count,
            policy.max_installments
        )
        .into());
    }
    if let Some(closed) = installments.iter().find(|i| !i.state.is_open()) {
        return Err(CollectionsError::InvalidTransition {
            entity: "installment",
            from: closed.state.to_string(),
            to: "restructured".into(),
        });
    }
    if let Some(stray) = installments.iter().find(|i| i.credit_id != first.credit_id) {
        return Err(anyhow::anyhow!(
            "Installment {} is on credit {}, not {}",
            stray.installment_id,
            stray.credit_id,
            first.credit_id
        )
        .into());
    }

    let original_debt: Decimal = installments.iter().map(Installment::remaining_total).sum();
    let original_penalty: Decimal = installments
        .iter()
        .map(|i| i.amount_owed() - i.remaining_total())
        .sum();

    let condoned = proposal.condonation_requested;
    let max_allowed = original_penalty * policy.max_condonation_percentage;
    if condoned < Decimal::ZERO || condoned > max_allowed {
        return Err(CollectionsError::InvalidCondonation {
            requested: condoned,
            max_allowed,
        });
    }

    let total_agreed = original_debt + original_penalty - condoned;
    let upfront = proposal.upfront_amount;
    if upfront < Decimal::ZERO || upfront > total_agreed {
        return Err(CollectionsError::InvalidPayment {
            reason: format!("upfront {upfront} outside 0..={total_agreed}"),
        });
    }
    if policy.requires_upfront {
        let required = round_money(total_agreed * policy.min_upfront_percentage);
        if upfront < required {
            return Err(CollectionsError::InsufficientUpfront {
                offered: upfront,
                required,
            });
        }
    }

    // The penalty share of the financed part follows the agreed mix.
    let financed = total_agreed - upfront;
    let net_penalty = original_penalty - condoned;
    let penalty_financed = if total_agreed.is_zero() {
        Decimal::ZERO
    } else {
        round_money(net_penalty * financed / total_agreed)
    };
    let capital_parts = split_evenly(financed - penalty_financed, proposal.installment_count);
    let penalty_parts = split_evenly(penalty_financed, proposal.installment_count);

    let agreement_id = new_id("acu");
    let mut schedule = Vec::with_capacity(proposal.installment_count as usize);
    for (i, (capital, penalty)) in capital_parts.into_iter().zip(penalty_parts).enumerate() {
        let offset = policy.interval_months * i as u32;
        let due_date = proposal
            .first_installment_date
            .checked_add_months(Months::new(offset))
            .ok_or_else(|| anyhow::anyhow!("Due date overflow for agreement installment {}", i + 1))?;
        schedule.push(AgreementInstallment {
            installment_id: new_id("acq"),
            agreement_id: agreement_id.clone(),
            number: i as u32 + 1,
            capital,
            penalty,
            total: capital + penalty,
            due_date,
            paid_date: None,
            paid_amount: Decimal::ZERO,
            state: AgreementInstallmentState::Pending,
        });
    }

    let agreement = PaymentAgreement {
        agreement_id,
        alert_id: proposal.alert_id.clone(),
        client_id: client_id.to_string(),
        credit_id: first.credit_id.clone(),
        number,
        created_at: now,
        activated_at: None,
        state: AgreementState::Draft,
        original_debt,
        original_penalty,
        condoned_amount: condoned,
        total_agreed,
        upfront_amount: upfront,
        upfront_paid: false,
        requires_upfront: policy.requires_upfront,
        installment_count: proposal.installment_count,
        first_installment_date: proposal.first_installment_date,
        agreement_installment_amount: schedule.first().map(|q| q.total).unwrap_or_default(),
        created_by: proposal.created_by.clone(),
        approved_by: None,
        source_installment_ids: installments.iter().map(|i| i.installment_id.clone()).collect(),
        version: 1,
    };
    Ok((agreement, schedule))
}

/// Length of the longest run of consecutive (by number) unpaid past-due
/// agreement installments.
pub fn consecutive_overdue(schedule: &[AgreementInstallment], today: NaiveDate) -> u32 {
    let mut sorted: Vec<&AgreementInstallment> = schedule.iter().collect();
    sorted.sort_by_key(|q| q.number);
    let (mut run, mut longest) = (0u32, 0u32);
    for q in sorted {
        if q.is_unpaid_on(today) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

pub struct RestructuringEngine<'a> {
    scope: &'a str,
    store: &'a CollectionsStore,
}

impl<'a> RestructuringEngine<'a> {
    pub fn new(scope: &'a str, store: &'a CollectionsStore) -> Self {
        Self { scope, store }
    }

    pub fn agreement(&self, agreement_id: &str) -> CollectionsResult<PaymentAgreement> {
        self.store.get_agreement(agreement_id)
    }

    pub fn schedule(&self, agreement_id: &str) -> CollectionsResult<Vec<AgreementInstallment>> {
        self.store.agreement_installments(agreement_id)
    }

    /// Validate and store a Draft agreement. A rejected proposal writes nothing.
    pub fn propose(
        &self,
        proposal: &AgreementProposal,
        policy: &RestructuringPolicy,
        now: NaiveDateTime,
    ) -> CollectionsResult<(PaymentAgreement, Vec<AgreementInstallment>)> {
        self.store.atomically(|store| {
            let alert = store.get_alert(&proposal.alert_id)?;
            if alert.resolved {
                return Err(CollectionsError::InvalidTransition {
                    entity: "alert",
                    from: "resolved".into(),
                    to: "restructured".into(),
                });
            }
            let mut installments = Vec::with_capacity(proposal.installment_ids.len());
            for id in &proposal.installment_ids {
                if store.installment_in_open_agreement(id)? {
                    return Err(CollectionsError::InvalidTransition {
                        entity: "installment",
                        from: "in agreement".into(),
                        to: "restructured".into(),
                    });
                }
                let installment = store.get_installment(id)?;
                if installment.credit_id != alert.credit_id {
                    return Err(anyhow::anyhow!(
                        "Installment {id} does not belong to credit {}",
                        alert.credit_id
                    )
                    .into());
                }
                installments.push(installment);
            }
            installments.sort_by_key(|i| i.number);

            let number = store.agreement_count_for_credit(&alert.credit_id)? + 1;
            let (agreement, schedule) =
                build_agreement(proposal, &alert.client_id, &installments, policy, number, now)?;
            let numbers: Vec<u32> = schedule.iter().map(|q| q.number).collect();
            check_sequence(&format!("agreement {}", agreement.agreement_id), &numbers)?;

            store.insert_agreement(&agreement)?;
            for q in &schedule {
                store.insert_agreement_installment(q)?;
            }
            store.record_event(
                self.scope,
                now,
                &CollectionsEvent::AgreementProposed {
                    agreement_id: agreement.agreement_id.clone(),
                    credit_id: agreement.credit_id.clone(),
                    total_agreed: agreement.total_agreed,
                    condoned_amount: agreement.condoned_amount,
                },
            )?;
            log::info!(
                "agreement {} proposed on credit {}: {} agreed, {} condoned",
                agreement.agreement_id,
                agreement.credit_id,
                agreement.total_agreed,
                agreement.condoned_amount
            );
            Ok((agreement, schedule))
        })
    }

    /// Record the approver; activates when no upfront payment is pending.
    pub fn approve(
        &self,
        agreement_id: &str,
        approved_by: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        self.store.atomically(|store| {
            let mut agreement = store.get_agreement(agreement_id)?;
            check_version("agreement", agreement_id, agreement.version, expected_version)?;
            self.require_draft(&agreement, AgreementState::Active)?;
            agreement.approved_by = Some(approved_by.to_string());
            let agreement = store.update_agreement(&agreement)?;
            self.activate_if_ready(agreement, now)
        })
    }

    /// Mark the upfront payment received; activates when already approved.
    pub fn record_upfront_payment(
        &self,
        agreement_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        self.store.atomically(|store| {
            let mut agreement = store.get_agreement(agreement_id)?;
            check_version("agreement", agreement_id, agreement.version, expected_version)?;
            self.require_draft(&agreement, AgreementState::Active)?;
            if agreement.upfront_paid {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("upfront of {agreement_id} already recorded"),
                });
            }
            agreement.upfront_paid = true;
            let agreement = store.update_agreement(&agreement)?;
            self.activate_if_ready(agreement, now)
        })
    }

    /// Withdraw a Draft agreement. Not allowed once upfront money was taken.
    pub fn cancel(
        &self,
        agreement_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        self.store.atomically(|store| {
            let agreement = store.get_agreement(agreement_id)?;
            check_version("agreement", agreement_id, agreement.version, expected_version)?;
            self.require_draft(&agreement, AgreementState::Cancelled)?;
            if agreement.upfront_paid {
                return Err(CollectionsError::InvalidTransition {
                    entity: "agreement",
                    from: "draft with upfront paid".into(),
                    to: AgreementState::Cancelled.to_string(),
                });
            }
            self.set_state(agreement, AgreementState::Cancelled, now)
        })
    }

    /// Pay (part of) one agreement installment.
    ///
    /// Money settles the refinanced capital before the penalty portion; only
    /// the capital part reduces the credit's outstanding balance. Breached
    /// agreements keep taking payments; paying one off resolves its breach
    /// alert.
    pub fn record_agreement_payment(
        &self,
        agreement_id: &str,
        number: u32,
        amount: Decimal,
        paid_at: NaiveDateTime,
    ) -> CollectionsResult<AgreementInstallment> {
        if amount <= Decimal::ZERO {
            return Err(CollectionsError::InvalidPayment {
                reason: format!("amount must be positive, got {amount}"),
            });
        }
        let ledger = InstallmentLedger::new(self.scope, self.store);
        self.store.atomically(|store| {
            let agreement = store.get_agreement(agreement_id)?;
            if !agreement.state.accepts_payments() {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("agreement {agreement_id} is {}", agreement.state),
                });
            }
            let mut schedule = store.agreement_installments(agreement_id)?;
            let Some(q) = schedule.iter_mut().find(|q| q.number == number) else {
                return Err(CollectionsError::not_found(
                    "agreement_installment",
                    format!("{agreement_id}#{number}"),
                ));
            };
            if amount > q.remaining() {
                return Err(CollectionsError::InvalidPayment {
                    reason: format!("payment {amount} exceeds remaining {}", q.remaining()),
                });
            }

            let capital_left = (q.capital - q.paid_amount).max(Decimal::ZERO);
            let capital_applied = amount.min(capital_left);
            q.paid_amount += amount;
            q.paid_date = Some(paid_at.date());
            q.state = if q.paid_amount >= q.total {
                AgreementInstallmentState::Paid
            } else {
                AgreementInstallmentState::PartiallyPaid
            };
            store.update_agreement_installment(q)?;
            let paid = q.clone();

            if capital_applied > Decimal::ZERO {
                ledger.apply_agreement_payment(&agreement.credit_id, capital_applied)?;
            }
            store.record_event(
                self.scope,
                paid_at,
                &CollectionsEvent::AgreementPaymentRecorded {
                    agreement_id: agreement_id.to_string(),
                    number,
                    amount,
                },
            )?;

            if schedule
                .iter()
                .all(|q| q.state == AgreementInstallmentState::Paid)
            {
                let credit_id = agreement.credit_id.clone();
                let was_breached = agreement.state == AgreementState::Breached;
                self.set_state(agreement, AgreementState::Completed, paid_at)?;
                if was_breached {
                    if let Some(alert) =
                        store.open_credit_alert(&credit_id, AlertType::AgreementBreached)?
                    {
                        AlertManager::new(self.scope, self.store)
                            .resolve(alert, RESOLUTION_PAID, paid_at)?;
                    }
                }
                if let Some(credit) = ledger.complete_if_settled(&credit_id, paid_at.date())? {
                    log::info!("credit {} completed through agreement", credit.credit_id);
                }
            }
            Ok(paid)
        })
    }

    /// Mark past-due agreement installments and breach agreements with too
    /// many consecutive misses. Each breach raises a credit-level alert and
    /// moves an Active credit to Defaulted.
    pub fn sweep(
        &self,
        config: &DelinquencyConfig,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> CollectionsResult<AgreementSweep> {
        let mut report = AgreementSweep::default();
        for agreement in self.store.agreements_in_state(AgreementState::Active)? {
            let agreement_id = agreement.agreement_id.clone();
            let breached = self.store.atomically(|store| {
                let mut schedule = store.agreement_installments(&agreement_id)?;
                for q in schedule.iter_mut() {
                    if q.state == AgreementInstallmentState::Pending && q.due_date < today {
                        q.state = AgreementInstallmentState::Overdue;
                        store.update_agreement_installment(q)?;
                        report.installments_marked_overdue += 1;
                    }
                }
                if consecutive_overdue(&schedule, today)
                    < config.restructuring.breach_after_consecutive
                {
                    return Ok(false);
                }
                self.breach(agreement, &schedule, config, today, now)?;
                Ok(true)
            })?;
            if breached {
                report.breached.push(agreement_id);
            }
        }
        Ok(report)
    }

    fn breach(
        &self,
        agreement: PaymentAgreement,
        schedule: &[AgreementInstallment],
        config: &DelinquencyConfig,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> CollectionsResult<()> {
        let overdue: Vec<&AgreementInstallment> =
            schedule.iter().filter(|q| q.is_unpaid_on(today)).collect();
        let overdue_amount: Decimal = overdue.iter().map(|q| q.remaining()).sum();
        let days = overdue
            .iter()
            .map(|q| (today - q.due_date).num_days().max(0) as u32)
            .max()
            .unwrap_or(0);
        let ledger = InstallmentLedger::new(self.scope, self.store);
        let credit = ledger.credit(&agreement.credit_id)?;
        let agreement = self.set_state(agreement, AgreementState::Breached, now)?;

        AlertManager::new(self.scope, self.store).raise_credit_alert(
            &credit,
            AlertType::AgreementBreached,
            format!(
                "Agreement #{} on credit {} breached: {} installments overdue",
                agreement.number,
                credit.credit_id,
                overdue.len()
            ),
            overdue_amount,
            overdue.len() as u32,
            days,
            classify(days, overdue_amount, &config.priority),
            now,
        )?;
        if credit.state == CreditState::Active {
            ledger.transition_credit(&credit.credit_id, CreditState::Defaulted, today)?;
        }
        log::warn!(
            "agreement {} breached, {overdue_amount} overdue",
            agreement.agreement_id
        );
        Ok(())
    }

    fn activate_if_ready(
        &self,
        agreement: PaymentAgreement,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        if !agreement.ready_to_activate() {
            return Ok(agreement);
        }
        let ledger = InstallmentLedger::new(self.scope, self.store);
        let alerts = AlertManager::new(self.scope, self.store);

        for installment_id in &agreement.source_installment_ids {
            ledger.write_off(installment_id)?;
            alerts.resolve_for_installment(installment_id, RESOLUTION_RESTRUCTURED, now)?;
        }
        let origin = self.store.get_alert(&agreement.alert_id)?;
        alerts.resolve(origin, RESOLUTION_RESTRUCTURED, now)?;

        // Upfront money covers the penalty part not carried by the schedule
        // first; the rest is capital.
        let penalty_financed: Decimal = self
            .store
            .agreement_installments(&agreement.agreement_id)?
            .iter()
            .map(|q| q.penalty)
            .sum();
        let upfront_penalty = agreement.net_penalty() - penalty_financed;
        let upfront_capital = (agreement.upfront_amount - upfront_penalty).max(Decimal::ZERO);
        if upfront_capital > Decimal::ZERO {
            ledger.apply_agreement_payment(&agreement.credit_id, upfront_capital)?;
        }

        let mut agreement = agreement;
        agreement.activated_at = Some(now);
        self.set_state(agreement, AgreementState::Active, now)
    }

    fn require_draft(&self, agreement: &PaymentAgreement, to: AgreementState) -> CollectionsResult<()> {
        if agreement.state != AgreementState::Draft {
            return Err(CollectionsError::InvalidTransition {
                entity: "agreement",
                from: agreement.state.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn set_state(
        &self,
        mut agreement: PaymentAgreement,
        to: AgreementState,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        let from = agreement.state;
        if !from.can_transition_to(to) {
            return Err(CollectionsError::InvalidTransition {
                entity: "agreement",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        agreement.state = to;
        let agreement = self.store.update_agreement(&agreement)?;
        self.store.record_event(
            self.scope,
            now,
            &CollectionsEvent::AgreementStateChanged {
                agreement_id: agreement.agreement_id.clone(),
                from,
                to,
            },
        )?;
        log::info!("agreement {} {from} -> {to}", agreement.agreement_id);
        Ok(agreement)
    }
}
