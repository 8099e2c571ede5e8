//! Payment agreements end to end: proposal validation, approval and
//! upfront payment, activation side effects, repayment, breach and
//! collection after a breach.
//!
//! Fixture: two installments of 50 000 due 2025-01-10 and 2025-02-10,
//! evaluated on Monday 2025-03-03. The first carries the capped penalty
//! of 1 000, the second 800 (16 days at tier 1).

mod common;

use collections_core::{
    alerts::{Alert, AlertType, RESOLUTION_RESTRUCTURED},
    config::DelinquencyConfig,
    engine::CollectionsEngine,
    error::CollectionsError,
    ledger::{CreditState, Installment, InstallmentState},
    restructuring::{AgreementInstallmentState, AgreementProposal, AgreementState, PaymentAgreement},
};
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct Fixture {
    engine: CollectionsEngine,
    schedule: Vec<Installment>,
    alert: Alert,
}

fn fixture_with(config: &DelinquencyConfig) -> Fixture {
    let engine = engine_with(config, RecordingNotifier::default());
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(50000), 2, day(2025, 1, 10));
    engine.run(day(2025, 3, 3)).unwrap();
    let alert = engine
        .store()
        .open_alert_for_installment(&schedule[0].installment_id)
        .unwrap()
        .unwrap();
    Fixture { engine, schedule, alert }
}

fn fixture() -> Fixture {
    fixture_with(&DelinquencyConfig::documented_default())
}

fn proposal(f: &Fixture, condoned: Decimal, upfront: Decimal) -> AgreementProposal {
    AgreementProposal {
        alert_id: f.alert.alert_id.clone(),
        installment_ids: f.schedule.iter().map(|i| i.installment_id.clone()).collect(),
        condonation_requested: condoned,
        upfront_amount: upfront,
        installment_count: 4,
        first_installment_date: day(2025, 4, 1),
        created_by: "agent-7".into(),
    }
}

/// Propose, approve and pay the upfront: the agreement is Active.
fn activate(f: &Fixture) -> PaymentAgreement {
    let (draft, _) = f
        .engine
        .propose_agreement(&proposal(f, dec!(900), dec!(10900)), at(2025, 3, 3, 11))
        .unwrap();
    let approved = f
        .engine
        .approve_agreement(&draft.agreement_id, "supervisor-1", draft.version, at(2025, 3, 3, 12))
        .unwrap();
    assert_eq!(approved.state, AgreementState::Draft);
    f.engine
        .record_upfront_payment(&approved.agreement_id, approved.version, at(2025, 3, 4, 9))
        .unwrap()
}

/// Condonation above the configured share of the penalty is rejected and
/// nothing is written.
#[test]
fn excessive_condonation_is_rejected() {
    let f = fixture();
    let err = f
        .engine
        .propose_agreement(&proposal(&f, dec!(1000), dec!(20000)), at(2025, 3, 3, 11))
        .unwrap_err();
    match err {
        CollectionsError::InvalidCondonation { requested, max_allowed } => {
            assert_eq!(requested, dec!(1000));
            assert_eq!(max_allowed, dec!(900));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(f.engine.store().agreement_count_for_credit("cr-1").unwrap(), 0);
}

/// The upfront payment must cover the configured share of the agreed total.
#[test]
fn insufficient_upfront_is_rejected() {
    let f = fixture();
    let err = f
        .engine
        .propose_agreement(&proposal(&f, dec!(900), dec!(5000)), at(2025, 3, 3, 11))
        .unwrap_err();
    match err {
        CollectionsError::InsufficientUpfront { offered, required } => {
            assert_eq!(offered, dec!(5000));
            assert_eq!(required, dec!(10090));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(f.engine.store().agreement_count_for_credit("cr-1").unwrap(), 0);
}

/// A valid proposal is stored as a Draft with a gap-free schedule that,
/// with the upfront, adds up to the agreed total.
#[test]
fn proposal_lays_out_schedule() {
    let f = fixture();
    let (agreement, schedule) = f
        .engine
        .propose_agreement(&proposal(&f, dec!(900), dec!(10900)), at(2025, 3, 3, 11))
        .unwrap();

    assert_eq!(agreement.state, AgreementState::Draft);
    assert_eq!(agreement.number, 1);
    assert_eq!(agreement.original_debt, dec!(100000));
    assert_eq!(agreement.original_penalty, dec!(1800));
    assert_eq!(agreement.total_agreed, dec!(100900));
    assert_eq!(agreement.financed_amount(), dec!(90000));

    let stored = f.engine.store().agreement_installments(&agreement.agreement_id).unwrap();
    assert_eq!(stored, schedule);
    let numbers: Vec<u32> = stored.iter().map(|q| q.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    let scheduled: Decimal = stored.iter().map(|q| q.total).sum();
    assert_eq!(scheduled, dec!(90000));
    let penalty: Decimal = stored.iter().map(|q| q.penalty).sum();
    assert_eq!(penalty, dec!(802.78));
    assert_eq!(stored[3].due_date, day(2025, 7, 1));

    // Source installments stay untouched until activation.
    let first = installment(&f.engine, &f.schedule[0].installment_id);
    assert_eq!(first.state, InstallmentState::Overdue);
}

/// Activation writes off the source installments, resolves their alerts
/// and applies the capital part of the upfront to the credit.
#[test]
fn activation_restructures_sources() {
    let f = fixture();
    let active = activate(&f);

    assert_eq!(active.state, AgreementState::Active);
    assert!(active.upfront_paid);
    assert_eq!(active.approved_by.as_deref(), Some("supervisor-1"));
    assert_eq!(active.activated_at, Some(at(2025, 3, 4, 9)));

    for source in &f.schedule {
        let inst = installment(&f.engine, &source.installment_id);
        assert_eq!(inst.state, InstallmentState::WrittenOff);
        let alerts = f.engine.store().alerts_for_installment(&source.installment_id).unwrap();
        assert!(alerts.iter().all(|a| a.resolved
            && a.resolution_reason.as_deref() == Some(RESOLUTION_RESTRUCTURED)));
    }
    assert!(f.engine.store().open_alerts().unwrap().is_empty());

    let schedule = f.engine.store().agreement_installments(&active.agreement_id).unwrap();
    let financed_capital: Decimal = schedule.iter().map(|q| q.capital).sum();
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.outstanding_balance, financed_capital);
    assert_eq!(credit.outstanding_balance, dec!(89197.22));

    // Written-off installments drop out of the batch.
    let run_log = f.engine.run(day(2025, 3, 5)).unwrap();
    assert_eq!(run_log.installments_processed, 0);
}

/// Without an upfront requirement, approval alone activates.
#[test]
fn approval_activates_without_upfront_requirement() {
    let mut config = DelinquencyConfig::documented_default();
    config.restructuring.requires_upfront = false;
    let f = fixture_with(&config);

    let (draft, _) = f
        .engine
        .propose_agreement(&proposal(&f, dec!(0), dec!(0)), at(2025, 3, 3, 11))
        .unwrap();
    let approved = f
        .engine
        .approve_agreement(&draft.agreement_id, "supervisor-1", draft.version, at(2025, 3, 3, 12))
        .unwrap();

    assert_eq!(approved.state, AgreementState::Active);
    assert!(!approved.requires_upfront);
    let stale = f
        .engine
        .approve_agreement(&draft.agreement_id, "supervisor-2", draft.version, at(2025, 3, 3, 13))
        .unwrap_err();
    assert!(matches!(stale, CollectionsError::ConcurrentModification { .. }));
}

/// Paying every agreement installment completes the agreement and closes
/// the credit.
#[test]
fn repaying_the_schedule_completes_the_credit() {
    let f = fixture();
    let active = activate(&f);
    let schedule = f.engine.store().agreement_installments(&active.agreement_id).unwrap();

    let partial = f
        .engine
        .record_agreement_payment(&active.agreement_id, 1, dec!(1000), at(2025, 4, 1, 9))
        .unwrap();
    assert_eq!(partial.state, AgreementInstallmentState::PartiallyPaid);
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.outstanding_balance, dec!(88197.22));

    let too_much = f
        .engine
        .record_agreement_payment(&active.agreement_id, 1, schedule[0].total, at(2025, 4, 1, 10))
        .unwrap_err();
    assert!(matches!(too_much, CollectionsError::InvalidPayment { .. }));

    f.engine
        .record_agreement_payment(
            &active.agreement_id,
            1,
            schedule[0].total - dec!(1000),
            at(2025, 4, 1, 10),
        )
        .unwrap();
    for q in &schedule[1..] {
        let paid = f
            .engine
            .record_agreement_payment(&active.agreement_id, q.number, q.total, at(2025, 4, 20, 9))
            .unwrap();
        assert_eq!(paid.state, AgreementInstallmentState::Paid);
    }

    let agreement = f.engine.store().get_agreement(&active.agreement_id).unwrap();
    assert_eq!(agreement.state, AgreementState::Completed);
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.state, CreditState::Completed);
    assert_eq!(credit.outstanding_balance, dec!(0));
}

/// Consecutive missed agreement installments breach the agreement, raise a
/// credit-level alert and default the credit.
#[test]
fn missed_installments_breach_the_agreement() {
    let f = fixture();
    let active = activate(&f);

    // Only April is past due: one miss is tolerated.
    let may = f.engine.run(day(2025, 5, 1)).unwrap();
    assert_eq!(may.agreements_breached, 0);

    let june = f.engine.run(day(2025, 6, 2)).unwrap();
    assert_eq!(june.agreements_breached, 1);

    let agreement = f.engine.store().get_agreement(&active.agreement_id).unwrap();
    assert_eq!(agreement.state, AgreementState::Breached);
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.state, CreditState::Defaulted);

    let alert = f
        .engine
        .store()
        .open_credit_alert("cr-1", AlertType::AgreementBreached)
        .unwrap()
        .expect("breach alert");
    assert_eq!(alert.installment_id, None);
    assert_eq!(alert.overdue_installment_count, 3);
    assert_eq!(alert.days_overdue, 62);
}

/// After a breach the agreement balance is still what the credit owes:
/// paying it off completes the agreement, resolves the breach alert and
/// closes the defaulted credit.
#[test]
fn breached_agreement_can_be_paid_off() {
    let f = fixture();
    let active = activate(&f);
    f.engine.run(day(2025, 6, 2)).unwrap();
    let breached = f.engine.store().get_agreement(&active.agreement_id).unwrap();
    assert_eq!(breached.state, AgreementState::Breached);

    let schedule = f.engine.store().agreement_installments(&active.agreement_id).unwrap();
    let too_much = f
        .engine
        .record_agreement_payment(
            &active.agreement_id,
            1,
            schedule[0].total + dec!(1),
            at(2025, 6, 3, 9),
        )
        .unwrap_err();
    assert!(matches!(too_much, CollectionsError::InvalidPayment { .. }));

    for q in &schedule[..3] {
        f.engine
            .record_agreement_payment(&active.agreement_id, q.number, q.total, at(2025, 6, 3, 9))
            .unwrap();
    }
    // One installment left: the credit is still owed money.
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.state, CreditState::Defaulted);
    assert!(credit.outstanding_balance > Decimal::ZERO);
    assert!(f
        .engine
        .store()
        .open_credit_alert("cr-1", AlertType::AgreementBreached)
        .unwrap()
        .is_some());

    f.engine
        .record_agreement_payment(&active.agreement_id, 4, schedule[3].total, at(2025, 6, 3, 10))
        .unwrap();

    let agreement = f.engine.store().get_agreement(&active.agreement_id).unwrap();
    assert_eq!(agreement.state, AgreementState::Completed);
    assert!(f
        .engine
        .store()
        .open_credit_alert("cr-1", AlertType::AgreementBreached)
        .unwrap()
        .is_none());
    assert!(f.engine.store().open_alerts().unwrap().is_empty());
    let credit = f.engine.store().get_credit("cr-1").unwrap();
    assert_eq!(credit.state, CreditState::Completed);
    assert_eq!(credit.outstanding_balance, dec!(0));
}

/// A Draft can be cancelled, which frees its installments for a new
/// proposal; an installment cannot sit in two open agreements.
#[test]
fn cancelled_draft_frees_installments() {
    let f = fixture();
    let (first, _) = f
        .engine
        .propose_agreement(&proposal(&f, dec!(0), dec!(20000)), at(2025, 3, 3, 11))
        .unwrap();

    let overlap = f
        .engine
        .propose_agreement(&proposal(&f, dec!(0), dec!(20000)), at(2025, 3, 3, 12))
        .unwrap_err();
    assert!(matches!(overlap, CollectionsError::InvalidTransition { .. }));

    let cancelled = f
        .engine
        .cancel_agreement(&first.agreement_id, first.version, at(2025, 3, 3, 13))
        .unwrap();
    assert_eq!(cancelled.state, AgreementState::Cancelled);

    let (second, _) = f
        .engine
        .propose_agreement(&proposal(&f, dec!(0), dec!(20000)), at(2025, 3, 3, 14))
        .unwrap();
    assert_eq!(second.number, 2);
}

/// Once upfront money was taken the Draft can no longer be cancelled.
#[test]
fn paid_upfront_blocks_cancellation() {
    let f = fixture();
    let (draft, _) = f
        .engine
        .propose_agreement(&proposal(&f, dec!(0), dec!(20000)), at(2025, 3, 3, 11))
        .unwrap();
    let paid = f
        .engine
        .record_upfront_payment(&draft.agreement_id, draft.version, at(2025, 3, 3, 12))
        .unwrap();
    assert_eq!(paid.state, AgreementState::Draft);

    let err = f
        .engine
        .cancel_agreement(&paid.agreement_id, paid.version, at(2025, 3, 3, 13))
        .unwrap_err();
    assert!(matches!(err, CollectionsError::InvalidTransition { .. }));
}
