//! Scoring adjuster: daily netting of score penalties, recovery on payment,
//! the zero floor, and automatic client block / unblock.

mod common;

use collections_core::error::CollectionsError;
use common::*;
use rust_decimal_macros::dec;

/// Re-running the same day leaves the score and the movement ledger alone;
/// the next day only the difference to the new target is applied.
#[test]
fn daily_penalty_is_netted() {
    let (engine, _) = engine();
    open_credit(&engine, "cr-1", "cli-1", dec!(1000), 1, day(2025, 1, 10));

    engine.run(day(2025, 1, 20)).unwrap();
    // 5 days × 2 points + 10 for the overdue installment.
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(680));
    let movements = engine.store().score_movements("cli-1").unwrap().len();

    engine.run(day(2025, 1, 20)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(680));
    assert_eq!(engine.store().score_movements("cli-1").unwrap().len(), movements);

    engine.run(day(2025, 1, 21)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(678));
    let last = engine.store().score_movements("cli-1").unwrap().pop().unwrap();
    assert_eq!(last.delta, dec!(-2));
    assert_eq!(last.score_after, dec!(678));
}

/// Paying an overdue installment in full restores half of its deduction.
#[test]
fn full_payment_restores_half_the_deduction() {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(1000), 1, day(2025, 1, 10));
    let id = &schedule[0].installment_id;
    engine.run(day(2025, 1, 20)).unwrap();

    let owed = installment(&engine, id).amount_owed();
    let outcome = engine
        .record_payment(id, owed, at(2025, 1, 20, 15), None)
        .unwrap();

    assert_eq!(outcome.score_restored, dec!(10));
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(690));

    // A later run does not deduct again for the paid installment.
    engine.run(day(2025, 1, 21)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(690));
}

/// Reversing the settling payment takes the restored points back, and the
/// reopened installment is scored again by later runs. The second
/// installment keeps the credit open so the reversal is allowed.
#[test]
fn reversal_takes_back_recovered_points() {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(1000), 2, day(2025, 1, 10));
    let id = &schedule[0].installment_id;
    engine.run(day(2025, 1, 20)).unwrap();

    let owed = installment(&engine, id).amount_owed();
    let outcome = engine
        .record_payment(id, owed, at(2025, 1, 20, 15), None)
        .unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(690));

    engine
        .reverse_payment(&outcome.receipt.payment.payment_id, "bounced", at(2025, 1, 20, 18))
        .unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(680));
    let adjustment = engine.store().get_score_adjustment(id).unwrap().unwrap();
    assert!(!adjustment.recovered);
    assert_eq!(adjustment.recovered_delta, dec!(0));

    // Six days past grace: target 22, 20 already held.
    engine.run(day(2025, 1, 21)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(678));
}

/// A partial payment restores nothing.
#[test]
fn partial_payment_does_not_recover() {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(1000), 1, day(2025, 1, 10));
    engine.run(day(2025, 1, 20)).unwrap();

    let outcome = engine
        .record_payment(&schedule[0].installment_id, dec!(100), at(2025, 1, 20, 15), None)
        .unwrap();

    assert_eq!(outcome.score_restored, dec!(0));
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(680));
}

/// Scores never go below zero, and the floor does not drift on re-runs.
#[test]
fn score_is_floored_at_zero() {
    let (engine, _) = engine();
    open_credit_scored(&engine, "cr-1", "cli-1", dec!(1000), 1, day(2025, 1, 10), dec!(15));

    engine.run(day(2025, 1, 20)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(0));

    engine.run(day(2025, 1, 21)).unwrap();
    assert_eq!(engine.client_score("cli-1").unwrap(), dec!(0));
    let movements = engine.store().score_movements("cli-1").unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].delta, dec!(-15));
}

/// Reaching the day threshold blocks the client; once nothing is overdue
/// the block is lifted automatically.
#[test]
fn clients_are_blocked_and_unblocked() {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(1000), 3, day(2025, 1, 10));

    let blocking = engine.run(day(2025, 3, 20)).unwrap();
    assert_eq!(blocking.clients_blocked, 1);
    assert!(engine.store().is_client_blocked("cli-1").unwrap());
    assert_eq!(engine.store().events_of_type("client_blocked").unwrap().len(), 1);

    // Still blocked the next day, but not counted as newly blocked.
    let again = engine.run(day(2025, 3, 21)).unwrap();
    assert_eq!(again.clients_blocked, 0);

    for inst in &schedule {
        let owed = installment(&engine, &inst.installment_id).amount_owed();
        engine
            .record_payment(&inst.installment_id, owed, at(2025, 3, 21, 15), None)
            .unwrap();
    }
    engine.run(day(2025, 3, 22)).unwrap();
    assert!(!engine.store().is_client_blocked("cli-1").unwrap());
    assert_eq!(engine.store().events_of_type("client_unblocked").unwrap().len(), 1);
}

/// Asking for the score of a client the engine never saw is an error.
#[test]
fn unknown_client_has_no_score() {
    let (engine, _) = engine();
    let err = engine.client_score("cli-nobody").unwrap_err();
    assert!(matches!(err, CollectionsError::NotFound { entity: "client", .. }));
}
