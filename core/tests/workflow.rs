//! Collections workflow: assignment, contact history, promises to pay and
//! the broken-promise sweep of the daily batch.

mod common;

use collections_core::{
    alerts::{Alert, ManagementState},
    engine::CollectionsEngine,
    error::CollectionsError,
    event::CollectionsEvent,
    workflow::{ContactChannel, ContactOutcome, ContactReport},
};
use chrono::NaiveDate;
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// One overdue credit with its alert raised on Monday 2025-01-20.
fn overdue_alert() -> (CollectionsEngine, Alert) {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(100000), 1, day(2025, 1, 10));
    engine.run(day(2025, 1, 20)).unwrap();
    let alert = engine
        .store()
        .open_alert_for_installment(&schedule[0].installment_id)
        .unwrap()
        .unwrap();
    (engine, alert)
}

fn report(alert: &Alert, outcome: ContactOutcome) -> ContactReport {
    ContactReport {
        alert_id: alert.alert_id.clone(),
        agent_id: "agent-7".into(),
        channel: ContactChannel::Phone,
        outcome,
        notes: None,
        promise_date: None,
        promise_amount: None,
        next_contact_date: None,
        expected_version: alert.version,
    }
}

fn promise(alert: &Alert, date: NaiveDate, amount: Decimal) -> ContactReport {
    ContactReport {
        promise_date: Some(date),
        promise_amount: Some(amount),
        ..report(alert, ContactOutcome::PromiseToPay)
    }
}

/// Assignment moves a new alert to Assigned; a stale version conflicts.
#[test]
fn assignment_uses_optimistic_locking() {
    let (engine, alert) = overdue_alert();

    let assigned = engine
        .assign_alert(&alert.alert_id, "agent-7", alert.version, at(2025, 1, 20, 11))
        .unwrap();
    assert_eq!(assigned.management_state, ManagementState::Assigned);
    assert_eq!(assigned.assigned_agent_id.as_deref(), Some("agent-7"));
    assert_eq!(assigned.version, alert.version + 1);

    let stale = engine
        .assign_alert(&alert.alert_id, "agent-9", alert.version, at(2025, 1, 20, 12))
        .unwrap_err();
    assert!(matches!(stale, CollectionsError::ConcurrentModification { .. }));

    let reassigned = engine
        .assign_alert(&alert.alert_id, "agent-9", assigned.version, at(2025, 1, 20, 12))
        .unwrap();
    assert_eq!(reassigned.management_state, ManagementState::Assigned);
    assert_eq!(reassigned.assigned_agent_id.as_deref(), Some("agent-9"));
}

/// A contact attempt is appended and starts work on the alert.
#[test]
fn contact_moves_alert_in_progress() {
    let (engine, alert) = overdue_alert();

    let (contact, updated) = engine
        .record_contact(&report(&alert, ContactOutcome::NoAnswer), at(2025, 1, 20, 14))
        .unwrap();

    assert_eq!(updated.management_state, ManagementState::InProgress);
    assert_eq!(contact.outcome, ContactOutcome::NoAnswer);
    let history = engine.store().contacts_for_alert(&alert.alert_id).unwrap();
    assert_eq!(history, vec![contact]);
}

/// A promise needs a date not in the past and a positive amount; a
/// rejected promise records nothing.
#[test]
fn malformed_promise_is_rejected() {
    let (engine, alert) = overdue_alert();

    let no_amount = ContactReport {
        promise_date: Some(day(2025, 1, 25)),
        ..report(&alert, ContactOutcome::PromiseToPay)
    };
    let err = engine.record_contact(&no_amount, at(2025, 1, 20, 14)).unwrap_err();
    assert!(matches!(err, CollectionsError::InvalidPayment { .. }));

    let past = promise(&alert, day(2025, 1, 19), dec!(1000));
    let err = engine.record_contact(&past, at(2025, 1, 20, 14)).unwrap_err();
    assert!(matches!(err, CollectionsError::InvalidPayment { .. }));

    assert!(engine.store().contacts_for_alert(&alert.alert_id).unwrap().is_empty());
    let unchanged = engine.store().get_alert(&alert.alert_id).unwrap();
    assert_eq!(unchanged.version, alert.version);
    assert_eq!(unchanged.management_state, ManagementState::New);
}

/// An unpaid promise is escalated by the next batch after its date.
#[test]
fn broken_promise_is_escalated() {
    let (engine, alert) = overdue_alert();
    let (_, promised) = engine
        .record_contact(&promise(&alert, day(2025, 1, 24), dec!(50000)), at(2025, 1, 20, 14))
        .unwrap();
    assert_eq!(promised.management_state, ManagementState::PromiseMade);
    assert_eq!(promised.promise_amount, Some(dec!(50000)));

    // The promise date itself is still within the promise.
    let on_date = engine.run(day(2025, 1, 24)).unwrap();
    assert_eq!(on_date.promises_broken, 0);

    let after = engine.run(day(2025, 1, 27)).unwrap();
    assert_eq!(after.promises_broken, 1);
    let escalated = engine.store().get_alert(&alert.alert_id).unwrap();
    assert_eq!(escalated.management_state, ManagementState::Escalated);

    let broken = engine.store().events_of_type("promise_broken").unwrap();
    assert!(matches!(
        broken.as_slice(),
        [CollectionsEvent::PromiseBroken { paid_since, .. }] if paid_since.is_zero()
    ));

    // Escalated alerts are out of the assignment pool.
    let err = engine
        .assign_alert(&alert.alert_id, "agent-9", escalated.version, at(2025, 1, 27, 11))
        .unwrap_err();
    assert!(matches!(err, CollectionsError::InvalidTransition { .. }));
}

/// Paying the promised amount before the date keeps the promise.
#[test]
fn kept_promise_is_not_escalated() {
    let (engine, alert) = overdue_alert();
    engine
        .record_contact(&promise(&alert, day(2025, 1, 24), dec!(50000)), at(2025, 1, 20, 14))
        .unwrap();
    engine
        .record_payment(
            alert.installment_id.as_deref().unwrap(),
            dec!(50000),
            at(2025, 1, 23, 9),
            Some("transfer"),
        )
        .unwrap();

    let run_log = engine.run(day(2025, 1, 27)).unwrap();

    assert_eq!(run_log.promises_broken, 0);
    let current = engine.store().get_alert(&alert.alert_id).unwrap();
    assert_eq!(current.management_state, ManagementState::PromiseMade);
}

/// Resolved alerts take no further contacts.
#[test]
fn resolved_alert_rejects_contacts() {
    let (engine, alert) = overdue_alert();
    let installment_id = alert.installment_id.clone().unwrap();
    let owed = installment(&engine, &installment_id).amount_owed();
    engine
        .record_payment(&installment_id, owed, at(2025, 1, 20, 15), None)
        .unwrap();
    let resolved = engine.store().get_alert(&alert.alert_id).unwrap();

    let err = engine
        .record_contact(
            &report(&resolved, ContactOutcome::Reached),
            at(2025, 1, 20, 16),
        )
        .unwrap_err();
    assert!(matches!(err, CollectionsError::InvalidTransition { .. }));
}
