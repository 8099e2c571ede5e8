//! Shared fixtures for the integration tests.
//!
//! Every test gets its own in-memory store with the documented default
//! configuration published. Credits are opened Active with zero interest
//! so installment totals equal capital and the arithmetic stays readable.

#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use collections_core::{
    config::DelinquencyConfig,
    engine::CollectionsEngine,
    ledger::{level_schedule, Credit, CreditState, Installment},
    notifier::{NotificationRequest, Notifier, NotifyFailed, Sent},
    store::CollectionsStore,
};
use rust_decimal::Decimal;
use std::{cell::RefCell, rc::Rc};

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    day(y, m, d).and_hms_opt(h, 0, 0).expect("valid time")
}

/// Notifier that records every request and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Rc<RefCell<Vec<NotificationRequest>>>,
    pub failing: Rc<RefCell<bool>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.borrow().len()
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.borrow_mut() = failing;
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, request: &NotificationRequest) -> Result<Sent, NotifyFailed> {
        if *self.failing.borrow() {
            return Err(NotifyFailed {
                reason: "gateway down".into(),
            });
        }
        self.sent.borrow_mut().push(request.clone());
        Ok(Sent {
            message_id: format!("msg-{}", self.sent.borrow().len()),
        })
    }
}

/// Engine over a fresh in-memory store, without any configuration.
pub fn bare_engine(notifier: RecordingNotifier) -> CollectionsEngine {
    let store = CollectionsStore::in_memory().expect("in-memory store");
    CollectionsEngine::build(store, Box::new(notifier)).expect("migration")
}

/// Engine with `config` published on 2025-01-01.
pub fn engine_with(config: &DelinquencyConfig, notifier: RecordingNotifier) -> CollectionsEngine {
    let engine = bare_engine(notifier);
    engine
        .publish_configuration(config, at(2025, 1, 1, 0))
        .expect("publish configuration");
    engine
}

pub fn engine() -> (CollectionsEngine, RecordingNotifier) {
    let notifier = RecordingNotifier::default();
    let engine = engine_with(&DelinquencyConfig::documented_default(), notifier.clone());
    (engine, notifier)
}

/// Open an Active credit of `count` installments of `installment_capital`
/// each, the first due on `first_due`. Returns the schedule.
pub fn open_credit(
    engine: &CollectionsEngine,
    credit_id: &str,
    client_id: &str,
    installment_capital: Decimal,
    count: u32,
    first_due: NaiveDate,
) -> Vec<Installment> {
    open_credit_scored(
        engine,
        credit_id,
        client_id,
        installment_capital,
        count,
        first_due,
        Decimal::from(700),
    )
}

/// `open_credit` for a client first seen with `score`.
pub fn open_credit_scored(
    engine: &CollectionsEngine,
    credit_id: &str,
    client_id: &str,
    installment_capital: Decimal,
    count: u32,
    first_due: NaiveDate,
    score: Decimal,
) -> Vec<Installment> {
    let capital = installment_capital * Decimal::from(count);
    let schedule = level_schedule(credit_id, capital, Decimal::ZERO, count, first_due)
        .expect("schedule");
    let credit = Credit {
        credit_id: credit_id.to_string(),
        client_id: client_id.to_string(),
        principal_requested: capital,
        principal_approved: capital,
        nominal_rate: Decimal::ZERO,
        installment_count: count,
        installment_amount: installment_capital,
        total_cost_rate: Decimal::ZERO,
        total_payable: capital,
        outstanding_balance: capital,
        state: CreditState::Active,
        request_date: day(2024, 12, 1),
        approval_date: Some(day(2024, 12, 1)),
        close_date: None,
        first_installment_date: first_due,
        initial_risk_score: score,
        guarantor_id: None,
    };
    engine.open_credit(&credit, &schedule).expect("open credit");
    schedule
}

pub fn installment(engine: &CollectionsEngine, installment_id: &str) -> Installment {
    engine
        .store()
        .get_installment(installment_id)
        .expect("installment")
}
