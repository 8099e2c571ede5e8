//! The daily batch must be safe to repeat: a same-day re-run charges no
//! extra penalty, moves no score and raises no new alert. Also covers the
//! run-level and per-installment failure modes and the scheduler entry
//! point.

mod common;

use chrono::NaiveTime;
use collections_core::{
    config::{DelinquencyConfig, PenaltyCap},
    engine::CollectionsEngine,
    error::CollectionsError,
    ledger::{Installment, InstallmentState},
    store::CollectionsStore,
};
use rusqlite::{Connection, OpenFlags};
use common::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Three clients, five credits, a mix of late and current installments.
fn portfolio(engine: &CollectionsEngine) -> Vec<Installment> {
    let mut all = Vec::new();
    all.extend(open_credit(engine, "cr-1", "cli-1", dec!(100000), 3, day(2024, 12, 10)));
    all.extend(open_credit(engine, "cr-2", "cli-1", dec!(2500), 6, day(2025, 1, 5)));
    all.extend(open_credit(engine, "cr-3", "cli-2", dec!(400000), 2, day(2025, 1, 12)));
    all.extend(open_credit(engine, "cr-4", "cli-3", dec!(10000), 4, day(2025, 2, 1)));
    all.extend(open_credit(engine, "cr-5", "cli-3", dec!(75000), 1, day(2024, 11, 30)));
    all
}

fn penalties(engine: &CollectionsEngine, schedule: &[Installment]) -> Vec<(InstallmentState, Decimal)> {
    schedule
        .iter()
        .map(|i| {
            let current = installment(engine, &i.installment_id);
            (current.state, current.penalty_amount)
        })
        .collect()
}

fn scores(engine: &CollectionsEngine) -> Vec<Decimal> {
    ["cli-1", "cli-2", "cli-3"]
        .iter()
        .map(|c| engine.client_score(c).unwrap())
        .collect()
}

/// Running the same day twice yields the same ledger, scores and alerts.
#[test]
fn same_day_rerun_changes_nothing() {
    let (engine, _) = engine();
    let schedule = portfolio(&engine);
    let today = day(2025, 1, 28);

    let first = engine.run(today).unwrap();
    let after_first = (
        penalties(&engine, &schedule),
        scores(&engine),
        engine.store().open_alerts().unwrap().len(),
    );

    let second = engine.run(today).unwrap();
    let after_second = (
        penalties(&engine, &schedule),
        scores(&engine),
        engine.store().open_alerts().unwrap().len(),
    );

    assert_eq!(after_first, after_second);
    assert!(first.succeeded && second.succeeded);
    assert!(first.installments_with_delinquency > 0);
    assert_eq!(first.installments_processed, second.installments_processed);
    assert_eq!(first.total_penalty_amount, second.total_penalty_amount);
    assert!(first.total_penalty_applied > Decimal::ZERO);
    assert_eq!(second.total_penalty_applied, Decimal::ZERO);
    assert_eq!(second.alerts_generated, 0);
    assert_eq!(second.alerts_updated, 0);
    assert_eq!(second.clients_blocked, 0);

    let logs = engine.store().run_logs_for(today).unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0], first);
    assert_eq!(logs[1], second);
}

/// Without an active configuration the run aborts and leaves a failed
/// RunLog behind.
#[test]
fn missing_configuration_aborts_run() {
    let engine = bare_engine(RecordingNotifier::default());
    let today = day(2025, 1, 28);

    let err = engine.run(today).unwrap_err();
    assert!(matches!(err, CollectionsError::ConfigurationMissing));

    let logs = engine.store().run_logs_for(today).unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].succeeded);
    assert_eq!(logs[0].config_version, None);
    assert!(!engine.store().has_completed_run(today).unwrap());
}

/// A credit with broken numbering is skipped and reported; the rest of
/// the portfolio is still processed.
#[test]
fn sequence_gap_is_isolated() {
    let (engine, _) = engine();
    open_credit(&engine, "cr-ok", "cli-1", dec!(1000), 1, day(2025, 1, 10));
    let broken = open_credit(&engine, "cr-gap", "cli-2", dec!(1000), 2, day(2025, 1, 10));
    let mut stray = broken[1].clone();
    stray.installment_id = "cuo-stray".into();
    stray.number = 4;
    engine.store().insert_installment(&stray).unwrap();

    let run_log = engine.run(day(2025, 1, 20)).unwrap();

    assert!(!run_log.succeeded);
    assert!(run_log
        .error_detail
        .as_deref()
        .unwrap_or_default()
        .contains("credit cr-gap"));
    assert_eq!(run_log.installments_processed, 1);
    assert_eq!(run_log.alerts_generated, 1);
    assert_eq!(installment(&engine, &broken[0].installment_id).penalty_amount, dec!(0));
}

/// A write failure on one installment rolls back only that installment's
/// penalty, score and alert; its neighbour is committed and the run is
/// reported as failed.
#[test]
fn installment_write_failure_is_isolated() {
    // Shared in-memory database so a second connection can add a trigger.
    let uri = "file:installment-write-failure?mode=memory&cache=shared";
    let store = CollectionsStore::open(uri).unwrap();
    let engine = CollectionsEngine::build(store, Box::new(RecordingNotifier::default())).unwrap();
    engine
        .publish_configuration(&DelinquencyConfig::documented_default(), at(2025, 1, 1, 0))
        .unwrap();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(1000), 2, day(2025, 1, 10));
    let (broken, healthy) = (&schedule[0].installment_id, &schedule[1].installment_id);

    let side = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap();
    side.execute_batch(&format!(
        "CREATE TRIGGER reject_installment BEFORE UPDATE ON installment
         WHEN NEW.installment_id = '{broken}'
         BEGIN SELECT RAISE(ABORT, 'installment locked'); END;"
    ))
    .unwrap();

    let run_log = engine.run(day(2025, 2, 20)).unwrap();

    assert!(!run_log.succeeded);
    assert_eq!(run_log.failed_installments, 1);
    assert_eq!(run_log.installments_processed, 2);
    assert_eq!(run_log.installments_with_delinquency, 1);
    assert!(run_log
        .error_detail
        .as_deref()
        .unwrap_or_default()
        .contains(&format!("installment {broken}")));

    let failed = installment(&engine, broken);
    assert_eq!(failed.penalty_amount, dec!(0));
    assert_eq!(failed.state, InstallmentState::Pending);
    assert!(engine.store().open_alert_for_installment(broken).unwrap().is_none());
    assert!(engine.store().get_score_adjustment(broken).unwrap().is_none());

    let committed = installment(&engine, healthy);
    assert_eq!(committed.state, InstallmentState::Overdue);
    assert!(committed.penalty_amount > Decimal::ZERO);
    assert!(engine.store().open_alert_for_installment(healthy).unwrap().is_some());
    assert!(engine.store().get_score_adjustment(healthy).unwrap().is_some());
}

/// Publishing a cheaper policy never lowers penalty already accrued.
#[test]
fn accrued_penalty_is_never_lowered() {
    let (engine, _) = engine();
    let schedule = open_credit(&engine, "cr-1", "cli-1", dec!(100000), 1, day(2025, 1, 10));
    engine.run(day(2025, 2, 10)).unwrap();
    let accrued = installment(&engine, &schedule[0].installment_id).penalty_amount;
    assert_eq!(accrued, dec!(2000));

    let mut cheaper = DelinquencyConfig::documented_default();
    cheaper.penalty.cap = PenaltyCap::Fixed(dec!(100));
    let snapshot = engine.publish_configuration(&cheaper, at(2025, 2, 10, 18)).unwrap();
    assert_eq!(snapshot.version, 2);

    let run_log = engine.run(day(2025, 2, 11)).unwrap();
    assert_eq!(run_log.config_version, Some(2));
    assert_eq!(run_log.total_penalty_applied, dec!(0));
    assert_eq!(installment(&engine, &schedule[0].installment_id).penalty_amount, accrued);
}

/// The scheduler entry point runs once per day, after the configured time.
#[test]
fn scheduled_run_fires_once_per_day() {
    let (engine, _) = engine();
    open_credit(&engine, "cr-1", "cli-1", dec!(1000), 1, day(2025, 1, 10));

    assert!(engine.run_scheduled(at(2025, 1, 20, 9)).unwrap().is_none());
    let fired = engine.run_scheduled(at(2025, 1, 20, 11)).unwrap().expect("due");
    assert_eq!(fired.executed_at, at(2025, 1, 20, 11));
    assert!(engine.run_scheduled(at(2025, 1, 20, 15)).unwrap().is_none());
    assert!(engine.run_scheduled(at(2025, 1, 21, 10)).unwrap().is_some());
    assert!(engine.store().has_completed_run(day(2025, 1, 21)).unwrap());
}

/// A disabled job never fires.
#[test]
fn disabled_job_does_not_run() {
    let mut config = DelinquencyConfig::documented_default();
    config.job.enabled = false;
    config.job.run_time = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
    let engine = engine_with(&config, RecordingNotifier::default());

    assert!(engine.run_scheduled(at(2025, 1, 20, 12)).unwrap().is_none());
    assert!(engine.store().run_logs_for(day(2025, 1, 20)).unwrap().is_empty());
}
