//! Batch orchestrator: the daily delinquency run.
//!
//! RULE: One run captures one configuration snapshot and writes exactly
//! one RunLog row, last. A RunLog with `succeeded = false` (or none at all
//! for a date) marks a run that must be repeated; repeating is safe
//! because every step sets the day's value instead of adding to it.
//!
//! Pipeline:
//!   1. Load the active configuration (missing → failed RunLog, abort).
//!   2. Fetch open installments due on or before `today`.
//!   3. Evaluate every credit's installments in parallel (pure).
//!   4. Commit each installment in its own transaction:
//!      penalty + state, score, alert.
//!   5. Sweep broken promises and agreement breaches.
//!   6. Review client standing (block / unblock).
//!   7. Dispatch notifications for open alerts.
//!   8. Append the RunLog.

use crate::{
    alerts::{AlertManager, DispatchOutcome, UpsertOutcome},
    calculator::{evaluate, DelinquencyResult},
    config::{ConfigSnapshot, DelinquencyConfig},
    error::{CollectionsError, CollectionsResult},
    event::CollectionsEvent,
    ledger::{Credit, Installment, InstallmentLedger},
    notifier::Notifier,
    restructuring::RestructuringEngine,
    scoring::ScoringAdjuster,
    store::CollectionsStore,
    types::{new_id, RunId},
    workflow::CollectionsWorkflow,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, time::Instant};

/// Cap on individual failure messages kept in `error_detail`.
const MAX_ERROR_DETAILS: usize = 20;

/// Audit row of one batch invocation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: RunId,
    pub as_of: NaiveDate,
    pub executed_at: NaiveDateTime,
    pub config_version: Option<i64>,
    pub installments_processed: u32,
    pub installments_with_delinquency: u32,
    pub alerts_generated: u32,
    pub alerts_updated: u32,
    pub alerts_resolved: u32,
    pub notifications_sent: u32,
    pub promises_broken: u32,
    pub agreements_breached: u32,
    pub clients_blocked: u32,
    pub failed_installments: u32,
    /// Sum of the penalties computed for the day.
    pub total_penalty_amount: Decimal,
    /// Penalty newly accrued by this run; zero on a same-day re-run.
    pub total_penalty_applied: Decimal,
    pub succeeded: bool,
    pub error_detail: Option<String>,
    pub duration_ms: u64,
}

impl RunLog {
    fn empty(run_id: RunId, as_of: NaiveDate, executed_at: NaiveDateTime) -> Self {
        Self {
            run_id,
            as_of,
            executed_at,
            config_version: None,
            installments_processed: 0,
            installments_with_delinquency: 0,
            alerts_generated: 0,
            alerts_updated: 0,
            alerts_resolved: 0,
            notifications_sent: 0,
            promises_broken: 0,
            agreements_breached: 0,
            clients_blocked: 0,
            failed_installments: 0,
            total_penalty_amount: Decimal::ZERO,
            total_penalty_applied: Decimal::ZERO,
            succeeded: true,
            error_detail: None,
            duration_ms: 0,
        }
    }
}

/// Evaluation of one credit's due installments, in installment order.
#[derive(Debug, Clone)]
struct CreditPlan {
    credit: Credit,
    steps: Vec<(Installment, DelinquencyResult)>,
    overdue_count: u32,
}

fn plan_credit(
    credit: &Credit,
    installments: &[Installment],
    today: NaiveDate,
    config: &DelinquencyConfig,
) -> CreditPlan {
    let steps: Vec<(Installment, DelinquencyResult)> = installments
        .iter()
        .map(|inst| (inst.clone(), evaluate(inst, today, config)))
        .collect();
    let overdue_count = steps.iter().filter(|(_, r)| r.is_delinquent).count() as u32;
    CreditPlan {
        credit: credit.clone(),
        steps,
        overdue_count,
    }
}

/// Failures collected during a run; any entry marks the run unsuccessful.
#[derive(Default)]
struct Failures {
    details: Vec<String>,
    total: usize,
}

impl Failures {
    fn push(&mut self, what: String, err: &CollectionsError) {
        log::warn!("{what}: {err}");
        self.total += 1;
        if self.details.len() < MAX_ERROR_DETAILS {
            self.details.push(format!("{what}: {err}"));
        }
    }

    fn summary(&self) -> Option<String> {
        if self.total == 0 {
            return None;
        }
        let mut text = self.details.join("; ");
        if self.total > self.details.len() {
            text.push_str(&format!(" (+{} more)", self.total - self.details.len()));
        }
        Some(text)
    }
}

pub struct BatchOrchestrator<'a> {
    store: &'a CollectionsStore,
    notifier: &'a dyn Notifier,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(store: &'a CollectionsStore, notifier: &'a dyn Notifier) -> Self {
        Self { store, notifier }
    }

    /// Run the batch for `today`, timestamped at the configured run time.
    pub fn run(&self, today: NaiveDate) -> CollectionsResult<RunLog> {
        let snapshot = self.load_snapshot(today.and_time(NaiveTime::default()), today)?;
        let now = today.and_time(snapshot.config.job.run_time);
        self.execute(&snapshot, today, now)
    }

    /// Scheduler entry point. Runs at most once per calendar day, and only
    /// when the job is enabled and `now` has reached the configured time.
    pub fn run_scheduled(&self, now: NaiveDateTime) -> CollectionsResult<Option<RunLog>> {
        let today = now.date();
        let snapshot = self.load_snapshot(now, today)?;
        let job = &snapshot.config.job;
        if !job.enabled {
            log::debug!("collections job disabled, skipping");
            return Ok(None);
        }
        if now.time() < job.run_time {
            log::debug!("collections job not due until {}", job.run_time);
            return Ok(None);
        }
        if self.store.last_job_run()?.is_some_and(|last| last.date() == today) {
            log::debug!("collections job already ran on {today}");
            return Ok(None);
        }
        self.execute(&snapshot, today, now).map(Some)
    }

    fn load_snapshot(&self, now: NaiveDateTime, today: NaiveDate) -> CollectionsResult<ConfigSnapshot> {
        match self.store.load_active_configuration() {
            Ok(snapshot) => Ok(snapshot),
            Err(CollectionsError::ConfigurationMissing) => {
                let mut run_log = RunLog::empty(new_id("run"), today, now);
                run_log.succeeded = false;
                run_log.error_detail = Some(CollectionsError::ConfigurationMissing.to_string());
                self.store.append_run_log(&run_log)?;
                log::error!("collections run for {today} aborted: no active configuration");
                Err(CollectionsError::ConfigurationMissing)
            }
            Err(other) => Err(other),
        }
    }

    fn execute(
        &self,
        snapshot: &ConfigSnapshot,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> CollectionsResult<RunLog> {
        let started = Instant::now();
        let config = &snapshot.config;
        let run_id = new_id("run");
        let scope = run_id.as_str();
        let mut run_log = RunLog::empty(run_id.clone(), today, now);
        run_log.config_version = Some(snapshot.version);
        let mut failures = Failures::default();

        self.store.record_event(
            scope,
            now,
            &CollectionsEvent::RunStarted {
                run_id: run_id.clone(),
                as_of: today,
                config_version: snapshot.version,
            },
        )?;
        log::info!(
            "collections run {run_id} for {today} (config v{})",
            snapshot.version
        );

        let ledger = InstallmentLedger::new(scope, self.store);
        let scoring = ScoringAdjuster::new(scope, self.store, self.store);
        let alerts = AlertManager::new(scope, self.store);

        // ── Load ───────────────────────────────────────────────
        let due = ledger.find_due_or_overdue(today)?;
        let mut groups: Vec<(Credit, Vec<Installment>)> = Vec::new();
        let mut rejected: Option<String> = None;
        for inst in due {
            if rejected.as_deref() == Some(inst.credit_id.as_str()) {
                continue;
            }
            match groups.last_mut() {
                Some((credit, list)) if credit.credit_id == inst.credit_id => list.push(inst),
                _ => {
                    let checked = ledger
                        .verify_sequence(&inst.credit_id)
                        .and_then(|_| ledger.credit(&inst.credit_id));
                    match checked {
                        Ok(credit) => groups.push((credit, vec![inst])),
                        Err(err) => {
                            // The whole credit is skipped for this run.
                            failures.push(format!("credit {}", inst.credit_id), &err);
                            rejected = Some(inst.credit_id);
                        }
                    }
                }
            }
        }

        // ── Evaluate ───────────────────────────────────────────
        let plans: Vec<CreditPlan> = groups
            .par_iter()
            .map(|(credit, installments)| plan_credit(credit, installments, today, config))
            .collect();

        // ── Commit ─────────────────────────────────────────────
        let mut clients: BTreeSet<String> = BTreeSet::new();
        for plan in &plans {
            log::debug!(
                "credit {}: {} due, {} delinquent",
                plan.credit.credit_id,
                plan.steps.len(),
                plan.overdue_count
            );
            clients.insert(plan.credit.client_id.clone());
            for (inst, result) in &plan.steps {
                let committed = self.store.atomically(|store| {
                    let update = ledger.apply_delinquency_result(inst, result, today)?;
                    if update.changed() && result.is_delinquent {
                        store.record_event(
                            scope,
                            now,
                            &CollectionsEvent::PenaltyApplied {
                                installment_id: inst.installment_id.clone(),
                                credit_id: inst.credit_id.clone(),
                                days_overdue: result.days_overdue,
                                previous_penalty: update.previous_penalty,
                                penalty: update.installment.penalty_amount,
                                state: update.installment.state,
                            },
                        )?;
                    }
                    scoring.apply(
                        &update.installment,
                        &plan.credit.client_id,
                        result,
                        &config.score,
                        now,
                    )?;
                    let outcome = alerts.upsert(
                        &update.installment,
                        &plan.credit,
                        result,
                        plan.overdue_count,
                        now,
                    )?;
                    Ok((update, outcome))
                });
                run_log.installments_processed += 1;
                match committed {
                    Ok((update, outcome)) => {
                        if result.is_delinquent {
                            run_log.installments_with_delinquency += 1;
                            run_log.total_penalty_amount += result.penalty;
                            run_log.total_penalty_applied += update.penalty_increment();
                        }
                        match outcome {
                            UpsertOutcome::Created(_) => run_log.alerts_generated += 1,
                            UpsertOutcome::Updated(_) => run_log.alerts_updated += 1,
                            UpsertOutcome::Resolved(_) => run_log.alerts_resolved += 1,
                            UpsertOutcome::Unchanged(_) | UpsertOutcome::NotDelinquent => {}
                        }
                    }
                    Err(err) => {
                        run_log.failed_installments += 1;
                        failures.push(format!("installment {}", inst.installment_id), &err);
                    }
                }
            }
        }

        // ── Sweeps ─────────────────────────────────────────────
        match CollectionsWorkflow::new(scope, self.store).escalate_broken_promises(today, now) {
            Ok(broken) => run_log.promises_broken = broken.len() as u32,
            Err(err) => failures.push("promise sweep".into(), &err),
        }
        match RestructuringEngine::new(scope, self.store).sweep(config, today, now) {
            Ok(sweep) => run_log.agreements_breached = sweep.breached.len() as u32,
            Err(err) => failures.push("agreement sweep".into(), &err),
        }

        // ── Client standing ────────────────────────────────────
        match self.store.blocked_clients() {
            Ok(blocked) => clients.extend(blocked),
            Err(err) => failures.push("blocked clients".into(), &err),
        }
        for client_id in &clients {
            let reviewed = self.store.atomically(|store| {
                let was_blocked = store.is_client_blocked(client_id)?;
                let blocked = scoring.review_standing(client_id, config, today, now)?;
                Ok(blocked && !was_blocked)
            });
            match reviewed {
                Ok(true) => run_log.clients_blocked += 1,
                Ok(false) => {}
                Err(err) => failures.push(format!("client {client_id}"), &err),
            }
        }

        // ── Notifications ──────────────────────────────────────
        let mut dispatch_failures = 0u32;
        let mut aborted = None;
        for alert in self.store.open_alerts()? {
            match alerts.notify(&alert, self.notifier, &config.notification, now) {
                Ok(DispatchOutcome::Sent(_)) => run_log.notifications_sent += 1,
                Ok(DispatchOutcome::Skipped(_)) => {}
                Ok(DispatchOutcome::Failed(_)) => {
                    dispatch_failures += 1;
                    if dispatch_failures > config.notification.max_dispatch_failures {
                        aborted = Some(format!(
                            "notifier unreachable: {dispatch_failures} failed dispatches"
                        ));
                        break;
                    }
                }
                Err(err) => failures.push(format!("notify alert {}", alert.alert_id), &err),
            }
        }

        // ── RunLog ─────────────────────────────────────────────
        let mut detail = failures.summary();
        if let Some(reason) = aborted {
            log::error!("collections run {run_id} aborted: {reason}");
            detail = Some(match detail {
                Some(d) => format!("{reason}; {d}"),
                None => reason,
            });
        }
        run_log.succeeded = detail.is_none();
        run_log.error_detail = detail;
        run_log.duration_ms = started.elapsed().as_millis() as u64;

        self.store.append_run_log(&run_log)?;
        self.store.record_job_run(now)?;
        self.store.record_event(
            scope,
            now,
            &CollectionsEvent::RunFinished {
                run_id: run_id.clone(),
                succeeded: run_log.succeeded,
                installments_processed: run_log.installments_processed,
            },
        )?;
        log::info!(
            "collections run {run_id}: {} processed, {} delinquent, {} alerts new, {} notified, \
             penalty {} (+{} applied), succeeded={}",
            run_log.installments_processed,
            run_log.installments_with_delinquency,
            run_log.alerts_generated,
            run_log.notifications_sent,
            run_log.total_penalty_amount,
            run_log.total_penalty_applied,
            run_log.succeeded
        );
        Ok(run_log)
    }
}
