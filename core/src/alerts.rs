//! Alert manager: collections alerts and notification throttling.
//!
//! RULE: The alert manager is the only component that mutates alerts.
//! At most one unresolved alert exists per installment; a credit-level
//! alert (no installment) is unique per credit and alert type.
//!
//! Within a batch run priority only ever escalates. Lowering it is the
//! explicit operator action `override_priority`.

use crate::{
    calculator::{DelinquencyResult, Priority},
    config::NotificationPolicy,
    error::{CollectionsError, CollectionsResult},
    event::CollectionsEvent,
    ledger::{Credit, Installment, InstallmentState},
    notifier::{NotificationRequest, Notifier},
    store::CollectionsStore,
    types::{new_id, storage_enum, EntityId},
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

storage_enum! {
    pub enum AlertType {
        InstallmentOverdue => "installment_overdue",
        AgreementBreached => "agreement_breached",
    }
}

storage_enum! {
    pub enum ManagementState {
        New => "new",
        Assigned => "assigned",
        InProgress => "in_progress",
        PromiseMade => "promise_made",
        Resolved => "resolved",
        Escalated => "escalated",
    }
}

impl ManagementState {
    /// States from which an alert may be (re)assigned to an agent.
    pub fn allows_assignment(self) -> bool {
        matches!(
            self,
            ManagementState::New | ManagementState::Assigned | ManagementState::InProgress
        )
    }
}

pub const RESOLUTION_PAID: &str = "paid";
pub const RESOLUTION_RESTRUCTURED: &str = "restructured";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: EntityId,
    /// `None` for credit-level alerts.
    pub installment_id: Option<EntityId>,
    pub credit_id: EntityId,
    pub client_id: EntityId,
    pub alert_type: AlertType,
    pub message: String,
    pub computed_penalty_amount: Decimal,
    pub overdue_amount: Decimal,
    pub total_amount: Decimal,
    pub overdue_installment_count: u32,
    pub days_overdue: u32,
    pub raised_at: NaiveDateTime,
    pub priority: Priority,
    /// Priority the alert had when an operator last overrode it. The batch
    /// leaves an overridden priority alone until evaluation exceeds this.
    pub override_baseline: Option<Priority>,
    pub management_state: ManagementState,
    pub assigned_agent_id: Option<EntityId>,
    pub assigned_at: Option<NaiveDateTime>,
    pub promise_date: Option<NaiveDate>,
    pub promise_amount: Option<Decimal>,
    pub notifications_sent: u32,
    pub last_notified_at: Option<NaiveDateTime>,
    pub resolved: bool,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolution_reason: Option<String>,
    /// Optimistic-concurrency stamp, bumped on every update.
    pub version: i64,
}

impl Alert {
    /// Fields a batch run refreshes; used to skip no-op writes.
    #[allow(clippy::type_complexity)]
    fn batch_fields(&self) -> (Decimal, Decimal, Decimal, u32, u32, Priority, Option<Priority>, &str) {
        (
            self.computed_penalty_amount,
            self.overdue_amount,
            self.total_amount,
            self.overdue_installment_count,
            self.days_overdue,
            self.priority,
            self.override_baseline,
            &self.message,
        )
    }
}

/// Priority (and override baseline) an alert carries after a batch
/// evaluated it at `evaluated`.
///
/// Priority only escalates. An operator override holds until evaluation
/// climbs above the priority the alert had when it was overridden.
pub fn batch_priority(alert: &Alert, evaluated: Priority) -> (Priority, Option<Priority>) {
    match alert.override_baseline {
        Some(baseline) if evaluated <= baseline => (alert.priority, Some(baseline)),
        _ => (evaluated.max(alert.priority), None),
    }
}

/// What `upsert` did with the installment's alert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Alert),
    Updated(Alert),
    Unchanged(Alert),
    Resolved(Alert),
    NotDelinquent,
}

impl UpsertOutcome {
    /// The open alert left behind, if any.
    pub fn open_alert(&self) -> Option<&Alert> {
        match self {
            UpsertOutcome::Created(a) | UpsertOutcome::Updated(a) | UpsertOutcome::Unchanged(a) => {
                Some(a)
            }
            UpsertOutcome::Resolved(_) | UpsertOutcome::NotDelinquent => None,
        }
    }
}

/// Why a notification was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Resolved,
    InstallmentCap,
    OutsideWindow,
    Weekend,
    TooSoon,
    DailyCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    Send,
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent(Alert),
    Skipped(SkipReason),
    Failed(String),
}

/// Throttling policy: may `alert` trigger a notification at `now`?
///
/// `sent_today` is the number of notifications already sent to the
/// alert's client on `now`'s calendar day.
pub fn notification_decision(
    alert: &Alert,
    policy: &NotificationPolicy,
    now: NaiveDateTime,
    sent_today: u32,
) -> NotifyDecision {
    if alert.resolved {
        return NotifyDecision::Skip(SkipReason::Resolved);
    }
    if alert.notifications_sent >= policy.max_per_installment {
        return NotifyDecision::Skip(SkipReason::InstallmentCap);
    }
    let time = now.time();
    if time < policy.send_window_start || time > policy.send_window_end {
        return NotifyDecision::Skip(SkipReason::OutsideWindow);
    }
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) && !policy.send_on_weekends {
        return NotifyDecision::Skip(SkipReason::Weekend);
    }
    if let Some(last) = alert.last_notified_at {
        if now - last < Duration::hours(i64::from(policy.min_reminder_interval_hours)) {
            return NotifyDecision::Skip(SkipReason::TooSoon);
        }
    }
    if sent_today >= policy.max_per_day {
        return NotifyDecision::Skip(SkipReason::DailyCap);
    }
    NotifyDecision::Send
}

fn overdue_message(installment: &Installment, days: u32) -> String {
    format!(
        "Installment #{} of credit {} is {days} days overdue",
        installment.number, installment.credit_id
    )
}

pub struct AlertManager<'a> {
    scope: &'a str,
    store: &'a CollectionsStore,
}

impl<'a> AlertManager<'a> {
    pub fn new(scope: &'a str, store: &'a CollectionsStore) -> Self {
        Self { scope, store }
    }

    pub fn alert(&self, alert_id: &str) -> CollectionsResult<Alert> {
        self.store.get_alert(alert_id)
    }

    /// Create, refresh or resolve the alert for one evaluated installment.
    ///
    /// `overdue_installment_count` is the number of delinquent installments
    /// on the installment's credit in this evaluation.
    pub fn upsert(
        &self,
        installment: &Installment,
        credit: &Credit,
        result: &DelinquencyResult,
        overdue_installment_count: u32,
        now: NaiveDateTime,
    ) -> CollectionsResult<UpsertOutcome> {
        let existing = self
            .store
            .open_alert_for_installment(&installment.installment_id)?;

        if installment.state == InstallmentState::Paid {
            return match existing {
                Some(alert) => Ok(UpsertOutcome::Resolved(self.resolve(
                    alert,
                    RESOLUTION_PAID,
                    now,
                )?)),
                None => Ok(UpsertOutcome::NotDelinquent),
            };
        }

        if !result.is_delinquent {
            return Ok(match existing {
                Some(alert) => UpsertOutcome::Unchanged(alert),
                None => UpsertOutcome::NotDelinquent,
            });
        }

        let Some(mut alert) = existing else {
            let alert = Alert {
                alert_id: new_id("alr"),
                installment_id: Some(installment.installment_id.clone()),
                credit_id: credit.credit_id.clone(),
                client_id: credit.client_id.clone(),
                alert_type: AlertType::InstallmentOverdue,
                message: overdue_message(installment, result.days_overdue),
                computed_penalty_amount: installment.penalty_amount,
                overdue_amount: result.overdue_amount,
                total_amount: installment.total_amount + installment.penalty_amount,
                overdue_installment_count,
                days_overdue: result.days_overdue,
                raised_at: now,
                priority: result.priority,
                override_baseline: None,
                management_state: ManagementState::New,
                assigned_agent_id: None,
                assigned_at: None,
                promise_date: None,
                promise_amount: None,
                notifications_sent: 0,
                last_notified_at: None,
                resolved: false,
                resolved_at: None,
                resolution_reason: None,
                version: 1,
            };
            self.store.insert_alert(&alert)?;
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::AlertRaised {
                    alert_id: alert.alert_id.clone(),
                    alert_type: alert.alert_type,
                    credit_id: alert.credit_id.clone(),
                    installment_id: alert.installment_id.clone(),
                    priority: alert.priority,
                },
            )?;
            log::info!(
                "alert {} raised for installment {} ({})",
                alert.alert_id,
                installment.installment_id,
                alert.priority
            );
            return Ok(UpsertOutcome::Created(alert));
        };

        let before = alert.clone();
        let (priority, override_baseline) = batch_priority(&alert, result.priority);
        alert.computed_penalty_amount = installment.penalty_amount;
        alert.overdue_amount = result.overdue_amount;
        alert.total_amount = installment.total_amount + installment.penalty_amount;
        alert.overdue_installment_count = overdue_installment_count;
        alert.days_overdue = result.days_overdue;
        alert.message = overdue_message(installment, result.days_overdue);
        alert.priority = priority;
        alert.override_baseline = override_baseline;

        if alert.batch_fields() == before.batch_fields() {
            return Ok(UpsertOutcome::Unchanged(alert));
        }
        let alert = self.store.update_alert(&alert)?;
        if alert.priority != before.priority {
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::AlertEscalated {
                    alert_id: alert.alert_id.clone(),
                    from: before.priority,
                    to: alert.priority,
                },
            )?;
        }
        Ok(UpsertOutcome::Updated(alert))
    }

    /// Open or refresh the credit-level alert of `alert_type`.
    #[allow(clippy::too_many_arguments)]
    pub fn raise_credit_alert(
        &self,
        credit: &Credit,
        alert_type: AlertType,
        message: String,
        overdue_amount: Decimal,
        overdue_installment_count: u32,
        days_overdue: u32,
        priority: Priority,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        if let Some(mut alert) = self
            .store
            .open_credit_alert(&credit.credit_id, alert_type)?
        {
            alert.message = message;
            alert.overdue_amount = overdue_amount;
            alert.total_amount = overdue_amount;
            alert.overdue_installment_count = overdue_installment_count;
            alert.days_overdue = days_overdue;
            let (priority, override_baseline) = batch_priority(&alert, priority);
            alert.priority = priority;
            alert.override_baseline = override_baseline;
            return self.store.update_alert(&alert);
        }
        let alert = Alert {
            alert_id: new_id("alr"),
            installment_id: None,
            credit_id: credit.credit_id.clone(),
            client_id: credit.client_id.clone(),
            alert_type,
            message,
            computed_penalty_amount: Decimal::ZERO,
            overdue_amount,
            total_amount: overdue_amount,
            overdue_installment_count,
            days_overdue,
            raised_at: now,
            priority,
            override_baseline: None,
            management_state: ManagementState::New,
            assigned_agent_id: None,
            assigned_at: None,
            promise_date: None,
            promise_amount: None,
            notifications_sent: 0,
            last_notified_at: None,
            resolved: false,
            resolved_at: None,
            resolution_reason: None,
            version: 1,
        };
        self.store.insert_alert(&alert)?;
        self.store.record_event(
            self.scope,
            now,
            &CollectionsEvent::AlertRaised {
                alert_id: alert.alert_id.clone(),
                alert_type,
                credit_id: alert.credit_id.clone(),
                installment_id: None,
                priority,
            },
        )?;
        log::info!(
            "credit-level alert {} ({alert_type}) raised on credit {}",
            alert.alert_id,
            credit.credit_id
        );
        Ok(alert)
    }

    /// Close an alert. Resolving an already resolved alert is a no-op.
    pub fn resolve(
        &self,
        mut alert: Alert,
        reason: &str,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        if alert.resolved {
            return Ok(alert);
        }
        let from = alert.management_state;
        alert.resolved = true;
        alert.resolved_at = Some(now);
        alert.resolution_reason = Some(reason.to_string());
        alert.management_state = ManagementState::Resolved;
        let alert = self.store.update_alert(&alert)?;
        self.store.record_event(
            self.scope,
            now,
            &CollectionsEvent::AlertResolved {
                alert_id: alert.alert_id.clone(),
                reason: reason.to_string(),
            },
        )?;
        log::info!("alert {} resolved ({reason}) from {from}", alert.alert_id);
        Ok(alert)
    }

    /// Resolve the open alert of an installment, if there is one.
    pub fn resolve_for_installment(
        &self,
        installment_id: &str,
        reason: &str,
        now: NaiveDateTime,
    ) -> CollectionsResult<Option<Alert>> {
        match self.store.open_alert_for_installment(installment_id)? {
            Some(alert) => self.resolve(alert, reason, now).map(Some),
            None => Ok(None),
        }
    }

    /// Move an alert's management state.
    pub(crate) fn set_management_state(
        &self,
        mut alert: Alert,
        to: ManagementState,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        let from = alert.management_state;
        if from == to {
            return Ok(alert);
        }
        alert.management_state = to;
        let alert = self.store.update_alert(&alert)?;
        self.store.record_event(
            self.scope,
            now,
            &CollectionsEvent::ManagementStateChanged {
                alert_id: alert.alert_id.clone(),
                from,
                to,
            },
        )?;
        Ok(alert)
    }

    /// Operator override; the only path that may lower a priority.
    pub fn override_priority(
        &self,
        alert_id: &str,
        priority: Priority,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        let mut alert = self.store.get_alert(alert_id)?;
        check_version("alert", &alert.alert_id, alert.version, expected_version)?;
        if alert.resolved {
            return Err(CollectionsError::InvalidTransition {
                entity: "alert",
                from: ManagementState::Resolved.to_string(),
                to: format!("priority {priority}"),
            });
        }
        let from = alert.priority;
        alert.override_baseline = Some(alert.override_baseline.unwrap_or(from));
        alert.priority = priority;
        let alert = self.store.update_alert(&alert)?;
        if from != priority {
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::AlertEscalated {
                    alert_id: alert.alert_id.clone(),
                    from,
                    to: priority,
                },
            )?;
        }
        Ok(alert)
    }

    /// Throttling decision for `alert` at `now`.
    pub fn decide(
        &self,
        alert: &Alert,
        policy: &NotificationPolicy,
        now: NaiveDateTime,
    ) -> CollectionsResult<NotifyDecision> {
        let sent_today = self
            .store
            .notifications_sent_on(&alert.client_id, now.date())?;
        Ok(notification_decision(alert, policy, now, sent_today))
    }

    /// Ask the notifier to send a reminder for `alert` if policy allows.
    ///
    /// A notifier failure is reported as `DispatchOutcome::Failed`; the
    /// alert's counters only move on success.
    pub fn notify(
        &self,
        alert: &Alert,
        notifier: &dyn Notifier,
        policy: &NotificationPolicy,
        now: NaiveDateTime,
    ) -> CollectionsResult<DispatchOutcome> {
        if let NotifyDecision::Skip(reason) = self.decide(alert, policy, now)? {
            log::debug!("alert {} notification skipped: {reason:?}", alert.alert_id);
            return Ok(DispatchOutcome::Skipped(reason));
        }

        let request = NotificationRequest {
            channel: policy.channel,
            recipient: alert.client_id.clone(),
            template_key: format!("collections.{}.{}", alert.alert_type, alert.priority),
            variables: notification_variables(alert),
        };

        match notifier.send(&request) {
            Ok(sent) => {
                let updated = self.store.atomically(|store| {
                    let mut current = store.get_alert(&alert.alert_id)?;
                    check_version("alert", &current.alert_id, current.version, alert.version)?;
                    current.notifications_sent += 1;
                    current.last_notified_at = Some(now);
                    let current = store.update_alert(&current)?;
                    store.insert_notification(
                        &current,
                        request.channel,
                        &request.template_key,
                        &sent.message_id,
                        now,
                    )?;
                    store.record_event(
                        self.scope,
                        now,
                        &CollectionsEvent::AlertNotified {
                            alert_id: current.alert_id.clone(),
                            channel: request.channel.as_str().to_string(),
                            template_key: request.template_key.clone(),
                            message_id: sent.message_id.clone(),
                        },
                    )?;
                    Ok(current)
                })?;
                Ok(DispatchOutcome::Sent(updated))
            }
            Err(failed) => {
                self.store.record_event(
                    self.scope,
                    now,
                    &CollectionsEvent::NotificationFailed {
                        alert_id: alert.alert_id.clone(),
                        reason: failed.reason.clone(),
                    },
                )?;
                log::warn!("alert {} notification failed: {}", alert.alert_id, failed.reason);
                Ok(DispatchOutcome::Failed(failed.reason))
            }
        }
    }
}

fn notification_variables(alert: &Alert) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("client_id".into(), alert.client_id.clone());
    vars.insert("credit_id".into(), alert.credit_id.clone());
    vars.insert("days_overdue".into(), alert.days_overdue.to_string());
    vars.insert("overdue_amount".into(), alert.overdue_amount.to_string());
    vars.insert("penalty_amount".into(), alert.computed_penalty_amount.to_string());
    vars.insert("total_amount".into(), alert.total_amount.to_string());
    if let Some(installment_id) = &alert.installment_id {
        vars.insert("installment_id".into(), installment_id.clone());
    }
    vars
}

/// Fail with `ConcurrentModification` when the caller's version is stale.
pub(crate) fn check_version(
    entity: &'static str,
    id: &str,
    current: i64,
    expected: i64,
) -> CollectionsResult<()> {
    if current != expected {
        return Err(CollectionsError::ConcurrentModification {
            entity,
            id: id.to_string(),
            expected_version: expected,
        });
    }
    Ok(())
}
