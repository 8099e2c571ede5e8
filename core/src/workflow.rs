//! Collections workflow: agent contacts, promises to pay, assignment.
//!
//! Operator-driven and low-frequency. Every mutation carries the version
//! the operator last saw; a stale version is `ConcurrentModification`.
//! Contact history is append-only.

use crate::{
    alerts::{check_version, Alert, AlertManager, ManagementState},
    error::{CollectionsError, CollectionsResult},
    event::CollectionsEvent,
    store::CollectionsStore,
    types::{new_id, storage_enum, EntityId},
};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

storage_enum! {
    pub enum ContactChannel {
        Phone => "phone",
        WhatsApp => "whats_app",
        Email => "email",
        Sms => "sms",
        Visit => "visit",
    }
}

storage_enum! {
    pub enum ContactOutcome {
        NoAnswer => "no_answer",
        Reached => "reached",
        PromiseToPay => "promise_to_pay",
        Refused => "refused",
        WrongContact => "wrong_contact",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactHistory {
    pub contact_id: EntityId,
    pub alert_id: EntityId,
    pub client_id: EntityId,
    pub agent_id: EntityId,
    pub contacted_at: NaiveDateTime,
    pub channel: ContactChannel,
    pub outcome: ContactOutcome,
    pub notes: Option<String>,
    pub promise_date: Option<NaiveDate>,
    pub promise_amount: Option<Decimal>,
    pub next_contact_date: Option<NaiveDate>,
}

/// One contact attempt as reported by an agent.
#[derive(Debug, Clone)]
pub struct ContactReport {
    pub alert_id: EntityId,
    pub agent_id: EntityId,
    pub channel: ContactChannel,
    pub outcome: ContactOutcome,
    pub notes: Option<String>,
    pub promise_date: Option<NaiveDate>,
    pub promise_amount: Option<Decimal>,
    pub next_contact_date: Option<NaiveDate>,
    pub expected_version: i64,
}

pub struct CollectionsWorkflow<'a> {
    scope: &'a str,
    store: &'a CollectionsStore,
}

impl<'a> CollectionsWorkflow<'a> {
    pub fn new(scope: &'a str, store: &'a CollectionsStore) -> Self {
        Self { scope, store }
    }

    /// Append a contact and apply its outcome to the alert.
    pub fn record_contact(
        &self,
        report: &ContactReport,
        now: NaiveDateTime,
    ) -> CollectionsResult<(ContactHistory, Alert)> {
        let alerts = AlertManager::new(self.scope, self.store);
        self.store.atomically(|store| {
            let mut alert = store.get_alert(&report.alert_id)?;
            check_version("alert", &alert.alert_id, alert.version, report.expected_version)?;
            if alert.resolved {
                return Err(CollectionsError::InvalidTransition {
                    entity: "alert",
                    from: ManagementState::Resolved.to_string(),
                    to: format!("contact {}", report.outcome),
                });
            }

            let (promise_date, promise_amount) = match report.outcome {
                ContactOutcome::PromiseToPay => match (report.promise_date, report.promise_amount) {
                    (Some(date), Some(amount)) if amount > Decimal::ZERO && date >= now.date() => {
                        (Some(date), Some(amount))
                    }
                    _ => {
                        return Err(CollectionsError::InvalidPayment {
                            reason: "a promise to pay needs a future date and a positive amount"
                                .into(),
                        })
                    }
                },
                _ => (None, None),
            };

            let contact = ContactHistory {
                contact_id: new_id("ctc"),
                alert_id: alert.alert_id.clone(),
                client_id: alert.client_id.clone(),
                agent_id: report.agent_id.clone(),
                contacted_at: now,
                channel: report.channel,
                outcome: report.outcome,
                notes: report.notes.clone(),
                promise_date,
                promise_amount,
                next_contact_date: report.next_contact_date,
            };
            store.insert_contact(&contact)?;
            store.record_event(
                self.scope,
                now,
                &CollectionsEvent::ContactRecorded {
                    contact_id: contact.contact_id.clone(),
                    alert_id: alert.alert_id.clone(),
                    agent_id: report.agent_id.clone(),
                    outcome: report.outcome.to_string(),
                },
            )?;

            let next_state = match report.outcome {
                ContactOutcome::PromiseToPay => ManagementState::PromiseMade,
                _ if matches!(
                    alert.management_state,
                    ManagementState::New | ManagementState::Assigned
                ) =>
                {
                    ManagementState::InProgress
                }
                _ => alert.management_state,
            };
            if report.outcome == ContactOutcome::PromiseToPay {
                alert.promise_date = promise_date;
                alert.promise_amount = promise_amount;
                if alert.management_state == ManagementState::PromiseMade {
                    // A renewed promise replaces the previous one in place.
                    alert = store.update_alert(&alert)?;
                }
            }
            let alert = alerts.set_management_state(alert, next_state, now)?;
            log::info!(
                "contact {} on alert {}: {} -> {}",
                contact.contact_id,
                alert.alert_id,
                report.outcome,
                alert.management_state
            );
            Ok((contact, alert))
        })
    }

    /// Assign (or reassign) an alert to a collections agent.
    pub fn assign(
        &self,
        alert_id: &str,
        agent_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        self.store.atomically(|store| {
            let mut alert = store.get_alert(alert_id)?;
            check_version("alert", &alert.alert_id, alert.version, expected_version)?;
            if alert.resolved || !alert.management_state.allows_assignment() {
                return Err(CollectionsError::InvalidTransition {
                    entity: "alert",
                    from: alert.management_state.to_string(),
                    to: ManagementState::Assigned.to_string(),
                });
            }
            let from = alert.management_state;
            alert.assigned_agent_id = Some(agent_id.to_string());
            alert.assigned_at = Some(now);
            if from == ManagementState::New {
                alert.management_state = ManagementState::Assigned;
            }
            let alert = store.update_alert(&alert)?;
            store.record_event(
                self.scope,
                now,
                &CollectionsEvent::AlertAssigned {
                    alert_id: alert.alert_id.clone(),
                    agent_id: agent_id.to_string(),
                },
            )?;
            if from != alert.management_state {
                store.record_event(
                    self.scope,
                    now,
                    &CollectionsEvent::ManagementStateChanged {
                        alert_id: alert.alert_id.clone(),
                        from,
                        to: alert.management_state,
                    },
                )?;
            }
            log::info!("alert {alert_id} assigned to {agent_id}");
            Ok(alert)
        })
    }

    /// Escalate alerts whose promise date passed without the promised money.
    ///
    /// Payments are counted from the moment the promise was recorded, on
    /// the alert's installment or, for credit-level alerts, on the credit.
    pub fn escalate_broken_promises(
        &self,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> CollectionsResult<Vec<Alert>> {
        let alerts = AlertManager::new(self.scope, self.store);
        let mut escalated = Vec::new();
        for alert in self.store.alerts_with_promise_due_before(today)? {
            let (Some(promise_date), Some(promise_amount)) = (alert.promise_date, alert.promise_amount)
            else {
                continue;
            };
            let promised_at = self
                .store
                .latest_promise_contact_at(&alert.alert_id)?
                .unwrap_or(alert.raised_at);
            let paid_since = match &alert.installment_id {
                Some(installment_id) => self
                    .store
                    .payments_for_installment_since(installment_id, promised_at)?,
                None => self.store.payments_for_credit_since(&alert.credit_id, promised_at)?,
            };
            if paid_since >= promise_amount {
                continue;
            }
            let alert_id = alert.alert_id.clone();
            let updated = self.store.atomically(|store| {
                store.record_event(
                    self.scope,
                    now,
                    &CollectionsEvent::PromiseBroken {
                        alert_id: alert_id.clone(),
                        promise_date,
                        promise_amount,
                        paid_since,
                    },
                )?;
                alerts.set_management_state(alert, ManagementState::Escalated, now)
            })?;
            log::warn!(
                "alert {alert_id}: promise of {promise_amount} due {promise_date} broken ({paid_since} paid)"
            );
            escalated.push(updated);
        }
        Ok(escalated)
    }

    pub fn contact_history(&self, alert_id: &str) -> CollectionsResult<Vec<ContactHistory>> {
        self.store.contacts_for_alert(alert_id)
    }
}
