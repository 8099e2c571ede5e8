//! Audit events: every state change the engine makes.
//!
//! RULE: Events are appended, never updated. Variants are added over
//! time and never removed or reordered; stored payloads refer to them.

use crate::{
    alerts::{AlertType, ManagementState},
    calculator::Priority,
    ledger::InstallmentState,
    restructuring::AgreementState,
    types::EntityId,
};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectionsEvent {
    // ── Batch ──────────────────────────────────────
    RunStarted {
        run_id: EntityId,
        as_of: NaiveDate,
        config_version: i64,
    },
    RunFinished {
        run_id: EntityId,
        succeeded: bool,
        installments_processed: u32,
    },

    // ── Ledger ─────────────────────────────────────
    PenaltyApplied {
        installment_id: EntityId,
        credit_id: EntityId,
        days_overdue: u32,
        previous_penalty: Decimal,
        penalty: Decimal,
        state: InstallmentState,
    },
    PaymentRecorded {
        payment_id: EntityId,
        installment_id: EntityId,
        credit_id: EntityId,
        amount: Decimal,
        installment_state: InstallmentState,
    },
    PaymentReversed {
        payment_id: EntityId,
        reversal_id: EntityId,
        installment_id: EntityId,
        amount: Decimal,
    },

    // ── Scoring ────────────────────────────────────
    ScoreAdjusted {
        client_id: EntityId,
        installment_id: EntityId,
        delta: Decimal,
        score: Decimal,
        reason: String,
    },
    ClientBlocked {
        client_id: EntityId,
        reason: String,
    },
    ClientUnblocked {
        client_id: EntityId,
    },

    // ── Alerts ─────────────────────────────────────
    AlertRaised {
        alert_id: EntityId,
        alert_type: AlertType,
        credit_id: EntityId,
        installment_id: Option<EntityId>,
        priority: Priority,
    },
    AlertEscalated {
        alert_id: EntityId,
        from: Priority,
        to: Priority,
    },
    AlertResolved {
        alert_id: EntityId,
        reason: String,
    },
    AlertNotified {
        alert_id: EntityId,
        channel: String,
        template_key: String,
        message_id: String,
    },
    NotificationFailed {
        alert_id: EntityId,
        reason: String,
    },

    // ── Collections workflow ───────────────────────
    AlertAssigned {
        alert_id: EntityId,
        agent_id: EntityId,
    },
    ContactRecorded {
        contact_id: EntityId,
        alert_id: EntityId,
        agent_id: EntityId,
        outcome: String,
    },
    PromiseBroken {
        alert_id: EntityId,
        promise_date: NaiveDate,
        promise_amount: Decimal,
        paid_since: Decimal,
    },
    ManagementStateChanged {
        alert_id: EntityId,
        from: ManagementState,
        to: ManagementState,
    },

    // ── Restructuring ──────────────────────────────
    AgreementProposed {
        agreement_id: EntityId,
        credit_id: EntityId,
        total_agreed: Decimal,
        condoned_amount: Decimal,
    },
    AgreementStateChanged {
        agreement_id: EntityId,
        from: AgreementState,
        to: AgreementState,
    },
    AgreementPaymentRecorded {
        agreement_id: EntityId,
        number: u32,
        amount: Decimal,
    },
}

impl CollectionsEvent {
    /// Stable name stored in the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            CollectionsEvent::RunStarted { .. }              => "run_started",
            CollectionsEvent::RunFinished { .. }             => "run_finished",
            CollectionsEvent::PenaltyApplied { .. }          => "penalty_applied",
            CollectionsEvent::PaymentRecorded { .. }         => "payment_recorded",
            CollectionsEvent::PaymentReversed { .. }         => "payment_reversed",
            CollectionsEvent::ScoreAdjusted { .. }           => "score_adjusted",
            CollectionsEvent::ClientBlocked { .. }           => "client_blocked",
            CollectionsEvent::ClientUnblocked { .. }         => "client_unblocked",
            CollectionsEvent::AlertRaised { .. }             => "alert_raised",
            CollectionsEvent::AlertEscalated { .. }          => "alert_escalated",
            CollectionsEvent::AlertResolved { .. }           => "alert_resolved",
            CollectionsEvent::AlertNotified { .. }           => "alert_notified",
            CollectionsEvent::NotificationFailed { .. }      => "notification_failed",
            CollectionsEvent::AlertAssigned { .. }           => "alert_assigned",
            CollectionsEvent::ContactRecorded { .. }         => "contact_recorded",
            CollectionsEvent::PromiseBroken { .. }           => "promise_broken",
            CollectionsEvent::ManagementStateChanged { .. }  => "management_state_changed",
            CollectionsEvent::AgreementProposed { .. }       => "agreement_proposed",
            CollectionsEvent::AgreementStateChanged { .. }   => "agreement_state_changed",
            CollectionsEvent::AgreementPaymentRecorded { .. }=> "agreement_payment_recorded",
        }
    }
}

/// One row of the `event_log` table.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    /// Run id for batch events, operation id for operator actions.
    pub scope: String,
    pub recorded_at: NaiveDateTime,
    pub event_type: String,
    pub payload: String,
}
