//! The collections engine: one handle over the store and every component.
//!
//! The batch entry points (`run`, `run_scheduled`) and every operator
//! action go through here. Each operator action gets its own event-log
//! scope so its audit trail can be read back as a unit.
//!
//! RULES:
//!   - Components never call each other's mutations except through the
//!     owner (ledger owns credits/installments, alert manager owns alerts,
//!     restructuring engine owns agreements).
//!   - Operator actions on alerts and agreements carry the version the
//!     operator last saw.

use crate::{
    alerts::{Alert, AlertManager, RESOLUTION_PAID},
    calculator::Priority,
    config::{ConfigSnapshot, DelinquencyConfig},
    error::CollectionsResult,
    ledger::{
        Credit, CreditState, Installment, InstallmentLedger, InstallmentState, Payment,
        PaymentReceipt,
    },
    notifier::Notifier,
    orchestrator::{BatchOrchestrator, RunLog},
    restructuring::{AgreementInstallment, AgreementProposal, PaymentAgreement, RestructuringEngine},
    scoring::{ScoreStore, ScoringAdjuster},
    store::CollectionsStore,
    types::new_id,
    workflow::{CollectionsWorkflow, ContactHistory, ContactReport},
};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

/// Everything a recorded payment changed.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub receipt: PaymentReceipt,
    /// Score points given back because the installment is now paid.
    pub score_restored: Decimal,
    pub resolved_alert: Option<Alert>,
}

pub struct CollectionsEngine {
    store: CollectionsStore,
    notifier: Box<dyn Notifier>,
}

impl CollectionsEngine {
    pub fn new(store: CollectionsStore, notifier: Box<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Migrate the store and wrap it. Call this instead of `new` on a fresh
    /// database.
    pub fn build(store: CollectionsStore, notifier: Box<dyn Notifier>) -> CollectionsResult<Self> {
        store.migrate()?;
        Ok(Self::new(store, notifier))
    }

    pub fn store(&self) -> &CollectionsStore {
        &self.store
    }

    // ── Configuration ──────────────────────────────────────────

    pub fn publish_configuration(
        &self,
        config: &DelinquencyConfig,
        at: NaiveDateTime,
    ) -> CollectionsResult<ConfigSnapshot> {
        self.store.save_configuration(config, at)
    }

    pub fn configuration(&self) -> CollectionsResult<ConfigSnapshot> {
        self.store.load_active_configuration()
    }

    // ── Batch ──────────────────────────────────────────────────

    pub fn run(&self, today: NaiveDate) -> CollectionsResult<RunLog> {
        BatchOrchestrator::new(&self.store, self.notifier.as_ref()).run(today)
    }

    pub fn run_scheduled(&self, now: NaiveDateTime) -> CollectionsResult<Option<RunLog>> {
        BatchOrchestrator::new(&self.store, self.notifier.as_ref()).run_scheduled(now)
    }

    // ── Ledger ─────────────────────────────────────────────────

    pub fn open_credit(&self, credit: &Credit, schedule: &[Installment]) -> CollectionsResult<()> {
        InstallmentLedger::new(&new_id("op"), &self.store).open_credit(credit, schedule)
    }

    pub fn transition_credit(
        &self,
        credit_id: &str,
        to: CreditState,
        on: NaiveDate,
    ) -> CollectionsResult<Credit> {
        InstallmentLedger::new(&new_id("op"), &self.store).transition_credit(credit_id, to, on)
    }

    /// Record a payment. When it settles the installment, the score
    /// deduction is partly restored and the installment's alert resolved,
    /// all in the payment's transaction.
    pub fn record_payment(
        &self,
        installment_id: &str,
        amount: Decimal,
        paid_at: NaiveDateTime,
        method: Option<&str>,
    ) -> CollectionsResult<PaymentOutcome> {
        let snapshot = self.store.load_active_configuration()?;
        let scope = new_id("op");
        let ledger = InstallmentLedger::new(&scope, &self.store);
        let scoring = ScoringAdjuster::new(&scope, &self.store, &self.store);
        let alerts = AlertManager::new(&scope, &self.store);
        self.store.atomically(|_| {
            let receipt = ledger.record_payment(installment_id, amount, paid_at, method)?;
            if !receipt.settled_installment() {
                return Ok(PaymentOutcome {
                    receipt,
                    score_restored: Decimal::ZERO,
                    resolved_alert: None,
                });
            }
            let score_restored =
                scoring.recover(&receipt.installment, &snapshot.config.score, paid_at)?;
            let resolved_alert =
                alerts.resolve_for_installment(installment_id, RESOLUTION_PAID, paid_at)?;
            Ok(PaymentOutcome {
                receipt,
                score_restored,
                resolved_alert,
            })
        })
    }

    /// Reverse a payment. When the payment had settled its installment, the
    /// score points restored at settlement are taken back in the same
    /// transaction.
    pub fn reverse_payment(
        &self,
        payment_id: &str,
        reason: &str,
        at: NaiveDateTime,
    ) -> CollectionsResult<Payment> {
        let scope = new_id("op");
        let ledger = InstallmentLedger::new(&scope, &self.store);
        let scoring = ScoringAdjuster::new(&scope, &self.store, &self.store);
        self.store.atomically(|store| {
            let original = store.get_payment(payment_id)?;
            let was_paid =
                store.get_installment(&original.installment_id)?.state == InstallmentState::Paid;
            let reversal = ledger.reverse_payment(payment_id, reason, at)?;
            if was_paid {
                let reopened = store.get_installment(&original.installment_id)?;
                scoring.revoke_recovery(&reopened, at)?;
            }
            Ok(reversal)
        })
    }

    pub fn client_score(&self, client_id: &str) -> CollectionsResult<Decimal> {
        self.store.get_score(client_id)
    }

    // ── Collections workflow ───────────────────────────────────

    pub fn assign_alert(
        &self,
        alert_id: &str,
        agent_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        CollectionsWorkflow::new(&new_id("op"), &self.store).assign(
            alert_id,
            agent_id,
            expected_version,
            now,
        )
    }

    pub fn record_contact(
        &self,
        report: &ContactReport,
        now: NaiveDateTime,
    ) -> CollectionsResult<(ContactHistory, Alert)> {
        CollectionsWorkflow::new(&new_id("op"), &self.store).record_contact(report, now)
    }

    pub fn override_priority(
        &self,
        alert_id: &str,
        priority: Priority,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<Alert> {
        AlertManager::new(&new_id("op"), &self.store).override_priority(
            alert_id,
            priority,
            expected_version,
            now,
        )
    }

    // ── Restructuring ──────────────────────────────────────────

    pub fn propose_agreement(
        &self,
        proposal: &AgreementProposal,
        now: NaiveDateTime,
    ) -> CollectionsResult<(PaymentAgreement, Vec<AgreementInstallment>)> {
        let snapshot = self.store.load_active_configuration()?;
        RestructuringEngine::new(&new_id("op"), &self.store).propose(
            proposal,
            &snapshot.config.restructuring,
            now,
        )
    }

    pub fn approve_agreement(
        &self,
        agreement_id: &str,
        approved_by: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        RestructuringEngine::new(&new_id("op"), &self.store).approve(
            agreement_id,
            approved_by,
            expected_version,
            now,
        )
    }

    pub fn record_upfront_payment(
        &self,
        agreement_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        RestructuringEngine::new(&new_id("op"), &self.store).record_upfront_payment(
            agreement_id,
            expected_version,
            now,
        )
    }

    pub fn cancel_agreement(
        &self,
        agreement_id: &str,
        expected_version: i64,
        now: NaiveDateTime,
    ) -> CollectionsResult<PaymentAgreement> {
        RestructuringEngine::new(&new_id("op"), &self.store).cancel(agreement_id, expected_version, now)
    }

    pub fn record_agreement_payment(
        &self,
        agreement_id: &str,
        number: u32,
        amount: Decimal,
        paid_at: NaiveDateTime,
    ) -> CollectionsResult<AgreementInstallment> {
        RestructuringEngine::new(&new_id("op"), &self.store).record_agreement_payment(
            agreement_id,
            number,
            amount,
            paid_at,
        )
    }
}
