//! Scoring adjuster: client risk-score penalties and auto-block.
//!
//! Score changes are append-and-net: every delta is a movement row, and
//! the delta currently applied for each installment is kept so that a
//! re-run nets to zero and a recovery restores an exact share.

use crate::{
    calculator::{days_overdue, DelinquencyResult},
    config::{BlockPolicy, DelinquencyConfig, ScorePolicy},
    error::CollectionsResult,
    event::CollectionsEvent,
    ledger::Installment,
    store::CollectionsStore,
    types::{round_money, EntityId},
};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

/// Client risk-score store. The engine only reads and nets deltas.
pub trait ScoreStore {
    fn get_score(&self, client_id: &str) -> CollectionsResult<Decimal>;

    /// Add `delta` (negative to deduct) and return the new score.
    fn apply_score_delta(
        &self,
        client_id: &str,
        delta: Decimal,
        reason: &str,
        at: NaiveDateTime,
    ) -> CollectionsResult<Decimal>;
}

/// Score penalty currently held against one installment.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreAdjustment {
    pub installment_id: EntityId,
    pub client_id: EntityId,
    pub applied_delta: Decimal,
    /// Client score just before this installment's first deduction.
    pub pre_penalty_score: Decimal,
    pub recovered: bool,
    pub recovered_delta: Decimal,
}

/// One row of the append-only score ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMovement {
    pub client_id: EntityId,
    pub delta: Decimal,
    pub score_after: Decimal,
    pub reason: String,
    pub moved_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreChange {
    pub installment_id: EntityId,
    pub previous_delta: Decimal,
    pub applied_delta: Decimal,
    pub score: Decimal,
}

/// Aggregate exposure of one client across collectible credits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientExposure {
    pub max_days_overdue: u32,
    pub overdue_installments: u32,
    pub overdue_amount: Decimal,
}

/// Target deduction for an installment overdue `days` days.
pub fn penalty_points(days: u32, policy: &ScorePolicy) -> Decimal {
    let raw = Decimal::from(days) * policy.points_per_day + policy.points_per_overdue_installment;
    raw.min(policy.max_points_deductible)
}

/// Points restored on full payment, bounded by the pre-penalty score.
pub fn recovery_points(
    applied_delta: Decimal,
    current_score: Decimal,
    pre_penalty_score: Decimal,
    policy: &ScorePolicy,
) -> Decimal {
    if !policy.recover_on_payment {
        return Decimal::ZERO;
    }
    let share = round_money(applied_delta * policy.recovery_percentage);
    let headroom = (pre_penalty_score - current_score).max(Decimal::ZERO);
    share.min(headroom)
}

/// Reason text when the block policy holds for `exposure`, else `None`.
pub fn block_reason(exposure: &ClientExposure, policy: &BlockPolicy) -> Option<String> {
    if !policy.enabled {
        return None;
    }
    if exposure.max_days_overdue >= policy.days_overdue {
        return Some(format!("{} days overdue", exposure.max_days_overdue));
    }
    if exposure.overdue_installments >= policy.overdue_installments {
        return Some(format!("{} overdue installments", exposure.overdue_installments));
    }
    if exposure.overdue_amount >= policy.overdue_amount {
        return Some(format!("{} overdue", exposure.overdue_amount));
    }
    None
}

pub struct ScoringAdjuster<'a> {
    scope: &'a str,
    store: &'a CollectionsStore,
    scores: &'a dyn ScoreStore,
}

impl<'a> ScoringAdjuster<'a> {
    pub fn new(scope: &'a str, store: &'a CollectionsStore, scores: &'a dyn ScoreStore) -> Self {
        Self { scope, store, scores }
    }

    /// Set the installment's score penalty to today's target.
    ///
    /// The previous deduction is netted out first, so running twice for the
    /// same day moves nothing. The score never drops below zero.
    pub fn apply(
        &self,
        installment: &Installment,
        client_id: &str,
        result: &DelinquencyResult,
        policy: &ScorePolicy,
        now: NaiveDateTime,
    ) -> CollectionsResult<Option<ScoreChange>> {
        if !result.is_delinquent {
            return Ok(None);
        }
        let existing = self.store.get_score_adjustment(&installment.installment_id)?;
        if existing.as_ref().is_some_and(|a| a.recovered) {
            return Ok(None);
        }

        let score = self.scores.get_score(client_id)?;
        let previous_delta = existing
            .as_ref()
            .map(|a| a.applied_delta)
            .unwrap_or(Decimal::ZERO);
        let pre_penalty_score = existing
            .as_ref()
            .map(|a| a.pre_penalty_score)
            .unwrap_or(score);

        let target = penalty_points(result.days_overdue, policy);
        let applied_delta = target.min(score + previous_delta).max(Decimal::ZERO);
        let net = applied_delta - previous_delta;

        let score = if net.is_zero() {
            score
        } else {
            let reason = format!(
                "installment #{} {} days overdue",
                installment.number, result.days_overdue
            );
            let score = self.scores.apply_score_delta(client_id, -net, &reason, now)?;
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::ScoreAdjusted {
                    client_id: client_id.to_string(),
                    installment_id: installment.installment_id.clone(),
                    delta: -net,
                    score,
                    reason,
                },
            )?;
            score
        };

        if net.is_zero() && existing.is_some() {
            return Ok(Some(ScoreChange {
                installment_id: installment.installment_id.clone(),
                previous_delta,
                applied_delta,
                score,
            }));
        }

        self.store.save_score_adjustment(&ScoreAdjustment {
            installment_id: installment.installment_id.clone(),
            client_id: client_id.to_string(),
            applied_delta,
            pre_penalty_score,
            recovered: false,
            recovered_delta: Decimal::ZERO,
        })?;
        Ok(Some(ScoreChange {
            installment_id: installment.installment_id.clone(),
            previous_delta,
            applied_delta,
            score,
        }))
    }

    /// Restore part of the deduction once the installment is paid in full.
    /// Returns the points restored; zero when nothing was deducted.
    pub fn recover(
        &self,
        installment: &Installment,
        policy: &ScorePolicy,
        now: NaiveDateTime,
    ) -> CollectionsResult<Decimal> {
        let Some(mut adjustment) = self.store.get_score_adjustment(&installment.installment_id)?
        else {
            return Ok(Decimal::ZERO);
        };
        if adjustment.recovered {
            return Ok(Decimal::ZERO);
        }
        let current = self.scores.get_score(&adjustment.client_id)?;
        let restored = recovery_points(
            adjustment.applied_delta,
            current,
            adjustment.pre_penalty_score,
            policy,
        );
        if restored > Decimal::ZERO {
            let reason = format!("installment #{} paid", installment.number);
            let score = self
                .scores
                .apply_score_delta(&adjustment.client_id, restored, &reason, now)?;
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::ScoreAdjusted {
                    client_id: adjustment.client_id.clone(),
                    installment_id: installment.installment_id.clone(),
                    delta: restored,
                    score,
                    reason,
                },
            )?;
        }
        adjustment.recovered = true;
        adjustment.recovered_delta = restored;
        self.store.save_score_adjustment(&adjustment)?;
        log::debug!(
            "installment {} paid: restored {restored} of {} points",
            installment.installment_id,
            adjustment.applied_delta
        );
        Ok(restored)
    }

    /// Take back the points `recover` restored, after the payment that
    /// settled the installment was reversed. The installment's deduction is
    /// then held in full again and later runs keep scoring it.
    pub fn revoke_recovery(
        &self,
        installment: &Installment,
        now: NaiveDateTime,
    ) -> CollectionsResult<Decimal> {
        let Some(mut adjustment) = self.store.get_score_adjustment(&installment.installment_id)?
        else {
            return Ok(Decimal::ZERO);
        };
        if !adjustment.recovered {
            return Ok(Decimal::ZERO);
        }
        let revoked = adjustment.recovered_delta;
        if revoked > Decimal::ZERO {
            let reason = format!("installment #{} payment reversed", installment.number);
            let score = self
                .scores
                .apply_score_delta(&adjustment.client_id, -revoked, &reason, now)?;
            self.store.record_event(
                self.scope,
                now,
                &CollectionsEvent::ScoreAdjusted {
                    client_id: adjustment.client_id.clone(),
                    installment_id: installment.installment_id.clone(),
                    delta: -revoked,
                    score,
                    reason,
                },
            )?;
        }
        adjustment.recovered = false;
        adjustment.recovered_delta = Decimal::ZERO;
        self.store.save_score_adjustment(&adjustment)?;
        Ok(revoked)
    }

    /// Block or unblock a client according to the block policy.
    /// Returns the client's blocked flag after review.
    pub fn review_standing(
        &self,
        client_id: &str,
        config: &DelinquencyConfig,
        as_of: NaiveDate,
        now: NaiveDateTime,
    ) -> CollectionsResult<bool> {
        let exposure = self.exposure(client_id, config.penalty.grace_days, as_of)?;
        let blocked = self.store.is_client_blocked(client_id)?;
        match (block_reason(&exposure, &config.block), blocked) {
            (Some(reason), false) => {
                self.store.set_client_block(client_id, Some(&reason), now)?;
                self.store.record_event(
                    self.scope,
                    now,
                    &CollectionsEvent::ClientBlocked {
                        client_id: client_id.to_string(),
                        reason: reason.clone(),
                    },
                )?;
                log::info!("client {client_id} blocked: {reason}");
                Ok(true)
            }
            (None, true) if config.block.auto_unblock => {
                self.store.set_client_block(client_id, None, now)?;
                self.store.record_event(
                    self.scope,
                    now,
                    &CollectionsEvent::ClientUnblocked {
                        client_id: client_id.to_string(),
                    },
                )?;
                log::info!("client {client_id} unblocked");
                Ok(false)
            }
            (_, current) => Ok(current),
        }
    }

    /// Current exposure of a client as of `as_of`.
    pub fn exposure(
        &self,
        client_id: &str,
        grace_days: u32,
        as_of: NaiveDate,
    ) -> CollectionsResult<ClientExposure> {
        let mut exposure = ClientExposure::default();
        for inst in self.store.open_installments_for_client(client_id, as_of)? {
            let days = days_overdue(inst.due_date, as_of, grace_days);
            if days == 0 || inst.remaining_total().is_zero() {
                continue;
            }
            exposure.max_days_overdue = exposure.max_days_overdue.max(days);
            exposure.overdue_installments += 1;
            exposure.overdue_amount += inst.amount_owed();
        }
        Ok(exposure)
    }
}
