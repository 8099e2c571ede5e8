//! Delinquency calculator: pure penalty and priority evaluation.
//!
//! RULE: No I/O and no clock. The same installment snapshot, as-of date
//! and configuration always produce the same result, which is what makes
//! a retried batch safe.

use crate::{
    config::{DelinquencyConfig, PenaltyBasis, PenaltyCap, PriorityThresholds},
    ledger::Installment,
    types::{round_money, storage_enum, EntityId},
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

storage_enum! {
    /// Collections priority, ordered from least to most urgent.
    #[derive(PartialOrd, Ord)]
    pub enum Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelinquencyResult {
    pub installment_id: EntityId,
    pub as_of: NaiveDate,
    pub days_overdue: u32,
    pub is_delinquent: bool,
    /// 1..=3 when delinquent under a tiered policy.
    pub tier: Option<u8>,
    pub daily_rate: Decimal,
    pub base: Decimal,
    /// `base × daily_rate × days_overdue`, before the cap.
    pub raw_penalty: Decimal,
    pub penalty: Decimal,
    pub capped: bool,
    /// Everything owed on the installment once `penalty` is accrued.
    pub overdue_amount: Decimal,
    pub priority: Priority,
}

/// Days past the grace period; zero while inside it.
pub fn days_overdue(due_date: NaiveDate, as_of: NaiveDate, grace_days: u32) -> u32 {
    let elapsed = (as_of - due_date).num_days() - i64::from(grace_days);
    elapsed.clamp(0, i64::from(u32::MAX)) as u32
}

/// Highest level whose day OR amount threshold is met.
pub fn classify(days_overdue: u32, overdue_amount: Decimal, t: &PriorityThresholds) -> Priority {
    if days_overdue >= t.critical_days || overdue_amount >= t.critical_amount {
        Priority::Critical
    } else if days_overdue >= t.high_days || overdue_amount >= t.high_amount {
        Priority::High
    } else if days_overdue >= t.medium_days || overdue_amount >= t.medium_amount {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Apply the configured cap to a raw penalty.
pub fn apply_cap(raw_penalty: Decimal, base: Decimal, cap: PenaltyCap) -> Decimal {
    match cap {
        PenaltyCap::Uncapped => raw_penalty,
        PenaltyCap::Percentage(pct) => raw_penalty.min(round_money(base * pct)),
        PenaltyCap::Fixed(amount) => raw_penalty.min(amount),
    }
}

/// Evaluate one installment as of `as_of`.
pub fn evaluate(
    installment: &Installment,
    as_of: NaiveDate,
    config: &DelinquencyConfig,
) -> DelinquencyResult {
    let policy = &config.penalty;
    let base = match policy.basis {
        PenaltyBasis::Capital => installment.capital_amount,
        PenaltyBasis::Total => installment.total_amount,
    };
    let days = days_overdue(installment.due_date, as_of, policy.grace_days);

    // Settled capital and interest accrue no further mora.
    if days == 0 || !installment.state.is_open() || installment.remaining_total().is_zero() {
        return DelinquencyResult {
            installment_id: installment.installment_id.clone(),
            as_of,
            days_overdue: days,
            is_delinquent: false,
            tier: None,
            daily_rate: Decimal::ZERO,
            base,
            raw_penalty: Decimal::ZERO,
            penalty: Decimal::ZERO,
            capped: false,
            overdue_amount: installment.amount_owed(),
            priority: Priority::Low,
        };
    }

    let daily_rate = policy.rate_for(days);
    let raw_penalty = round_money(base * daily_rate * Decimal::from(days));
    let penalty = apply_cap(raw_penalty, base, policy.cap);
    let accrued = installment.penalty_amount.max(penalty);
    let overdue_amount =
        (installment.total_amount + accrued - installment.paid_amount).max(Decimal::ZERO);

    DelinquencyResult {
        installment_id: installment.installment_id.clone(),
        as_of,
        days_overdue: days,
        is_delinquent: true,
        tier: policy.tiered.then(|| policy.tier_for(days)),
        daily_rate,
        base,
        raw_penalty,
        penalty,
        capped: penalty < raw_penalty,
        overdue_amount,
        priority: classify(days, overdue_amount, &config.priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InstallmentState;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn installment(capital: Decimal, due: NaiveDate) -> Installment {
        Installment {
            installment_id: "cuo-1".into(),
            credit_id: "cr-1".into(),
            number: 1,
            capital_amount: capital,
            interest_amount: dec!(10000),
            total_amount: capital + dec!(10000),
            due_date: due,
            paid_date: None,
            paid_amount: Decimal::ZERO,
            penalty_amount: Decimal::ZERO,
            state: InstallmentState::Due,
            payment_method: None,
        }
    }

    #[test]
    fn grace_period_is_not_delinquent() {
        let config = DelinquencyConfig::documented_default();
        let inst = installment(dec!(100000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 1, 15), &config);
        assert_eq!(result.days_overdue, 0);
        assert!(!result.is_delinquent);
        assert_eq!(result.penalty, Decimal::ZERO);
    }

    #[test]
    fn first_tier_scenario() {
        let config = DelinquencyConfig::documented_default();
        let inst = installment(dec!(100000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 1, 20), &config);
        assert_eq!(result.days_overdue, 5);
        assert_eq!(result.tier, Some(1));
        assert_eq!(result.raw_penalty, dec!(500));
        assert_eq!(result.penalty, dec!(500));
        assert!(!result.capped);
    }

    #[test]
    fn second_tier_is_capped_and_high_priority() {
        let config = DelinquencyConfig::documented_default();
        let inst = installment(dec!(100000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 3, 1), &config);
        assert_eq!(result.days_overdue, 45);
        assert_eq!(result.tier, Some(2));
        assert_eq!(result.raw_penalty, dec!(6750));
        assert_eq!(result.penalty, dec!(2000));
        assert!(result.capped);
        assert_eq!(result.priority, Priority::High);
    }

    #[test]
    fn fixed_cap_bounds_penalty() {
        let mut config = DelinquencyConfig::documented_default();
        config.penalty.cap = PenaltyCap::Fixed(dec!(750));
        let inst = installment(dec!(100000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 2, 10), &config);
        assert_eq!(result.penalty, dec!(750));
    }

    #[test]
    fn total_basis_includes_interest() {
        let mut config = DelinquencyConfig::documented_default();
        config.penalty.basis = PenaltyBasis::Total;
        config.penalty.cap = PenaltyCap::Uncapped;
        let inst = installment(dec!(100000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 1, 20), &config);
        assert_eq!(result.base, dec!(110000));
        assert_eq!(result.penalty, dec!(550));
    }

    #[test]
    fn amount_threshold_alone_raises_priority() {
        let config = DelinquencyConfig::documented_default();
        let inst = installment(dec!(2000000), date(2025, 1, 10));
        let result = evaluate(&inst, date(2025, 1, 16), &config);
        assert_eq!(result.days_overdue, 1);
        assert_eq!(result.priority, Priority::Critical);
    }

    #[test]
    fn paid_principal_stops_accrual() {
        let config = DelinquencyConfig::documented_default();
        let mut inst = installment(dec!(100000), date(2025, 1, 10));
        inst.paid_amount = inst.total_amount;
        inst.penalty_amount = dec!(300);
        inst.state = InstallmentState::PartiallyPaid;
        let result = evaluate(&inst, date(2025, 2, 20), &config);
        assert!(!result.is_delinquent);
        assert_eq!(result.overdue_amount, dec!(300));
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
