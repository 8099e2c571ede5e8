//! Delinquency configuration: one immutable, versioned value object.
//!
//! RULE: The batch loads exactly one snapshot at run start and passes it
//! explicitly through the pipeline. Nothing reads configuration lazily
//! mid-run. Administrators publish a new version; they never edit one.

use crate::error::{CollectionsError, CollectionsResult};
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Penalty policy ─────────────────────────────────────────────────

/// Unit in which penalty rates are expressed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RatePeriod {
    Daily,
    /// Converted to a daily rate as `rate / 30`.
    Monthly,
}

/// Amount the penalty rate is applied to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyBasis {
    Capital,
    Total,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PenaltyCap {
    Uncapped,
    /// Fraction of the penalty basis, e.g. `0.02` = 2% of capital.
    Percentage(Decimal),
    /// Absolute amount per installment.
    Fixed(Decimal),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PenaltyPolicy {
    pub grace_days: u32,
    pub rate_period: RatePeriod,
    /// Flat rate used when `tiered` is false.
    pub base_rate: Decimal,
    pub tiered: bool,
    pub tier1_rate: Decimal,
    pub tier2_rate: Decimal,
    pub tier3_rate: Decimal,
    /// Last day (inclusive) billed at the tier-1 rate.
    pub tier1_max_days: u32,
    /// Last day (inclusive) billed at the tier-2 rate; beyond is tier 3.
    pub tier2_max_days: u32,
    pub basis: PenaltyBasis,
    pub cap: PenaltyCap,
}

impl PenaltyPolicy {
    pub const DAYS_PER_MONTH: u32 = 30;

    /// Convert a configured rate to a per-day rate.
    pub fn daily_rate(&self, rate: Decimal) -> Decimal {
        match self.rate_period {
            RatePeriod::Daily => rate,
            RatePeriod::Monthly => rate / Decimal::from(Self::DAYS_PER_MONTH),
        }
    }

    /// Tier number (1..=3) for a given number of overdue days.
    pub fn tier_for(&self, days_overdue: u32) -> u8 {
        if days_overdue <= self.tier1_max_days {
            1
        } else if days_overdue <= self.tier2_max_days {
            2
        } else {
            3
        }
    }

    /// Per-day rate applicable at `days_overdue`.
    pub fn rate_for(&self, days_overdue: u32) -> Decimal {
        let configured = if !self.tiered {
            self.base_rate
        } else {
            match self.tier_for(days_overdue) {
                1 => self.tier1_rate,
                2 => self.tier2_rate,
                _ => self.tier3_rate,
            }
        };
        self.daily_rate(configured)
    }
}

// ── Priority thresholds ────────────────────────────────────────────

/// A level is reached when EITHER its day or its amount threshold is met.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorityThresholds {
    pub medium_days: u32,
    pub medium_amount: Decimal,
    pub high_days: u32,
    pub high_amount: Decimal,
    pub critical_days: u32,
    pub critical_amount: Decimal,
}

// ── Auto-block ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockPolicy {
    pub enabled: bool,
    pub days_overdue: u32,
    pub overdue_installments: u32,
    pub overdue_amount: Decimal,
    pub auto_unblock: bool,
}

// ── Score penalties ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorePolicy {
    pub points_per_day: Decimal,
    pub points_per_overdue_installment: Decimal,
    pub max_points_deductible: Decimal,
    pub recover_on_payment: bool,
    /// Fraction of the deducted delta restored on full payment.
    pub recovery_percentage: Decimal,
}

// ── Notifications ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    WhatsApp,
    Sms,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::WhatsApp => "whatsapp",
            NotificationChannel::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPolicy {
    pub channel: NotificationChannel,
    pub send_window_start: NaiveTime,
    pub send_window_end: NaiveTime,
    /// Per client, per calendar day.
    pub max_per_day: u32,
    /// Per alert over its whole life.
    pub max_per_installment: u32,
    pub send_on_weekends: bool,
    pub min_reminder_interval_hours: u32,
    /// Dispatch failures tolerated in one run before the run aborts.
    pub max_dispatch_failures: u32,
}

// ── Restructuring ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestructuringPolicy {
    pub max_condonation_percentage: Decimal,
    pub requires_upfront: bool,
    pub min_upfront_percentage: Decimal,
    pub max_installments: u32,
    /// Months between consecutive agreement installments.
    pub interval_months: u32,
    /// Consecutive overdue agreement installments that breach the agreement.
    pub breach_after_consecutive: u32,
}

// ── Job schedule ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSchedule {
    pub enabled: bool,
    pub run_time: NaiveTime,
}

// ── Aggregate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelinquencyConfig {
    pub penalty: PenaltyPolicy,
    pub priority: PriorityThresholds,
    pub block: BlockPolicy,
    pub score: ScorePolicy,
    pub notification: NotificationPolicy,
    pub restructuring: RestructuringPolicy,
    pub job: JobSchedule,
}

/// The configuration captured for one run, with its store version.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: i64,
    pub activated_at: NaiveDateTime,
    pub config: DelinquencyConfig,
}

impl DelinquencyConfig {
    /// Load a configuration file (JSON) and validate it.
    pub fn load(path: &str) -> CollectionsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: DelinquencyConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// The documented default policy: tiers split at 30/60 days, 5 grace days.
    pub fn documented_default() -> Self {
        Self {
            penalty: PenaltyPolicy {
                grace_days: 5,
                rate_period: RatePeriod::Daily,
                base_rate: Decimal::new(1, 3),
                tiered: true,
                tier1_rate: Decimal::new(1, 3),
                tier2_rate: Decimal::new(15, 4),
                tier3_rate: Decimal::new(2, 3),
                tier1_max_days: 30,
                tier2_max_days: 60,
                basis: PenaltyBasis::Capital,
                cap: PenaltyCap::Percentage(Decimal::new(2, 2)),
            },
            priority: PriorityThresholds {
                medium_days: 15,
                medium_amount: Decimal::new(250_000, 0),
                high_days: 30,
                high_amount: Decimal::new(500_000, 0),
                critical_days: 90,
                critical_amount: Decimal::new(1_000_000, 0),
            },
            block: BlockPolicy {
                enabled: true,
                days_overdue: 60,
                overdue_installments: 3,
                overdue_amount: Decimal::new(500_000, 0),
                auto_unblock: true,
            },
            score: ScorePolicy {
                points_per_day: Decimal::new(2, 0),
                points_per_overdue_installment: Decimal::new(10, 0),
                max_points_deductible: Decimal::new(200, 0),
                recover_on_payment: true,
                recovery_percentage: Decimal::new(5, 1),
            },
            notification: NotificationPolicy {
                channel: NotificationChannel::WhatsApp,
                send_window_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
                send_window_end: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
                max_per_day: 2,
                max_per_installment: 5,
                send_on_weekends: false,
                min_reminder_interval_hours: 48,
                max_dispatch_failures: 25,
            },
            restructuring: RestructuringPolicy {
                max_condonation_percentage: Decimal::new(5, 1),
                requires_upfront: true,
                min_upfront_percentage: Decimal::new(1, 1),
                max_installments: 24,
                interval_months: 1,
                breach_after_consecutive: 2,
            },
            job: JobSchedule {
                enabled: true,
                run_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            },
        }
    }

    /// Reject values the pipeline cannot compute with.
    pub fn validate(&self) -> CollectionsResult<()> {
        let p = &self.penalty;
        for (name, rate) in [
            ("base_rate", p.base_rate),
            ("tier1_rate", p.tier1_rate),
            ("tier2_rate", p.tier2_rate),
            ("tier3_rate", p.tier3_rate),
        ] {
            if rate.is_sign_negative() {
                return Err(CollectionsError::invalid_config(format!(
                    "penalty.{name} must not be negative"
                )));
            }
        }
        if p.tier1_max_days >= p.tier2_max_days {
            return Err(CollectionsError::invalid_config(
                "penalty.tier1_max_days must be below tier2_max_days",
            ));
        }
        match p.cap {
            PenaltyCap::Uncapped => {}
            PenaltyCap::Percentage(v) | PenaltyCap::Fixed(v) if v.is_sign_negative() => {
                return Err(CollectionsError::invalid_config(
                    "penalty.cap value must not be negative",
                ));
            }
            _ => {}
        }

        let t = &self.priority;
        if !(t.medium_days <= t.high_days && t.high_days <= t.critical_days) {
            return Err(CollectionsError::invalid_config(
                "priority day thresholds must be ordered medium <= high <= critical",
            ));
        }
        if !(t.medium_amount <= t.high_amount && t.high_amount <= t.critical_amount) {
            return Err(CollectionsError::invalid_config(
                "priority amount thresholds must be ordered medium <= high <= critical",
            ));
        }

        let unit = Decimal::ZERO..=Decimal::ONE;
        for (name, pct) in [
            ("score.recovery_percentage", self.score.recovery_percentage),
            (
                "restructuring.max_condonation_percentage",
                self.restructuring.max_condonation_percentage,
            ),
            (
                "restructuring.min_upfront_percentage",
                self.restructuring.min_upfront_percentage,
            ),
        ] {
            if !unit.contains(&pct) {
                return Err(CollectionsError::invalid_config(format!(
                    "{name} must lie in [0, 1]"
                )));
            }
        }
        if self.score.max_points_deductible.is_sign_negative() {
            return Err(CollectionsError::invalid_config(
                "score.max_points_deductible must not be negative",
            ));
        }

        let n = &self.notification;
        if n.send_window_start > n.send_window_end {
            return Err(CollectionsError::invalid_config(
                "notification send window starts after it ends",
            ));
        }
        if self.restructuring.interval_months == 0 || self.restructuring.max_installments == 0 {
            return Err(CollectionsError::invalid_config(
                "restructuring interval and max_installments must be positive",
            ));
        }
        if self.restructuring.breach_after_consecutive == 0 {
            return Err(CollectionsError::invalid_config(
                "restructuring.breach_after_consecutive must be positive",
            ));
        }
        Ok(())
    }
}
