//! Shared primitive types used across the engine.

use rust_decimal::Decimal;

/// A stable, unique identifier for any persisted entity.
pub type EntityId = String;

/// Identifier of a batch run (one per RunLog row).
pub type RunId = String;

/// Monetary amounts are carried with two decimal places.
pub const MONEY_SCALE: u32 = 2;

/// Round a monetary amount to the ledger's scale, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(
        MONEY_SCALE,
        rust_decimal::RoundingStrategy::MidpointAwayFromZero,
    )
}

/// Generate a prefixed entity id, e.g. `alr-3f2a…`.
pub fn new_id(prefix: &str) -> EntityId {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Split `total` into `count` equal parts rounded to money scale; the last
/// part absorbs the rounding remainder so the parts always sum to `total`.
pub fn split_evenly(total: Decimal, count: u32) -> Vec<Decimal> {
    if count == 0 {
        return Vec::new();
    }
    let share = (total / Decimal::from(count)).round_dp_with_strategy(
        MONEY_SCALE,
        rust_decimal::RoundingStrategy::ToZero,
    );
    let mut parts = vec![share; count as usize];
    let distributed = share * Decimal::from(count - 1);
    if let Some(last) = parts.last_mut() {
        *last = total - distributed;
    }
    parts
}

/// Declare a closed set of states persisted as snake_case text.
///
/// Generates `as_str`, `Display`, `FromStr` and the rusqlite conversions
/// so store code can bind and read the enum directly.
macro_rules! storage_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::CollectionsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "Unknown {} '{}'", stringify!($name), other
                    ).into()),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: crate::error::CollectionsError| {
                        rusqlite::types::FromSqlError::Other(e.to_string().into())
                    })
            }
        }
    };
}
pub(crate) use storage_enum;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn split_puts_remainder_on_last_part() {
        let parts = split_evenly(dec!(100), 3);
        assert_eq!(parts, vec![dec!(33.33), dec!(33.33), dec!(33.34)]);
        assert_eq!(parts.iter().sum::<Decimal>(), dec!(100));
    }

    #[test]
    fn split_of_zero_parts_is_empty() {
        assert!(split_evenly(dec!(10), 0).is_empty());
    }

    #[test]
    fn money_rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(2.004)), dec!(2.00));
    }
}
