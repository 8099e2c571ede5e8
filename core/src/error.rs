use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectionsError {
    #[error("No active delinquency configuration")]
    ConfigurationMissing,

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Condonation {requested} exceeds the allowed maximum {max_allowed}")]
    InvalidCondonation {
        requested: Decimal,
        max_allowed: Decimal,
    },

    #[error("Upfront payment {offered} is below the required minimum {required}")]
    InsufficientUpfront { offered: Decimal, required: Decimal },

    #[error("{entity} '{id}' was modified concurrently (expected version {expected_version})")]
    ConcurrentModification {
        entity: &'static str,
        id: String,
        expected_version: i64,
    },

    #[error("Numbering gap in {owner}: expected #{expected}, found #{found}")]
    SequenceGap {
        owner: String,
        expected: u32,
        found: u32,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Invalid payment: {reason}")]
    InvalidPayment { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollectionsError {
    /// Optimistic-lock conflicts are the only errors a caller should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectionsError::ConcurrentModification { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CollectionsError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        CollectionsError::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

pub type CollectionsResult<T> = Result<T, CollectionsError>;
