//! Application-wide error types.

use giftpool_protocol::{EventStatus, ProtocolError};
use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Event {event_id} is not accepting contributions ({reason})")]
    EventNotAcceptingContributions { event_id: String, reason: String },

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Contribution not found: {0}")]
    ContributionNotFound(String),

    #[error("Unknown payment reference: {0}")]
    UnknownPaymentRef(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: EventStatus, to: EventStatus },

    #[error("Event in status {0} does not accept payment confirmations")]
    ConfirmationRejected(EventStatus),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Concurrent update retries exhausted after {attempts} attempts on event {event_id}")]
    ConcurrencyExhausted { event_id: String, attempts: u32 },

    #[error("Accounting violation: {0}")]
    Accounting(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl PoolError {
    /// Transient failures the caller may retry as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::ConcurrencyExhausted { .. } | PoolError::Gateway(_)
        )
    }
}

impl From<ProtocolError> for PoolError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidStateTransition { from, to } => {
                PoolError::InvalidStateTransition { from, to }
            }
            ProtocolError::InvalidAmount(amount) => PoolError::InvalidAmount(amount),
            ProtocolError::NotAcceptingConfirmations(status) => {
                PoolError::ConfirmationRejected(status)
            }
            ProtocolError::AccountingViolation(msg) => PoolError::Accounting(msg),
            ProtocolError::UnknownTag(tag) => PoolError::Corrupt(format!("unknown tag {tag}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
