//! Unified error types for ArkBot.

use thiserror::Error;

/// Result type alias using ArkError.
pub type Result<T> = std::result::Result<T, ArkError>;

#[derive(Error, Debug)]
pub enum ArkError {
    // Delivery errors
    #[error("Transient delivery error: {0}")]
    TransientDelivery(String),

    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Corrupt document '{key}': {reason}")]
    CorruptDocument { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    // Lifecycle errors
    #[error("Transition '{transition}' failed for entity {entity_id}: {reason}")]
    TransitionApply {
        entity_id: String,
        transition: String,
        reason: String,
    },

    // Supervisor errors
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl ArkError {
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn transition(
        entity_id: impl Into<String>,
        transition: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransitionApply {
            entity_id: entity_id.into(),
            transition: transition.into(),
            reason: reason.into(),
        }
    }

    /// Errors that may terminate a supervised loop. Everything else is logged
    /// and the loop moves on to the next item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptDocument { .. })
    }
}

/// Outcome classification for a failed delivery attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying within the same tick (network hiccup, rate limit).
    #[error("transient: {0}")]
    Transient(String),
    /// The recipient cannot be reached by policy (DMs closed, blocked).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

impl From<DeliveryError> for ArkError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Transient(r) => Self::TransientDelivery(r),
            DeliveryError::Permanent(r) => Self::PermanentDelivery(r),
        }
    }
}
