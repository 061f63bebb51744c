//! Error types for the metering controller
//!
//! Errors fall into four groups: missing objects, version conflicts,
//! invariant violations and transient store failures. Reconcilers decide
//! per call site which of them are fatal for a pass.

use crate::store::ObjectKey;
use thiserror::Error;

/// Result type alias using MeteringError
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Unified error type for metering operations
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The version token supplied with an update was stale
    #[error("conflict updating {kind} {key}: {reason}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        reason: String,
    },

    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Object store unavailable or failing
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// Conditions that must never hold for a billing period.
///
/// These are not retried blindly: the pass fails and the next invocation
/// starts from scratch.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("metering {metering} computed negative cost {amount}")]
    NegativeCost { metering: String, amount: i64 },

    #[error("ledger deduction {name} already exists with different content")]
    DuplicateLedgerEntry { name: String },

    #[error("usage entry {resource} in {record} is negative")]
    NegativeUsage { record: String, resource: String },

    #[error("price for {resource} has a zero unit")]
    ZeroPriceUnit { resource: String },
}

impl MeteringError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeteringError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, MeteringError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MeteringError::Conflict { .. })
    }

    /// Whether a later pass could succeed without anything changing upstream
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeteringError::Conflict { .. } | MeteringError::Store(_)
        )
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            MeteringError::NotFound { .. } => "not_found",
            MeteringError::AlreadyExists { .. } => "already_exists",
            MeteringError::Conflict { .. } => "conflict",
            MeteringError::Invariant(_) => "invariant",
            MeteringError::Store(_) => "store",
            MeteringError::Serialization(_) => "serialization",
            MeteringError::InvalidQuantity(_) => "invalid_quantity",
        }
    }
}

/// Extension for treating a missing object as "nothing to do"
pub trait ResultExt<T> {
    /// Map `NotFound` to `Ok(None)`, keep every other error
    fn ignore_not_found(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
