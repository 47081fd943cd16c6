//! Error types for token secret reconciliation.

use thiserror::Error;

/// Failure talking to the cluster's resource store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Create was rejected because an object with that name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Replace was rejected because the resourceVersion no longer matches.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Errors returned to callers of
/// [`TokenReconciler::ensure_secret_for_service_account`](crate::reconciler::TokenReconciler::ensure_secret_for_service_account).
///
/// Cleanup and lease release failures never show up here; they are logged.
#[derive(Debug, Error)]
pub enum EnsureError {
    /// The service account is missing a field needed to reconcile it.
    #[error("could not ensure secret for invalid service account: {0}")]
    InvalidInput(String),

    /// Another holder kept the lease for the whole retry budget.
    #[error("error acquiring the lease {lease} after {attempts} attempts")]
    LockContention { lease: String, attempts: u32 },

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    /// The secret exists but the token controller never filled in the token.
    #[error("timed out waiting for secret {secret} to be populated after {attempts} polls")]
    PopulationTimeout { secret: String, attempts: u32 },

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl EnsureError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EnsureError::InvalidInput(_) => "invalid_input",
            EnsureError::LockContention { .. } => "lock_contention",
            EnsureError::Store { .. } => "store_error",
            EnsureError::PopulationTimeout { .. } => "population_timeout",
            EnsureError::Cancelled => "cancelled",
        }
    }
}
