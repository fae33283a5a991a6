//! Crate-wide error taxonomy.
//!
//! A top-level enum with one variant per error kind, plus small per-subsystem error
//! enums that `From`-convert into it at module boundaries.

use thiserror::Error;

/// Result alias used throughout the crate, mirroring `CallCenterResult`.
pub type Result<T> = std::result::Result<T, PhoneAgentError>;

/// The crate-wide error kinds. Each corresponds to a
/// distinct propagation policy enforced by callers, not by this enum itself.
#[derive(Debug, Error)]
pub enum PhoneAgentError {
    /// Caller supplied malformed or out-of-range data. Rejected at the
    /// command boundary; never propagates further.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity doesn't exist in the current tenant scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// State-machine violation (e.g. cancel a completed call).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required consent is missing or withdrawn.
    #[error("consent denied for subject {subject_id}, purpose {purpose}")]
    ConsentDenied { subject_id: String, purpose: String },

    /// Network, 5xx, rate-limit. Retried with exponential-style backoff.
    #[error("transient external error: {0}")]
    TransientExternal(String),

    /// 4xx excluding rate limits, auth failures, permanently invalid contact.
    #[error("permanent external error: {0}")]
    PermanentExternal(String),

    /// Operator or system requested stop. Never retried.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Audit checksum mismatch. Never "fixed" automatically.
    #[error("audit chain corruption: {0}")]
    Corruption(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Database-layer errors, kept distinct from domain errors so repository code
/// can use `?` against sqlx without dragging tenant-scoping concerns into it.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(_) => DatabaseError::Query(err.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DatabaseError::Connection(err.to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for PhoneAgentError {
    fn from(err: sqlx::Error) -> Self {
        PhoneAgentError::Database(DatabaseError::from(err))
    }
}

/// Errors surfaced by external collaborators, translated by the core
/// into workflow-level outcomes rather than propagated raw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("slot unavailable")]
    SlotUnavailable,
    #[error("event not found")]
    EventNotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("auth failed")]
    AuthFailed,
    #[error("timeout")]
    Timeout,
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Dialer-specific failures.
#[derive(Debug, Error)]
pub enum DialerError {
    #[error("call not found: {0}")]
    CallNotFound(String),
    #[error("call already in flight")]
    AlreadyInFlight,
    #[error("originate failed: {0}")]
    OriginateFailed(String),
}

/// Routing-specific failures.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task already assigned")]
    AlreadyAssigned,
}

/// Delivery-tracking failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message not found for provider id: {0}")]
    UnknownProviderMessageId(String),
    #[error("invalid webhook payload: {0}")]
    InvalidWebhook(String),
}

/// Audit-log failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("checksum mismatch at entry {0}")]
    ChecksumMismatch(String),
    #[error("broken chain link at entry {0}")]
    BrokenChain(String),
}
