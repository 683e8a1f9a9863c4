use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transient network/broker failure. Logged, tick skipped, never
    /// retried synchronously within the same tick.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// A real-money order was attempted while critical checks fail.
    /// Always logged as security-relevant; the order is never submitted.
    #[error("safety gate refused order (failing: {})", .failed.join(", "))]
    SafetyGateRefused { failed: Vec<String> },

    /// Rejected configuration change. The prior configuration is retained.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a failed operation's caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Worth retrying on the next pass (persistent state, local IO).
    Retry,
    /// Drop this unit of work, continue with siblings.
    Skip,
    /// Surface to the operator; retrying cannot help.
    Escalate,
}

impl Error {
    /// Per-error-kind handling policy consulted wherever failures are
    /// logged-and-contained (scheduler tasks, routing legs).
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            Error::AdapterUnavailable(_) | Error::Http(_) | Error::Broker(_) => ErrorPolicy::Skip,
            Error::Database(_) | Error::Io(_) => ErrorPolicy::Retry,
            Error::SafetyGateRefused { .. }
            | Error::NotFound { .. }
            | Error::ConfigurationInvalid(_) => ErrorPolicy::Escalate,
            Error::Json(_) => ErrorPolicy::Skip,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
