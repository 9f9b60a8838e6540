//! Error types for botlink
//!
//! Specific error enums per collaborator (transport connect/send, credential store,
//! handler execution, state machine) and the umbrella `BotlinkError` that unifies them.
//! Only a handful of conditions are allowed to end the process; see
//! [`BotlinkError::is_fatal`].

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// The Transport could not establish a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Network unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("Connect timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Session credential revoked: {reason}")]
    CredentialRevoked { reason: String },
    #[error("Connection rejected: {reason}")]
    Rejected { reason: String },
}

/// Reply delivery failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("No live connection")]
    NotConnected,
    #[error("Recipient {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },
    #[error("Send I/O failure: {reason}")]
    Io { reason: String },
}

/// The durable backing store failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Credential store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Stored credential is unreadable: {reason}")]
    Corrupt { reason: String },
}

/// Application handler failed while processing one event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerFailure {
    #[error("Handler returned error: {0}")]
    Error(String),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Invalid state machine input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event}")]
    InvalidTransition { from_state: String, event: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Umbrella error for the botlink runtime
#[derive(Debug, Error)]
pub enum BotlinkError {
    #[error("Credential store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Credential revoked: {reason}")]
    CredentialRevoked { reason: String },

    #[error("Handler failure: {0}")]
    Handler(#[from] HandlerFailure),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("State machine error: {0}")]
    State(#[from] StateTransitionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Runtime task failed: {reason}")]
    Task { reason: String },
}

impl From<StoreError> for BotlinkError {
    fn from(err: StoreError) -> Self {
        BotlinkError::StoreUnavailable {
            reason: err.to_string(),
        }
    }
}

impl BotlinkError {
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        BotlinkError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        BotlinkError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn task(reason: impl Into<String>) -> Self {
        BotlinkError::Task {
            reason: reason.into(),
        }
    }

    /// Whether this condition may terminate the process
    ///
    /// Store failures are only fatal when raised from startup; the runtime retries them
    /// under backoff once a credential is held in memory, so they never reach the caller
    /// mid-run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BotlinkError::StoreUnavailable { .. }
                | BotlinkError::Configuration { .. }
                | BotlinkError::Task { .. }
        )
    }

    /// Short classification label for log fields
    pub fn class(&self) -> &'static str {
        match self {
            BotlinkError::StoreUnavailable { .. } => "store_unavailable",
            BotlinkError::Connect(ConnectError::CredentialRevoked { .. })
            | BotlinkError::CredentialRevoked { .. } => "credential_revoked",
            BotlinkError::Connect(_) => "connect_error",
            BotlinkError::Handler(_) => "handler_failure",
            BotlinkError::Send(_) => "send_error",
            BotlinkError::State(_) => "state_error",
            BotlinkError::Configuration { .. } => "configuration",
            BotlinkError::Task { .. } => "task_failed",
        }
    }
}

/// Result type for botlink operations
pub type BotlinkResult<T> = Result<T, BotlinkError>;
