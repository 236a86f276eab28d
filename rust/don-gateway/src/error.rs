use thiserror::Error;

use crate::api::ErrorCode;
use crate::config::ConfigurationError;

/// Errors returned synchronously by the gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing fields, bad signature, or an unparsable sender
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported DON id '{got}', this handler serves '{expected}'")]
    UnsupportedDonId { expected: String, got: String },

    /// Admission errors
    #[error("sender not allowlisted: {sender}")]
    NotAllowlisted { sender: String },

    #[error("rate-limited: {sender}")]
    RateLimited { sender: String },

    /// Pending-request table errors
    #[error("duplicate request '{message_id}' from {sender}")]
    DuplicateRequest { sender: String, message_id: String },

    #[error("too many pending requests ({scope} limit of {limit} reached)")]
    TooManyPendingRequests { scope: &'static str, limit: usize },

    /// Fan-out could not reach enough members for a quorum to be possible
    #[error("failed to send to enough nodes ({failed} of {total} sends failed), please retry")]
    InsufficientNodes { failed: usize, total: usize },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("handler lifecycle error: {0}")]
    Lifecycle(String),

    #[error(transparent)]
    Config(#[from] ConfigurationError),
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::TooManyPendingRequests { .. }
                | Self::InsufficientNodes { .. }
        )
    }

    /// Code reported to users when this error is surfaced over the wire.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidMessage(_) => ErrorCode::UserMessageParseError,
            Self::UnsupportedDonId { .. } => ErrorCode::UnsupportedDonIdError,
            Self::UnsupportedMethod(_)
            | Self::NotAllowlisted { .. }
            | Self::RateLimited { .. }
            | Self::DuplicateRequest { .. }
            | Self::TooManyPendingRequests { .. }
            | Self::InsufficientNodes { .. } => ErrorCode::HandlerError,
            Self::Signing(_) | Self::Lifecycle(_) | Self::Config(_) => ErrorCode::FatalError,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "invalid",
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::UnsupportedDonId { .. } => "unsupported_don_id",
            Self::NotAllowlisted { .. } => "not_allowlisted",
            Self::RateLimited { .. } => "rate_limited",
            Self::DuplicateRequest { .. } => "duplicate",
            Self::TooManyPendingRequests { .. } => "backpressure",
            Self::InsufficientNodes { .. } => "insufficient_nodes",
            Self::Signing(_) => "signing",
            Self::Lifecycle(_) => "lifecycle",
            Self::Config(_) => "config",
        }
    }
}
