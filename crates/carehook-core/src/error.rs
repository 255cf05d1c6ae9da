use thiserror::Error;

/// Error taxonomy shared by every carehook component.
///
/// Validation errors surface synchronously to producers and administrators.
/// Delivery errors never reach producers; they only show up in the ledger.
#[derive(Debug, Error)]
pub enum HookError {
    /// Malformed event or subscription. Rejected at intake, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network failure, timeout, HTTP 429 or 5xx. Retried per backoff policy.
    #[error("Transient delivery error: {reason}")]
    TransientDelivery {
        status: Option<u16>,
        reason: String,
    },

    /// HTTP 4xx other than 429, or the retry budget ran out.
    #[error("Terminal delivery error: {reason}")]
    TerminalDelivery {
        status: Option<u16>,
        reason: String,
    },

    /// Durability layer unreachable. Intake must fail loudly.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Not found: {kind}/{id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HookError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn transient(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::TransientDelivery {
            status,
            reason: reason.into(),
        }
    }

    pub fn terminal(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::TerminalDelivery {
            status,
            reason: reason.into(),
        }
    }

    /// Ledger reason of a delivery error; `None` for every other kind.
    pub fn delivery_reason(&self) -> Option<&str> {
        match self {
            Self::TransientDelivery { reason, .. } | Self::TerminalDelivery { reason, .. } => {
                Some(reason)
            }
            _ => None,
        }
    }

    /// Whether the error should be retried under the subscription's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDelivery { .. })
    }

    /// Short machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientDelivery { .. } => "transient-delivery",
            Self::TerminalDelivery { .. } => "terminal-delivery",
            Self::QueueUnavailable(_) => "queue-unavailable",
            Self::NotFound { .. } => "not-found",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for HookError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("payload is not serializable: {e}"))
    }
}

impl From<url::ParseError> for HookError {
    fn from(e: url::ParseError) -> Self {
        Self::Validation(format!("invalid target_url: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, HookError>;
