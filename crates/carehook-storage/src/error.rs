//! Storage error types for the carehook storage abstraction layer.

use carehook_core::HookError;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("Not found: {kind}/{id}")]
    NotFound {
        /// The kind of record that was not found.
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Attempted to insert a record that already exists.
    #[error("Already exists: {kind}/{id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// The claim being acknowledged is no longer held by the caller.
    #[error("Lease lost for delivery task {task_id}")]
    LeaseLost { task_id: String },

    /// A second success for the same event and subscription.
    #[error("Success already recorded for event {event_id} and subscription {subscription_id}")]
    DuplicateSuccess {
        event_id: String,
        subscription_id: String,
    },

    /// The requested state transition is not allowed.
    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    /// Stored data could not be decoded.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Failed to reach the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn lease_lost(task_id: impl ToString) -> Self {
        Self::LeaseLost {
            task_id: task_id.to_string(),
        }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the backend itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ConnectionError { .. })
    }
}

impl From<StorageError> for HookError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ConnectionError { message } => HookError::QueueUnavailable(message),
            StorageError::NotFound { kind, id } => HookError::NotFound { kind, id },
            StorageError::AlreadyExists { .. } => HookError::Validation(e.to_string()),
            other => HookError::Internal(other.to_string()),
        }
    }
}
