// Façade error type.
//
// Lower layers carry their own thiserror enums; nothing crosses the public
// boundary except this structured value. `retryable` tells the caller
// whether trying again can ever help; `message` is safe to show a user.

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::message::ProtocolError;
use crate::reactions::ReactionError;
use crate::relay::{DirectoryError, FailoverError};
use crate::store::{QueueError, StoreError};
use crate::sync::SyncError;
use crate::transport::TransportError;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotReady,
    Transport,
    Protocol,
    Crypto,
    Store,
    Consistency,
    Capacity,
    Sync,
}

#[derive(Debug, Error)]
#[error("[{category:?}/{code}] {message}")]
pub struct CoreError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub retryable: bool,
    /// User-presentable description
    pub message: String,
    /// Internal detail for logs, never shown to users
    pub context: Option<String>,
}

impl CoreError {
    fn new(
        category: ErrorCategory,
        code: &'static str,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            retryable,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, false, message)
    }

    pub fn not_ready() -> Self {
        Self::new(
            ErrorCategory::NotReady,
            "NOT_READY",
            false,
            "Messaging core is not ready",
        )
    }

    pub fn offline() -> Self {
        Self::new(
            ErrorCategory::Transport,
            "OFFLINE",
            true,
            "No relay connection available",
        )
    }

    pub fn circuit_open() -> Self {
        Self::new(
            ErrorCategory::Capacity,
            "CIRCUIT_OPEN",
            true,
            "Sending is paused after repeated relay failures",
        )
    }

    pub fn sync_in_progress(session_id: &str) -> Self {
        Self::new(
            ErrorCategory::Sync,
            "SYNC_IN_PROGRESS",
            true,
            "Sync already running for this session",
        )
        .with_context(session_id.to_string())
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        Self::new(ErrorCategory::Validation, "CONFIG_INVALID", false, e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::Unavailable(_) | StoreError::Conflict(_) => {
                Self::new(ErrorCategory::Store, "STORE_UNAVAILABLE", true, "Storage is temporarily unavailable")
                    .with_context(e.to_string())
            }
            StoreError::Corruption(_) => {
                Self::new(ErrorCategory::Store, "STORE_CORRUPTION", false, "Storage is corrupted")
                    .with_context(e.to_string())
            }
            StoreError::IllegalTransition { .. } => {
                Self::new(ErrorCategory::Validation, "ILLEGAL_TRANSITION", false, e.to_string())
            }
            StoreError::ClockInversion { .. } => {
                Self::new(ErrorCategory::Consistency, "CLOCK_INVERSION", false, e.to_string())
            }
            StoreError::BlobTooLarge(_) => {
                Self::new(ErrorCategory::Validation, "BLOB_TOO_LARGE", false, e.to_string())
            }
            StoreError::NotFound(_) | StoreError::Serialization(_) => {
                Self::new(ErrorCategory::Store, "STORE_ERROR", false, e.to_string())
            }
        }
    }
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full(n) => Self::new(
                ErrorCategory::Capacity,
                "QUEUE_FULL",
                true,
                format!("Outbound queue is full ({} messages waiting)", n),
            ),
            QueueError::Store(inner) => inner.into(),
        }
    }
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        let code = match &e {
            CryptoError::Encrypt(_) => "ENCRYPT_FAILED",
            CryptoError::Decrypt(_) => "DECRYPT_FAILED",
            CryptoError::UnknownSession(_) => "NO_SESSION_KEY",
        };
        Self::new(ErrorCategory::Crypto, code, false, "Encryption error").with_context(e.to_string())
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        Self::new(ErrorCategory::Transport, "TRANSPORT", true, "Relay connection trouble")
            .with_context(e.to_string())
    }
}

impl From<ProtocolError> for CoreError {
    fn from(e: ProtocolError) -> Self {
        Self::new(ErrorCategory::Protocol, "PROTOCOL", false, "Wire protocol error")
            .with_context(e.to_string())
    }
}

impl From<DirectoryError> for CoreError {
    fn from(e: DirectoryError) -> Self {
        Self::new(
            ErrorCategory::Transport,
            "NO_HEALTHY_RELAYS",
            true,
            "No healthy relay available",
        )
        .with_context(e.to_string())
    }
}

impl From<FailoverError> for CoreError {
    fn from(e: FailoverError) -> Self {
        let retryable = !matches!(e, FailoverError::Store(StoreError::Corruption(_)));
        Self::new(ErrorCategory::Transport, "FAILOVER", retryable, "Relay failover failed")
            .with_context(e.to_string())
    }
}

impl From<ReactionError> for CoreError {
    fn from(e: ReactionError) -> Self {
        match e {
            ReactionError::Store(inner) => inner.into(),
            other => Self::new(ErrorCategory::Validation, "INVALID_REACTION", false, other.to_string()),
        }
    }
}

impl From<SyncError> for CoreError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::InProgress(session) => Self::sync_in_progress(&session),
            SyncError::UnknownSession(s) => {
                Self::validation("UNKNOWN_SESSION", format!("Unknown session: {}", s))
            }
            SyncError::Store(inner) => inner.into(),
        }
    }
}
