use std::time::Duration;

use thiserror::Error;

use crate::ipc::envelope::{ContextId, ErrorPayload};

/// Stable wire codes. UI code matches on these strings, so they never change.
pub mod codes {
    pub const UNKNOWN_CHANNEL: &str = "UNKNOWN_CHANNEL";
    pub const SHAPE_MISMATCH: &str = "SHAPE_MISMATCH";
    pub const DUPLICATE_CHANNEL: &str = "DUPLICATE_CHANNEL";
    pub const DUPLICATE_HANDLER: &str = "DUPLICATE_HANDLER";
    pub const HANDLER_FAILURE: &str = "HANDLER_FAILURE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNKNOWN_CONTEXT: &str = "UNKNOWN_CONTEXT";
    pub const CANCELLED: &str = "CANCELLED";
    pub const INVALID_CHANNEL_NAME: &str = "INVALID_CHANNEL_NAME";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const TRANSPORT: &str = "TRANSPORT";
    pub const JSON: &str = "JSON";
    pub const IO: &str = "IO";
}

/// All errors produced by tether-core.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("unknown channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("payload for {channel} does not match its declared shape: {detail}")]
    ShapeMismatch { channel: String, detail: String },

    #[error("channel already registered: {channel}")]
    DuplicateChannel { channel: String },

    #[error("handler already registered for channel: {channel}")]
    DuplicateHandler { channel: String },

    #[error("handler failed [{code}]: {message}")]
    HandlerFailure { code: String, message: String },

    #[error("no response on {channel} within {after:?}")]
    Timeout { channel: String, after: Duration },

    #[error("unknown or closed UI context: {0}")]
    UnknownContext(ContextId),

    #[error("call cancelled: {0}")]
    Cancelled(String),

    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport closed: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Stable code carried across the process boundary.
    pub fn code(&self) -> &str {
        match self {
            TetherError::UnknownChannel { .. } => codes::UNKNOWN_CHANNEL,
            TetherError::ShapeMismatch { .. } => codes::SHAPE_MISMATCH,
            TetherError::DuplicateChannel { .. } => codes::DUPLICATE_CHANNEL,
            TetherError::DuplicateHandler { .. } => codes::DUPLICATE_HANDLER,
            TetherError::HandlerFailure { code, .. } => code.as_str(),
            TetherError::Timeout { .. } => codes::TIMEOUT,
            TetherError::UnknownContext(_) => codes::UNKNOWN_CONTEXT,
            TetherError::Cancelled(_) => codes::CANCELLED,
            TetherError::InvalidChannelName(_) => codes::INVALID_CHANNEL_NAME,
            TetherError::InvalidConfig(_) => codes::INVALID_CONFIG,
            TetherError::Transport(_) => codes::TRANSPORT,
            TetherError::Json(_) => codes::JSON,
            TetherError::Io(_) => codes::IO,
        }
    }

    /// Convert into the cloneable `{code, message}` pair sent in a failure envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            // Variants rebuilt by `from_payload` carry their inner text only.
            TetherError::HandlerFailure { message, .. } => message.clone(),
            TetherError::ShapeMismatch { detail, .. } => detail.clone(),
            TetherError::Cancelled(reason) => reason.clone(),
            other => other.to_string(),
        };
        ErrorPayload {
            code: self.code().to_string(),
            message,
        }
    }

    /// Rebuild an error from a failure envelope received on `channel`.
    ///
    /// Codes that do not name a taxonomy variant are handler-defined and map
    /// to `HandlerFailure`.
    pub fn from_payload(channel: &str, payload: ErrorPayload) -> Self {
        let ErrorPayload { code, message } = payload;
        match code.as_str() {
            codes::UNKNOWN_CHANNEL => TetherError::UnknownChannel {
                channel: channel.to_string(),
            },
            codes::SHAPE_MISMATCH => TetherError::ShapeMismatch {
                channel: channel.to_string(),
                detail: message,
            },
            codes::CANCELLED => TetherError::Cancelled(message),
            _ => TetherError::HandlerFailure { code, message },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TetherError::Timeout { .. })
    }
}

/// Failure returned by a request handler.
///
/// Only the code and message cross the boundary; the source error
/// stays in the controller process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(codes::HANDLER_FAILURE, format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(codes::HANDLER_FAILURE, err.to_string())
    }
}

impl From<HandlerError> for TetherError {
    fn from(err: HandlerError) -> Self {
        TetherError::HandlerFailure {
            code: err.code,
            message: err.message,
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip_preserves_taxonomy_variants() {
        let err = TetherError::ShapeMismatch {
            channel: "add".into(),
            detail: "$.a: expected number, found string".into(),
        };
        let payload = err.to_payload();
        assert_eq!(payload.code, codes::SHAPE_MISMATCH);

        match TetherError::from_payload("add", payload) {
            TetherError::ShapeMismatch { channel, detail } => {
                assert_eq!(channel, "add");
                assert!(detail.contains("expected number"));
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn handler_defined_codes_become_handler_failure() {
        let payload = ErrorPayload {
            code: "NOT_FOUND".into(),
            message: "no such user".into(),
        };
        match TetherError::from_payload("api-request", payload) {
            TetherError::HandlerFailure { code, message } => {
                assert_eq!(code, "NOT_FOUND");
                assert_eq!(message, "no such user");
            }
            other => panic!("expected HandlerFailure, got {other:?}"),
        }
    }

    #[test]
    fn handler_failure_payload_keeps_raw_message() {
        let err: TetherError = HandlerError::new("BOOM", "operation failed").into();
        let payload = err.to_payload();
        assert_eq!(payload.code, "BOOM");
        assert_eq!(payload.message, "operation failed");
    }

    #[test]
    fn anyhow_errors_map_to_generic_handler_code() {
        let err = HandlerError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.code, codes::HANDLER_FAILURE);
        assert_eq!(err.message, "disk full");
    }
}
