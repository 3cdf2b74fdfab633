//! Error types for Tally.
//!
//! One error enum covers the server, the client and the wire protocol, and
//! maps onto JSON-RPC error codes in both directions. Invalid params, unknown
//! methods, aborted streams and counter overflow arrive at the client as the
//! same variant; any other server-side failure arrives as `Remote`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Tally library.
#[derive(Debug, Error)]
pub enum TallyError {
    // Server bootstrap errors
    #[error("Failed to bind {host} on any candidate port {attempted:?}")]
    BindExhausted { host: String, attempted: Vec<u16> },

    // Client connection errors
    #[error("Failed to dial {address}: {message}")]
    DialFailed { address: String, message: String },

    #[error("Dial to {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("Connection to {address} lost: {message}")]
    ConnectionLost { address: String, message: String },

    #[error("Call to {address} timed out after {timeout:?}")]
    CallTimeout { address: String, timeout: Duration },

    #[error("Connection to {address} is not ready ({state})")]
    NotReady { address: String, state: String },

    // Counter errors
    #[error("Counter overflow: {current} + {amount} does not fit in 64 bits")]
    CounterOverflow { current: i64, amount: i64 },

    #[error("Amount {input} does not fit the {width}-bit protocol amount")]
    AmountOutOfRange { input: String, width: u32 },

    // Streaming errors
    #[error("Stream aborted: {message}")]
    StreamAborted { message: String },

    // Protocol errors
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error reported by a remote peer that has no local counterpart.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // IO and serialization errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Application-defined JSON-RPC error codes (-32000 to -32099).
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const COUNTER_OVERFLOW: i32 = -32010;
    pub const STREAM_ABORTED: i32 = -32011;
}

impl TallyError {
    /// Convert to a JSON-RPC error code.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TallyError::InvalidParams { .. } | TallyError::AmountOutOfRange { .. } => {
                codes::INVALID_PARAMS
            }
            TallyError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            TallyError::Json { .. } | TallyError::FrameTooLarge { .. } => codes::PARSE_ERROR,
            TallyError::Protocol { .. } => codes::INVALID_REQUEST,
            TallyError::CounterOverflow { .. } => codes::COUNTER_OVERFLOW,
            TallyError::StreamAborted { .. } => codes::STREAM_ABORTED,
            TallyError::Remote { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Structured detail sent in the `data` field of a JSON-RPC error.
    pub fn to_rpc_error_data(&self) -> Option<serde_json::Value> {
        match self {
            TallyError::CounterOverflow { current, amount } => Some(serde_json::json!({
                "current": current,
                "amount": amount,
            })),
            _ => None,
        }
    }

    /// Rebuild an error from a JSON-RPC error object received off the wire.
    pub fn from_rpc_error(code: i32, message: String, data: Option<serde_json::Value>) -> Self {
        match code {
            codes::INVALID_PARAMS => TallyError::InvalidParams { message },
            codes::METHOD_NOT_FOUND => TallyError::MethodNotFound { method: message },
            codes::STREAM_ABORTED => TallyError::StreamAborted { message },
            codes::COUNTER_OVERFLOW => {
                let field = |name: &str| {
                    data.as_ref()
                        .and_then(|d| d.get(name))
                        .and_then(serde_json::Value::as_i64)
                };
                match (field("current"), field("amount")) {
                    (Some(current), Some(amount)) => {
                        TallyError::CounterOverflow { current, amount }
                    }
                    _ => TallyError::Remote { code, message },
                }
            }
            _ => TallyError::Remote { code, message },
        }
    }

    /// Whether the error means the connection itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TallyError::DialFailed { .. }
                | TallyError::DialTimeout { .. }
                | TallyError::ConnectionLost { .. }
                | TallyError::CallTimeout { .. }
                | TallyError::NotReady { .. }
        )
    }
}
