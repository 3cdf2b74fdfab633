//! Shared wire types and framing.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Client-streaming calls send their items as notifications (no `id`) using
//! the stream's method name, then close the stream with a request to
//! `<method>.end`, which receives the single response.

use crate::config::RpcConfig;
use crate::{Result, TallyError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Suffix of the request that closes a client stream.
pub const STREAM_END_SUFFIX: &str = ".end";

/// Name of the request that closes the stream `method`.
pub fn stream_end_method(method: &str) -> String {
    format!("{}{}", method, STREAM_END_SUFFIX)
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    /// Create a request that expects a response.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }

    /// Create a notification, which never receives a response.
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The stream this request closes, if it is a `<method>.end` request.
    pub fn closed_stream(&self) -> Option<&str> {
        if self.is_notification() {
            return None;
        }
        self.method.strip_suffix(STREAM_END_SUFFIX)
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Create an error response from a library error.
    pub fn from_error(id: Option<serde_json::Value>, err: &TallyError) -> Self {
        let mut response = Self::error(id, err.to_rpc_error_code(), err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = err.to_rpc_error_data();
        }
        response
    }

    /// Split into the result value or the error it carries.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(TallyError::from_rpc_error(err.code, err.message, err.data));
        }
        self.result.ok_or_else(|| TallyError::Protocol {
            message: "Response missing result".to_string(),
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection between frames).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(TallyError::FrameTooLarge {
            size: len,
            max: RpcConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(TallyError::FrameTooLarge {
            size: payload.len(),
            max: RpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
