//! Request and response payloads carried by the counter protocol.

use crate::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::num::IntErrorKind;

/// Wire method names.
pub mod methods {
    /// Increment with a 32-bit amount.
    pub const INCREMENT: &str = "increment";
    /// Increment with a 64-bit amount.
    pub const INCREMENT_V2: &str = "increment_v2";
    /// Client stream of greetings.
    pub const GREET: &str = "greet";
    pub const PING: &str = "ping";
}

/// Width of the increment amount on the wire.
///
/// The two versions use different method names so a server never widens a
/// 32-bit request into a 64-bit one without the client asking for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// 32-bit signed amounts.
    #[default]
    V1,
    /// 64-bit signed amounts.
    V2,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
            ProtocolVersion::V2 => "v2",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "v1" | "1" => Some(ProtocolVersion::V1),
            "v2" | "2" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// Amount width in bits.
    pub fn width(&self) -> u32 {
        match self {
            ProtocolVersion::V1 => 32,
            ProtocolVersion::V2 => 64,
        }
    }

    /// Method name for an increment under this version.
    pub fn increment_method(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => methods::INCREMENT,
            ProtocolVersion::V2 => methods::INCREMENT_V2,
        }
    }

    /// Version that owns an increment method name.
    pub fn for_method(method: &str) -> Option<Self> {
        match method {
            methods::INCREMENT => Some(ProtocolVersion::V1),
            methods::INCREMENT_V2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// Check that `amount` fits this version's width.
    pub fn check_amount(&self, amount: i64) -> Result<i64> {
        match self {
            ProtocolVersion::V1 if i32::try_from(amount).is_err() => {
                Err(TallyError::AmountOutOfRange {
                    input: amount.to_string(),
                    width: self.width(),
                })
            }
            _ => Ok(amount),
        }
    }

    /// Parse operator input as an amount of this version's width.
    ///
    /// Returns `Ok(None)` when the input is not a number at all, and
    /// `AmountOutOfRange` when it is a number that does not fit.
    pub fn parse_amount(&self, input: &str) -> Result<Option<i64>> {
        match input.parse::<i64>() {
            Ok(amount) => self.check_amount(amount).map(Some),
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                    Err(TallyError::AmountOutOfRange {
                        input: input.to_string(),
                        width: self.width(),
                    })
                }
                _ => Ok(None),
            },
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request to add `amount` to a replica's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRequest {
    pub client_name: String,
    pub amount: i64,
}

impl IncrementRequest {
    pub fn new(client_name: impl Into<String>, amount: i64) -> Self {
        Self {
            client_name: client_name.into(),
            amount,
        }
    }
}

/// Counter value observed right after applying an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementAck {
    pub new_value: i64,
}

/// One message of the greeting stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingMessage {
    pub client_name: String,
    pub message: String,
}

impl GreetingMessage {
    pub fn new(client_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            message: message.into(),
        }
    }
}

/// Single response that closes a greeting stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarewellMessage {
    pub message: String,
}
