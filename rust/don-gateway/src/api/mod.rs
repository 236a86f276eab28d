//! Wire-level types shared by the gateway and its collaborators.
//!
//! - [`Message`]: the signed envelope users and nodes exchange
//! - [`Address`]: the 20-byte sender identity recovered from signatures
//! - [`UserCallbackPayload`]: the single terminal value delivered to a caller

pub mod address;
pub mod message;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use address::{Address, ParseAddressError};
pub use message::{Message, MessageBody};

/// Outcome code attached to every value delivered to a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoError,
    UserMessageParseError,
    UnsupportedDonIdError,
    HandlerError,
    RequestTimeoutError,
    NodeResponseEncodingError,
    FatalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "no_error",
            Self::UserMessageParseError => "user_message_parse_error",
            Self::UnsupportedDonIdError => "unsupported_don_id_error",
            Self::HandlerError => "handler_error",
            Self::RequestTimeoutError => "request_timeout_error",
            Self::NodeResponseEncodingError => "node_response_encoding_error",
            Self::FatalError => "fatal_error",
        };
        f.write_str(name)
    }
}

/// The one value a pending request delivers to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCallbackPayload {
    /// Aggregated node response; `None` when the request failed.
    pub msg: Option<Message>,
    pub err_code: ErrorCode,
    pub err_msg: String,
}

impl UserCallbackPayload {
    /// A successful result carrying the agreed node response.
    pub fn success(msg: Message) -> Self {
        Self {
            msg: Some(msg),
            err_code: ErrorCode::NoError,
            err_msg: String::new(),
        }
    }

    /// A failed result.
    pub fn failure(err_code: ErrorCode, err_msg: impl Into<String>) -> Self {
        Self {
            msg: None,
            err_code,
            err_msg: err_msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.err_code == ErrorCode::NoError
    }
}
