//! Wire-visible error kinds and the `ERROR` payload shape.

use htcp_registry::{BindError, HandlerError};
use htcp_value::{EncodingError, Fields, Value};
use htcp_wire::FrameError;

/// The string tag carried on the wire inside an `ERROR` frame's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame, unknown kind, oversize payload, handshake timeout. Terminal.
    Protocol,
    /// No handler registered for the requested code.
    UnknownEndpoint,
    /// Argument binding failure (missing, extra, or mistyped argument).
    BadRequest,
    /// The handler itself failed during execution.
    HandlerError,
    /// A value could not be encoded to or decoded from the wire tag set.
    Encoding,
    /// Subscription terminated by client `CANCEL` or server shutdown.
    Cancelled,
    /// Outbound queue overflow. Terminal.
    Backpressure,
    /// Underlying socket I/O failure. Terminal.
    Transport,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::UnknownEndpoint => "unknown_endpoint",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Transport => "transport",
        }
    }

    /// Whether an error of this kind ends the connection, rather than just
    /// the one request it was raised for.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::Protocol | ErrorKind::Backpressure | ErrorKind::Transport
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A wire-visible error: a `kind` tag plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtcpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HtcpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Encode as the `{ "kind": string, "message": string }` payload of an `ERROR` frame.
    pub fn to_value(&self) -> Value {
        let mut fields = Fields::new();
        fields.insert("kind".into(), Value::String(self.kind.as_str().to_string()));
        fields.insert("message".into(), Value::String(self.message.clone()));
        Value::Map(fields)
    }

    /// Decode an `ERROR` frame's payload back into an [`HtcpError`].
    pub fn from_value(value: Value) -> Result<Self, EncodingError> {
        let Value::Map(mut fields) = value else {
            return Err(EncodingError::TypeMismatch {
                expected: "mapping",
                found: value.type_name(),
            });
        };
        let kind_str = match fields.shift_remove("kind") {
            Some(Value::String(s)) => s,
            _ => return Err(EncodingError::MissingField("kind".into())),
        };
        let message = match fields.shift_remove("message") {
            Some(Value::String(s)) => s,
            _ => return Err(EncodingError::MissingField("message".into())),
        };
        let kind = match kind_str.as_str() {
            "protocol" => ErrorKind::Protocol,
            "unknown_endpoint" => ErrorKind::UnknownEndpoint,
            "bad_request" => ErrorKind::BadRequest,
            "handler_error" => ErrorKind::HandlerError,
            "encoding" => ErrorKind::Encoding,
            "cancelled" => ErrorKind::Cancelled,
            "backpressure" => ErrorKind::Backpressure,
            "transport" => ErrorKind::Transport,
            _ => ErrorKind::Protocol,
        };
        Ok(HtcpError::new(kind, message))
    }
}

impl std::fmt::Display for HtcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HtcpError {}

impl From<FrameError> for HtcpError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge { .. } | FrameError::UnknownKind(_) | FrameError::Truncated => {
                HtcpError::new(ErrorKind::Protocol, e.to_string())
            }
            FrameError::Eof => HtcpError::new(ErrorKind::Transport, e.to_string()),
            FrameError::Io(_) => HtcpError::new(ErrorKind::Transport, e.to_string()),
        }
    }
}

impl From<BindError> for HtcpError {
    fn from(e: BindError) -> Self {
        HtcpError::new(ErrorKind::BadRequest, e.to_string())
    }
}

impl From<HandlerError> for HtcpError {
    fn from(e: HandlerError) -> Self {
        HtcpError::new(ErrorKind::HandlerError, e.to_string())
    }
}

impl From<EncodingError> for HtcpError {
    fn from(e: EncodingError) -> Self {
        HtcpError::new(ErrorKind::Encoding, e.to_string())
    }
}
