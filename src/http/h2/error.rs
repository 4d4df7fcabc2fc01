//! Errors raised by the HTTP/2 engine and connections
//!
//! Every [`Error`] knows the RFC 7540 error code it is announced with when
//! it resets a stream or tears the connection down.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    /// A request or response failed HTTP-level validation
    #[error("message: {0}")]
    Http(#[from] crate::http::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal failure: {0}")]
    Internal(String),

    /// A window went negative or past 2^31-1
    #[error("flow control: {0}")]
    FlowControl(String),

    /// Frame arrived for, or was submitted on, a closed stream
    #[error("stream {0} is closed")]
    StreamClosed(u32),

    #[error("bad frame size: {0}")]
    FrameSize(String),

    /// HPACK block could not be decoded or encoded
    #[error("header compression: {0}")]
    Compression(String),

    /// Stream terminated by RST_STREAM, sent or received
    #[error("stream {0} reset with {1}")]
    Reset(u32, ErrorCode),

    #[error("stream {0} is not in the table")]
    StreamNotFound(u32),

    /// The concurrent stream ceiling has been reached
    #[error("stream ceiling reached")]
    TooManyStreams,

    #[error("push is disabled on this connection")]
    PushDisabled,

    #[error("settings rejected: {0}")]
    InvalidSettings(String),

    /// Connection already finished or is shutting down
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("peer did not send the connection preface")]
    MissingPreface,

    #[error("malformed header block: {0}")]
    InvalidHeader(String),
}

impl Error {
    /// Code carried by the RST_STREAM or GOAWAY this error produces
    pub fn code(&self) -> ErrorCode {
        use ErrorCode as C;
        match self {
            Error::Protocol(_)
            | Error::MissingPreface
            | Error::InvalidHeader(_)
            | Error::InvalidSettings(_)
            | Error::Http(_) => C::ProtocolError,
            Error::FlowControl(_) => C::FlowControlError,
            Error::StreamClosed(_) => C::StreamClosed,
            Error::FrameSize(_) => C::FrameSizeError,
            Error::TooManyStreams => C::RefusedStream,
            Error::Compression(_) => C::CompressionError,
            Error::Reset(_, code) => *code,
            Error::ConnectionClosed => C::NoError,
            Error::Io(_) | Error::Internal(_) | Error::StreamNotFound(_) | Error::PushDisabled => {
                C::InternalError
            }
        }
    }
}

/// RST_STREAM and GOAWAY error codes (RFC 7540 Section 7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// Registered codes with their wire names, indexed by code value
const REGISTRY: [(ErrorCode, &str); 14] = [
    (ErrorCode::NoError, "NO_ERROR"),
    (ErrorCode::ProtocolError, "PROTOCOL_ERROR"),
    (ErrorCode::InternalError, "INTERNAL_ERROR"),
    (ErrorCode::FlowControlError, "FLOW_CONTROL_ERROR"),
    (ErrorCode::SettingsTimeout, "SETTINGS_TIMEOUT"),
    (ErrorCode::StreamClosed, "STREAM_CLOSED"),
    (ErrorCode::FrameSizeError, "FRAME_SIZE_ERROR"),
    (ErrorCode::RefusedStream, "REFUSED_STREAM"),
    (ErrorCode::Cancel, "CANCEL"),
    (ErrorCode::CompressionError, "COMPRESSION_ERROR"),
    (ErrorCode::ConnectError, "CONNECT_ERROR"),
    (ErrorCode::EnhanceYourCalm, "ENHANCE_YOUR_CALM"),
    (ErrorCode::InadequateSecurity, "INADEQUATE_SECURITY"),
    (ErrorCode::Http11Required, "HTTP_1_1_REQUIRED"),
];

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Registered code for `code`, if any
    pub fn from_u32(code: u32) -> Option<Self> {
        REGISTRY.get(code as usize).map(|(c, _)| *c)
    }

    /// Unregistered codes must be treated as INTERNAL_ERROR
    pub fn from_u32_lossy(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Name as written in RFC 7540, e.g. `REFUSED_STREAM`
    pub fn name(&self) -> &'static str {
        REGISTRY[*self as usize].1
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name(), self.as_u32())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
