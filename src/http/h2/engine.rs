//! Protocol engine interface
//!
//! The multiplexer drives HTTP/2 through [`ProtocolEngine`]: raw bytes go in
//! through `receive`, serialized frames come out of `prepare_send`. While
//! doing either, the engine reports what happened by calling back into a
//! [`FrameEvents`] implementation handed to it for the duration of the call.
//!
//! Callbacks run inside the engine's call stack. They must not block, must
//! not fail and must not call back into the engine; work that has to wait is
//! recorded and carried out once the engine call has returned.

use super::error::{Error, ErrorCode, Result};
use super::frames::{FrameFlags, FrameType};
use bytes::Bytes;
use std::fmt;

/// One header field, lowercase name first
pub type HeaderField = (String, String);

/// Which side of the connection an engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// What a header block received on a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersCategory {
    /// Request headers opening a stream (server role)
    Request,
    /// Response headers (client role)
    Response,
    /// Request headers of a promised stream (client role)
    PushPromise,
    /// Trailing header block
    Trailers,
}

/// Summary of a frame received or sent, for callbacks and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
    /// Payload length
    pub length: usize,
    /// PUSH_PROMISE only
    pub promised_stream_id: Option<u32>,
    /// RST_STREAM and GOAWAY only
    pub error_code: Option<ErrorCode>,
}

impl FrameInfo {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> Self {
        FrameInfo {
            frame_type,
            flags,
            stream_id,
            length,
            promised_stream_id: None,
            error_code: None,
        }
    }

    /// END_STREAM on a DATA or HEADERS frame
    pub fn is_end_stream(&self) -> bool {
        matches!(self.frame_type, FrameType::Data | FrameType::Headers) && self.flags.is_end_stream()
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} len={} flags=0x{:02x}",
            self.frame_type.name(),
            self.stream_id,
            self.length,
            self.flags.as_u8()
        )?;
        if let Some(promised) = self.promised_stream_id {
            write!(f, " promised={}", promised)?;
        }
        if let Some(code) = self.error_code {
            write!(f, " error={}", code.name())?;
        }
        Ok(())
    }
}

/// Callbacks fired synchronously by a [`ProtocolEngine`]
pub trait FrameEvents {
    /// A header block starts on `stream_id`
    fn on_begin_headers(&mut self, stream_id: u32, category: HeadersCategory);

    /// One decoded header field of the current block
    fn on_header(&mut self, stream_id: u32, name: &str, value: &str);

    /// A chunk of DATA payload, padding removed
    fn on_data_chunk_recv(&mut self, stream_id: u32, data: &[u8]);

    /// A complete frame was received and processed
    fn on_frame_recv(&mut self, frame: &FrameInfo);

    /// The stream is closed; `code` is NO_ERROR for an orderly close
    fn on_stream_close(&mut self, stream_id: u32, code: ErrorCode);

    /// A frame was serialized into the outbound buffer
    fn on_frame_send(&mut self, _frame: &FrameInfo) {}

    /// A queued frame was dropped instead of being sent
    fn on_frame_not_send(&mut self, _frame: &FrameInfo, _reason: &Error) {}
}

/// A synchronous, callback-driven HTTP/2 implementation
pub trait ProtocolEngine {
    /// Feed received bytes; returns how many were consumed
    ///
    /// An `Err` is connection-fatal. The engine has queued a GOAWAY that the
    /// next `prepare_send` returns.
    fn receive(&mut self, data: &[u8], events: &mut dyn FrameEvents) -> Result<usize>;

    /// Serialize everything that can be sent now, or `None` if nothing can
    fn prepare_send(&mut self, events: &mut dyn FrameEvents) -> Option<Bytes>;

    /// Queue response headers and body for a peer-initiated or promised stream
    fn submit_response(&mut self, stream_id: u32, headers: Vec<HeaderField>, body: Bytes) -> Result<()>;

    /// Reserve a pushed stream associated with `stream_id`; returns its id
    fn submit_push_promise(&mut self, stream_id: u32, headers: Vec<HeaderField>) -> Result<u32>;

    /// Open a new stream carrying a request (client role); returns its id
    fn submit_request(&mut self, headers: Vec<HeaderField>, body: Bytes) -> Result<u32>;

    /// Let a stream whose output was deferred produce frames again
    fn resume_data(&mut self, stream_id: u32) -> Result<()>;

    /// Queue RST_STREAM and forget the stream
    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) -> Result<()>;

    /// Queue GOAWAY; the session accepts no further input
    fn terminate_session(&mut self, code: ErrorCode);

    fn want_read(&self) -> bool;

    fn want_write(&self) -> bool;
}
