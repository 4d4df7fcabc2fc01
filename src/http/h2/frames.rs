//! HTTP/2 frame types
//!
//! The frames of RFC 7540 Section 6. Each typed frame can be parsed out of a
//! raw [`Frame`] once the codec has split it off the byte stream; parsing
//! strips padding and checks the fixed payload lengths.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use bytes::{Buf, Bytes};
use std::fmt;

/// Frame types of RFC 7540 Section 6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// Frame types with their names, indexed by type byte
const FRAME_TYPES: [(FrameType, &str); 10] = [
    (FrameType::Data, "DATA"),
    (FrameType::Headers, "HEADERS"),
    (FrameType::Priority, "PRIORITY"),
    (FrameType::RstStream, "RST_STREAM"),
    (FrameType::Settings, "SETTINGS"),
    (FrameType::PushPromise, "PUSH_PROMISE"),
    (FrameType::Ping, "PING"),
    (FrameType::Goaway, "GOAWAY"),
    (FrameType::WindowUpdate, "WINDOW_UPDATE"),
    (FrameType::Continuation, "CONTINUATION"),
];

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Extension frame types yield `None`
    pub fn from_u8(byte: u8) -> Option<Self> {
        FRAME_TYPES.get(byte as usize).map(|(t, _)| *t)
    }

    pub fn name(&self) -> &'static str {
        FRAME_TYPES[*self as usize].1
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag byte of a frame header; which bits mean what depends on the type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set a flag when `cond` holds
    pub fn set_if(&mut self, flag: u8, cond: bool) {
        if cond {
            self.set(flag);
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub const END_STREAM: u8 = 0x1;
    /// Shares its bit with END_STREAM; only SETTINGS and PING carry it
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A frame as split off the wire, payload still undecoded
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn require_stream(&self) -> Result<()> {
        if self.stream_id == 0 {
            return Err(Error::Protocol(format!(
                "{} frame on stream 0",
                self.frame_type.name()
            )));
        }
        Ok(())
    }

    fn require_connection(&self) -> Result<()> {
        if self.stream_id != 0 {
            return Err(Error::Protocol(format!(
                "{} frame on stream {}",
                self.frame_type.name(),
                self.stream_id
            )));
        }
        Ok(())
    }

    fn require_len(&self, len: usize) -> Result<()> {
        if self.payload.len() != len {
            return Err(Error::FrameSize(format!(
                "{} payload of {} bytes, expected {}",
                self.frame_type.name(),
                self.payload.len(),
                len
            )));
        }
        Ok(())
    }

    /// Payload with the PADDED prefix and trailing padding removed
    fn unpadded(&self) -> Result<Bytes> {
        if !self.flags.is_padded() {
            return Ok(self.payload.clone());
        }
        let Some(&pad_len) = self.payload.first() else {
            return Err(Error::FrameSize("padded frame without pad length".to_string()));
        };
        let pad_len = pad_len as usize;
        if pad_len >= self.payload.len() {
            return Err(Error::Protocol("padding exceeds frame payload".to_string()));
        }
        Ok(self.payload.slice(1..self.payload.len() - pad_len))
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        let data = frame.unpadded()?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            padding: frame.flags.is_padded().then(|| (frame.payload_len() - data.len() - 1) as u8),
            data,
            end_stream: frame.flags.is_end_stream(),
        })
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        let mut block = frame.unpadded()?;
        let priority = if frame.flags.is_priority() {
            if block.len() < 5 {
                return Err(Error::FrameSize("HEADERS priority fields truncated".to_string()));
            }
            Some(PrioritySpec::parse(&mut block))
        } else {
            None
        };
        if let Some(spec) = priority {
            if spec.stream_dependency == frame.stream_id {
                return Err(Error::Protocol(format!(
                    "stream {} depends on itself",
                    frame.stream_id
                )));
            }
        }
        Ok(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: block,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
        })
    }
}

/// Priority specification (RFC 7540 Section 6.3)
///
/// Parsed for validation only; no priority tree is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

impl PrioritySpec {
    fn parse(buf: &mut Bytes) -> Self {
        let dep = buf.get_u32();
        let weight = buf.get_u8();
        PrioritySpec {
            stream_dependency: dep & 0x7FFFFFFF,
            exclusive: dep & 0x80000000 != 0,
            weight,
        }
    }

    /// Validate a standalone PRIORITY frame
    pub fn parse_frame(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        frame.require_len(5)?;
        let mut payload = frame.payload.clone();
        Ok(Self::parse(&mut payload))
    }
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        frame.require_len(4)?;
        let mut payload = frame.payload.clone();
        Ok(RstStreamFrame {
            stream_id: frame.stream_id,
            error_code: ErrorCode::from_u32_lossy(payload.get_u32()),
        })
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Empty acknowledgement of the peer SETTINGS
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        if frame.flags.is_ack() {
            frame.require_len(0)?;
            return Ok(SettingsFrame::ack());
        }
        if frame.payload_len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload of {} bytes",
                frame.payload_len()
            )));
        }
        Ok(SettingsFrame::new(Settings::decode(&frame.payload)?))
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    pub promised_stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl PushPromiseFrame {
    pub fn new(stream_id: u32, promised_stream_id: u32, header_block: Bytes, end_headers: bool) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        let mut block = frame.unpadded()?;
        if block.len() < 4 {
            return Err(Error::FrameSize("PUSH_PROMISE without promised stream".to_string()));
        }
        let promised_stream_id = block.get_u32() & 0x7FFFFFFF;
        Ok(PushPromiseFrame {
            stream_id: frame.stream_id,
            promised_stream_id,
            header_block: block,
            end_headers: frame.flags.is_end_headers(),
        })
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Reply echoing the opaque data of a received PING
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        frame.require_len(8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload);
        Ok(PingFrame {
            ack: frame.flags.is_ack(),
            data,
        })
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        if frame.payload_len() < 8 {
            return Err(Error::FrameSize("GOAWAY payload truncated".to_string()));
        }
        let mut payload = frame.payload.clone();
        let last_stream_id = payload.get_u32() & 0x7FFFFFFF;
        let error_code = ErrorCode::from_u32_lossy(payload.get_u32());
        Ok(GoawayFrame {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// Stream ID (0 for connection-level)
    pub stream_id: u32,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    /// A zero increment is left for the caller to reject, since its scope
    /// (stream or connection) depends on the stream id
    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_len(4)?;
        let mut payload = frame.payload.clone();
        Ok(WindowUpdateFrame {
            stream_id: frame.stream_id,
            size_increment: payload.get_u32() & 0x7FFFFFFF,
        })
    }
}

/// CONTINUATION frame (RFC 7540 Section 6.10)
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        Ok(ContinuationFrame {
            stream_id: frame.stream_id,
            header_block: frame.payload.clone(),
            end_headers: frame.flags.is_end_headers(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Frame {
        Frame::new(
            frame_type,
            FrameFlags::from_u8(flags),
            stream_id,
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Data.as_u8(), 0x0);
        assert_eq!(FrameType::Continuation.as_u8(), 0x9);
        assert_eq!(FrameType::from_u8(0x5), Some(FrameType::PushPromise));
        // extension frames are not known types
        assert_eq!(FrameType::from_u8(0xa), None);
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        assert!(!flags.is_end_stream());

        flags.set(FrameFlags::END_STREAM);
        flags.set_if(FrameFlags::END_HEADERS, true);
        flags.set_if(FrameFlags::PADDED, false);
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
        assert!(!flags.is_padded());
    }

    #[test]
    fn test_parse_padded_data() {
        // pad length 2, "Hi", two bytes of padding
        let f = frame(FrameType::Data, FrameFlags::PADDED | FrameFlags::END_STREAM, 1, &[2, b'H', b'i', 0, 0]);
        let data = DataFrame::parse(&f).unwrap();
        assert_eq!(data.data.as_ref(), b"Hi");
        assert_eq!(data.padding, Some(2));
        assert!(data.end_stream);
    }

    #[test]
    fn test_parse_data_padding_too_long() {
        let f = frame(FrameType::Data, FrameFlags::PADDED, 1, &[4, b'H', b'i']);
        assert!(matches!(DataFrame::parse(&f), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_data_on_stream_zero() {
        let f = frame(FrameType::Data, 0, 0, b"x");
        assert!(DataFrame::parse(&f).is_err());
    }

    #[test]
    fn test_parse_headers_with_priority() {
        let mut payload = vec![0x80, 0, 0, 1, 15];
        payload.extend_from_slice(b"block");
        let f = frame(FrameType::Headers, FrameFlags::PRIORITY | FrameFlags::END_HEADERS, 3, &payload);
        let headers = HeadersFrame::parse(&f).unwrap();
        assert_eq!(headers.header_block.as_ref(), b"block");
        assert_eq!(
            headers.priority,
            Some(PrioritySpec {
                stream_dependency: 1,
                exclusive: true,
                weight: 15
            })
        );
    }

    #[test]
    fn test_parse_headers_self_dependency() {
        let f = frame(FrameType::Headers, FrameFlags::PRIORITY, 3, &[0, 0, 0, 3, 0]);
        assert!(HeadersFrame::parse(&f).is_err());
    }

    #[test]
    fn test_parse_fixed_lengths() {
        assert!(RstStreamFrame::parse(&frame(FrameType::RstStream, 0, 1, &[0, 0, 0])).is_err());
        assert!(PingFrame::parse(&frame(FrameType::Ping, 0, 0, &[0; 7])).is_err());
        assert!(PingFrame::parse(&frame(FrameType::Ping, 0, 1, &[0; 8])).is_err());
        assert!(WindowUpdateFrame::parse(&frame(FrameType::WindowUpdate, 0, 0, &[0; 5])).is_err());
        assert!(SettingsFrame::parse(&frame(FrameType::Settings, FrameFlags::ACK, 0, &[0; 6])).is_err());
    }

    #[test]
    fn test_parse_rst_stream_unknown_code() {
        let f = frame(FrameType::RstStream, 0, 5, &[0, 0, 0, 0x7f]);
        let rst = RstStreamFrame::parse(&f).unwrap();
        assert_eq!(rst.error_code, ErrorCode::InternalError);
    }

    #[test]
    fn test_parse_push_promise() {
        let f = frame(FrameType::PushPromise, FrameFlags::END_HEADERS, 1, &[0, 0, 0, 2, 0x82]);
        let pp = PushPromiseFrame::parse(&f).unwrap();
        assert_eq!(pp.promised_stream_id, 2);
        assert_eq!(pp.header_block.as_ref(), &[0x82]);
        assert!(pp.end_headers);
    }

    #[test]
    fn test_parse_goaway() {
        let f = frame(FrameType::Goaway, 0, 0, &[0, 0, 0, 7, 0, 0, 0, 1, b'b', b'y', b'e']);
        let goaway = GoawayFrame::parse(&f).unwrap();
        assert_eq!(goaway.last_stream_id, 7);
        assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
        assert_eq!(goaway.debug_data.as_ref(), b"bye");
    }
}
