//! HTTP/2 frame encoding and decoding
//!
//! `FrameCodec` splits frames off an inbound byte buffer as bytes arrive, and
//! provides the encoders the session uses to build outbound frames. Header
//! blocks larger than the peer's maximum frame size are split into a HEADERS
//! or PUSH_PROMISE frame followed by CONTINUATION frames.

use super::error::{Error, Result};
use super::frames::*;
use super::{CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Incremental frame reader plus frame encoders
#[derive(Debug)]
pub struct FrameCodec {
    read_buffer: BytesMut,
    /// Largest payload accepted from the peer (our SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = (size as usize).min(MAX_FRAME_SIZE);
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Consume the client connection preface (RFC 7540 Section 3.5)
    ///
    /// Returns `Ok(false)` while more bytes are needed.
    pub fn strip_preface(&mut self) -> Result<bool> {
        let n = self.read_buffer.len().min(CONNECTION_PREFACE.len());
        if self.read_buffer[..n] != CONNECTION_PREFACE[..n] {
            return Err(Error::MissingPreface);
        }
        if n < CONNECTION_PREFACE.len() {
            return Ok(false);
        }
        let _ = self.read_buffer.split_to(n);
        Ok(true)
    }

    /// Split the next complete frame off the buffer
    ///
    /// Frames of unknown type are discarded (RFC 7540 Section 4.1). Returns
    /// `Ok(None)` when no complete frame is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.read_buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
            let (raw_type, flags, stream_id, length) = Self::decode_header(&header);

            if length > self.max_frame_size {
                return Err(Error::FrameSize(format!(
                    "frame payload of {} bytes exceeds {}",
                    length, self.max_frame_size
                )));
            }
            if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
                return Ok(None);
            }

            let _ = self.read_buffer.split_to(FRAME_HEADER_SIZE);
            let payload = self.read_buffer.split_to(length).freeze();
            if let Some(frame_type) = FrameType::from_u8(raw_type) {
                return Ok(Some(Frame::new(frame_type, flags, stream_id, payload)));
            }
        }
    }

    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        header[5..9].copy_from_slice(&(stream_id & 0x7FFFFFFF).to_be_bytes());

        header
    }

    /// Decode a frame header into (raw type, flags, stream id, length)
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let flags = FrameFlags::from_u8(bytes[4]);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        (bytes[3], flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);

        let mut payload_len = frame.data.len();
        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Data, flags, frame.stream_id, payload_len));
        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.data);
        buf.put_bytes(0, padding_len as usize);

        buf.freeze()
    }

    /// Encode a single HEADERS frame; the block must fit the peer's frame size
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);

        let mut payload_len = frame.header_block.len();
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len));
        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x80000000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a single PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);

        let payload_len = 4 + frame.header_block.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::PushPromise, flags, frame.stream_id, payload_len));
        buf.put_u32(frame.promised_stream_id & 0x7FFFFFFF);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        ));
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a response or request header block as HEADERS plus as many
    /// CONTINUATION frames as `max_frame_size` requires
    pub fn encode_headers(
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        max_frame_size: usize,
    ) -> Bytes {
        let mut block = block;
        let first = block.split_to(block.len().min(max_frame_size));
        let frame = HeadersFrame::new(stream_id, first, end_stream, block.is_empty());

        let mut buf = BytesMut::from(&Self::encode_headers_frame(&frame)[..]);
        Self::encode_continuations(&mut buf, stream_id, block, max_frame_size);
        buf.freeze()
    }

    /// Encode a PUSH_PROMISE header block, splitting it like `encode_headers`
    pub fn encode_push_promise(
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        max_frame_size: usize,
    ) -> Bytes {
        let mut block = block;
        // the promised stream id takes 4 bytes of the first payload
        let first = block.split_to(block.len().min(max_frame_size - 4));
        let frame = PushPromiseFrame::new(stream_id, promised_stream_id, first, block.is_empty());

        let mut buf = BytesMut::from(&Self::encode_push_promise_frame(&frame)[..]);
        Self::encode_continuations(&mut buf, stream_id, block, max_frame_size);
        buf.freeze()
    }

    fn encode_continuations(buf: &mut BytesMut, stream_id: u32, mut rest: Bytes, max_frame_size: usize) {
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max_frame_size));
            let frame = ContinuationFrame {
                stream_id,
                header_block: chunk,
                end_headers: rest.is_empty(),
            };
            buf.put_slice(&Self::encode_continuation_frame(&frame));
        }
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut settings_data = BytesMut::new();
        if !frame.ack {
            frame.settings.encode(&mut settings_data);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + settings_data.len());
        buf.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, settings_data.len()));
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len));
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
