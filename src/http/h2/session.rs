//! Bundled HTTP/2 protocol engine
//!
//! `H2Session` implements [`ProtocolEngine`] on top of the frame codec, HPACK
//! (via the `hpack` crate), flow control and the stream state machine. It
//! performs no I/O: bytes are pushed in with `receive` and pulled out with
//! `prepare_send`.
//!
//! Outbound frames are produced in two tiers. Control frames (SETTINGS, ACKs,
//! WINDOW_UPDATE, RST_STREAM, GOAWAY, PUSH_PROMISE) are queued and always
//! written first. Stream output (HEADERS and DATA) follows, round robin over
//! the streams with something to send, limited by the connection and stream
//! send windows. Header blocks are HPACK-encoded when they are written so the
//! encoder's dynamic table changes in wire order.

use super::codec::{FrameCodec, FRAME_HEADER_SIZE};
use super::engine::{FrameEvents, FrameInfo, HeaderField, HeadersCategory, ProtocolEngine, Role};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use super::frames::*;
use super::settings::Settings;
use super::state::{Outbound, StreamManager, StreamSlot, StreamState};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Largest header block accepted, CONTINUATION frames included
pub const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

/// Frames waiting to be written ahead of stream output
enum Control {
    Frame(Bytes, FrameInfo),
    Reset(u32, ErrorCode),
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<HeaderField>,
    },
}

enum BlockKind {
    Headers { end_stream: bool, flags: FrameFlags },
    PushPromise { promised_stream_id: u32 },
}

/// Header block being reassembled from HEADERS/PUSH_PROMISE + CONTINUATION
struct PendingBlock {
    stream_id: u32,
    kind: BlockKind,
    block: BytesMut,
    length: usize,
}

/// HTTP/2 session for one connection
pub struct H2Session {
    role: Role,
    local_settings: Settings,
    remote_settings: Settings,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    /// Connection-level windows
    flow: FlowControl,
    streams: StreamManager,
    control: VecDeque<Control>,
    /// Streams with HEADERS or DATA ready to write
    send_queue: VecDeque<u32>,
    pending_block: Option<PendingBlock>,
    preface_sent: bool,
    preface_received: bool,
    settings_received: bool,
    goaway_sent: bool,
    goaway_received: bool,
    terminated: bool,
    fatal: bool,
}

impl H2Session {
    /// Create a session; `settings` are advertised in our initial SETTINGS
    pub fn new(role: Role, settings: Settings) -> Self {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(settings.get_max_frame_size());

        H2Session {
            role,
            local_settings: settings,
            remote_settings: Settings::new(),
            codec,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            streams: StreamManager::new(role == Role::Client),
            control: VecDeque::new(),
            send_queue: VecDeque::new(),
            pending_block: None,
            preface_sent: false,
            // only the server reads the client magic
            preface_received: role == Role::Client,
            settings_received: false,
            goaway_sent: false,
            goaway_received: false,
            terminated: false,
            fatal: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Streams the engine currently tracks
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn last_peer_stream_id(&self) -> u32 {
        self.streams.last_peer_stream_id()
    }

    fn new_slot(&self, id: u32, state: StreamState) -> StreamSlot {
        StreamSlot::new(
            id,
            state,
            self.remote_settings.get_initial_window_size(),
            self.local_settings.get_initial_window_size(),
        )
    }

    fn queue_frame(&mut self, bytes: Bytes, info: FrameInfo) {
        self.control.push_back(Control::Frame(bytes, info));
    }

    fn queue_window_update(&mut self, stream_id: u32, increment: u32) {
        let bytes = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(stream_id, increment));
        let info = FrameInfo::new(FrameType::WindowUpdate, FrameFlags::empty(), stream_id, 4);
        self.queue_frame(bytes, info);
    }

    fn queue_goaway(&mut self, code: ErrorCode, debug_data: &str) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        let frame = GoawayFrame::new(
            self.streams.last_peer_stream_id(),
            code,
            Bytes::copy_from_slice(debug_data.as_bytes()),
        );
        let bytes = FrameCodec::encode_goaway_frame(&frame);
        let mut info = FrameInfo::new(
            FrameType::Goaway,
            FrameFlags::empty(),
            0,
            bytes.len() - FRAME_HEADER_SIZE,
        );
        info.error_code = Some(code);
        self.queue_frame(bytes, info);
    }

    /// Record a connection error: GOAWAY is queued and no further input is
    /// accepted
    fn connection_error(&mut self, err: Error) -> Error {
        debug!(error = %err, "HTTP/2 connection error");
        self.queue_goaway(err.code(), &err.to_string());
        self.fatal = true;
        err
    }

    /// Reset a stream on our own initiative; the close is reported when the
    /// RST_STREAM is written
    fn stream_error(&mut self, stream_id: u32, code: ErrorCode) {
        trace!(stream_id, code = %code, "resetting stream");
        self.streams.remove(stream_id);
        self.control.push_back(Control::Reset(stream_id, code));
    }

    fn close_slot(&mut self, stream_id: u32, code: ErrorCode, events: &mut dyn FrameEvents) {
        if self.streams.remove(stream_id).is_some() {
            events.on_stream_close(stream_id, code);
        }
    }

    /// Put every stream waiting for window space back in the send queue
    fn requeue_deferred(&mut self) {
        for slot in self.streams.iter_mut() {
            if slot.deferred && slot.outbound.is_some() {
                slot.deferred = false;
                self.send_queue.push_back(slot.id());
            }
        }
    }

    fn process_frames(&mut self, events: &mut dyn FrameEvents) -> Result<()> {
        if !self.preface_received {
            if !self.codec.strip_preface()? {
                return Ok(());
            }
            self.preface_received = true;
        }
        while let Some(frame) = self.codec.next_frame()? {
            self.process_frame(frame, events)?;
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: Frame, events: &mut dyn FrameEvents) -> Result<()> {
        if !self.settings_received && (frame.frame_type != FrameType::Settings || frame.flags.is_ack()) {
            return Err(Error::Protocol(format!(
                "expected SETTINGS as first frame, got {}",
                frame.frame_type.name()
            )));
        }
        if let Some(pending) = &self.pending_block {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "expected CONTINUATION on stream {}, got {} on stream {}",
                    pending.stream_id,
                    frame.frame_type.name(),
                    frame.stream_id
                )));
            }
        }

        match frame.frame_type {
            FrameType::Data => self.recv_data(&frame, events),
            FrameType::Headers => {
                let headers = HeadersFrame::parse(&frame)?;
                let kind = BlockKind::Headers {
                    end_stream: headers.end_stream,
                    flags: frame.flags,
                };
                self.start_block(
                    headers.stream_id,
                    kind,
                    headers.header_block,
                    headers.end_headers,
                    frame.payload_len(),
                    events,
                )
            }
            FrameType::Priority => {
                if let Err(err) = PrioritySpec::parse_frame(&frame) {
                    if frame.stream_id == CONNECTION_STREAM_ID {
                        return Err(err);
                    }
                    self.stream_error(frame.stream_id, err.code());
                }
                events.on_frame_recv(&Self::info(&frame));
                Ok(())
            }
            FrameType::RstStream => self.recv_rst_stream(&frame, events),
            FrameType::Settings => self.recv_settings(&frame, events),
            FrameType::PushPromise => self.recv_push_promise(&frame, events),
            FrameType::Ping => {
                let ping = PingFrame::parse(&frame)?;
                if !ping.ack {
                    let bytes = FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data));
                    let info = FrameInfo::new(FrameType::Ping, FrameFlags::from_u8(FrameFlags::ACK), 0, 8);
                    self.queue_frame(bytes, info);
                }
                events.on_frame_recv(&Self::info(&frame));
                Ok(())
            }
            FrameType::Goaway => self.recv_goaway(&frame, events),
            FrameType::WindowUpdate => self.recv_window_update(&frame, events),
            FrameType::Continuation => self.recv_continuation(&frame, events),
        }
    }

    fn info(frame: &Frame) -> FrameInfo {
        FrameInfo::new(frame.frame_type, frame.flags, frame.stream_id, frame.payload_len())
    }

    fn recv_data(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let data = DataFrame::parse(frame)?;
        let id = data.stream_id;
        let len = frame.payload_len();

        // padding counts against the windows too
        self.flow.consume_recv_window(len)?;
        if let Some(increment) = self.flow.should_send_window_update() {
            self.flow.send_window_update(increment)?;
            self.queue_window_update(CONNECTION_STREAM_ID, increment);
        }

        let Some(slot) = self.streams.get_mut(id) else {
            if self.streams.was_closed(id) {
                return Ok(());
            }
            return Err(Error::Protocol(format!("DATA on idle stream {}", id)));
        };
        if !slot.state.can_receive() {
            self.stream_error(id, ErrorCode::StreamClosed);
            return Ok(());
        }
        if let Err(err) = slot.flow.consume_recv_window(len) {
            self.stream_error(id, err.code());
            return Ok(());
        }
        slot.state = slot.state.recv_data(data.end_stream)?;
        let update = if data.end_stream {
            None
        } else {
            slot.flow.should_send_window_update()
        };
        if let Some(increment) = update {
            slot.flow.send_window_update(increment)?;
        }
        let closed = slot.state.is_closed();

        if let Some(increment) = update {
            self.queue_window_update(id, increment);
        }
        if !data.data.is_empty() {
            events.on_data_chunk_recv(id, &data.data);
        }
        events.on_frame_recv(&Self::info(frame));
        if closed {
            self.close_slot(id, ErrorCode::NoError, events);
        }
        Ok(())
    }

    fn start_block(
        &mut self,
        stream_id: u32,
        kind: BlockKind,
        fragment: Bytes,
        end_headers: bool,
        length: usize,
        events: &mut dyn FrameEvents,
    ) -> Result<()> {
        let pending = PendingBlock {
            stream_id,
            kind,
            block: BytesMut::from(&fragment[..]),
            length,
        };
        if end_headers {
            self.finish_block(pending, events)
        } else {
            self.pending_block = Some(pending);
            Ok(())
        }
    }

    fn recv_continuation(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let continuation = ContinuationFrame::parse(frame)?;
        let Some(mut pending) = self.pending_block.take() else {
            return Err(Error::Protocol("unexpected CONTINUATION".to_string()));
        };
        if pending.block.len() + continuation.header_block.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(Error::Protocol("header block too large".to_string()));
        }
        pending.block.extend_from_slice(&continuation.header_block);
        pending.length += frame.payload_len();
        if continuation.end_headers {
            self.finish_block(pending, events)
        } else {
            self.pending_block = Some(pending);
            Ok(())
        }
    }

    fn finish_block(&mut self, pending: PendingBlock, events: &mut dyn FrameEvents) -> Result<()> {
        // decode even for streams that are ignored, to keep HPACK state in sync
        let fields = self
            .decoder
            .decode(&pending.block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        match pending.kind {
            BlockKind::Headers { end_stream, flags } => {
                let mut flags = flags;
                flags.set(FrameFlags::END_HEADERS);
                let info = FrameInfo::new(FrameType::Headers, flags, pending.stream_id, pending.length);
                self.recv_headers(info, end_stream, fields, events)
            }
            BlockKind::PushPromise { promised_stream_id } => {
                let mut info = FrameInfo::new(
                    FrameType::PushPromise,
                    FrameFlags::from_u8(FrameFlags::END_HEADERS),
                    pending.stream_id,
                    pending.length,
                );
                info.promised_stream_id = Some(promised_stream_id);
                events.on_begin_headers(promised_stream_id, HeadersCategory::PushPromise);
                emit_fields(events, promised_stream_id, &fields);
                events.on_frame_recv(&info);
                Ok(())
            }
        }
    }

    fn recv_headers(
        &mut self,
        info: FrameInfo,
        end_stream: bool,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        events: &mut dyn FrameEvents,
    ) -> Result<()> {
        let id = info.stream_id;
        let role = self.role;
        let closed = self.streams.was_closed(id);

        let (category, transition) = match self.streams.get_mut(id) {
            Some(slot) => {
                let category = if role == Role::Client && !slot.response_seen {
                    slot.response_seen = true;
                    HeadersCategory::Response
                } else {
                    HeadersCategory::Trailers
                };
                let transition = if category == HeadersCategory::Trailers && !end_stream {
                    Err(ErrorCode::ProtocolError)
                } else {
                    slot.state.recv_headers(end_stream).map_err(|_| ErrorCode::StreamClosed)
                };
                if let Ok(state) = transition {
                    slot.state = state;
                }
                (category, transition)
            }
            None if closed => return Ok(()),
            None => {
                if role == Role::Client {
                    return Err(Error::Protocol(format!("HEADERS on idle stream {}", id)));
                }
                self.streams.open_peer_stream(id)?;
                if self.terminated {
                    return Ok(());
                }
                let state = StreamState::Idle.recv_headers(end_stream)?;
                let slot = self.new_slot(id, state);
                self.streams.insert(slot);
                (HeadersCategory::Request, Ok(state))
            }
        };

        let state = match transition {
            Ok(state) => state,
            Err(code) => {
                self.stream_error(id, code);
                return Ok(());
            }
        };

        events.on_begin_headers(id, category);
        emit_fields(events, id, &fields);
        events.on_frame_recv(&info);
        if state.is_closed() {
            self.close_slot(id, ErrorCode::NoError, events);
        }
        Ok(())
    }

    fn recv_push_promise(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        if self.role == Role::Server {
            return Err(Error::Protocol("PUSH_PROMISE received by server".to_string()));
        }
        if !self.local_settings.get_enable_push() {
            return Err(Error::Protocol("PUSH_PROMISE with push disabled".to_string()));
        }
        let promise = PushPromiseFrame::parse(frame)?;
        match self.streams.get(promise.stream_id) {
            Some(slot) if matches!(slot.state, StreamState::Open | StreamState::HalfClosedLocal) => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "PUSH_PROMISE on stream {} which is not open",
                    promise.stream_id
                )))
            }
        }
        self.streams.open_peer_stream(promise.promised_stream_id)?;
        let slot = self.new_slot(promise.promised_stream_id, StreamState::ReservedRemote);
        self.streams.insert(slot);

        let kind = BlockKind::PushPromise {
            promised_stream_id: promise.promised_stream_id,
        };
        self.start_block(
            promise.stream_id,
            kind,
            promise.header_block,
            promise.end_headers,
            frame.payload_len(),
            events,
        )
    }

    fn recv_rst_stream(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let rst = RstStreamFrame::parse(frame)?;
        if self.streams.get(rst.stream_id).is_none() && !self.streams.was_closed(rst.stream_id) {
            return Err(Error::Protocol(format!("RST_STREAM on idle stream {}", rst.stream_id)));
        }
        let mut info = Self::info(frame);
        info.error_code = Some(rst.error_code);
        events.on_frame_recv(&info);
        self.close_slot(rst.stream_id, rst.error_code, events);
        Ok(())
    }

    fn recv_settings(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let settings = SettingsFrame::parse(frame)?;
        if !settings.ack {
            self.settings_received = true;
            let update = settings.settings;
            if let Some(size) = update.initial_window_size {
                for slot in self.streams.iter_mut() {
                    slot.flow.update_send_initial_size(size)?;
                }
            }
            if update.max_concurrent_streams.is_some() {
                self.streams.set_max_concurrent_streams(update.max_concurrent_streams);
            }
            self.remote_settings.merge(&update);

            let bytes = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
            let info = FrameInfo::new(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, 0);
            self.queue_frame(bytes, info);
            self.requeue_deferred();
        }
        events.on_frame_recv(&Self::info(frame));
        Ok(())
    }

    fn recv_goaway(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let goaway = GoawayFrame::parse(frame)?;
        self.goaway_received = true;
        if goaway.error_code != ErrorCode::NoError {
            debug!(
                code = %goaway.error_code,
                debug_data = %String::from_utf8_lossy(&goaway.debug_data),
                "peer sent GOAWAY"
            );
        }
        let mut info = Self::info(frame);
        info.error_code = Some(goaway.error_code);
        events.on_frame_recv(&info);

        // streams we opened above the peer's last stream were never processed
        for id in self.streams.stream_ids() {
            if !self.streams.is_peer_initiated(id) && id > goaway.last_stream_id {
                self.close_slot(id, ErrorCode::RefusedStream, events);
            }
        }
        Ok(())
    }

    fn recv_window_update(&mut self, frame: &Frame, events: &mut dyn FrameEvents) -> Result<()> {
        let update = WindowUpdateFrame::parse(frame)?;
        if update.stream_id == CONNECTION_STREAM_ID {
            self.flow.increase_send_window(update.size_increment)?;
            self.requeue_deferred();
        } else {
            let closed = self.streams.was_closed(update.stream_id);
            let result = match self.streams.get_mut(update.stream_id) {
                Some(slot) => {
                    let result = slot.flow.increase_send_window(update.size_increment);
                    if result.is_ok() && slot.deferred {
                        slot.deferred = false;
                        self.send_queue.push_back(update.stream_id);
                    }
                    result
                }
                None if closed => Ok(0),
                None => {
                    return Err(Error::Protocol(format!(
                        "WINDOW_UPDATE on idle stream {}",
                        update.stream_id
                    )))
                }
            };
            if let Err(err) = result {
                self.stream_error(update.stream_id, err.code());
            }
        }
        events.on_frame_recv(&Self::info(frame));
        Ok(())
    }

    fn encode_block(&mut self, headers: &[HeaderField]) -> Result<Bytes> {
        let mut block = Vec::new();
        self.encoder
            .encode_into(
                headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())),
                &mut block,
            )
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }

    fn write_push_promise(
        &mut self,
        out: &mut BytesMut,
        stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<HeaderField>,
        events: &mut dyn FrameEvents,
    ) {
        let mut info = FrameInfo::new(
            FrameType::PushPromise,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            stream_id,
            0,
        );
        info.promised_stream_id = Some(promised_stream_id);

        let associated_open = self.streams.get(stream_id).is_some_and(|s| s.state.can_send());
        let block = if associated_open {
            self.encode_block(&headers)
        } else {
            Err(Error::StreamClosed(stream_id))
        };
        match block {
            Ok(block) => {
                info.length = 4 + block.len();
                let max_frame = self.remote_settings.get_max_frame_size() as usize;
                out.put_slice(&FrameCodec::encode_push_promise(
                    stream_id,
                    promised_stream_id,
                    block,
                    max_frame,
                ));
                events.on_frame_send(&info);
            }
            Err(err) => {
                events.on_frame_not_send(&info, &err);
                self.close_slot(promised_stream_id, ErrorCode::Cancel, events);
            }
        }
    }

    fn write_streams(&mut self, out: &mut BytesMut, events: &mut dyn FrameEvents) {
        let max_frame = self.remote_settings.get_max_frame_size() as usize;
        while let Some(id) = self.send_queue.pop_front() {
            let headers = match self.streams.get_mut(id) {
                Some(slot) => match slot.outbound.as_mut() {
                    Some(outbound) => outbound.headers.take(),
                    None => continue,
                },
                None => continue,
            };
            if let Some(headers) = headers {
                if !self.write_headers(out, id, headers, max_frame, events) {
                    continue;
                }
            }
            self.write_data(out, id, max_frame, events);
        }
    }

    /// Write the HEADERS (and CONTINUATION) frames of a stream; returns
    /// whether DATA may follow
    fn write_headers(
        &mut self,
        out: &mut BytesMut,
        id: u32,
        headers: Vec<HeaderField>,
        max_frame: usize,
        events: &mut dyn FrameEvents,
    ) -> bool {
        let mut info = FrameInfo::new(
            FrameType::Headers,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            id,
            0,
        );
        let Some(slot) = self.streams.get_mut(id) else {
            return false;
        };
        let end_stream = slot.outbound.as_ref().map_or(true, |o| o.body.is_empty());
        let next = match slot.state.send_headers(end_stream) {
            Ok(state) => state,
            Err(err) => {
                slot.outbound = None;
                events.on_frame_not_send(&info, &err);
                return false;
            }
        };

        let block = match self.encode_block(&headers) {
            Ok(block) => block,
            Err(err) => {
                events.on_frame_not_send(&info, &err);
                self.stream_error(id, ErrorCode::InternalError);
                return false;
            }
        };

        if let Some(slot) = self.streams.get_mut(id) {
            slot.state = next;
            if end_stream {
                slot.outbound = None;
            }
        }
        info.flags.set_if(FrameFlags::END_STREAM, end_stream);
        info.length = block.len();
        out.put_slice(&FrameCodec::encode_headers(id, block, end_stream, max_frame));
        events.on_frame_send(&info);

        if next.is_closed() {
            self.close_slot(id, ErrorCode::NoError, events);
        }
        !end_stream
    }

    /// Write at most one DATA frame for a stream, requeueing it if more remains
    fn write_data(&mut self, out: &mut BytesMut, id: u32, max_frame: usize, events: &mut dyn FrameEvents) {
        let Some(slot) = self.streams.get_mut(id) else {
            return;
        };
        let Some(outbound) = slot.outbound.as_mut() else {
            return;
        };
        let window = self.flow.send_capacity().min(slot.flow.send_capacity());
        let len = outbound.body.len().min(max_frame).min(window);
        if len == 0 {
            slot.deferred = true;
            return;
        }

        self.flow.consume_send_window(len);
        slot.flow.consume_send_window(len);
        let chunk = outbound.body.split_to(len);
        let end_stream = outbound.body.is_empty();
        if end_stream {
            slot.outbound = None;
            match slot.state.send_data(true) {
                Ok(state) => slot.state = state,
                Err(err) => {
                    let info = FrameInfo::new(FrameType::Data, FrameFlags::empty(), id, len);
                    events.on_frame_not_send(&info, &err);
                    return;
                }
            }
        }
        let closed = slot.state.is_closed();

        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, end_stream);
        out.put_slice(&FrameCodec::encode_data_frame(&DataFrame::new(id, chunk, end_stream)));
        events.on_frame_send(&FrameInfo::new(FrameType::Data, flags, id, len));

        if closed {
            self.close_slot(id, ErrorCode::NoError, events);
        } else if !end_stream {
            self.send_queue.push_back(id);
        }
    }
}

fn emit_fields(events: &mut dyn FrameEvents, stream_id: u32, fields: &[(Vec<u8>, Vec<u8>)]) {
    for (name, value) in fields {
        events.on_header(
            stream_id,
            &String::from_utf8_lossy(name),
            &String::from_utf8_lossy(value),
        );
    }
}

impl ProtocolEngine for H2Session {
    fn receive(&mut self, data: &[u8], events: &mut dyn FrameEvents) -> Result<usize> {
        if self.fatal {
            return Err(Error::ConnectionClosed);
        }
        if self.terminated {
            return Ok(data.len());
        }
        self.codec.extend(data);
        match self.process_frames(events) {
            Ok(()) => Ok(data.len()),
            Err(err) => Err(self.connection_error(err)),
        }
    }

    fn prepare_send(&mut self, events: &mut dyn FrameEvents) -> Option<Bytes> {
        let mut out = BytesMut::new();

        if !self.preface_sent {
            self.preface_sent = true;
            if self.role == Role::Client {
                out.put_slice(CONNECTION_PREFACE);
            }
            let frame = FrameCodec::encode_settings_frame(&SettingsFrame::new(self.local_settings.clone()));
            let info = FrameInfo::new(
                FrameType::Settings,
                FrameFlags::empty(),
                0,
                frame.len() - FRAME_HEADER_SIZE,
            );
            out.put_slice(&frame);
            events.on_frame_send(&info);
        }

        while let Some(control) = self.control.pop_front() {
            match control {
                Control::Frame(bytes, info) => {
                    out.put_slice(&bytes);
                    events.on_frame_send(&info);
                }
                Control::Reset(stream_id, code) => {
                    out.put_slice(&FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
                        stream_id, code,
                    )));
                    let mut info = FrameInfo::new(FrameType::RstStream, FrameFlags::empty(), stream_id, 4);
                    info.error_code = Some(code);
                    events.on_frame_send(&info);
                    events.on_stream_close(stream_id, code);
                }
                Control::PushPromise {
                    stream_id,
                    promised_stream_id,
                    headers,
                } => self.write_push_promise(&mut out, stream_id, promised_stream_id, headers, events),
            }
        }

        if !self.fatal {
            self.write_streams(&mut out, events);
        }

        if out.is_empty() {
            None
        } else {
            Some(out.freeze())
        }
    }

    fn submit_response(&mut self, stream_id: u32, headers: Vec<HeaderField>, body: Bytes) -> Result<()> {
        if self.fatal {
            return Err(Error::ConnectionClosed);
        }
        let Some(slot) = self.streams.get_mut(stream_id) else {
            return Err(Error::StreamNotFound(stream_id));
        };
        if !slot.state.can_send() {
            return Err(Error::StreamClosed(stream_id));
        }
        if slot.outbound.is_some() {
            return Err(Error::Protocol(format!(
                "response already submitted on stream {}",
                stream_id
            )));
        }
        slot.outbound = Some(Outbound {
            headers: Some(headers),
            body,
        });
        slot.deferred = false;
        self.send_queue.push_back(stream_id);
        Ok(())
    }

    fn submit_push_promise(&mut self, stream_id: u32, headers: Vec<HeaderField>) -> Result<u32> {
        if self.role != Role::Server {
            return Err(Error::Protocol("only servers push".to_string()));
        }
        if self.fatal || self.terminated || self.goaway_received {
            return Err(Error::ConnectionClosed);
        }
        if !self.remote_settings.get_enable_push() {
            return Err(Error::PushDisabled);
        }
        match self.streams.get(stream_id) {
            Some(slot) if matches!(slot.state, StreamState::Open | StreamState::HalfClosedRemote) => {}
            Some(_) => return Err(Error::StreamClosed(stream_id)),
            None => return Err(Error::StreamNotFound(stream_id)),
        }

        let promised_stream_id = self.streams.allocate_id()?;
        let slot = self.new_slot(promised_stream_id, StreamState::ReservedLocal);
        self.streams.insert(slot);
        self.control.push_back(Control::PushPromise {
            stream_id,
            promised_stream_id,
            headers,
        });
        Ok(promised_stream_id)
    }

    fn submit_request(&mut self, headers: Vec<HeaderField>, body: Bytes) -> Result<u32> {
        if self.role != Role::Client {
            return Err(Error::Protocol("only clients submit requests".to_string()));
        }
        if self.fatal || self.terminated || self.goaway_received {
            return Err(Error::ConnectionClosed);
        }

        let stream_id = self.streams.allocate_id()?;
        let mut slot = self.new_slot(stream_id, StreamState::Idle);
        slot.outbound = Some(Outbound {
            headers: Some(headers),
            body,
        });
        self.streams.insert(slot);
        self.send_queue.push_back(stream_id);
        Ok(stream_id)
    }

    fn resume_data(&mut self, stream_id: u32) -> Result<()> {
        let Some(slot) = self.streams.get_mut(stream_id) else {
            return Err(Error::StreamNotFound(stream_id));
        };
        if slot.deferred && slot.outbound.is_some() {
            slot.deferred = false;
            self.send_queue.push_back(stream_id);
        }
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) -> Result<()> {
        if self.streams.get(stream_id).is_none() {
            return Err(Error::StreamNotFound(stream_id));
        }
        self.stream_error(stream_id, code);
        Ok(())
    }

    fn terminate_session(&mut self, code: ErrorCode) {
        if !self.terminated {
            self.terminated = true;
            self.queue_goaway(code, "");
        }
    }

    fn want_read(&self) -> bool {
        !self.fatal && !self.terminated && !(self.goaway_received && self.streams.is_empty())
    }

    fn want_write(&self) -> bool {
        !self.preface_sent || !self.control.is_empty() || !self.send_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    #[derive(Default)]
    struct Recorder {
        begins: Vec<(u32, HeadersCategory)>,
        headers: Vec<(u32, String, String)>,
        data: Vec<(u32, Vec<u8>)>,
        recv: Vec<FrameInfo>,
        sent: Vec<FrameInfo>,
        closed: Vec<(u32, ErrorCode)>,
    }

    impl Recorder {
        fn body(&self, stream_id: u32) -> Vec<u8> {
            self.data
                .iter()
                .filter(|(id, _)| *id == stream_id)
                .flat_map(|(_, chunk)| chunk.clone())
                .collect()
        }

        fn header(&self, stream_id: u32, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(id, n, _)| *id == stream_id && n == name)
                .map(|(_, _, v)| v.clone())
        }
    }

    impl FrameEvents for Recorder {
        fn on_begin_headers(&mut self, stream_id: u32, category: HeadersCategory) {
            self.begins.push((stream_id, category));
        }
        fn on_header(&mut self, stream_id: u32, name: &str, value: &str) {
            self.headers.push((stream_id, name.to_string(), value.to_string()));
        }
        fn on_data_chunk_recv(&mut self, stream_id: u32, data: &[u8]) {
            self.data.push((stream_id, data.to_vec()));
        }
        fn on_frame_recv(&mut self, frame: &FrameInfo) {
            self.recv.push(*frame);
        }
        fn on_stream_close(&mut self, stream_id: u32, code: ErrorCode) {
            self.closed.push((stream_id, code));
        }
        fn on_frame_send(&mut self, frame: &FrameInfo) {
            self.sent.push(*frame);
        }
    }

    struct Pair {
        client: H2Session,
        client_events: Recorder,
        server: H2Session,
        server_events: Recorder,
    }

    impl Pair {
        fn new(client_settings: Settings, server_settings: Settings) -> Self {
            let mut pair = Pair {
                client: H2Session::new(Role::Client, client_settings),
                client_events: Recorder::default(),
                server: H2Session::new(Role::Server, server_settings),
                server_events: Recorder::default(),
            };
            pair.settle();
            pair
        }

        /// Exchange bytes until neither side has anything to send
        fn settle(&mut self) {
            for _ in 0..64 {
                let mut moved = false;
                if let Some(bytes) = self.client.prepare_send(&mut self.client_events) {
                    self.server.receive(&bytes, &mut self.server_events).unwrap();
                    moved = true;
                }
                if let Some(bytes) = self.server.prepare_send(&mut self.server_events) {
                    self.client.receive(&bytes, &mut self.client_events).unwrap();
                    moved = true;
                }
                if !moved {
                    return;
                }
            }
        }
    }

    fn request(path: &str) -> Vec<HeaderField> {
        vec![
            (":method".into(), "GET".into()),
            (":scheme".into(), "https".into()),
            (":path".into(), path.into()),
        ]
    }

    fn status(code: &str) -> Vec<HeaderField> {
        vec![(":status".into(), code.into())]
    }

    #[test]
    fn test_request_response_exchange() {
        let mut pair = Pair::new(Settings::new(), Settings::new());

        let id = pair.client.submit_request(request("/index.html"), Bytes::new()).unwrap();
        assert_eq!(id, 1);
        pair.settle();

        assert_eq!(pair.server_events.begins, vec![(1, HeadersCategory::Request)]);
        assert_eq!(pair.server_events.header(1, ":path").as_deref(), Some("/index.html"));
        assert!(pair.server_events.recv.iter().any(|f| f.is_end_stream() && f.stream_id == 1));

        pair.server
            .submit_response(1, status("200"), Bytes::from_static(b"hello"))
            .unwrap();
        pair.settle();

        assert_eq!(pair.client_events.begins, vec![(1, HeadersCategory::Response)]);
        assert_eq!(pair.client_events.header(1, ":status").as_deref(), Some("200"));
        assert_eq!(pair.client_events.body(1), b"hello");
        assert_eq!(pair.client_events.closed, vec![(1, ErrorCode::NoError)]);
        assert_eq!(pair.server_events.closed, vec![(1, ErrorCode::NoError)]);
        assert_eq!(pair.server.stream_count(), 0);
        assert_eq!(pair.client.stream_count(), 0);
    }

    #[test]
    fn test_missing_preface_is_fatal() {
        let mut server = H2Session::new(Role::Server, Settings::new());
        let mut events = Recorder::default();

        let result = server.receive(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &mut events);
        assert!(matches!(result, Err(Error::MissingPreface)));
        assert!(!server.want_read());

        let out = server.prepare_send(&mut events).unwrap();
        let goaway = events.sent.iter().find(|f| f.frame_type == FrameType::Goaway).unwrap();
        assert_eq!(goaway.error_code, Some(ErrorCode::ProtocolError));
        assert!(out.len() > FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_server_push_order() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        pair.client.submit_request(request("/"), Bytes::new()).unwrap();
        pair.settle();

        let promised = pair.server.submit_push_promise(1, request("/style.css")).unwrap();
        assert_eq!(promised, 2);
        pair.server
            .submit_response(promised, status("200"), Bytes::from_static(b"body{}"))
            .unwrap();
        pair.server
            .submit_response(1, status("200"), Bytes::from_static(b"<html>"))
            .unwrap();
        pair.settle();

        assert_eq!(
            pair.client_events.begins,
            vec![
                (2, HeadersCategory::PushPromise),
                (2, HeadersCategory::Response),
                (1, HeadersCategory::Response),
            ]
        );
        assert_eq!(pair.client_events.header(2, ":path").as_deref(), Some("/style.css"));
        assert_eq!(pair.client_events.body(2), b"body{}");
        assert_eq!(pair.client_events.body(1), b"<html>");
        let promise = pair
            .client_events
            .recv
            .iter()
            .find(|f| f.frame_type == FrameType::PushPromise)
            .unwrap();
        assert_eq!(promise.stream_id, 1);
        assert_eq!(promise.promised_stream_id, Some(2));
    }

    #[test]
    fn test_push_disabled_by_client() {
        let client_settings = SettingsBuilder::new().enable_push(false).build().unwrap();
        let mut pair = Pair::new(client_settings, Settings::new());
        pair.client.submit_request(request("/"), Bytes::new()).unwrap();
        pair.settle();

        let result = pair.server.submit_push_promise(1, request("/style.css"));
        assert!(matches!(result, Err(Error::PushDisabled)));
    }

    #[test]
    fn test_push_limited_by_peer_max_concurrent_streams() {
        let client_settings = SettingsBuilder::new().max_concurrent_streams(1).build().unwrap();
        let mut pair = Pair::new(client_settings, Settings::new());
        pair.client.submit_request(request("/"), Bytes::new()).unwrap();
        pair.settle();

        pair.server.submit_push_promise(1, request("/a.css")).unwrap();
        let result = pair.server.submit_push_promise(1, request("/b.css"));
        assert!(matches!(result, Err(Error::TooManyStreams)));
    }

    #[test]
    fn test_flow_control_defers_and_resumes() {
        let client_settings = SettingsBuilder::new().initial_window_size(10).build().unwrap();
        let mut pair = Pair::new(client_settings, Settings::new());
        pair.client.submit_request(request("/big"), Bytes::new()).unwrap();
        pair.settle();

        let body = Bytes::from(vec![b'x'; 25]);
        pair.server.submit_response(1, status("200"), body).unwrap();

        // the first flush can only fill the 10 byte stream window
        let first = pair.server.prepare_send(&mut pair.server_events).unwrap();
        pair.client.receive(&first, &mut pair.client_events).unwrap();
        assert_eq!(pair.client_events.body(1).len(), 10);
        assert!(pair.server.prepare_send(&mut pair.server_events).is_none());

        // WINDOW_UPDATEs from the client let the rest through
        pair.settle();
        assert_eq!(pair.client_events.body(1).len(), 25);
        assert_eq!(pair.client_events.closed, vec![(1, ErrorCode::NoError)]);
    }

    #[test]
    fn test_reset_stream_reports_close() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        pair.client.submit_request(request("/"), Bytes::new()).unwrap();
        pair.settle();

        pair.server.reset_stream(1, ErrorCode::RefusedStream).unwrap();
        assert!(matches!(
            pair.server.reset_stream(1, ErrorCode::RefusedStream),
            Err(Error::StreamNotFound(1))
        ));
        pair.settle();

        assert_eq!(pair.server_events.closed, vec![(1, ErrorCode::RefusedStream)]);
        assert_eq!(pair.client_events.closed, vec![(1, ErrorCode::RefusedStream)]);
    }

    #[test]
    fn test_unknown_stream_operations() {
        let mut server = H2Session::new(Role::Server, Settings::new());
        assert!(matches!(server.resume_data(9), Err(Error::StreamNotFound(9))));
        assert!(matches!(
            server.submit_response(9, status("200"), Bytes::new()),
            Err(Error::StreamNotFound(9))
        ));
    }

    #[test]
    fn test_data_on_idle_stream_is_connection_error() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        let data = FrameCodec::encode_data_frame(&DataFrame::new(7, Bytes::from_static(b"x"), true));

        let result = pair.server.receive(&data, &mut pair.server_events);
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(!pair.server.want_read());
    }

    #[test]
    fn test_late_frames_on_closed_stream_are_ignored() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        pair.client.submit_request(request("/"), Bytes::new()).unwrap();
        pair.settle();
        pair.server.submit_response(1, status("204"), Bytes::new()).unwrap();
        pair.settle();
        assert_eq!(pair.server.stream_count(), 0);

        let update = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 100));
        pair.server.receive(&update, &mut pair.server_events).unwrap();

        // :method GET, :scheme http, :path / from the static table
        let headers = FrameCodec::encode_headers(1, Bytes::from_static(&[0x82, 0x86, 0x84]), true, 16_384);
        pair.server.receive(&headers, &mut pair.server_events).unwrap();

        assert!(pair.server.want_read());
        assert_eq!(pair.server.stream_count(), 0);
        assert_eq!(pair.server_events.begins, vec![(1, HeadersCategory::Request)]);
    }

    #[test]
    fn test_ping_is_acknowledged() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([9; 8]));
        pair.server.receive(&ping, &mut pair.server_events).unwrap();
        pair.server.prepare_send(&mut pair.server_events).unwrap();

        let ack = pair.server_events.sent.last().unwrap();
        assert_eq!(ack.frame_type, FrameType::Ping);
        assert!(ack.flags.is_ack());
    }

    #[test]
    fn test_goaway_from_client_ends_server_reads() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        assert!(pair.server.want_read());

        pair.client.terminate_session(ErrorCode::NoError);
        assert!(!pair.client.want_read());
        assert!(pair.client.want_write());
        pair.settle();

        assert!(!pair.server.want_read());
        assert!(!pair.client.want_write());
    }

    #[test]
    fn test_large_header_block_uses_continuation() {
        let mut pair = Pair::new(Settings::new(), Settings::new());
        let mut headers = request("/");
        headers.push(("x-large".into(), "v".repeat(40_000)));
        pair.client.submit_request(headers, Bytes::new()).unwrap();
        pair.settle();

        assert_eq!(pair.server_events.header(1, "x-large").map(|v| v.len()), Some(40_000));
    }
}
