//! Engine-side stream state
//!
//! The stream state machine of RFC 7540 Section 5.1 and the per-stream record
//! the protocol engine keeps: state, flow-control windows and whatever is
//! still waiting to be written. This is distinct from the multiplexer's
//! [`Stream`](super::stream::Stream), which holds the request and response.

use super::engine::HeaderField;
use super::error::{Error, Result};
use super::flow_control::FlowControl;
use super::MAX_STREAM_ID;
use bytes::Bytes;
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Reserved (local): PUSH_PROMISE sent
    ReservedLocal,
    /// Reserved (remote): PUSH_PROMISE received
    ReservedRemote,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedRemote | StreamState::ReservedLocal
        )
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }

    /// State after receiving HEADERS
    pub fn recv_headers(self, end_stream: bool) -> Result<StreamState> {
        match self {
            StreamState::Idle if end_stream => Ok(StreamState::HalfClosedRemote),
            StreamState::Idle => Ok(StreamState::Open),
            StreamState::ReservedRemote if end_stream => Ok(StreamState::Closed),
            StreamState::ReservedRemote => Ok(StreamState::HalfClosedLocal),
            StreamState::Open | StreamState::HalfClosedLocal => self.recv_data(end_stream),
            _ => Err(Error::Protocol(format!("HEADERS received in state {:?}", self))),
        }
    }

    /// State after receiving DATA (or trailers)
    pub fn recv_data(self, end_stream: bool) -> Result<StreamState> {
        match (self, end_stream) {
            (StreamState::Open, true) => Ok(StreamState::HalfClosedRemote),
            (StreamState::HalfClosedLocal, true) => Ok(StreamState::Closed),
            (StreamState::Open | StreamState::HalfClosedLocal, false) => Ok(self),
            _ => Err(Error::Protocol(format!("DATA received in state {:?}", self))),
        }
    }

    /// State after sending HEADERS
    pub fn send_headers(self, end_stream: bool) -> Result<StreamState> {
        match self {
            StreamState::Idle if end_stream => Ok(StreamState::HalfClosedLocal),
            StreamState::Idle => Ok(StreamState::Open),
            StreamState::ReservedLocal if end_stream => Ok(StreamState::Closed),
            StreamState::ReservedLocal => Ok(StreamState::HalfClosedRemote),
            StreamState::Open | StreamState::HalfClosedRemote => self.send_data(end_stream),
            _ => Err(Error::Protocol(format!("cannot send HEADERS in state {:?}", self))),
        }
    }

    /// State after sending DATA
    pub fn send_data(self, end_stream: bool) -> Result<StreamState> {
        match (self, end_stream) {
            (StreamState::Open, true) => Ok(StreamState::HalfClosedLocal),
            (StreamState::HalfClosedRemote, true) => Ok(StreamState::Closed),
            (StreamState::Open | StreamState::HalfClosedRemote, false) => Ok(self),
            _ => Err(Error::Protocol(format!("cannot send DATA in state {:?}", self))),
        }
    }
}

/// Headers and body submitted for a stream and not yet fully written
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Header list still to be encoded; `None` once HEADERS went out
    pub headers: Option<Vec<HeaderField>>,
    /// Body bytes not yet written
    pub body: Bytes,
}

/// Engine record of one stream
#[derive(Debug)]
pub struct StreamSlot {
    id: StreamId,
    pub state: StreamState,
    pub flow: FlowControl,
    pub outbound: Option<Outbound>,
    /// Waiting for window space before more DATA can be written
    pub deferred: bool,
    /// Whether response HEADERS were already received (client role)
    pub response_seen: bool,
}

impl StreamSlot {
    pub fn new(id: StreamId, state: StreamState, send_window: u32, recv_window: u32) -> Self {
        StreamSlot {
            id,
            state,
            flow: FlowControl::new(send_window, recv_window),
            outbound: None,
            deferred: false,
            response_seen: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }
}

/// Stream manager
///
/// Owns the slots of every stream the engine tracks and allocates the ids of
/// streams this side initiates (client: odd, server: even).
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, StreamSlot>,
    next_stream_id: StreamId,
    /// Highest id the peer has opened or promised
    last_peer_stream_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS, limiting streams we initiate
    max_concurrent_streams: Option<u32>,
}

impl StreamManager {
    /// `is_client` selects odd local ids, otherwise even
    pub fn new(is_client: bool) -> Self {
        StreamManager {
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            last_peer_stream_id: 0,
            max_concurrent_streams: None,
        }
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    pub fn last_peer_stream_id(&self) -> StreamId {
        self.last_peer_stream_id
    }

    /// Whether `id` belongs to the peer's id space (odd for a client peer)
    pub fn is_peer_initiated(&self, id: StreamId) -> bool {
        id % 2 != self.next_stream_id % 2
    }

    /// Record a stream the peer opened; ids must increase
    pub fn open_peer_stream(&mut self, id: StreamId) -> Result<()> {
        if !self.is_peer_initiated(id) || id <= self.last_peer_stream_id {
            return Err(Error::Protocol(format!("invalid peer stream id {}", id)));
        }
        self.last_peer_stream_id = id;
        Ok(())
    }

    /// Allocate the next local id, honouring the peer's concurrency limit
    pub fn allocate_id(&mut self) -> Result<StreamId> {
        if let Some(max) = self.max_concurrent_streams {
            if self.local_active_count() >= max as usize {
                return Err(Error::TooManyStreams);
            }
        }
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(Error::Protocol("stream ids exhausted".to_string()));
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(stream_id)
    }

    pub fn insert(&mut self, slot: StreamSlot) {
        self.streams.insert(slot.id, slot);
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&StreamSlot> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut StreamSlot> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<StreamSlot> {
        self.streams.remove(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Streams we initiated that count against the peer's limit
    pub fn local_active_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !self.is_peer_initiated(s.id) && !s.state.is_closed())
            .count()
    }

    /// Whether `id` names a stream that was used and has since closed
    pub fn was_closed(&self, id: StreamId) -> bool {
        !self.streams.contains_key(&id)
            && if self.is_peer_initiated(id) {
                id <= self.last_peer_stream_id
            } else {
                id < self.next_stream_id
            }
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamSlot> {
        self.streams.values_mut()
    }
}
