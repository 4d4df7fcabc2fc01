//! Frame event dispatcher
//!
//! [`StreamTable`] owns the streams of a connection and is the
//! [`FrameEvents`] implementation the engine calls back into. Callbacks only
//! touch the table; anything that needs the engine or the socket (running a
//! handler, resetting a stream) is recorded as an [`Intent`] and carried out
//! by the connection once the engine call has returned.

use super::engine::{FrameEvents, FrameInfo, HeadersCategory, Role};
use super::error::{Error, ErrorCode, Result};
use super::state::StreamId;
use super::stream::{Inbound, Stream};
use crate::http::{Request, Response, Routes};
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Work recorded during a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// The request on this stream is complete; run its handler
    Dispatch(StreamId),
    /// Reset this stream
    Reset(StreamId, ErrorCode),
}

/// Streams of one connection
pub struct StreamTable {
    role: Role,
    routes: Rc<Routes>,
    streams: HashMap<StreamId, Stream>,
    /// Most recently active stream
    last_active: Option<StreamId>,
    max_streams: usize,
    intents: Vec<Intent>,
    /// Exchanges received through server push (client role)
    pushed: Vec<(Rc<Request>, Response)>,
}

impl StreamTable {
    pub fn new(role: Role, routes: Rc<Routes>, max_streams: usize) -> Self {
        StreamTable {
            role,
            routes,
            streams: HashMap::new(),
            last_active: None,
            max_streams,
            intents: Vec::new(),
            pushed: Vec::new(),
        }
    }

    pub fn routes(&self) -> &Rc<Routes> {
        &self.routes
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn last_active(&self) -> Option<StreamId> {
        self.last_active
    }

    /// Add a stream; `request` defaults to an empty one being received
    pub fn create(&mut self, stream_id: StreamId, request: Option<Rc<Request>>) -> Result<&mut Stream> {
        if self.streams.contains_key(&stream_id) {
            return Err(Error::Protocol(format!("stream {} already exists", stream_id)));
        }
        if self.streams.len() >= self.max_streams {
            return Err(Error::TooManyStreams);
        }

        let request = request.unwrap_or_default();
        let stream = Stream::new(stream_id, request, self.routes.clone());
        self.last_active = Some(stream_id);
        Ok(self.streams.entry(stream_id).or_insert(stream))
    }

    pub fn find(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        let stream = self.streams.get_mut(&stream_id)?;
        self.last_active = Some(stream_id);
        Some(stream)
    }

    /// Remove a stream, settling whoever waits for it
    ///
    /// Returns whether the stream existed.
    pub fn close(&mut self, stream_id: StreamId, outcome: Result<()>) -> bool {
        let Some(stream) = self.streams.remove(&stream_id) else {
            return false;
        };
        if self.last_active == Some(stream_id) {
            self.last_active = None;
        }
        if let Some(exchange) = stream.finish(outcome) {
            if self.role == Role::Client {
                self.pushed.push(exchange);
            }
        }
        true
    }

    /// Destroy every stream
    pub fn clear(&mut self) {
        for stream_id in self.streams.keys().copied().collect::<Vec<_>>() {
            self.close(stream_id, Err(Error::ConnectionClosed));
        }
    }

    pub fn take_intents(&mut self) -> Vec<Intent> {
        mem::take(&mut self.intents)
    }

    pub fn take_pushed(&mut self) -> Vec<(Rc<Request>, Response)> {
        mem::take(&mut self.pushed)
    }

    fn reject(&mut self, stream_id: StreamId, code: ErrorCode) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.malformed = true;
        }
        self.intents.push(Intent::Reset(stream_id, code));
    }

    /// Header block finished on a stream: check the request and queue its
    /// handler
    fn request_complete(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };
        if stream.malformed {
            return;
        }
        match stream.request().validate() {
            Ok(()) => self.intents.push(Intent::Dispatch(stream_id)),
            Err(err) => {
                debug!(stream_id, error = %err, "rejecting malformed request");
                self.reject(stream_id, ErrorCode::ProtocolError);
            }
        }
    }
}

impl FrameEvents for StreamTable {
    fn on_begin_headers(&mut self, stream_id: StreamId, category: HeadersCategory) {
        let inbound = match category {
            HeadersCategory::Request | HeadersCategory::PushPromise => Inbound::Request,
            HeadersCategory::Response => Inbound::Response,
            // trailers extend whatever message is being received
            HeadersCategory::Trailers => return,
        };

        if inbound == Inbound::Request {
            match self.create(stream_id, None) {
                Ok(stream) => stream.inbound = inbound,
                Err(Error::TooManyStreams) => {
                    warn!(stream_id, max = self.max_streams, "refusing stream over the limit");
                    self.intents.push(Intent::Reset(stream_id, ErrorCode::RefusedStream));
                }
                Err(err) => {
                    debug!(stream_id, error = %err, "cannot open stream");
                    self.intents.push(Intent::Reset(stream_id, ErrorCode::ProtocolError));
                }
            }
        } else if let Some(stream) = self.find(stream_id) {
            stream.inbound = inbound;
        }
    }

    fn on_header(&mut self, stream_id: StreamId, name: &str, value: &str) {
        let Some(stream) = self.find(stream_id) else {
            trace!(stream_id, name, "header for unknown stream ignored");
            return;
        };
        if stream.malformed {
            return;
        }
        let result = match stream.inbound {
            Inbound::Request => stream.update_request(name, value),
            Inbound::Response => stream.update_response(name, value),
        };
        if let Err(err) = result {
            debug!(stream_id, error = %err, "malformed header field");
            self.reject(stream_id, ErrorCode::ProtocolError);
        }
    }

    fn on_data_chunk_recv(&mut self, stream_id: StreamId, data: &[u8]) {
        let role = self.role;
        let Some(stream) = self.find(stream_id) else {
            return;
        };
        match role {
            Role::Server => stream.update_body(data),
            Role::Client => stream.update_response_body(data),
        }
    }

    fn on_frame_recv(&mut self, frame: &FrameInfo) {
        trace!(frame = %frame, "<----------------------------");
        if self.role == Role::Server && frame.is_end_stream() {
            self.request_complete(frame.stream_id);
        }
    }

    fn on_stream_close(&mut self, stream_id: StreamId, code: ErrorCode) {
        let outcome = if code == ErrorCode::NoError {
            Ok(())
        } else {
            Err(Error::Reset(stream_id, code))
        };
        if self.close(stream_id, outcome) {
            debug!(stream_id, code = %code, "stream closed");
        }
    }

    fn on_frame_send(&mut self, frame: &FrameInfo) {
        trace!(frame = %frame, "---------------------------->");
    }

    fn on_frame_not_send(&mut self, frame: &FrameInfo, reason: &Error) {
        warn!(frame = %frame, error = %reason, "frame not sent");
    }
}
