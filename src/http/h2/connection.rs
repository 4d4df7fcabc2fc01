//! Connection multiplexer
//!
//! A [`Connection`] owns one byte stream, one protocol engine and the table
//! of streams carried over it. [`Connection::process`] runs the whole
//! lifecycle on the current task:
//!
//! 1. move whatever the engine has ready into the outbound buffer
//! 2. wait for socket input, write progress, a finished handler or a
//!    shutdown request, whichever comes first
//! 3. feed input to the engine, which calls back into the stream table
//! 4. carry out the intents the callbacks recorded (run handlers, reset
//!    streams) and submit finished responses
//!
//! Reads keep going while a write is pending, so two peers that both send
//! more than the transport buffers hold cannot stall each other.
//!
//! Handlers are polled by the same task as the socket, so they must not
//! block. Nothing here is `Send`: connections run on a current-thread
//! runtime or inside a `tokio::task::LocalSet`.

use super::dispatcher::{Intent, StreamTable};
use super::engine::{ProtocolEngine, Role};
use super::error::{Error, ErrorCode, Result};
use super::session::H2Session;
use super::settings::Settings;
use super::state::StreamId;
use super::stream::{Completion, Inbound, ResponseWaiter, Stream};
use super::DEFAULT_MAX_STREAMS;
use crate::http::{Request, Response, Routes};
use bytes::{Buf, Bytes, BytesMut};
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::cell::Cell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Default size of the socket read buffer
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Per-connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub role: Role,
    /// SETTINGS advertised to the peer
    pub settings: Settings,
    /// Stream ceiling enforced by the multiplexer
    pub max_streams: usize,
    pub read_buffer_size: usize,
    /// Server: push when the push path is requested. Client: accept pushes.
    pub enable_push: bool,
}

impl ConnectionConfig {
    pub fn server() -> Self {
        ConnectionConfig {
            role: Role::Server,
            settings: Settings::new(),
            max_streams: DEFAULT_MAX_STREAMS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            enable_push: true,
        }
    }

    pub fn client() -> Self {
        ConnectionConfig {
            role: Role::Client,
            ..ConnectionConfig::server()
        }
    }

    /// Settings handed to the engine
    pub fn engine_settings(&self) -> Settings {
        let mut settings = self.settings.clone();
        match self.role {
            Role::Server => {
                if settings.max_concurrent_streams.is_none() {
                    settings.max_concurrent_streams = Some(self.max_streams as u32);
                }
            }
            Role::Client => {
                if !self.enable_push {
                    settings.enable_push = Some(false);
                }
            }
        }
        settings
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::server()
    }
}

/// Stops a running [`Connection::process`] from elsewhere on the same thread
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Rc<ShutdownSignal>,
}

#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: Cell<bool>,
    notify: Notify,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.inner.requested.replace(true) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.requested.get()
    }

    pub(crate) async fn requested(&self) {
        if !self.is_shutdown() {
            self.inner.notify.notified().await;
        }
    }
}

type Pending = (Rc<Request>, oneshot::Sender<Result<Response>>);

/// Write `outbound` when `writing` (returning the byte count), otherwise flush
async fn write_or_flush<W: AsyncWrite + Unpin>(
    writer: &mut W,
    outbound: &[u8],
    writing: bool,
) -> std::io::Result<Option<usize>> {
    if writing {
        writer.write(outbound).await.map(Some)
    } else {
        writer.flush().await.map(|()| None)
    }
}

/// One HTTP/2 connection
pub struct Connection<T, E = H2Session> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    /// Engine output not yet accepted by the byte stream
    outbound: BytesMut,
    unflushed: bool,
    engine: E,
    table: StreamTable,
    config: ConnectionConfig,
    tasks: FuturesUnordered<LocalBoxFuture<'static, Completion>>,
    remaining_reqs: VecDeque<Pending>,
    requests_sent: bool,
    closing: bool,
    shutdown: ShutdownHandle,
    done: bool,
    peer_addr: Option<SocketAddr>,
}

impl<T> Connection<T, H2Session>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Connection driven by the bundled engine
    pub fn new(io: T, routes: Rc<Routes>, config: ConnectionConfig) -> Self {
        let engine = H2Session::new(config.role, config.engine_settings());
        Connection::with_engine(io, engine, routes, config)
    }
}

impl<T, E> Connection<T, E>
where
    T: AsyncRead + AsyncWrite + Unpin,
    E: ProtocolEngine,
{
    pub fn with_engine(io: T, engine: E, routes: Rc<Routes>, config: ConnectionConfig) -> Self {
        let table = StreamTable::new(config.role, routes, config.max_streams);
        let (reader, writer) = tokio::io::split(io);
        Connection {
            reader,
            writer,
            outbound: BytesMut::new(),
            unflushed: false,
            engine,
            table,
            config,
            tasks: FuturesUnordered::new(),
            remaining_reqs: VecDeque::new(),
            requests_sent: false,
            closing: false,
            shutdown: ShutdownHandle::default(),
            done: false,
            peer_addr: None,
        }
    }

    /// Remember the peer address passed to the route table's client callback
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Drive the connection until the peer goes away, the session ends or
    /// shutdown is requested
    ///
    /// All streams are destroyed and the byte stream is shut down before
    /// this returns, whatever the outcome.
    pub async fn process(&mut self) -> Result<()> {
        if self.config.role == Role::Server {
            self.table.routes().notify_client(self.peer_addr);
        }

        let result = self.run().await;
        if let Err(err) = &result {
            debug!(error = %err, "connection failed");
            // best effort: the engine may have a GOAWAY queued
            let _ = self.drain_outbound().await;
        }

        self.shutdown();
        let _ = self.writer.shutdown().await;
        result
    }

    async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.config.read_buffer_size];
        let shutdown = self.shutdown.clone();

        loop {
            if self.config.role == Role::Client {
                self.handle_remaining_reqs();
                self.finish_client();
            }
            self.fill_outbound();

            if shutdown.is_shutdown() {
                return Ok(());
            }
            let want_read = self.engine.want_read();
            let has_tasks = !self.tasks.is_empty();
            let writing = !self.outbound.is_empty();
            let flushing = !writing && self.unflushed;
            if !want_read && !has_tasks && !writing && !flushing {
                debug!("session finished");
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = shutdown.requested() => return Ok(()),

                Some(done) = self.tasks.next(), if has_tasks => {
                    self.complete(done);
                }

                read = self.reader.read(&mut buf), if want_read => {
                    let n = read?;
                    if n == 0 {
                        debug!("peer closed connection");
                        return Ok(());
                    }
                    self.engine.receive(&buf[..n], &mut self.table)?;
                    self.drain_intents();
                }

                // write and flush are mutually exclusive; one branch so the
                // writer is borrowed only once
                io = write_or_flush(&mut self.writer, &self.outbound, writing), if writing || flushing => {
                    match io? {
                        Some(written) => self.advance_outbound(written)?,
                        None => self.unflushed = false,
                    }
                }
            }
        }
    }

    /// Append everything the engine has ready to the outbound buffer
    fn fill_outbound(&mut self) {
        while let Some(bytes) = self.engine.prepare_send(&mut self.table) {
            self.outbound.extend_from_slice(&bytes);
        }
    }

    fn advance_outbound(&mut self, written: usize) -> Result<()> {
        if written == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        self.outbound.advance(written);
        self.unflushed = true;
        Ok(())
    }

    /// Write out the buffer and whatever the engine still produces, giving up
    /// as soon as shutdown is requested
    async fn drain_outbound(&mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        loop {
            self.fill_outbound();
            if self.outbound.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.requested() => return Ok(()),
                written = self.writer.write(&self.outbound) => self.advance_outbound(written?)?,
            }
        }
        if self.unflushed {
            tokio::select! {
                biased;
                _ = shutdown.requested() => {}
                flushed = self.writer.flush() => flushed?,
            }
            self.unflushed = false;
        }
        Ok(())
    }

    fn drain_intents(&mut self) {
        for intent in self.table.take_intents() {
            match intent {
                Intent::Dispatch(stream_id) => {
                    let enable_push = self.config.enable_push;
                    if let Some(stream) = self.table.find(stream_id) {
                        let promised = enable_push && stream.pushable();
                        self.tasks.push(stream.eat_request(promised));
                    }
                }
                Intent::Reset(stream_id, code) => {
                    if let Err(err) = self.reset_stream(stream_id, code) {
                        debug!(stream_id, error = %err, "reset failed");
                    }
                }
            }
        }
    }

    /// A handler finished: submit its response, pushing first if it carries
    /// a promise
    fn complete(&mut self, done: Completion) {
        let stream_id = done.stream_id;
        let Some(stream) = self.table.find(stream_id) else {
            debug!(stream_id, "stream closed before its response was ready");
            return;
        };
        if let Some(promised) = done.promised {
            stream.set_response(promised);
            stream.migrate_to_promise();
        }
        stream.set_response(done.response);

        if stream.has_promise() {
            if let Err(err) = self.submit_push_promise(stream_id) {
                debug!(stream_id, error = %err, "push skipped");
            }
        }
        if let Err(err) = self.submit_response(stream_id) {
            warn!(stream_id, error = %err, "response not submitted");
        }
    }

    /// Let a stream with deferred output produce DATA again
    pub fn resume(&mut self, stream_id: StreamId) -> Result<()> {
        if self.table.find(stream_id).is_none() {
            return Err(Error::StreamNotFound(stream_id));
        }
        self.engine.resume_data(stream_id)
    }

    /// Hand the stream's live response to the engine
    pub fn submit_response(&mut self, stream_id: StreamId) -> Result<()> {
        let Some(stream) = self.table.find(stream_id) else {
            return Err(Error::StreamNotFound(stream_id));
        };
        let Some(response) = stream.commit_response(false) else {
            return Err(Error::Internal(format!("no response on stream {}", stream_id)));
        };
        self.engine
            .submit_response(stream_id, response.header_fields(), response.body().clone())
    }

    /// Announce the stream's promised response with PUSH_PROMISE and submit
    /// it on the newly reserved stream
    ///
    /// Returns the promised stream id.
    pub fn submit_push_promise(&mut self, stream_id: StreamId) -> Result<StreamId> {
        if self.table.len() >= self.table.max_streams() {
            return Err(Error::TooManyStreams);
        }
        let Some(stream) = self.table.find(stream_id) else {
            return Err(Error::StreamNotFound(stream_id));
        };
        let Some(promised) = stream.commit_response(true) else {
            return Err(Error::Internal(format!("no promised response on stream {}", stream_id)));
        };

        let request = stream.request().clone();
        let request = match promised.push_path() {
            Some(path) if path != request.path() => Rc::new(request.promised(path)),
            _ => request,
        };

        let promised_id = self
            .engine
            .submit_push_promise(stream_id, request.header_fields())?;
        debug!(stream_id, promised_id, path = request.path(), "pushing");
        self.create_stream(promised_id, Some(request))?;
        if let Some(stream) = self.table.find(promised_id) {
            stream.set_response(promised);
        }
        self.submit_response(promised_id)?;
        Ok(promised_id)
    }

    /// Open a stream for `request` (client role); returns its id
    pub fn submit_request(&mut self, request: Rc<Request>) -> Result<StreamId> {
        if self.table.len() >= self.table.max_streams() {
            return Err(Error::TooManyStreams);
        }
        request.validate()?;
        let body = Bytes::copy_from_slice(request.body());
        let stream_id = self.engine.submit_request(request.header_fields(), body)?;
        self.create_stream(stream_id, Some(request))?;
        if let Some(stream) = self.table.find(stream_id) {
            stream.inbound = Inbound::Response;
        }
        self.requests_sent = true;
        Ok(stream_id)
    }

    /// Queue a request (client role)
    ///
    /// The request is submitted by [`process`](Self::process) as soon as the
    /// stream limits allow; the receiver resolves when its stream closes.
    pub fn send_request(&mut self, request: Request) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        self.remaining_reqs.push_back((Rc::new(request), tx));
        rx
    }

    /// Submit queued requests while there is room
    pub fn handle_remaining_reqs(&mut self) -> usize {
        let mut submitted = 0;
        while self.table.len() < self.table.max_streams() && !self.closing {
            let Some((request, waiter)) = self.remaining_reqs.pop_front() else {
                break;
            };
            match self.submit_request(request.clone()) {
                Ok(stream_id) => {
                    if let Some(stream) = self.table.find(stream_id) {
                        stream.set_waiter(waiter);
                    }
                    submitted += 1;
                }
                Err(Error::TooManyStreams) => {
                    // peer limit reached; retry once a stream closes
                    self.remaining_reqs.push_front((request, waiter));
                    break;
                }
                Err(err) => {
                    let _ = waiter.send(Err(err));
                }
            }
        }
        submitted
    }

    /// End a client session once every queued request completed
    fn finish_client(&mut self) {
        if self.requests_sent && !self.closing && self.remaining_reqs.is_empty() && self.table.is_empty() {
            debug!("all requests completed");
            self.closing = true;
            self.engine.terminate_session(ErrorCode::NoError);
        }
    }

    /// Add a stream to the table
    pub fn create_stream(&mut self, stream_id: StreamId, request: Option<Rc<Request>>) -> Result<()> {
        self.table.create(stream_id, request).map(|_| ())
    }

    /// Remove and destroy a stream
    pub fn close_stream(&mut self, stream_id: StreamId) {
        self.table.close(stream_id, Err(Error::StreamClosed(stream_id)));
    }

    pub fn find_stream(&mut self, stream_id: StreamId) -> Option<&mut Stream> {
        self.table.find(stream_id)
    }

    /// RST_STREAM the stream and destroy it now
    pub fn reset_stream(&mut self, stream_id: StreamId, code: ErrorCode) -> Result<()> {
        let engine = self.engine.reset_stream(stream_id, code);
        let local = self.table.close(stream_id, Err(Error::Reset(stream_id, code)));
        match engine {
            Err(Error::StreamNotFound(_)) if local => Ok(()),
            other => other,
        }
    }

    /// Stop processing and destroy every stream; safe to call repeatedly
    pub fn shutdown(&mut self) {
        self.shutdown.shutdown();
        if self.done {
            return;
        }
        self.done = true;
        self.tasks = FuturesUnordered::new();
        self.table.clear();
        for (_, waiter) in self.remaining_reqs.drain(..) {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn pending_streams(&self) -> usize {
        self.table.len()
    }

    /// Exchanges the server pushed (client role)
    pub fn take_pushed(&mut self) -> Vec<(Rc<Request>, Response)> {
        self.table.take_pushed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::engine::{FrameEvents, FrameInfo, HeadersCategory};
    use crate::http::h2::H2ClientBuilder;
    use crate::http::Method;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::Notify;
    use tokio::task::{spawn_local, LocalSet};

    struct Ignore;

    impl FrameEvents for Ignore {
        fn on_begin_headers(&mut self, _stream_id: u32, _category: HeadersCategory) {}
        fn on_header(&mut self, _stream_id: u32, _name: &str, _value: &str) {}
        fn on_data_chunk_recv(&mut self, _stream_id: u32, _data: &[u8]) {}
        fn on_frame_recv(&mut self, _frame: &FrameInfo) {}
        fn on_stream_close(&mut self, _stream_id: u32, _code: ErrorCode) {}
    }

    fn server() -> Connection<DuplexStream> {
        let (io, _peer) = duplex(1024);
        Connection::new(io, Rc::new(Routes::new()), ConnectionConfig::server())
    }

    #[test]
    fn test_pending_streams_and_ceiling() {
        let mut conn = server();
        for i in 0..100u32 {
            conn.create_stream(2 * i + 1, None).unwrap();
        }
        assert_eq!(conn.pending_streams(), 100);
        assert!(matches!(conn.create_stream(201, None), Err(Error::TooManyStreams)));
        assert_eq!(conn.pending_streams(), 100);
    }

    #[test]
    fn test_create_existing_stream_rejected() {
        let mut conn = server();
        conn.create_stream(1, None).unwrap();
        assert!(conn.create_stream(1, None).is_err());
    }

    #[test]
    fn test_find_after_close() {
        let mut conn = server();
        conn.create_stream(1, None).unwrap();
        assert!(conn.find_stream(1).is_some());

        conn.close_stream(1);
        assert!(conn.find_stream(1).is_none());
        assert_eq!(conn.pending_streams(), 0);
    }

    #[test]
    fn test_shutdown_drops_streams() {
        let mut conn = server();
        for id in [1, 3, 5] {
            conn.create_stream(id, None).unwrap();
        }
        let handle = conn.shutdown_handle();

        conn.shutdown();
        assert_eq!(conn.pending_streams(), 0);
        assert!(handle.is_shutdown());
        conn.shutdown();
        assert_eq!(conn.pending_streams(), 0);
    }

    #[test]
    fn test_unknown_stream_operations() {
        let mut conn = server();
        assert!(matches!(conn.resume(7), Err(Error::StreamNotFound(7))));
        assert!(matches!(conn.submit_response(7), Err(Error::StreamNotFound(7))));
        assert!(matches!(conn.submit_push_promise(7), Err(Error::StreamNotFound(7))));
    }

    #[test]
    fn test_client_requests_queue_until_submitted() {
        let (io, _peer) = duplex(1024);
        let mut config = ConnectionConfig::client();
        config.max_streams = 1;
        let mut conn = Connection::new(io, Rc::new(Routes::new()), config);

        let first = conn.send_request(Request::builder().path("/a").authority("x").build());
        let _second = conn.send_request(Request::builder().path("/b").authority("x").build());
        assert_eq!(conn.handle_remaining_reqs(), 1);
        assert_eq!(conn.pending_streams(), 1);
        assert_eq!(conn.find_stream(1).unwrap().request().path(), "/a");

        conn.shutdown();
        drop(conn);
        let mut first = first;
        assert!(matches!(first.try_recv(), Ok(Err(Error::ConnectionClosed))));
    }

    #[test]
    fn test_engine_settings_per_role() {
        let server = ConnectionConfig::server().engine_settings();
        assert_eq!(server.get_max_concurrent_streams(), Some(DEFAULT_MAX_STREAMS as u32));

        let mut client = ConnectionConfig::client();
        client.enable_push = false;
        assert!(!client.engine_settings().get_enable_push());
    }

    #[test]
    fn test_submit_request_rejects_incomplete_request() {
        let (io, _peer) = duplex(1024);
        let mut conn = Connection::new(io, Rc::new(Routes::new()), ConnectionConfig::client());
        let mut request = Request::new();
        request.add_header(":method", Method::Get.as_str()).unwrap();

        assert!(conn.submit_request(Rc::new(request)).is_err());
        assert_eq!(conn.pending_streams(), 0);
    }

    #[tokio::test]
    async fn test_push_completion_opens_promised_stream() {
        let mut routes = Routes::new();
        routes.add_on_push(
            "/index.html",
            |req, mut rep: Response| async move {
                rep.set_body("<html>");
                Ok((req, rep))
            },
            |req, mut rep: Response| async move {
                rep.set_body("body{}");
                Ok((req, rep))
            },
        );
        let (io, _peer) = duplex(64 * 1024);
        let mut conn = Connection::new(io, Rc::new(routes), ConnectionConfig::server());

        // the client side of the exchange, fed straight into the server engine
        let mut client = H2Session::new(Role::Client, Settings::new());
        let request = Request::builder().path("/index.html").authority("localhost").build();
        client.submit_request(request.header_fields(), Bytes::new()).unwrap();
        while let Some(bytes) = client.prepare_send(&mut Ignore) {
            conn.engine.receive(&bytes, &mut conn.table).unwrap();
        }
        conn.drain_intents();

        let done = conn.tasks.next().await.unwrap();
        assert_eq!(done.stream_id, 1);
        assert!(done.promised.is_some());
        conn.complete(done);

        assert_eq!(conn.pending_streams(), 2);
        let push_path = conn.table.routes().push_path().map(str::to_string);
        assert!(conn.find_stream(1).unwrap().pushable());

        let pushed = conn.find_stream(2).unwrap();
        assert!(pushed.pushable());
        assert_eq!(Some(pushed.request().path().to_string()), push_path);
    }

    #[tokio::test]
    async fn test_shutdown_while_handlers_pending() {
        LocalSet::new()
            .run_until(async {
                let started = Rc::new(Notify::new());
                let running = Rc::new(Cell::new(0));
                let mut routes = Routes::new();
                let (notify, count) = (started.clone(), running.clone());
                routes.add(Method::Get, "/hang", move |req, rep: Response| {
                    let (notify, count) = (notify.clone(), count.clone());
                    async move {
                        count.set(count.get() + 1);
                        notify.notify_one();
                        std::future::pending::<()>().await;
                        Ok((req, rep))
                    }
                });

                let (client_io, server_io) = duplex(64 * 1024);
                let mut conn = Connection::new(server_io, Rc::new(routes), ConnectionConfig::server());
                let handle = conn.shutdown_handle();
                let server = spawn_local(async move {
                    let result = conn.process().await;
                    (result, conn.pending_streams())
                });

                let client = spawn_local(async move {
                    let mut conn = H2ClientBuilder::new().build(client_io).unwrap();
                    let waiters: Vec<_> = (0..3)
                        .map(|_| conn.send_request(Request::builder().path("/hang").authority("x").build()))
                        .collect();
                    let _ = conn.process().await;
                    let mut settled = 0;
                    for waiter in waiters {
                        if !matches!(waiter.await, Ok(Ok(_))) {
                            settled += 1;
                        }
                    }
                    settled
                });

                while running.get() < 3 {
                    started.notified().await;
                }
                handle.shutdown();

                let (result, pending) = server.await.unwrap();
                assert!(result.is_ok());
                assert_eq!(pending, 0);
                assert_eq!(client.await.unwrap(), 3);
            })
            .await;
    }
}
