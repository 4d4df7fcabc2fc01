//! HTTP/2 stream management
//!
//! A [`Stream`] is one request/response exchange as seen by the multiplexer:
//! the request (shared, since a pushed stream reuses the request of the
//! stream that triggered the push), the live response and, for a push
//! carrier, the promised response waiting to be sent on its own stream.
//!
//! Wire-level state (windows, RFC 7540 states) lives in the engine; see
//! [`state`](super::state).

use super::error::Result;
use super::state::StreamId;
use crate::http::routes::{Handler, HandlerFuture};
use crate::http::{Request, Response, Routes, Status};
use futures::future::{FutureExt, LocalBoxFuture};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving end of a client request
pub type ResponseWaiter = oneshot::Receiver<Result<Response>>;

/// Responses produced by [`Stream::eat_request`]
#[derive(Debug)]
pub struct Completion {
    pub stream_id: StreamId,
    pub response: Response,
    /// Response of the push handler, when the exchange carries a push
    pub promised: Option<Response>,
}

/// Which message incoming header fields belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound {
    Request,
    Response,
}

/// One logical exchange on a connection
pub struct Stream {
    id: StreamId,
    request: Rc<Request>,
    response: Response,
    promised: Option<Response>,
    routes: Rc<Routes>,
    waiter: Option<oneshot::Sender<Result<Response>>>,
    pub(crate) inbound: Inbound,
    /// A header field was rejected; the stream is about to be reset
    pub(crate) malformed: bool,
}

impl Stream {
    pub fn new(id: StreamId, request: Rc<Request>, routes: Rc<Routes>) -> Self {
        Stream {
            id,
            request,
            response: Response::default(),
            promised: None,
            routes,
            waiter: None,
            inbound: Inbound::Request,
            malformed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn request(&self) -> &Rc<Request> {
        &self.request
    }

    /// Run the handler for the request
    ///
    /// The returned future owns everything it needs, so it can be polled
    /// after the stream is gone. With `promised` the push handler runs first
    /// and its response comes back as [`Completion::promised`].
    pub fn eat_request(&self, promised: bool) -> LocalBoxFuture<'static, Completion> {
        let stream_id = self.id;
        let request = self.request.clone();
        let routes = self.routes.clone();

        async move {
            let promised = match routes.handle_push() {
                Some(push_handler) if promised => {
                    let mut rep = Response::default();
                    if let Some(path) = routes.push_path() {
                        rep.set_push_path(path);
                    }
                    Some(invoke(stream_id, push_handler, request.clone(), rep).await)
                }
                _ => None,
            };
            let response = serve(stream_id, &routes, request).await;

            Completion {
                stream_id,
                response,
                promised,
            }
        }
        .boxed_local()
    }

    /// Whether the request path is the table's push path
    pub fn pushable(&self) -> bool {
        self.routes
            .push_path()
            .is_some_and(|path| path == self.request.route_path())
    }

    /// Add one request header field
    pub fn update_request(&mut self, name: &str, value: &str) -> crate::http::Result<()> {
        Rc::make_mut(&mut self.request).add_header(name, value)
    }

    pub fn update_body(&mut self, chunk: &[u8]) {
        Rc::make_mut(&mut self.request).add_body(chunk);
    }

    /// Add one response header field (client role)
    pub fn update_response(&mut self, name: &str, value: &str) -> crate::http::Result<()> {
        self.response.add_header(name, value)
    }

    pub fn update_response_body(&mut self, chunk: &[u8]) {
        let mut body = Vec::with_capacity(self.response.body().len() + chunk.len());
        body.extend_from_slice(self.response.body());
        body.extend_from_slice(chunk);
        self.response.set_body(body);
    }

    /// Hand a response over for serialization
    ///
    /// `promised` takes the promised response out of the stream; otherwise a
    /// copy of the live response is returned, which stays readable through
    /// [`get_response`](Self::get_response).
    pub fn commit_response(&mut self, promised: bool) -> Option<Response> {
        if promised {
            self.promised.take()
        } else {
            Some(self.response.clone())
        }
    }

    /// Move the live response into the promised slot and start a fresh one
    pub fn migrate_to_promise(&mut self) {
        self.promised = Some(std::mem::take(&mut self.response));
    }

    pub fn has_promise(&self) -> bool {
        self.promised.is_some()
    }

    pub fn get_response(&self) -> &Response {
        &self.response
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = response;
    }

    pub(crate) fn set_waiter(&mut self, waiter: oneshot::Sender<Result<Response>>) {
        self.waiter = Some(waiter);
    }

    /// Settle the stream once it is closed
    ///
    /// A waiting requester gets the response (or `outcome`'s error). A
    /// stream nobody waits for hands its exchange back, which is how a
    /// client collects pushed responses.
    pub(crate) fn finish(self, outcome: Result<()>) -> Option<(Rc<Request>, Response)> {
        match self.waiter {
            Some(waiter) => {
                // the requester may have stopped listening
                let _ = waiter.send(outcome.map(|()| self.response));
                None
            }
            None => outcome.ok().map(|()| (self.request, self.response)),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("path", &self.request.path())
            .field("status", &self.response.status())
            .field("promised", &self.promised.is_some())
            .finish()
    }
}

/// Pick the route for `request` and run it
async fn serve(stream_id: StreamId, routes: &Routes, request: Rc<Request>) -> Response {
    let rep = Response::default();
    let route = routes
        .route(request.path())
        .map(|route| (route.method, route.handler.clone()));

    match route {
        Some((method, handler)) if request.method() == Some(method) => {
            invoke(stream_id, handler, request, rep).await
        }
        Some(_) => Response::error(Status::METHOD_NOT_ALLOWED),
        None => match routes.directory() {
            Some(directory) => {
                let fut = call(stream_id, || directory.handle(request, rep));
                settle(stream_id, fut).await
            }
            None => Response::not_found(),
        },
    }
}

async fn invoke(stream_id: StreamId, handler: Handler, request: Rc<Request>, rep: Response) -> Response {
    let fut = call(stream_id, || handler(request, rep));
    settle(stream_id, fut).await
}

/// Create the handler future, catching a panic raised before it is returned
fn call(stream_id: StreamId, f: impl FnOnce() -> HandlerFuture) -> Option<HandlerFuture> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(fut) => Some(fut),
        Err(_) => {
            warn!(stream_id, "handler panicked");
            None
        }
    }
}

/// Await a handler; errors and panics become 500
async fn settle(stream_id: StreamId, fut: Option<HandlerFuture>) -> Response {
    let Some(fut) = fut else {
        return Response::error(Status::INTERNAL_SERVER_ERROR);
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok((_, rep))) => {
            debug!(stream_id, status = rep.status().code(), "handler finished");
            rep
        }
        Ok(Err(err)) => {
            warn!(stream_id, error = %err, "handler failed");
            Response::error(Status::INTERNAL_SERVER_ERROR)
        }
        Err(_) => {
            warn!(stream_id, "handler panicked");
            Response::error(Status::INTERNAL_SERVER_ERROR)
        }
    }
}
