//! Route table
//!
//! Maps request paths to asynchronous handlers. A table is populated during
//! setup, wrapped in an `Rc` and shared read-only by every connection of a
//! server.

use super::{Method, Request, Response};
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;

/// Error type handlers may fail with
pub type BoxError = Box<dyn std::error::Error>;

/// What a handler resolves to: the request it was given and the finished
/// response
pub type HandlerResult = std::result::Result<(Rc<Request>, Response), BoxError>;

/// Future returned by a handler; polled on the connection's own task
pub type HandlerFuture = LocalBoxFuture<'static, HandlerResult>;

/// Type-erased route handler
pub type Handler = Rc<dyn Fn(Rc<Request>, Response) -> HandlerFuture>;

/// Callback run once per accepted connection, before any request is read
pub type ClientCallback = Rc<dyn Fn(Option<SocketAddr>)>;

/// Fallback for paths without an exact match
pub trait DirectoryHandler {
    fn handle(&self, req: Rc<Request>, rep: Response) -> HandlerFuture;
}

impl<F> DirectoryHandler for F
where
    F: Fn(Rc<Request>, Response) -> HandlerFuture,
{
    fn handle(&self, req: Rc<Request>, rep: Response) -> HandlerFuture {
        self(req, rep)
    }
}

/// A registered handler and the verb it answers to
#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub handler: Handler,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("method", &self.method).finish_non_exhaustive()
    }
}

fn erase<F, Fut>(handler: F) -> Handler
where
    F: Fn(Rc<Request>, Response) -> Fut + 'static,
    Fut: Future<Output = HandlerResult> + 'static,
{
    Rc::new(move |req, rep| handler(req, rep).boxed_local())
}

/// Path-keyed handler table with a single push configuration
#[derive(Default)]
pub struct Routes {
    paths: HashMap<String, Route>,
    push: Option<(String, Handler)>,
    directory: Option<Box<dyn DirectoryHandler>>,
    on_client: Option<ClientCallback>,
}

impl Routes {
    pub fn new() -> Self {
        Routes::default()
    }

    /// Register `handler` for `method` on `path`
    ///
    /// Lookups are keyed by path alone, so registering the same path again
    /// replaces the previous route whatever its verb.
    pub fn add<F, Fut>(&mut self, method: Method, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Rc<Request>, Response) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.paths.insert(
            path.into(),
            Route {
                method,
                handler: erase(handler),
            },
        );
        self
    }

    /// Register a GET handler for `path` and make `push_handler` the one
    /// push handler, announced whenever `path` is requested
    ///
    /// Replaces any earlier push configuration.
    pub fn add_on_push<F, Fut, P, PFut>(
        &mut self,
        path: impl Into<String>,
        handler: F,
        push_handler: P,
    ) -> &mut Self
    where
        F: Fn(Rc<Request>, Response) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
        P: Fn(Rc<Request>, Response) -> PFut + 'static,
        PFut: Future<Output = HandlerResult> + 'static,
    {
        let path = path.into();
        self.add(Method::Get, path.clone(), handler);
        self.push = Some((path, erase(push_handler)));
        self
    }

    pub fn add_on_client<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Option<SocketAddr>) + 'static,
    {
        self.on_client = Some(Rc::new(callback));
        self
    }

    /// Install the fallback for unmatched paths; the table owns it from now on
    pub fn add_directory_handler(&mut self, handler: Box<dyn DirectoryHandler>) -> &mut Self {
        self.directory = Some(handler);
        self
    }

    /// Exact lookup; any query string is ignored
    pub fn handle(&self, path: &str) -> Option<Handler> {
        self.route(path).map(|route| route.handler.clone())
    }

    pub fn route(&self, path: &str) -> Option<&Route> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        self.paths.get(path)
    }

    pub fn handle_push(&self) -> Option<Handler> {
        self.push.as_ref().map(|(_, handler)| handler.clone())
    }

    pub fn push_path(&self) -> Option<&str> {
        self.push.as_ref().map(|(path, _)| path.as_str())
    }

    pub fn directory(&self) -> Option<&dyn DirectoryHandler> {
        self.directory.as_deref()
    }

    pub(crate) fn notify_client(&self, peer: Option<SocketAddr>) {
        if let Some(callback) = &self.on_client {
            callback(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routes")
            .field("paths", &self.paths)
            .field("push_path", &self.push_path())
            .field("directory", &self.directory.is_some())
            .finish()
    }
}
