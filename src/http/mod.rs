//! HTTP message layer shared by the HTTP/2 multiplexer
//!
//! This module holds the value objects exchanged between route handlers and
//! the connection multiplexer, and the route table that maps request paths to
//! asynchronous handlers.
//!
//! # Architecture
//!
//! - `Request` / `Response` are plain values; the multiplexer only feeds header
//!   fields and body chunks into them and serializes them back out.
//! - `Routes` is built once during setup, wrapped in an `Rc`, and shared by
//!   every connection of a server.
//! - The `h2` submodule contains the protocol engine and the multiplexer.
//!
//! # Examples
//!
//! ```no_run
//! use h2mux::http::{Method, Response, Routes};
//! use std::rc::Rc;
//!
//! let mut routes = Routes::new();
//! routes.add(Method::Get, "/hello", |req, mut rep: Response| async move {
//!     rep.set_body("hello");
//!     Ok((req, rep))
//! });
//! let routes = Rc::new(routes);
//! ```

pub mod h2;
pub mod headers;
pub mod message;
pub mod routes;

pub use headers::Headers;
pub use message::{Method, Request, RequestBuilder, Response, Status};
pub use routes::{BoxError, DirectoryHandler, Handler, HandlerFuture, HandlerResult, Route, Routes};

/// Result type for HTTP message operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP message errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Incomplete message: {0}")]
    Incomplete(&'static str),
}

/// Maximum number of header fields accepted per message
pub const MAX_HEADERS: usize = 128;
