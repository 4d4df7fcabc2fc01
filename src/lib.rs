//! h2mux - asynchronous HTTP/2 connection multiplexer
//!
//! This crate drives a synchronous, callback-driven HTTP/2 protocol engine from
//! a cooperative tokio task, multiplexing many request/response exchanges over
//! one byte stream and dispatching them to asynchronous route handlers.

pub mod http;

pub use http::h2::{Connection, ConnectionConfig, H2ClientBuilder, H2Server, H2ServerBuilder};
pub use http::{Method, Request, Response, Routes, Status};
