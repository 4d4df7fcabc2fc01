//! HTTP/2 protocol implementation
//!
//! This module provides the HTTP/2 connection multiplexer and the protocol
//! engine it drives.
//!
//! # Architecture
//!
//! The multiplexer and the protocol engine meet at two traits defined in
//! [`engine`]:
//!
//! - [`ProtocolEngine`]: bytes in through `receive`, frames out through
//!   `prepare_send`, plus submission of responses, pushes and requests.
//! - [`FrameEvents`]: callbacks the engine fires while doing so.
//!
//! [`Connection`] owns the socket, an engine and a [`StreamTable`] (the
//! `FrameEvents` implementation). It runs handlers from the shared
//! [`Routes`](crate::http::Routes) table on its own task and feeds their
//! responses back to the engine.
//!
//! [`H2Session`] is the bundled engine:
//!
//! - **Frame handling**: All HTTP/2 frame types (DATA, HEADERS, PRIORITY,
//!   RST_STREAM, SETTINGS, PUSH_PROMISE, PING, GOAWAY, WINDOW_UPDATE, CONTINUATION)
//! - **HPACK compression**: Header compression/decompression (via the `hpack` crate)
//! - **Flow control**: Connection and stream-level window management
//! - **Settings exchange**: Initial connection setup and configuration
//! - **Server push**: PUSH_PROMISE frames
//!
//! # Examples
//!
//! ## Serving a connection
//!
//! ```no_run
//! use h2mux::http::h2::{Connection, ConnectionConfig};
//! use h2mux::http::{Method, Response, Routes};
//! use std::rc::Rc;
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut routes = Routes::new();
//! routes.add(Method::Get, "/", |req, mut rep: Response| async move {
//!     rep.set_body("OK");
//!     Ok((req, rep))
//! });
//! let routes = Rc::new(routes);
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let (socket, _) = listener.accept().await?;
//! let mut conn = Connection::new(socket, routes, ConnectionConfig::server());
//! conn.process().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod server;
pub mod session;
pub mod settings;
pub mod state;
pub mod stream;

pub use client::H2ClientBuilder;
pub use connection::{Connection, ConnectionConfig, ShutdownHandle};
pub use dispatcher::{Intent, StreamTable};
pub use engine::{FrameEvents, FrameInfo, HeaderField, HeadersCategory, ProtocolEngine, Role};
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use server::{H2Server, H2ServerBuilder};
pub use session::H2Session;
pub use settings::{Settings, SettingsBuilder};
pub use state::{StreamId, StreamState};
pub use stream::{Completion, ResponseWaiter, Stream};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Streams a connection keeps open at once unless configured otherwise
pub const DEFAULT_MAX_STREAMS: usize = 100;
