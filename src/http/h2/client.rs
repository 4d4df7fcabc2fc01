//! HTTP/2 client front-end
//!
//! [`H2ClientBuilder`] turns client settings into a client-role
//! [`Connection`]. Requests are queued with [`Connection::send_request`] and
//! go out once [`Connection::process`] runs; each returns a receiver that
//! resolves when its stream closes.
//!
//! ```no_run
//! use h2mux::http::h2::H2ClientBuilder;
//! use h2mux::http::Request;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut conn = H2ClientBuilder::new().connect("127.0.0.1:8080").await?;
//! let response = conn.send_request(Request::builder().path("/").authority("localhost").build());
//! conn.process().await?;
//! println!("Status: {}", response.await??.status());
//! # Ok(())
//! # }
//! ```

use super::connection::{Connection, ConnectionConfig, DEFAULT_READ_BUFFER_SIZE};
use super::engine::Role;
use super::error::Result;
use super::settings::SettingsBuilder;
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_STREAMS};
use crate::http::Routes;
use std::rc::Rc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// HTTP/2 client builder
pub struct H2ClientBuilder {
    settings: SettingsBuilder,
    enable_push: bool,
    max_streams: usize,
    read_buffer_size: usize,
}

impl H2ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        H2ClientBuilder {
            settings: SettingsBuilder::new()
                .header_table_size(DEFAULT_HEADER_TABLE_SIZE)
                .enable_push(false)
                .initial_window_size(DEFAULT_INITIAL_WINDOW_SIZE)
                .max_frame_size(DEFAULT_MAX_FRAME_SIZE),
            enable_push: false,
            max_streams: DEFAULT_MAX_STREAMS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
        self
    }

    /// Accept server push; pushed exchanges are collected by
    /// [`Connection::take_pushed`]
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings = self.settings.enable_push(enable);
        self.enable_push = enable;
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings = self.settings.initial_window_size(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_frame_size(size);
        self
    }

    /// Advertise SETTINGS_MAX_CONCURRENT_STREAMS (limits server pushes)
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings = self.settings.max_concurrent_streams(max);
        self
    }

    /// Streams the connection keeps open at once, pushed ones included
    pub fn max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn config(self) -> Result<ConnectionConfig> {
        Ok(ConnectionConfig {
            role: Role::Client,
            settings: self.settings.build()?,
            max_streams: self.max_streams,
            read_buffer_size: self.read_buffer_size,
            enable_push: self.enable_push,
        })
    }

    /// Build a client connection over an established byte stream
    pub fn build<T>(self, io: T) -> Result<Connection<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.config()?;
        Ok(Connection::new(io, Rc::new(Routes::new()), config))
    }

    /// Connect over TCP (prior knowledge, no TLS)
    pub async fn connect(self, addr: impl ToSocketAddrs) -> Result<Connection<TcpStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "connected");
        self.build(stream)
    }
}

impl Default for H2ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
