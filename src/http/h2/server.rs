//! HTTP/2 server front-end
//!
//! [`H2ServerBuilder`] binds a listening socket (through `socket2`, so the
//! backlog and address reuse are configurable) and produces an [`H2Server`].
//! Every accepted connection is served by its own local task, which runs
//! [`Connection::process`] against the shared route table.
//!
//! The server is single-threaded: [`H2Server::serve`] must run inside a
//! `tokio::task::LocalSet`.
//!
//! ```no_run
//! use h2mux::http::h2::H2ServerBuilder;
//! use h2mux::http::{Method, Response, Routes};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut routes = Routes::new();
//! routes.add(Method::Get, "/", |req, mut rep: Response| async move {
//!     rep.set_body("hello");
//!     Ok((req, rep))
//! });
//!
//! let server = H2ServerBuilder::new().bind("127.0.0.1:8080".parse()?, routes)?;
//! tokio::task::LocalSet::new().run_until(server.serve()).await?;
//! # Ok(())
//! # }
//! ```

use super::connection::{Connection, ConnectionConfig, ShutdownHandle, DEFAULT_READ_BUFFER_SIZE};
use super::engine::Role;
use super::error::Result;
use super::settings::SettingsBuilder;
use super::DEFAULT_MAX_STREAMS;
use crate::http::Routes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 1024;

/// HTTP/2 server
pub struct H2Server {
    listener: TcpListener,
    routes: Rc<Routes>,
    config: ConnectionConfig,
    shutdown: ShutdownHandle,
}

impl H2Server {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn routes(&self) -> &Rc<Routes> {
        &self.routes
    }

    /// Stops [`serve`](Self::serve) and every connection it is running
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept one connection without running it
    pub async fn accept(&self) -> Result<Connection<TcpStream>> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(peer = %addr, "accepted connection");
        Ok(Connection::new(stream, self.routes.clone(), self.config.clone()).with_peer_addr(addr))
    }

    /// Accept connections until shutdown, serving each on a local task
    ///
    /// On shutdown every live connection is stopped as well; this returns
    /// once all of them have finished.
    pub async fn serve(&self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "serving HTTP/2");
        let mut live: Vec<(ShutdownHandle, JoinHandle<()>)> = Vec::new();
        loop {
            let conn = tokio::select! {
                _ = self.shutdown.requested() => break,
                conn = self.accept() => conn,
            };
            live.retain(|(_, task)| !task.is_finished());
            match conn {
                Ok(mut conn) => {
                    let handle = conn.shutdown_handle();
                    let task = tokio::task::spawn_local(async move {
                        if let Err(err) = conn.process().await {
                            debug!(error = %err, "connection ended with error");
                        }
                    });
                    live.push((handle, task));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }

        debug!(connections = live.len(), "stopping connections");
        for (handle, _) in &live {
            handle.shutdown();
        }
        for (_, task) in live {
            if let Err(err) = task.await {
                warn!(error = %err, "connection task failed");
            }
        }
        Ok(())
    }
}

/// HTTP/2 server builder
pub struct H2ServerBuilder {
    settings: SettingsBuilder,
    max_streams: usize,
    read_buffer_size: usize,
    enable_push: bool,
    backlog: i32,
    reuse_address: bool,
}

impl H2ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        H2ServerBuilder {
            settings: SettingsBuilder::new(),
            max_streams: DEFAULT_MAX_STREAMS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            enable_push: true,
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
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

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_header_list_size(size);
        self
    }

    /// Stream ceiling per connection, also advertised as
    /// SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Push the configured push path when it is requested
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.enable_push = enable;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn config(&self) -> Result<ConnectionConfig> {
        Ok(ConnectionConfig {
            role: Role::Server,
            settings: self.settings.clone().build()?,
            max_streams: self.max_streams,
            read_buffer_size: self.read_buffer_size,
            enable_push: self.enable_push,
        })
    }

    /// Bind and listen; must be called from within a tokio runtime
    pub fn bind(self, addr: SocketAddr, routes: Routes) -> Result<H2Server> {
        let config = self.config()?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.backlog)?;
        let listener = TcpListener::from_std(socket.into())?;

        Ok(H2Server {
            listener,
            routes: Rc::new(routes),
            config,
            shutdown: ShutdownHandle::default(),
        })
    }
}

impl Default for H2ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_builder_defaults() {
        let config = H2ServerBuilder::new().config().unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.max_streams, DEFAULT_MAX_STREAMS);
        assert!(config.enable_push);
        assert_eq!(
            config.engine_settings().get_max_concurrent_streams(),
            Some(DEFAULT_MAX_STREAMS as u32)
        );
    }

    #[test]
    fn test_server_builder_ceiling_is_advertised() {
        let config = H2ServerBuilder::new().max_streams(8).enable_push(false).config().unwrap();
        assert_eq!(config.max_streams, 8);
        assert!(!config.enable_push);
        assert_eq!(config.engine_settings().get_max_concurrent_streams(), Some(8));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = H2ServerBuilder::new()
            .backlog(16)
            .bind("127.0.0.1:0".parse().unwrap(), Routes::new())
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
