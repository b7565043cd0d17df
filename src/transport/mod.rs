//! TCP listeners that hand each accepted connection to a single handler.
//!
//! Connections are served one at a time: the accept loop calls the
//! handler and only accepts the next peer once the handler returns. A
//! handler that fails or panics is logged and the loop carries on, so one
//! misbehaving peer cannot take a listener down.
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use rustls::ServerConfig;
use thiserror::Error;

mod conn;
mod tls;

pub use conn::{is_timeout, Connection};
pub use tls::{TlsConfig, TlsFiles};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Receives every connection accepted by a [`TransportServer`].
pub trait ConnectionHandler: Send + Sync + 'static {
    type Error: fmt::Display;

    fn on_connect(&self, conn: Connection) -> Result<(), Self::Error>;
}

/// Where and how a listener accepts connections.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsFiles>,
    pub io_timeout: Duration,
}

impl ListenConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tls: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A server builder with this listener's settings; loads TLS material.
    pub fn builder(&self) -> Result<TransportServerBuilder<NoHandler>, TransportError> {
        let tls = self.tls.as_ref().map(TlsConfig::from_files).transpose()?;
        Ok(TransportServer::builder(&self.name, self.addr())
            .io_timeout(self.io_timeout)
            .tls(tls))
    }
}

/// Builder state before a handler has been registered.
pub struct NoHandler;

/// Builds a [`TransportServer`]. `bind` only exists once exactly one
/// handler has been registered.
pub struct TransportServerBuilder<H> {
    name: String,
    addr: String,
    tls: Option<TlsConfig>,
    io_timeout: Duration,
    handler: H,
}

impl TransportServerBuilder<NoHandler> {
    pub fn handler<H: ConnectionHandler>(self, handler: H) -> TransportServerBuilder<H> {
        TransportServerBuilder {
            name: self.name,
            addr: self.addr,
            tls: self.tls,
            io_timeout: self.io_timeout,
            handler,
        }
    }
}

impl<H> TransportServerBuilder<H> {
    pub fn tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    pub fn io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }
}

impl<H: ConnectionHandler> TransportServerBuilder<H> {
    pub fn bind(self) -> Result<TransportServer<H>, TransportError> {
        let listener = TcpListener::bind(&self.addr).map_err(|source| TransportError::Bind {
            addr: self.addr.clone(),
            source,
        })?;
        info!(
            "{}: listening on {} ({})",
            self.name,
            listener.local_addr()?,
            if self.tls.is_some() { "mTLS" } else { "plain TCP" }
        );
        Ok(TransportServer {
            name: self.name,
            listener,
            tls: self.tls.map(|t| t.server_config()),
            io_timeout: self.io_timeout,
            handler: self.handler,
        })
    }
}

pub struct TransportServer<H> {
    name: String,
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    io_timeout: Duration,
    handler: H,
}

impl TransportServer<NoHandler> {
    pub fn builder(name: impl Into<String>, addr: impl Into<String>) -> TransportServerBuilder<NoHandler> {
        TransportServerBuilder {
            name: name.into(),
            addr: addr.into(),
            tls: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
            handler: NoHandler,
        }
    }
}

impl<H: ConnectionHandler> TransportServer<H> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Accept one connection and serve it to completion.
    ///
    /// Only a failed `accept` is returned as an error. Handshake failures,
    /// handler errors and handler panics are logged.
    pub fn accept_one(&self) -> Result<SocketAddr, TransportError> {
        let (tcp, peer) = self.listener.accept()?;
        debug!("{}: accepted {}", self.name, peer);
        match self.wrap(tcp) {
            Ok(conn) => self.serve(conn, peer),
            Err(e) => warn!("{}: rejected {}: {}", self.name, peer, e),
        }
        Ok(peer)
    }

    /// Serve connections forever.
    pub fn run(&self) {
        loop {
            if let Err(e) = self.accept_one() {
                error!("{}: accept failed: {}", self.name, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    /// Run the accept loop on a named thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || self.run())
    }

    fn wrap(&self, tcp: TcpStream) -> Result<Connection, TransportError> {
        match &self.tls {
            Some(config) => Connection::tls(tcp, Arc::clone(config), self.io_timeout),
            None => Ok(Connection::plain(tcp, self.io_timeout)?),
        }
    }

    fn serve(&self, conn: Connection, peer: SocketAddr) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_connect(conn)));
        match outcome {
            Ok(Ok(())) => debug!("{}: session with {} ended", self.name, peer),
            Ok(Err(e)) => warn!("{}: session with {} ended: {}", self.name, peer, e),
            Err(_) => error!("{}: handler panicked serving {}", self.name, peer),
        }
    }
}
