//! Relays internal reference requests to the station they are routed to.
//!
//! An internal client connects, sends one six-byte request and gets one
//! status byte back: NAK when no station is registered under the routing
//! id, otherwise ACK followed by the station's response frame.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::codec::reference::{REQUEST_LEN, RESPONSE_HEADER_LEN};
use crate::codec::{
    decode_reference_request, decode_reference_response, hex_dump, response_body_len,
    ProtocolViolation, ReferenceRequest, ReferenceResponse, Signal, ACK, NAK,
};
use crate::link::{CommandOutcome, ReferenceLink};
use crate::transport::{Connection, ConnectionHandler, ListenConfig, TransportError, TransportServer};
use crate::window::{match_window, RecurrencePattern, Window};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// Stations by routing id. Fixed once the dispatcher starts.
#[derive(Clone, Default)]
pub struct RoutingTable {
    stations: HashMap<u8, Arc<ReferenceLink>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link` under its station id, replacing any previous one.
    pub fn register(&mut self, link: Arc<ReferenceLink>) -> Option<Arc<ReferenceLink>> {
        self.stations.insert(link.station_id(), link)
    }

    pub fn get(&self, routing_id: u8) -> Option<&Arc<ReferenceLink>> {
        self.stations.get(&routing_id)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

impl FromIterator<Arc<ReferenceLink>> for RoutingTable {
    fn from_iter<I: IntoIterator<Item = Arc<ReferenceLink>>>(iter: I) -> Self {
        let mut table = RoutingTable::new();
        for link in iter {
            table.register(link);
        }
        table
    }
}

pub struct Dispatcher {
    routes: RoutingTable,
    window: Option<RecurrencePattern>,
}

impl Dispatcher {
    pub fn new(routes: RoutingTable) -> Self {
        Self {
            routes,
            window: None,
        }
    }

    /// Log which scoring window each relayed measurement falls in.
    pub fn with_window(mut self, pattern: RecurrencePattern) -> Self {
        self.window = Some(pattern);
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// The scoring window containing `instant`, if a pattern is set.
    pub fn window_for(&self, instant: DateTime<Utc>) -> Option<Window> {
        self.window
            .as_ref()
            .and_then(|pattern| match_window(pattern, instant))
    }

    pub fn listen(self, listen: &ListenConfig) -> Result<TransportServer<Dispatcher>, TransportError> {
        listen.builder()?.handler(self).bind()
    }

    /// Ask the station and turn every failure into an empty NAK response.
    fn relay(&self, station: &ReferenceLink, request: &ReferenceRequest) -> ReferenceResponse {
        match station.request(request) {
            Ok(CommandOutcome::Acked(response)) => response,
            Ok(CommandOutcome::NoResponse { attempts }) => {
                warn!(
                    "station {} did not acknowledge after {} attempts",
                    station.station_id(),
                    attempts
                );
                ReferenceResponse::unavailable()
            }
            Err(e) => {
                warn!("station {} unavailable: {}", station.station_id(), e);
                ReferenceResponse::unavailable()
            }
        }
    }
}

impl ConnectionHandler for Dispatcher {
    type Error = DispatchError;

    fn on_connect(&self, mut conn: Connection) -> Result<(), DispatchError> {
        let timeout = conn.io_timeout();
        let bytes = conn.read_up_to(REQUEST_LEN, timeout)?;
        let request = decode_reference_request(&bytes)?;
        debug!("dispatch request {} from {}", hex_dump(&bytes), conn.peer_addr());

        let Some(station) = self.routes.get(request.routing_id) else {
            info!("no station registered under routing id {}", request.routing_id);
            conn.write_frame(&[NAK])?;
            return Ok(());
        };
        conn.write_frame(&[ACK])?;

        let response = self.relay(station, &request);
        if self.window.is_some() && response.signal == Signal::Ack {
            let now = Utc::now();
            match self.window_for(now) {
                Some(window) => info!(
                    "station {} measured inside window {} - {}",
                    request.routing_id,
                    window.start.format("%H:%M:%S"),
                    window.end.format("%H:%M:%S")
                ),
                None => info!(
                    "station {} measured outside every scoring window",
                    request.routing_id
                ),
            }
        }
        let frame = response.encode()?;
        debug!("relaying {} to {}", hex_dump(&frame), conn.peer_addr());
        conn.write_frame(&frame)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("dispatcher answered {0:#04x}")]
    UnexpectedStatus(u8),

    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// What the dispatcher made of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReply {
    /// No station under that routing id.
    Rejected,
    Response(ReferenceResponse),
}

/// Internal client of the dispatcher.
pub struct DispatcherClient {
    stream: TcpStream,
}

impl DispatcherClient {
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug, timeout: Duration) -> Result<Self, ClientError> {
        let target: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("{addr:?}")))?;
        let stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn request(&mut self, request: &ReferenceRequest) -> Result<DispatchReply, ClientError> {
        self.stream.write_all(&request.encode())?;
        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status)?;
        match status[0] {
            NAK => Ok(DispatchReply::Rejected),
            ACK => {
                let mut header = [0u8; RESPONSE_HEADER_LEN];
                self.stream.read_exact(&mut header)?;
                let mut frame = vec![0u8; RESPONSE_HEADER_LEN + response_body_len(&header)? + 1];
                frame[..RESPONSE_HEADER_LEN].copy_from_slice(&header);
                self.stream.read_exact(&mut frame[RESPONSE_HEADER_LEN..])?;
                Ok(DispatchReply::Response(decode_reference_response(&frame)?))
            }
            other => Err(ClientError::UnexpectedStatus(other)),
        }
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
