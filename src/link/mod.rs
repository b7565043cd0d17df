//! Long-lived sessions with a single piece of hardware.
//!
//! A [`Link`] owns at most one live [`Connection`]. Its listener hands each
//! accepted connection to the link's [`SessionHandler`], which keeps the
//! session alive with periodic probes until the peer goes quiet. Commands
//! are sent through [`Link::send_command`]; the connection mutex makes the
//! keep-alive loop and command senders take turns, so their bytes never
//! interleave on the wire.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::codec::{hex_dump, ProtocolViolation, ACK, KEEP_ALIVE};
use crate::transport::{
    is_timeout, Connection, ConnectionHandler, ListenConfig, TransportError, TransportServer,
};

pub mod beacon;
pub mod reference;

pub use beacon::BeaconLink;
pub use reference::ReferenceLink;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no hardware connected")]
    NotConnected,

    #[error("peer closed the connection")]
    Closed,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("keep-alive answered with {0:#04x} instead of ACK")]
    KeepAliveRejected(u8),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        if is_timeout(&e) {
            LinkError::Timeout
        } else if e.kind() == io::ErrorKind::UnexpectedEof {
            LinkError::Closed
        } else {
            LinkError::Io(e)
        }
    }
}

/// How a command exchange ended when the connection survived it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome<R> {
    /// The peer acknowledged and the reply was read.
    Acked(R),
    /// Every attempt went unacknowledged.
    NoResponse { attempts: u32 },
}

impl<R> CommandOutcome<R> {
    pub fn is_acked(&self) -> bool {
        matches!(self, CommandOutcome::Acked(_))
    }
}

#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub name: String,
    /// Deadline for each status byte or reply.
    pub io_timeout: Duration,
    /// Idle time between keep-alive probes.
    pub keepalive_interval: Duration,
    /// Writes per command before giving up.
    pub repeat_attempts: u32,
    /// How long a sender waits for hardware to (re)connect.
    pub connect_wait: Duration,
}

impl LinkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            io_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            repeat_attempts: 10,
            connect_wait: Duration::from_secs(10),
        }
    }

    /// Longest a command can hold a caller: waiting for the hardware, every
    /// attempt going unanswered, then one reply deadline.
    pub fn worst_case_exchange(&self) -> Duration {
        self.connect_wait + self.io_timeout * self.repeat_attempts.max(1) + self.io_timeout
    }
}

#[derive(Default)]
struct Slot {
    conn: Option<Connection>,
    session: u64,
    last_ok: Option<Instant>,
}

pub struct Link {
    config: LinkConfig,
    slot: Mutex<Slot>,
    changed: Condvar,
    busy: AtomicBool,
    sessions: AtomicU64,
}

impl Link {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot: Mutex::new(Slot::default()),
            changed: Condvar::new(),
            busy: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.lock().conn.is_some()
    }

    /// A command exchange is in progress.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Connected, but nothing has been acknowledged for longer than a
    /// keep-alive round should take.
    pub fn is_stale(&self) -> bool {
        let slot = self.lock();
        match (&slot.conn, slot.last_ok) {
            (Some(_), Some(at)) => {
                at.elapsed() > self.config.keepalive_interval + self.config.io_timeout
            }
            _ => false,
        }
    }

    /// Handler for this link's listener.
    pub fn handler(self: &Arc<Self>) -> SessionHandler {
        SessionHandler(Arc::clone(self))
    }

    /// Bind the link's listener.
    pub fn listen(
        self: &Arc<Self>,
        listen: &ListenConfig,
    ) -> Result<TransportServer<SessionHandler>, TransportError> {
        listen.builder()?.handler(self.handler()).bind()
    }

    /// Send `frame` until the peer answers ACK, then let `read_reply` read
    /// whatever follows the ACK.
    ///
    /// A NAK, any other byte or silence counts as one failed attempt; after
    /// `repeat_attempts` of them the result is [`CommandOutcome::NoResponse`].
    /// A write failure, a closed peer or a bad reply drops the connection
    /// and is returned as an error.
    pub fn send_command<R, F>(&self, frame: &[u8], mut read_reply: F) -> Result<CommandOutcome<R>, LinkError>
    where
        F: FnMut(&mut Connection) -> Result<R, LinkError>,
    {
        let mut exclusive = self.acquire()?;
        let attempts = self.config.repeat_attempts.max(1);
        for attempt in 1..=attempts {
            debug!(
                "{}: sending {} (attempt {}/{})",
                self.name(),
                hex_dump(frame),
                attempt,
                attempts
            );
            let conn = exclusive.conn()?;
            if let Err(e) = conn.write_frame(frame) {
                warn!("{}: write failed: {}", self.name(), e);
                exclusive.drop_connection();
                return Err(e.into());
            }
            match conn.read_byte(self.config.io_timeout) {
                Ok(Some(ACK)) => {
                    return match read_reply(conn) {
                        Ok(reply) => {
                            exclusive.touch();
                            Ok(CommandOutcome::Acked(reply))
                        }
                        Err(e) => {
                            warn!("{}: reading reply failed: {}", self.name(), e);
                            exclusive.drop_connection();
                            Err(e)
                        }
                    };
                }
                Ok(Some(other)) => {
                    debug!("{}: peer answered {:#04x}, resending", self.name(), other);
                }
                Ok(None) => {
                    info!("{}: peer closed the connection", self.name());
                    exclusive.drop_connection();
                    return Err(LinkError::Closed);
                }
                Err(e) if is_timeout(&e) => {
                    debug!(
                        "{}: no answer within {:?}, resending",
                        self.name(),
                        self.config.io_timeout
                    );
                }
                Err(e) => {
                    warn!("{}: read failed: {}", self.name(), e);
                    exclusive.drop_connection();
                    return Err(e.into());
                }
            }
        }
        warn!("{}: no ACK after {} attempts", self.name(), attempts);
        Ok(CommandOutcome::NoResponse { attempts })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a connection and take the slot for one command exchange.
    fn acquire(&self) -> Result<Exclusive<'_>, LinkError> {
        let slot = self.lock();
        let (slot, _) = self
            .changed
            .wait_timeout_while(slot, self.config.connect_wait, |s| s.conn.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if slot.conn.is_none() {
            return Err(LinkError::NotConnected);
        }
        self.busy.store(true, Ordering::SeqCst);
        Ok(Exclusive { link: self, slot })
    }

    fn attach(&self, conn: Connection) -> u64 {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.lock();
        if let Some(old) = slot.conn.replace(conn) {
            info!("{}: replacing connection to {}", self.name(), old.peer_addr());
        }
        slot.session = session;
        slot.last_ok = Some(Instant::now());
        self.changed.notify_all();
        session
    }

    fn run_session(&self, conn: Connection) -> Result<(), LinkError> {
        let peer = conn.peer_addr();
        let session = self.attach(conn);
        let _detach = Detach {
            link: self,
            session,
        };
        info!("{}: hardware connected from {}", self.name(), peer);

        loop {
            let slot = self.lock();
            let (mut slot, _) = self
                .changed
                .wait_timeout_while(slot, self.config.keepalive_interval, |s| {
                    s.session == session && s.conn.is_some()
                })
                .unwrap_or_else(PoisonError::into_inner);
            if slot.session != session {
                return Ok(());
            }
            let Some(conn) = slot.conn.as_mut() else {
                info!("{}: connection to {} dropped", self.name(), peer);
                return Ok(());
            };
            conn.write_frame(KEEP_ALIVE)?;
            match conn.read_byte(self.config.io_timeout)? {
                Some(ACK) => {
                    debug!("{}: keep-alive acknowledged", self.name());
                    slot.last_ok = Some(Instant::now());
                }
                Some(other) => return Err(LinkError::KeepAliveRejected(other)),
                None => return Err(LinkError::Closed),
            }
        }
    }
}

/// Serves a link's listener.
pub struct SessionHandler(Arc<Link>);

impl SessionHandler {
    pub fn link(&self) -> &Arc<Link> {
        &self.0
    }
}

impl ConnectionHandler for SessionHandler {
    type Error = LinkError;

    fn on_connect(&self, conn: Connection) -> Result<(), LinkError> {
        self.0.run_session(conn)
    }
}

/// The slot held for one command exchange. Clears `busy` on every exit.
struct Exclusive<'a> {
    link: &'a Link,
    slot: MutexGuard<'a, Slot>,
}

impl Exclusive<'_> {
    fn conn(&mut self) -> Result<&mut Connection, LinkError> {
        self.slot.conn.as_mut().ok_or(LinkError::NotConnected)
    }

    fn touch(&mut self) {
        self.slot.last_ok = Some(Instant::now());
    }

    fn drop_connection(&mut self) {
        self.slot.conn = None;
        self.slot.last_ok = None;
    }
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        self.link.busy.store(false, Ordering::SeqCst);
        self.link.changed.notify_all();
    }
}

/// Ends a session: closes its connection unless a newer one replaced it.
struct Detach<'a> {
    link: &'a Link,
    session: u64,
}

impl Drop for Detach<'_> {
    fn drop(&mut self) {
        let mut slot = self.link.lock();
        if slot.session == self.session && slot.conn.take().is_some() {
            slot.last_ok = None;
            info!("{}: hardware disconnected", self.link.name());
        }
        self.link.changed.notify_all();
    }
}
