//! The beacon link: a command is acknowledged, transmitted, then confirmed.
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::codec::beacon::COMPLETION_TRAILER_LEN;
use crate::codec::{
    check_completion, frame_message_len, hex_dump, BeaconCommand, ProtocolViolation, ACK, TXG,
};
use crate::scheduler::Transmitter;
use crate::transport::{Connection, ListenConfig, TransportError, TransportServer};

use super::{CommandOutcome, Link, LinkConfig, LinkError, SessionHandler};

#[derive(Clone)]
pub struct BeaconLink {
    link: Arc<Link>,
}

impl BeaconLink {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            link: Link::new(config),
        }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn listen(&self, listen: &ListenConfig) -> Result<TransportServer<SessionHandler>, TransportError> {
        self.link.listen(listen)
    }

    pub fn send_command(&self, command: &BeaconCommand) -> Result<CommandOutcome<()>, LinkError> {
        let frame = command.encode()?;
        self.send_frame(&frame)
    }

    /// Send an already encoded beacon frame and wait for the transmission
    /// to complete.
    pub fn send_frame(&self, frame: &[u8]) -> Result<CommandOutcome<()>, LinkError> {
        let message_len = frame_message_len(frame)?;
        let timeout = self.link.config().io_timeout;
        self.link
            .send_command(frame, |conn| read_completion(conn, message_len, timeout))
    }
}

impl Transmitter for BeaconLink {
    fn transmit(&self, frame: &[u8]) -> Result<CommandOutcome<()>, LinkError> {
        self.send_frame(frame)
    }
}

/// Read the progress bytes, the completion ACK and the length trailer.
/// `timeout` bounds the gap between consecutive bytes.
pub fn read_completion(
    conn: &mut Connection,
    message_len: usize,
    timeout: Duration,
) -> Result<(), LinkError> {
    let mut packets = 0u32;
    loop {
        match conn.read_byte(timeout)? {
            Some(TXG) => packets += 1,
            Some(ACK) => break,
            Some(other) => return Err(ProtocolViolation::CompletionStatus(other).into()),
            None => return Err(LinkError::Closed),
        }
    }
    let trailer = conn.read_exact_within(COMPLETION_TRAILER_LEN, timeout)?;
    debug!(
        "transmission complete after {} packets, trailer {}",
        packets,
        hex_dump(&trailer)
    );
    check_completion(&trailer, message_len)?;
    Ok(())
}
