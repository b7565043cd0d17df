//! Reference station links: the ACK is followed by a response frame.
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::codec::reference::{RESPONSE_HEADER_LEN, REQUEST_LEN};
use crate::codec::{
    decode_reference_response, hex_dump, response_body_len, MeasurementType, ReferenceRequest,
    ReferenceResponse,
};
use crate::transport::{Connection, ListenConfig, TransportError, TransportServer};

use super::{CommandOutcome, Link, LinkConfig, LinkError, SessionHandler};

pub struct ReferenceLink {
    station_id: u8,
    link: Arc<Link>,
}

impl ReferenceLink {
    pub fn new(station_id: u8, config: LinkConfig) -> Self {
        Self {
            station_id,
            link: Link::new(config),
        }
    }

    pub fn station_id(&self) -> u8 {
        self.station_id
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn listen(&self, listen: &ListenConfig) -> Result<TransportServer<SessionHandler>, TransportError> {
        self.link.listen(listen)
    }

    /// Forward `request` to the station and read its response.
    pub fn request(&self, request: &ReferenceRequest) -> Result<CommandOutcome<ReferenceResponse>, LinkError> {
        let frame: [u8; REQUEST_LEN] = request.encode();
        let timeout = self.link.config().io_timeout;
        self.link
            .send_command(&frame, |conn| read_response(conn, timeout))
    }

    pub fn measure(&self, kind: MeasurementType) -> Result<CommandOutcome<ReferenceResponse>, LinkError> {
        self.request(&ReferenceRequest::measure(self.station_id, kind))
    }
}

/// Read one response frame; `timeout` bounds the whole frame.
pub fn read_response(conn: &mut Connection, timeout: Duration) -> Result<ReferenceResponse, LinkError> {
    let deadline = Instant::now() + timeout;
    let mut frame = conn.read_exact_within(RESPONSE_HEADER_LEN, timeout)?;
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    header.copy_from_slice(&frame);
    let rest = response_body_len(&header)? + 1;
    let remaining = deadline.saturating_duration_since(Instant::now());
    frame.extend(conn.read_exact_within(rest, remaining.max(Duration::from_millis(1)))?);
    debug!("received response {}", hex_dump(&frame));
    Ok(decode_reference_response(&frame)?)
}
