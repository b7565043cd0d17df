//! Beacon command frames.
//!
//! ```text
//! [0]       version
//! [1]       destination
//! [2]       intensity
//! [3..=4]   message length, big-endian
//! [5..=12]  reserved, zero
//! [13..n]   message bytes
//! [n]       NUL status byte
//! ```
//!
//! After acknowledging a command the beacon sends one TXG byte per packet
//! while it transmits, then ACK, then a two-byte trailer: the message length
//! modulo 255 and an unchecked NUL.
use serde::{Deserialize, Serialize};

use super::{ProtocolViolation, NUL, PROTOCOL_VERSION};

/// Fixed bytes preceding the message.
pub const BEACON_HEADER_LEN: usize = 13;
/// Reserved bytes after the length field.
pub const RESERVED_LEN: usize = 8;
/// Largest message the 16-bit length field can carry.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;
/// Bytes following the completion ACK.
pub const COMPLETION_TRAILER_LEN: usize = 2;

/// Which emitter of the beacon carries the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    #[serde(rename = "Visible")]
    Visible,
    #[serde(rename = "Infrared")]
    Infrared,
}

impl Destination {
    pub const fn wire_byte(self) -> u8 {
        match self {
            Destination::Visible => 0x01,
            Destination::Infrared => 0x02,
        }
    }
}

/// One command for the beacon, ready to be framed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeaconCommand {
    pub destination: Destination,
    pub intensity: u8,
    pub message: Vec<u8>,
}

impl BeaconCommand {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolViolation> {
        encode_beacon_command(self.destination, self.intensity, &self.message)
    }
}

/// Frame a beacon command. Messages longer than [`MAX_MESSAGE_LEN`] are rejected.
pub fn encode_beacon_command(
    destination: Destination,
    intensity: u8,
    message: &[u8],
) -> Result<Vec<u8>, ProtocolViolation> {
    let len = u16::try_from(message.len()).map_err(|_| ProtocolViolation::PayloadTooLarge {
        size: message.len(),
        max: MAX_MESSAGE_LEN,
    })?;
    let mut frame = Vec::with_capacity(BEACON_HEADER_LEN + message.len() + 1);
    frame.push(PROTOCOL_VERSION);
    frame.push(destination.wire_byte());
    frame.push(intensity);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&[0u8; RESERVED_LEN]);
    frame.extend_from_slice(message);
    frame.push(NUL);
    Ok(frame)
}

/// Message length carried in an encoded frame's length field.
pub fn frame_message_len(frame: &[u8]) -> Result<usize, ProtocolViolation> {
    if frame.len() <= BEACON_HEADER_LEN {
        return Err(ProtocolViolation::Length {
            expected: BEACON_HEADER_LEN + 1,
            found: frame.len(),
        });
    }
    let len = usize::from(u16::from_be_bytes([frame[3], frame[4]]));
    let expected = BEACON_HEADER_LEN + len + 1;
    if frame.len() != expected {
        return Err(ProtocolViolation::Length {
            expected,
            found: frame.len(),
        });
    }
    Ok(len)
}

/// Check the completion trailer against the transmitted message length.
pub fn check_completion(trailer: &[u8], message_len: usize) -> Result<(), ProtocolViolation> {
    let [check, _] = trailer else {
        return Err(ProtocolViolation::Length {
            expected: COMPLETION_TRAILER_LEN,
            found: trailer.len(),
        });
    };
    let expected = (message_len % 255) as u8;
    if *check != expected {
        return Err(ProtocolViolation::LengthCheck {
            expected,
            found: *check,
        });
    }
    Ok(())
}
