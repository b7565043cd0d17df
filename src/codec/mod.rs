//! Wire framing for the beacon and reference station protocols.
//!
//! Both protocols are tiny fixed-layout byte frames. Encoding never pads or
//! truncates and decoding is strict: anything that does not match the layout
//! byte-for-byte is a [`ProtocolViolation`].
use thiserror::Error;

pub mod beacon;
pub mod reference;

pub use beacon::{
    check_completion, encode_beacon_command, frame_message_len, BeaconCommand, Destination,
};
pub use reference::{
    decode_reference_request, decode_reference_response, encode_reference_request,
    encode_reference_response, response_body_len, Command, MeasurementType, ReferenceRequest,
    ReferenceResponse, ResponseValue, Signal,
};

/// Protocol version byte shared by both frame formats.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;
/// Trailing status byte of a beacon command.
pub const NUL: u8 = 0x00;
/// Sent by the beacon after each packet while a transmission is under way.
pub const TXG: u8 = 0x16;
/// Terminator of reference frames.
pub const EOT: u8 = 0x04;

/// Keep-alive probe sent to idle hardware links.
pub const KEEP_ALIVE: &[u8] = b"Keep-Alive\x00\x00\x00";

/// A frame that does not follow the wire layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("wrong protocol version: expected {expected:#04x}, got {found:#04x}")]
    Version { expected: u8, found: u8 },

    #[error("bad terminator: expected {expected:#04x}, got {found:#04x}")]
    Terminator { expected: u8, found: u8 },

    #[error("unknown signal code {0:#04x}")]
    UnknownSignal(u8),

    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),

    #[error("wrong frame length: expected {expected} bytes, got {found}")]
    Length { expected: usize, found: usize },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unsupported response type tag {0:#04x}")]
    UnknownTypeTag(u8),

    #[error("transmission ended with {0:#04x} instead of ACK")]
    CompletionStatus(u8),

    #[error("completion length check mismatch: expected {expected:#04x}, got {found:#04x}")]
    LengthCheck { expected: u8, found: u8 },
}

/// Render frame bytes for logs.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}
