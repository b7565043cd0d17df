//! Reference station request/response frames.
//!
//! ```text
//! request:  <version> <routing id> <signal> <command> <param> <EOT>
//! response: <version> <signal> <length N> <type tag> <N bytes> <EOT>
//! ```
use std::fmt;

use super::{ProtocolViolation, EOT, PROTOCOL_VERSION};

/// Every request is exactly this long.
pub const REQUEST_LEN: usize = 6;
/// Response bytes before the variable body.
pub const RESPONSE_HEADER_LEN: usize = 4;
/// Response framing overhead (header plus terminator).
pub const RESPONSE_OVERHEAD: usize = RESPONSE_HEADER_LEN + 1;
/// Largest body a one-byte length can describe.
pub const MAX_RESPONSE_BODY: usize = u8::MAX as usize;

/// Control signal carried by requests and responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    Nul,
    Ack,
    Nak,
    Eot,
    Enq,
}

impl Signal {
    pub const fn code(self) -> u8 {
        match self {
            Signal::Nul => 0x00,
            Signal::Eot => 0x04,
            Signal::Enq => 0x05,
            Signal::Ack => 0x06,
            Signal::Nak => 0x15,
        }
    }
}

impl TryFrom<u8> for Signal {
    type Error = ProtocolViolation;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(Signal::Nul),
            0x04 => Ok(Signal::Eot),
            0x05 => Ok(Signal::Enq),
            0x06 => Ok(Signal::Ack),
            0x15 => Ok(Signal::Nak),
            other => Err(ProtocolViolation::UnknownSignal(other)),
        }
    }
}

/// Operation requested from a station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Null,
    Measure,
    Noop,
    Status,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::Null => 0x00,
            Command::Measure => 0x01,
            Command::Noop => 0x02,
            Command::Status => 0x03,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolViolation;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(Command::Null),
            0x01 => Ok(Command::Measure),
            0x02 => Ok(Command::Noop),
            0x03 => Ok(Command::Status),
            other => Err(ProtocolViolation::UnknownCommand(other)),
        }
    }
}

/// Parameter of a [`Command::Measure`] request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeasurementType {
    Temperature,
    Pressure,
}

impl MeasurementType {
    pub const fn code(self) -> u8 {
        match self {
            MeasurementType::Temperature => 0x01,
            MeasurementType::Pressure => 0x02,
        }
    }
}

/// A request routed to one reference station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReferenceRequest {
    pub routing_id: u8,
    pub signal: Signal,
    pub command: Command,
    pub param: u8,
}

impl ReferenceRequest {
    /// Ask station `routing_id` for a fresh measurement.
    pub fn measure(routing_id: u8, kind: MeasurementType) -> Self {
        Self {
            routing_id,
            signal: Signal::Enq,
            command: Command::Measure,
            param: kind.code(),
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        encode_reference_request(self)
    }
}

pub fn encode_reference_request(req: &ReferenceRequest) -> [u8; REQUEST_LEN] {
    [
        PROTOCOL_VERSION,
        req.routing_id,
        req.signal.code(),
        req.command.code(),
        req.param,
        EOT,
    ]
}

pub fn decode_reference_request(data: &[u8]) -> Result<ReferenceRequest, ProtocolViolation> {
    if data.len() != REQUEST_LEN {
        return Err(ProtocolViolation::Length {
            expected: REQUEST_LEN,
            found: data.len(),
        });
    }
    check_version(data[0])?;
    check_terminator(data[REQUEST_LEN - 1])?;
    Ok(ReferenceRequest {
        routing_id: data[1],
        signal: Signal::try_from(data[2])?,
        command: Command::try_from(data[3])?,
        param: data[4],
    })
}

/// Typed value carried in a response body, selected by the type tag.
///
/// Tags follow the station firmware's packing characters; multi-byte values
/// are little-endian.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseValue {
    Empty,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
}

impl ResponseValue {
    fn tag(&self) -> u8 {
        match self {
            ResponseValue::Empty => 0x00,
            ResponseValue::Bool(_) => b'?',
            ResponseValue::I8(_) => b'b',
            ResponseValue::U8(_) => b'B',
            ResponseValue::I16(_) => b'h',
            ResponseValue::U16(_) => b'H',
            ResponseValue::I32(_) => b'i',
            ResponseValue::U32(_) => b'I',
            ResponseValue::I64(_) => b'q',
            ResponseValue::U64(_) => b'Q',
            ResponseValue::F32(_) => b'f',
            ResponseValue::F64(_) => b'd',
            ResponseValue::Bytes(_) => b's',
        }
    }

    fn to_body(&self) -> Vec<u8> {
        match self {
            ResponseValue::Empty => Vec::new(),
            ResponseValue::Bool(v) => vec![u8::from(*v)],
            ResponseValue::I8(v) => v.to_le_bytes().to_vec(),
            ResponseValue::U8(v) => vec![*v],
            ResponseValue::I16(v) => v.to_le_bytes().to_vec(),
            ResponseValue::U16(v) => v.to_le_bytes().to_vec(),
            ResponseValue::I32(v) => v.to_le_bytes().to_vec(),
            ResponseValue::U32(v) => v.to_le_bytes().to_vec(),
            ResponseValue::I64(v) => v.to_le_bytes().to_vec(),
            ResponseValue::U64(v) => v.to_le_bytes().to_vec(),
            ResponseValue::F32(v) => v.to_le_bytes().to_vec(),
            ResponseValue::F64(v) => v.to_le_bytes().to_vec(),
            ResponseValue::Bytes(v) => v.clone(),
        }
    }
}

impl fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseValue::Empty => write!(f, "(empty)"),
            ResponseValue::Bool(v) => write!(f, "{}", v),
            ResponseValue::I8(v) => write!(f, "{}", v),
            ResponseValue::U8(v) => write!(f, "{}", v),
            ResponseValue::I16(v) => write!(f, "{}", v),
            ResponseValue::U16(v) => write!(f, "{}", v),
            ResponseValue::I32(v) => write!(f, "{}", v),
            ResponseValue::U32(v) => write!(f, "{}", v),
            ResponseValue::I64(v) => write!(f, "{}", v),
            ResponseValue::U64(v) => write!(f, "{}", v),
            ResponseValue::F32(v) => write!(f, "{}", v),
            ResponseValue::F64(v) => write!(f, "{}", v),
            ResponseValue::Bytes(v) => write!(f, "0x{}", hex::encode_upper(v)),
        }
    }
}

/// A station's answer to a [`ReferenceRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceResponse {
    pub signal: Signal,
    pub type_tag: u8,
    pub body: Vec<u8>,
}

impl ReferenceResponse {
    /// Successful response carrying `value`.
    pub fn with_value(value: &ResponseValue) -> Self {
        Self {
            signal: Signal::Ack,
            type_tag: value.tag(),
            body: value.to_body(),
        }
    }

    /// Empty NAK response, used when a station could not be reached.
    pub fn unavailable() -> Self {
        Self {
            signal: Signal::Nak,
            type_tag: 0x00,
            body: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolViolation> {
        encode_reference_response(self)
    }

    /// Interpret the body according to the type tag.
    pub fn value(&self) -> Result<ResponseValue, ProtocolViolation> {
        let body = self.body.as_slice();
        let value = match self.type_tag {
            0x00 => {
                fixed::<0>(body)?;
                ResponseValue::Empty
            }
            b'?' => ResponseValue::Bool(fixed::<1>(body)?[0] != 0),
            b'b' => ResponseValue::I8(i8::from_le_bytes(fixed(body)?)),
            b'B' => ResponseValue::U8(fixed::<1>(body)?[0]),
            b'h' => ResponseValue::I16(i16::from_le_bytes(fixed(body)?)),
            b'H' => ResponseValue::U16(u16::from_le_bytes(fixed(body)?)),
            b'i' | b'l' => ResponseValue::I32(i32::from_le_bytes(fixed(body)?)),
            b'I' | b'L' => ResponseValue::U32(u32::from_le_bytes(fixed(body)?)),
            b'q' => ResponseValue::I64(i64::from_le_bytes(fixed(body)?)),
            b'Q' => ResponseValue::U64(u64::from_le_bytes(fixed(body)?)),
            b'f' => ResponseValue::F32(f32::from_le_bytes(fixed(body)?)),
            b'd' => ResponseValue::F64(f64::from_le_bytes(fixed(body)?)),
            b's' => ResponseValue::Bytes(body.to_vec()),
            other => return Err(ProtocolViolation::UnknownTypeTag(other)),
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(body: &[u8]) -> Result<[u8; N], ProtocolViolation> {
    body.try_into().map_err(|_| ProtocolViolation::Length {
        expected: N,
        found: body.len(),
    })
}

pub fn encode_reference_response(resp: &ReferenceResponse) -> Result<Vec<u8>, ProtocolViolation> {
    let len = u8::try_from(resp.body.len()).map_err(|_| ProtocolViolation::PayloadTooLarge {
        size: resp.body.len(),
        max: MAX_RESPONSE_BODY,
    })?;
    let mut frame = Vec::with_capacity(RESPONSE_OVERHEAD + resp.body.len());
    frame.push(PROTOCOL_VERSION);
    frame.push(resp.signal.code());
    frame.push(len);
    frame.push(resp.type_tag);
    frame.extend_from_slice(&resp.body);
    frame.push(EOT);
    Ok(frame)
}

/// Validate a response header and return the body length it announces.
///
/// Readers use this to learn how many more bytes (body plus terminator)
/// belong to the frame.
pub fn response_body_len(header: &[u8; RESPONSE_HEADER_LEN]) -> Result<usize, ProtocolViolation> {
    check_version(header[0])?;
    Signal::try_from(header[1])?;
    Ok(usize::from(header[2]))
}

pub fn decode_reference_response(data: &[u8]) -> Result<ReferenceResponse, ProtocolViolation> {
    if data.len() < RESPONSE_OVERHEAD {
        return Err(ProtocolViolation::Length {
            expected: RESPONSE_OVERHEAD,
            found: data.len(),
        });
    }
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    header.copy_from_slice(&data[..RESPONSE_HEADER_LEN]);
    let body_len = response_body_len(&header)?;
    if data.len() != RESPONSE_OVERHEAD + body_len {
        return Err(ProtocolViolation::Length {
            expected: RESPONSE_OVERHEAD + body_len,
            found: data.len(),
        });
    }
    check_terminator(data[data.len() - 1])?;
    Ok(ReferenceResponse {
        signal: Signal::try_from(header[1])?,
        type_tag: header[3],
        body: data[RESPONSE_HEADER_LEN..data.len() - 1].to_vec(),
    })
}

fn check_version(found: u8) -> Result<(), ProtocolViolation> {
    if found != PROTOCOL_VERSION {
        return Err(ProtocolViolation::Version {
            expected: PROTOCOL_VERSION,
            found,
        });
    }
    Ok(())
}

fn check_terminator(found: u8) -> Result<(), ProtocolViolation> {
    if found != EOT {
        return Err(ProtocolViolation::Terminator {
            expected: EOT,
            found,
        });
    }
    Ok(())
}
