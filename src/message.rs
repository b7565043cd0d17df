//! Scheduled beacon messages and their lifecycle.
//!
//! A [`ScheduledMessage`] is the persisted unit the scheduler works on. Its
//! payload is wrapped in a small HTTP-like envelope before being framed for
//! the beacon; the assembled frame is captured once and reused afterwards so
//! that what was transmitted stays auditable.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{encode_beacon_command, Destination, ProtocolViolation};
use crate::store::MessageId;

/// Largest integer payload, in bytes.
pub const MAX_INT_BYTES: usize = 256;

/// Envelope opening line.
pub const ENVELOPE_PREFIX: &[u8] = b"================INCOMING=MESSAGE================";
/// Envelope closing line.
pub const ENVELOPE_SUFFIX: &[u8] = b"===================END===MESSAGE================";
/// Envelope protocol line.
pub const ENVELOPE_PROTOCOL: &[u8] = b"CSMSG/1.0";
/// Line terminator inside the envelope.
pub const LINE_TERM: &[u8] = b"\r\n";
/// Value of the `Server` header.
pub const SERVER_IDENT: &str = concat!("CubeServer/", env!("CARGO_PKG_VERSION"));

/// Errors turning a payload into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not ASCII (byte {byte:#04x} at {index})")]
    NotAscii { index: usize, byte: u8 },

    #[error("invalid hex dump '{token}': {reason}")]
    InvalidHex { token: String, reason: String },

    #[error("invalid integer '{0}': expected a non-negative decimal number")]
    InvalidInteger(String),

    #[error("integer does not fit in {} bytes", MAX_INT_BYTES)]
    IntegerOverflow,

    #[error(transparent)]
    Frame(#[from] ProtocolViolation),
}

/// How a text payload becomes bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "hex dump")]
    HexDump,
    #[serde(rename = "integer")]
    Integer,
}

impl PayloadEncoding {
    pub fn encode(self, text: &str) -> Result<Vec<u8>, PayloadError> {
        match self {
            PayloadEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            PayloadEncoding::Ascii => {
                if let Some((index, byte)) = text.bytes().enumerate().find(|(_, b)| !b.is_ascii()) {
                    return Err(PayloadError::NotAscii { index, byte });
                }
                Ok(text.as_bytes().to_vec())
            }
            PayloadEncoding::HexDump => parse_hex_dump(text),
            PayloadEncoding::Integer => encode_integer(text),
        }
    }
}

/// Parse a hex dump such as `48 65 6C`, `0x48 0x65` or `48656C`.
pub fn parse_hex_dump(input: &str) -> Result<Vec<u8>, PayloadError> {
    let mut bytes = Vec::new();
    for token in input.split_whitespace() {
        let cleaned = token.trim_start_matches("0x").trim_start_matches("0X");
        if cleaned.is_empty() {
            continue;
        }
        let chunk = hex::decode(cleaned).map_err(|e| PayloadError::InvalidHex {
            token: token.to_string(),
            reason: e.to_string(),
        })?;
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Encode a decimal string big-endian in as few bytes as possible (at least one).
fn encode_integer(text: &str) -> Result<Vec<u8>, PayloadError> {
    let digits = text.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PayloadError::InvalidInteger(text.to_string()));
    }
    // Little-endian accumulator, flipped at the end.
    let mut acc: Vec<u8> = vec![0];
    for d in digits.bytes().map(|b| u32::from(b - b'0')) {
        let mut carry = d;
        for byte in acc.iter_mut() {
            let v = u32::from(*byte) * 10 + carry;
            *byte = (v & 0xFF) as u8;
            carry = v >> 8;
        }
        while carry > 0 {
            acc.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
        if acc.len() > MAX_INT_BYTES {
            return Err(PayloadError::IntegerOverflow);
        }
    }
    while acc.len() > 1 && acc.last() == Some(&0) {
        acc.pop();
    }
    acc.reverse();
    Ok(acc)
}

/// Message content: raw bytes, or text with a declared encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Raw {
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    Text {
        encoding: PayloadEncoding,
        text: String,
    },
}

impl Payload {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Raw {
            bytes: bytes.into(),
        }
    }

    pub fn text(encoding: PayloadEncoding, text: impl Into<String>) -> Self {
        Payload::Text {
            encoding,
            text: text.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        match self {
            Payload::Raw { bytes } => Ok(bytes.clone()),
            Payload::Text { encoding, text } => encoding.encode(text),
        }
    }
}

/// Simple position-weighted checksum carried in the envelope.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u64 = bytes
        .iter()
        .enumerate()
        .map(|(i, b)| u64::from(*b) ^ (i as u64 * 8))
        .sum();
    (sum % 255) as u8
}

/// Where a message is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MessageStatus {
    Queued,
    Scheduled,
    Transmitting,
    Transmitted,
    Missed,
    Failed,
}

/// Version of [`STATUS_TABLE`]. Bump when a persisted name changes.
pub const STATUS_TABLE_VERSION: u32 = 1;

/// Persisted name of every status.
pub const STATUS_TABLE: [(MessageStatus, &str); 6] = [
    (MessageStatus::Queued, "Queued"),
    (MessageStatus::Scheduled, "Scheduled"),
    (MessageStatus::Transmitting, "Transmitting..."),
    (MessageStatus::Transmitted, "Transmitted"),
    (MessageStatus::Missed, "Missed"),
    (MessageStatus::Failed, "Failed"),
];

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        STATUS_TABLE
            .iter()
            .find(|(status, _)| *status == self)
            .map(|(_, name)| *name)
            .unwrap_or("Unknown")
    }

    /// Scheduled or Transmitting: owned by a live scheduler.
    pub fn is_in_flight(self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Transmitting)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown message status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_TABLE
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(status, _)| *status)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl TryFrom<String> for MessageStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageStatus> for String {
    fn from(status: MessageStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A beacon message persisted in the message store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    pub scheduled_at: DateTime<Utc>,
    pub division: String,
    pub payload: Payload,
    pub destination: Destination,
    pub intensity: u8,
    /// Seconds past `scheduled_at` a late send is still acceptable.
    /// `None` uses the scheduler's configured default.
    #[serde(default)]
    pub misfire_grace: Option<u32>,
    #[serde(default)]
    pub additional_headers: Vec<(String, String)>,
    pub status: MessageStatus,
    /// Beacon frame captured when the message first went out.
    #[serde(default, with = "hex_bytes_opt")]
    pub frozen_frame: Option<Vec<u8>>,
}

impl ScheduledMessage {
    /// A new queued message for the infrared emitter at full intensity.
    pub fn new(scheduled_at: DateTime<Utc>, division: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            scheduled_at,
            division: division.into(),
            payload,
            destination: Destination::Infrared,
            intensity: u8::MAX,
            misfire_grace: None,
            additional_headers: Vec::new(),
            status: MessageStatus::Queued,
            frozen_frame: None,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_intensity(mut self, intensity: u8) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_misfire_grace(mut self, seconds: u32) -> Self {
        self.misfire_grace = Some(seconds);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.push((key.into(), value.into()));
        self
    }

    pub fn grace(&self, default_grace: u32) -> Duration {
        Duration::seconds(i64::from(self.misfire_grace.unwrap_or(default_grace)))
    }

    /// Last instant at which sending is still on time.
    pub fn deadline(&self, default_grace: u32) -> DateTime<Utc> {
        self.scheduled_at + self.grace(default_grace)
    }

    /// Whether it is too late to send at `now`.
    pub fn is_missed_at(&self, now: DateTime<Utc>, default_grace: u32) -> bool {
        now > self.deadline(default_grace)
    }

    /// Status an in-flight message falls back to after a restart.
    pub fn restart_status(&self, now: DateTime<Utc>, default_grace: u32) -> MessageStatus {
        if self.is_missed_at(now, default_grace) {
            MessageStatus::Missed
        } else {
            MessageStatus::Queued
        }
    }

    /// Envelope headers in transmission order.
    pub fn headers(&self) -> Result<Vec<(String, String)>, PayloadError> {
        let body = self.payload.to_bytes()?;
        let mut headers = vec![
            ("Division".to_string(), self.division.clone()),
            ("Server".to_string(), SERVER_IDENT.to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
            ("Checksum".to_string(), checksum(&body).to_string()),
        ];
        headers.extend(self.additional_headers.iter().cloned());
        Ok(headers)
    }

    /// The full envelope: prefix, protocol line, headers, body, suffix.
    pub fn envelope_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let body = self.payload.to_bytes()?;
        let mut lines: Vec<Vec<u8>> = vec![ENVELOPE_PREFIX.to_vec(), ENVELOPE_PROTOCOL.to_vec()];
        for (key, value) in self.headers()? {
            lines.push(format!("{}: {}", key, value).into_bytes());
        }
        lines.push(Vec::new());
        lines.push(body);
        lines.push(Vec::new());
        lines.push(ENVELOPE_SUFFIX.to_vec());
        Ok(lines.join(LINE_TERM))
    }

    /// Beacon frame for this message. Reuses the frozen frame when present.
    pub fn beacon_frame(&self) -> Result<Vec<u8>, PayloadError> {
        if let Some(frame) = &self.frozen_frame {
            return Ok(frame.clone());
        }
        let envelope = self.envelope_bytes()?;
        Ok(encode_beacon_command(self.destination, self.intensity, &envelope)?)
    }

    /// Capture the beacon frame if it has not been captured yet.
    pub fn freeze_frame(&mut self) -> Result<&[u8], PayloadError> {
        if self.frozen_frame.is_none() {
            self.frozen_frame = Some(self.beacon_frame()?);
        }
        Ok(self.frozen_frame.as_deref().unwrap_or_default())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode_upper(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        text.map(|t| hex::decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::beacon::BEACON_HEADER_LEN;

    fn hello() -> ScheduledMessage {
        ScheduledMessage::new(Utc::now(), "Talking Head", Payload::raw(b"Hello, world!".to_vec()))
    }

    #[test]
    fn checksum_matches_known_value() {
        assert_eq!(checksum(b"Hello, world!"), 124);
        assert_eq!(checksum(b"hi"), 201);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn text_encodings() {
        assert_eq!(PayloadEncoding::Ascii.encode("Hi!").unwrap(), b"Hi!".to_vec());
        assert!(matches!(
            PayloadEncoding::Ascii.encode("h\u{e9}"),
            Err(PayloadError::NotAscii { index: 1, .. })
        ));
        assert_eq!(PayloadEncoding::Utf8.encode("h\u{e9}").unwrap(), vec![b'h', 0xC3, 0xA9]);
        assert_eq!(
            PayloadEncoding::HexDump.encode("48 65 0x6C6C 6F").unwrap(),
            b"Hello".to_vec()
        );
        assert!(PayloadEncoding::HexDump.encode("4G").is_err());
    }

    #[test]
    fn integers_use_minimal_big_endian_bytes() {
        let enc = PayloadEncoding::Integer;
        assert_eq!(enc.encode("0").unwrap(), vec![0x00]);
        assert_eq!(enc.encode("255").unwrap(), vec![0xFF]);
        assert_eq!(enc.encode("256").unwrap(), vec![0x01, 0x00]);
        assert_eq!(
            enc.encode("12345678901234567890").unwrap(),
            vec![0xAB, 0x54, 0xA9, 0x8C, 0xEB, 0x1F, 0x0A, 0xD2]
        );
        assert!(matches!(enc.encode("-1"), Err(PayloadError::InvalidInteger(_))));
        let huge = "9".repeat(700);
        assert_eq!(enc.encode(&huge), Err(PayloadError::IntegerOverflow));
    }

    #[test]
    fn envelope_layout() {
        let msg = hello().with_header("Round", "3");
        let text = String::from_utf8(msg.envelope_bytes().unwrap()).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "================INCOMING=MESSAGE================");
        assert_eq!(lines[1], "CSMSG/1.0");
        assert_eq!(lines[2], "Division: Talking Head");
        assert!(lines[3].starts_with("Server: CubeServer/"));
        assert_eq!(lines[4], "Content-Length: 13");
        assert_eq!(lines[5], "Checksum: 124");
        assert_eq!(lines[6], "Round: 3");
        assert_eq!(lines[7], "");
        assert_eq!(lines[8], "Hello, world!");
        assert_eq!(lines[9], "");
        assert_eq!(lines[10], "===================END===MESSAGE================");
    }

    #[test]
    fn frozen_frame_is_never_recomputed() {
        let mut msg = hello();
        let first = msg.freeze_frame().unwrap().to_vec();
        assert_eq!(first[0], 0x01);
        assert_eq!(first[1], Destination::Infrared.wire_byte());
        assert_eq!(first.len(), BEACON_HEADER_LEN + msg.envelope_bytes().unwrap().len() + 1);

        msg.payload = Payload::raw(b"changed afterwards".to_vec());
        msg.intensity = 3;
        assert_eq!(msg.freeze_frame().unwrap(), first.as_slice());
        assert_eq!(msg.beacon_frame().unwrap(), first);
    }

    #[test]
    fn restart_rule_uses_grace() {
        let now = Utc::now();
        let mut msg = hello();
        msg.scheduled_at = now - Duration::seconds(120);

        assert_eq!(msg.clone().with_misfire_grace(30).restart_status(now, 0), MessageStatus::Missed);
        assert_eq!(msg.clone().with_misfire_grace(600).restart_status(now, 0), MessageStatus::Queued);
        assert_eq!(msg.restart_status(now, 600), MessageStatus::Queued);
    }

    #[test]
    fn status_names_round_trip_through_the_table() {
        for (status, name) in STATUS_TABLE {
            assert_eq!(status.as_str(), name);
            assert_eq!(name.parse::<MessageStatus>().unwrap(), status);
        }
        assert_eq!(
            "Sent".parse::<MessageStatus>(),
            Err(UnknownStatus("Sent".to_string()))
        );
        assert_eq!(
            serde_json::to_string(&MessageStatus::Transmitting).unwrap(),
            "\"Transmitting...\""
        );
    }

    #[test]
    fn persists_as_json() {
        let mut msg = hello()
            .with_destination(Destination::Visible)
            .with_header("Round", "1");
        msg.freeze_frame().unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"destination\":\"Visible\""));
        let back: ScheduledMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
