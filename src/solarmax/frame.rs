use crate::error::{SolarMaxError, SolarMaxResult};
use crate::solarmax::field::QueryField;

use bytes::BytesMut;
use std::collections::BTreeMap;
use tokio_util::codec::Decoder;

/// Kind code of an ordinary read request ("64" on the wire).
pub const READ_KIND: u16 = 100;
/// Kind code of a settings write; the gateway acknowledges with the same.
pub const WRITE_KIND: u16 = 200;

const MARKER: &str = "FB";
const TERMINATOR: u8 = b'}';
const MAX_FRAME_LEN: usize = 1024;

// braces (2), address (2), "FB" (2), two semicolons (2), checksum (4).
// The length field itself is added separately since its width depends on
// the total.
const FIXED_OVERHEAD: usize = 12;

pub type RawFields = BTreeMap<QueryField, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Query,
    Response,
}

/// One brace-delimited protocol message.
///
/// Items without a value are plain requests (`PAC`); items with a value are
/// answers or settings (`PAC=FA0`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub direction: Direction,
    pub kind: u16,
    pub items: Vec<(QueryField, Option<String>)>,
}

impl Frame {
    pub fn query(address: u8, fields: &[QueryField], kind: u16) -> Self {
        Self {
            address,
            direction: Direction::Query,
            kind,
            items: fields.iter().map(|f| (*f, None)).collect(),
        }
    }

    pub fn response(address: u8, fields: &[(QueryField, String)], kind: u16) -> Self {
        Self {
            address,
            direction: Direction::Response,
            kind,
            items: fields
                .iter()
                .map(|(f, v)| (*f, Some(v.clone())))
                .collect(),
        }
    }

    pub fn encode(&self) -> SolarMaxResult<String> {
        if self.items.is_empty() {
            return Err(SolarMaxError::InvalidField(
                "empty field list".to_string(),
            ));
        }
        if self.address > 99 {
            return Err(SolarMaxError::Protocol(format!(
                "address {} does not fit the two digit header",
                self.address
            )));
        }

        let items = self
            .items
            .iter()
            .map(|(field, value)| match value {
                Some(v) => format!("{}={}", field, v),
                None => field.to_string(),
            })
            .collect::<Vec<_>>()
            .join(";");

        let payload = format!("|{:X}:{}|", self.kind, items);
        let length = frame_length(payload.len());

        let header = match self.direction {
            Direction::Query => format!("{};{:02};{:02X}", MARKER, self.address, length),
            Direction::Response => format!("{:02};{};{:02X}", self.address, MARKER, length),
        };

        let content = header + &payload;
        let frame = format!("{{{}{}}}", content, compute_checksum(&content));
        debug_assert_eq!(frame.len(), length);

        Ok(frame)
    }

    /// Collects the valued items into a lookup map. Requests without values
    /// are a protocol error here, since only answers are expected to carry
    /// data.
    pub fn values(&self) -> SolarMaxResult<RawFields> {
        self.items
            .iter()
            .map(|(field, value)| match value {
                Some(v) => Ok((*field, v.clone())),
                None => Err(SolarMaxError::Protocol(format!(
                    "field {} carries no value",
                    field
                ))),
            })
            .collect()
    }
}

fn frame_length(payload_len: usize) -> usize {
    let fixed = payload_len + FIXED_OVERHEAD;
    let mut width = 2;
    while fixed + width > (1 << (4 * width)) - 1 {
        width += 1;
    }
    fixed + width
}

/// Sum of all byte values, truncated to the four hex digits the protocol
/// has room for.
pub fn compute_checksum(content: &str) -> String {
    let sum: u32 = content.bytes().map(u32::from).sum();
    format!("{:04X}", sum & 0xFFFF)
}

pub fn verify_checksum(content: &str, checksum: &str) -> bool {
    checksum == compute_checksum(content)
}

pub fn encode_query(address: u8, fields: &[QueryField], kind: u16) -> SolarMaxResult<String> {
    Frame::query(address, fields, kind).encode()
}

/// Builds the single supported write: each value is sent as uppercase hex.
pub fn encode_setting(address: u8, values: &[(QueryField, u64)]) -> SolarMaxResult<String> {
    Frame {
        address,
        direction: Direction::Query,
        kind: WRITE_KIND,
        items: values
            .iter()
            .map(|(f, v)| (*f, Some(format!("{:X}", v))))
            .collect(),
    }
    .encode()
}

pub fn encode_response(
    address: u8,
    fields: &[(QueryField, String)],
    kind: u16,
) -> SolarMaxResult<String> {
    Frame::response(address, fields, kind).encode()
}

/// Parses and validates a frame of either direction.
pub fn decode(wire: &str) -> SolarMaxResult<Frame> {
    let malformed = |what: &str| SolarMaxError::MalformedFrame(format!("{}: {}", what, wire));

    let inner = wire
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| malformed("not enclosed in braces"))?;

    let split_at = inner
        .len()
        .checked_sub(4)
        .filter(|i| inner.is_char_boundary(*i))
        .ok_or_else(|| malformed("too short"))?;
    let (content, checksum) = inner.split_at(split_at);

    if !verify_checksum(content, checksum) {
        return Err(SolarMaxError::Checksum {
            expected: compute_checksum(content),
            received: checksum.to_owned(),
        });
    }

    let (header, payload) = content
        .strip_suffix('|')
        .and_then(|s| s.split_once('|'))
        .ok_or_else(|| malformed("missing payload separators"))?;

    let parts: Vec<&str> = header.split(';').collect();
    if parts.len() != 3 {
        return Err(malformed("header needs three parts"));
    }

    let (direction, address) = match (parts[0], parts[1]) {
        (MARKER, target) => (Direction::Query, target),
        (source, MARKER) => (Direction::Response, source),
        _ => {
            return Err(SolarMaxError::Protocol(format!(
                "answer not understood, no {} marker in {:?}",
                MARKER, header
            )))
        }
    };
    let address: u8 = address
        .parse()
        .map_err(|_| malformed("address is not a number"))?;

    let declared =
        usize::from_str_radix(parts[2], 16).map_err(|_| malformed("length is not hex"))?;
    if declared != wire.len() {
        return Err(SolarMaxError::LengthMismatch {
            declared,
            actual: wire.len(),
        });
    }

    // the kind prefix is "64" for reads and "C8" when acknowledging a write;
    // neither says anything about the content, so it is only parsed.
    let (kind, body) = payload
        .split_once(':')
        .ok_or_else(|| malformed("missing kind prefix"))?;
    let kind = u16::from_str_radix(kind, 16).map_err(|_| malformed("kind is not hex"))?;

    let items = body
        .split(';')
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v.to_owned())),
                None => (item, None),
            };
            key.parse::<QueryField>()
                .map(|field| (field, value))
                .map_err(|_| SolarMaxError::Protocol(format!("don't know {}", item)))
        })
        .collect::<SolarMaxResult<Vec<_>>>()?;

    Ok(Frame {
        address,
        direction,
        kind,
        items,
    })
}

pub fn decode_response(wire: &str) -> SolarMaxResult<(u8, RawFields)> {
    let frame = decode(wire)?;
    if frame.direction != Direction::Response {
        return Err(SolarMaxError::Protocol(format!(
            "expected a response, got a query for {}",
            frame.address
        )));
    }

    Ok((frame.address, frame.values()?))
}

/// Masks the framing bit off every byte and drops NULs.
pub fn unmask(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| b & 0x7F)
        .filter(|b| *b != 0)
        .map(char::from)
        .collect()
}

/// Splits a gateway byte stream into raw frame strings, one per `}`.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameDecoder {
    type Item = String;
    type Error = SolarMaxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| b & 0x7F == TERMINATOR) {
            Some(end) => {
                let raw = src.split_to(end + 1);
                Ok(Some(unmask(&raw)))
            }
            None if src.len() > MAX_FRAME_LEN => {
                let len = src.len();
                src.clear();
                Err(SolarMaxError::MalformedFrame(format!(
                    "no terminator after {} bytes",
                    len
                )))
            }
            None => Ok(None),
        }
    }
}
