//! Wire protocol for the chat server.
//!
//! Every message is a fixed 3-byte header followed by a payload:
//! `type: u8 | length: u16 (little-endian) | payload[length]`.
//! The payload is never empty and never longer than 1021 bytes, so a
//! whole frame always fits in one 1024-byte pool buffer.

/// Header size on the wire.
pub const HEADER_LEN: usize = 3;

/// Maximum payload length. `HEADER_LEN + MAX_PAYLOAD` equals the pool
/// buffer size, so a single buffer always holds a complete frame.
pub const MAX_PAYLOAD: usize = 1021;

/// Maximum total frame size on the wire.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;

/// Message type codes.
///
/// Server-to-client types live in `0x01..=0x05`, client-to-server types
/// in `0x11..=0x14`. Anything else received from a client is a protocol
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ServerAck = 0x01,
    ServerError = 0x02,
    ServerChat = 0x03,
    ServerNotification = 0x04,
    ServerEcho = 0x05,

    ClientJoin = 0x11,
    ClientLeave = 0x12,
    ClientChat = 0x13,
    ClientCommand = 0x14,
}

impl MessageType {
    /// Decode a wire type code. Returns `None` for unknown codes.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ServerAck),
            0x02 => Some(Self::ServerError),
            0x03 => Some(Self::ServerChat),
            0x04 => Some(Self::ServerNotification),
            0x05 => Some(Self::ServerEcho),
            0x11 => Some(Self::ClientJoin),
            0x12 => Some(Self::ClientLeave),
            0x13 => Some(Self::ClientChat),
            0x14 => Some(Self::ClientCommand),
            _ => None,
        }
    }

    /// True for types a client is allowed to send.
    pub fn is_client(self) -> bool {
        matches!(
            self,
            Self::ClientJoin | Self::ClientLeave | Self::ClientChat | Self::ClientCommand
        )
    }
}

/// A parsed inbound frame borrowing its payload from the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: MessageType,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Total bytes this frame occupied on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Outcome of scanning a byte stream for one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// A well-formed frame; `wire_len()` bytes were consumed.
    Complete(Frame<'a>),
    /// Not enough bytes yet; wait for more data.
    Incomplete,
    /// Malformed frame; the connection must be closed.
    Invalid(ParseError),
}

/// Why a frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// `length` exceeds [`MAX_PAYLOAD`].
    Oversize(u16),
    /// `length` is zero; empty payloads are not allowed.
    EmptyPayload,
    /// Type code outside the client range.
    BadType(u8),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Oversize(len) => {
                write!(f, "payload length {len} exceeds {MAX_PAYLOAD}")
            }
            ParseError::EmptyPayload => write!(f, "empty payload"),
            ParseError::BadType(t) => write!(f, "message type {t:#04x} not valid from a client"),
        }
    }
}

/// Scan `input` for one client frame.
///
/// Validation order matters: the length field is checked before the
/// payload has fully arrived, so an oversize or empty-length header is
/// rejected without waiting for more bytes.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    if input.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let length = u16::from_le_bytes([input[1], input[2]]) as usize;
    if length > MAX_PAYLOAD {
        return ParseResult::Invalid(ParseError::Oversize(length as u16));
    }
    if length == 0 {
        return ParseResult::Invalid(ParseError::EmptyPayload);
    }
    if input.len() < HEADER_LEN + length {
        return ParseResult::Incomplete;
    }

    let kind = match MessageType::from_u8(input[0]) {
        Some(kind) if kind.is_client() => kind,
        _ => return ParseResult::Invalid(ParseError::BadType(input[0])),
    };

    ParseResult::Complete(Frame {
        kind,
        payload: &input[HEADER_LEN..HEADER_LEN + length],
    })
}

/// Build an outbound frame into `out`, returning the total frame length.
///
/// Returns `None` if the payload is empty, oversize, or does not fit in
/// `out`.
pub fn encode(out: &mut [u8], kind: MessageType, payload: &[u8]) -> Option<usize> {
    let total = HEADER_LEN + payload.len();
    if payload.is_empty() || payload.len() > MAX_PAYLOAD || out.len() < total {
        return None;
    }

    out[0] = kind as u8;
    out[1..HEADER_LEN].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    out[HEADER_LEN..total].copy_from_slice(payload);
    Some(total)
}
