//! Wire codec for the relay protocol.
//!
//! A packet is a single text record `"<type> <size> <source> <data>"`,
//! framed as one line. Only one split point exists after `source`, so the
//! data field keeps its spaces. Newlines and backslashes inside data are
//! escaped so a record never spans more than one line.

use std::{fmt, io};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest encoded record accepted on the wire, excluding the line ending.
pub const MAX_PACKET_SIZE: usize = 1380;

/// Longest escaped data field a server reply can carry: the limit minus the
/// widest `"<type> <size> SERVER "` header.
pub const MAX_SERVER_DATA: usize = MAX_PACKET_SIZE - "16 1380 SERVER ".len();

/// Data value substituted when a record carries no data field.
///
/// The sentinel is not escaped, so a data field that literally reads `NoData`
/// is indistinguishable from an absent one and [`Packet::payload`] reports
/// both as `None`.
pub const NO_DATA: &str = "NoData";

/// Source identifier used on every server-originated packet.
pub const SERVER_SOURCE: &str = "SERVER";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Packet types with their stable wire ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Login = 0,
    LoAck = 1,
    LoNak = 2,
    LoDup = 3,
    Exit = 4,
    Join = 5,
    JnAck = 6,
    JnNak = 7,
    LeaveSession = 8,
    LsAck = 9,
    LsNak = 10,
    NewSession = 11,
    NsAck = 12,
    NsNak = 13,
    Message = 14,
    Query = 15,
    QuAck = 16,
}

impl PacketType {
    const ALL: [PacketType; 17] = [
        PacketType::Login,
        PacketType::LoAck,
        PacketType::LoNak,
        PacketType::LoDup,
        PacketType::Exit,
        PacketType::Join,
        PacketType::JnAck,
        PacketType::JnNak,
        PacketType::LeaveSession,
        PacketType::LsAck,
        PacketType::LsNak,
        PacketType::NewSession,
        PacketType::NsAck,
        PacketType::NsNak,
        PacketType::Message,
        PacketType::Query,
        PacketType::QuAck,
    ];

    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PacketType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or(CodecError::UnknownType(value))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Login => "LOGIN",
            PacketType::LoAck => "LO_ACK",
            PacketType::LoNak => "LO_NAK",
            PacketType::LoDup => "LO_DUP",
            PacketType::Exit => "EXIT",
            PacketType::Join => "JOIN",
            PacketType::JnAck => "JN_ACK",
            PacketType::JnNak => "JN_NAK",
            PacketType::LeaveSession => "LEAVE_SESSION",
            PacketType::LsAck => "LS_ACK",
            PacketType::LsNak => "LS_NAK",
            PacketType::NewSession => "NEW_SESSION",
            PacketType::NsAck => "NS_ACK",
            PacketType::NsNak => "NS_NAK",
            PacketType::Message => "MESSAGE",
            PacketType::Query => "QUERY",
            PacketType::QuAck => "QU_ACK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unknown packet type {0}")]
    UnknownType(u32),
    #[error("encoded packet is {len} bytes, limit is {MAX_PACKET_SIZE}")]
    TooLarge { len: usize },
    #[error("source '{0}' must be a single non-empty token")]
    InvalidSource(String),
}

/// One protocol record as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub size: u32,
    pub source: String,
    pub data: String,
}

impl Packet {
    /// Builds a packet whose declared size matches its data.
    pub fn new(kind: PacketType, source: impl Into<String>, data: impl Into<String>) -> Self {
        let data = data.into();
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            kind,
            size,
            source: source.into(),
            data,
        }
    }

    pub fn from_server(kind: PacketType, data: impl Into<String>) -> Self {
        Self::new(kind, SERVER_SOURCE, data)
    }

    /// Returns the data field, or `None` for the empty/`NoData` payload.
    pub fn payload(&self) -> Option<&str> {
        if self.data.is_empty() || self.data == NO_DATA {
            None
        } else {
            Some(&self.data)
        }
    }

    /// Encodes the packet as a single record without the line terminator.
    pub fn encode(&self) -> Result<String, CodecError> {
        if self.source.is_empty() || self.source.contains(char::is_whitespace) {
            return Err(CodecError::InvalidSource(self.source.clone()));
        }

        let mut record = format!("{} {} {}", self.kind.ordinal(), self.size, self.source);
        if !self.data.is_empty() {
            record.push(' ');
            escape_into(&self.data, &mut record);
        }

        if record.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge { len: record.len() });
        }
        Ok(record)
    }

    /// Decodes one record. Everything after the separator that follows
    /// `source` is data.
    pub fn decode(record: &str) -> Result<Self, CodecError> {
        let record = record.trim_end_matches(LINE_ENDINGS);

        let (kind, rest) = next_token(record).ok_or(CodecError::Malformed("missing type"))?;
        let (size, rest) = next_token(rest).ok_or(CodecError::Malformed("missing size"))?;
        let (source, rest) = next_token(rest).ok_or(CodecError::Malformed("missing source"))?;

        let kind: u32 = kind
            .parse()
            .map_err(|_| CodecError::Malformed("type is not an integer"))?;
        let size: u32 = size
            .parse()
            .map_err(|_| CodecError::Malformed("size is not an integer"))?;
        let kind = PacketType::try_from(kind)?;

        let mut remainder = rest.chars();
        remainder.next();
        let data = match remainder.as_str() {
            "" => NO_DATA.to_string(),
            raw => unescape(raw),
        };

        Ok(Self {
            kind,
            size,
            source: source.to_string(),
            data,
        })
    }
}

fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start_matches(char::is_whitespace);
    if input.is_empty() {
        return None;
    }
    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    Some(input.split_at(end))
}

/// Length of `data` once escaped for the wire.
pub fn escaped_len(data: &str) -> usize {
    data.chars()
        .map(|ch| match ch {
            '\\' | '\n' | '\r' => 2,
            other => other.len_utf8(),
        })
        .sum()
}

fn escape_into(data: &str, out: &mut String) {
    for ch in data.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn unescape(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Reads the next non-blank line from the stream.
///
/// Returns `Ok(None)` on a clean end of stream. A line longer than the packet
/// limit is an `InvalidData` error because the stream can no longer be
/// trusted to be aligned on record boundaries.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the record plus "\r\n".
    let limit = (MAX_PACKET_SIZE + 2) as u64;
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buffer).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == limit && !buffer.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_PACKET_SIZE} bytes"),
            ));
        }

        let line = String::from_utf8_lossy(&buffer);
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_PACKET_SIZE} bytes"),
            ));
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Writes one already-encoded record followed by a newline, then flushes.
pub async fn write_frame<W>(writer: &mut W, record: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(record.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

pub async fn read_packet<R>(reader: &mut R) -> io::Result<Option<Packet>>
where
    R: AsyncBufRead + Unpin,
{
    match read_frame(reader).await? {
        Some(record) => Packet::decode(&record).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let record = packet.encode().map_err(to_io_error)?;
    write_frame(writer, &record).await
}

fn to_io_error(err: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
