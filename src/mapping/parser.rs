//! Line-level parsing for routing table sources

use std::fmt;
use std::io::{self, BufRead};

use crate::can::FrameKind;

use super::RoutingRule;

/// Longest line kept from a source; the rest of a longer line is dropped
pub const MAX_LINE_LEN: usize = 127;

/// Longest topic a rule may carry
pub const MAX_TOPIC_LEN: usize = 63;

/// Why a record line was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// First field is not `S` or `E`
    InvalidFrameKind(String),
    /// No identifier field
    MissingId,
    /// Identifier is not a hexadecimal number
    InvalidId(String),
    /// Identifier is zero (reserved as unset)
    ZeroId,
    /// Identifier does not fit the frame kind
    IdOutOfRange(FrameKind, u32),
    /// No topic field
    MissingTopic,
    /// Topic field is empty
    EmptyTopic,
    /// Topic contains `#` or `+`
    WildcardInTopic,
    /// Topic longer than [`MAX_TOPIC_LEN`]
    TopicTooLong(usize),
    /// Line is not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineError::InvalidFrameKind(k) => write!(f, "invalid frame kind '{}'", k),
            LineError::MissingId => write!(f, "missing CAN id"),
            LineError::InvalidId(id) => write!(f, "invalid CAN id '{}'", id),
            LineError::ZeroId => write!(f, "CAN id must not be zero"),
            LineError::IdOutOfRange(kind, id) => {
                write!(f, "CAN id 0x{:x} out of range for {} frame", id, kind)
            }
            LineError::MissingTopic => write!(f, "missing topic"),
            LineError::EmptyTopic => write!(f, "empty topic"),
            LineError::WildcardInTopic => write!(f, "topic contains a wildcard"),
            LineError::TopicTooLong(len) => {
                write!(f, "topic is {} bytes, limit is {}", len, MAX_TOPIC_LEN)
            }
            LineError::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
        }
    }
}

impl std::error::Error for LineError {}

/// One physical line, already stripped of its terminator
pub(crate) struct RawLine {
    text: Result<String, LineError>,
    /// Original length in bytes when the line was cut at [`MAX_LINE_LEN`]
    pub(crate) truncated: Option<usize>,
}

pub(crate) enum Line<'a> {
    Blank,
    Comment,
    Record(&'a str),
    Invalid(&'a LineError),
}

impl RawLine {
    pub(crate) fn classify(&self) -> Line<'_> {
        let text = match &self.text {
            Ok(text) => text,
            Err(e) => return Line::Invalid(e),
        };

        let trimmed = text.trim_start();
        if trimmed.trim_end().is_empty() {
            Line::Blank
        } else if trimmed.starts_with('#') {
            Line::Comment
        } else {
            Line::Record(text)
        }
    }
}

/// Read the next line, cutting it at [`MAX_LINE_LEN`] bytes.
///
/// A cut never splits a UTF-8 character; the partial character is dropped
/// along with the rest of the line. Returns `None` at end of input.
pub(crate) fn read_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Option<RawLine>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    let truncated = if buf.len() > MAX_LINE_LEN {
        let original = buf.len();
        buf.truncate(MAX_LINE_LEN);
        Some(original)
    } else {
        None
    };

    let text = match std::str::from_utf8(buf) {
        Ok(s) => Ok(s.to_string()),
        // Incomplete trailing character left by the cut
        Err(e) if truncated.is_some() && e.error_len().is_none() => {
            Ok(String::from_utf8_lossy(&buf[..e.valid_up_to()]).into_owned())
        }
        Err(_) => Err(LineError::InvalidUtf8),
    };

    Ok(Some(RawLine { text, truncated }))
}

/// Parse one `kind,hex-id,topic` record.
///
/// Fields are trimmed of surrounding whitespace; the id may carry a `0x`
/// prefix. Fields after the topic are ignored.
pub fn parse_record(record: &str) -> Result<RoutingRule, LineError> {
    let mut fields = record.split(',').map(str::trim);

    let kind_field = fields.next().unwrap_or_default();
    let kind = FrameKind::from_code(kind_field)
        .ok_or_else(|| LineError::InvalidFrameKind(kind_field.to_string()))?;

    let id_field = fields.next().ok_or(LineError::MissingId)?;
    let id = parse_hex_id(id_field)?;
    if id == 0 {
        return Err(LineError::ZeroId);
    }
    if id > kind.max_id() {
        return Err(LineError::IdOutOfRange(kind, id));
    }

    let topic = fields.next().ok_or(LineError::MissingTopic)?;
    if topic.is_empty() {
        return Err(LineError::EmptyTopic);
    }
    if topic.contains(['#', '+']) {
        return Err(LineError::WildcardInTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(LineError::TopicTooLong(topic.len()));
    }

    Ok(RoutingRule::new(kind, id, topic))
}

fn parse_hex_id(field: &str) -> Result<u32, LineError> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LineError::InvalidId(field.to_string()));
    }

    u32::from_str_radix(digits, 16).map_err(|_| LineError::InvalidId(field.to_string()))
}
