use crate::protocol::segment::ProtocolVersion;
use crate::protocol::{MAX_V2_BODY_SIZE, V1_BODY_SIZE};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Header date format, e.g. `7/4/2025 3:05:09 PM`. Month, day and hour are
/// unpadded on the wire; chrono's numeric parsing accepts both widths.
const DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Parsed 80-byte block header, body not yet read.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub filename: String,
    pub block_number: u32,
    pub total_blocks: u32,
    pub checksum: u32,
    pub timestamp: DateTime<Utc>,
    /// Body length to read off the stream: 1024 for V1, `/DL` for V2.
    pub length: usize,
    pub version: ProtocolVersion,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParseError {
    NotAscii,
    MissingTerminator,
    MissingField(&'static str),
    InvalidNumber(&'static str),
    EmptyFilename,
    InvalidFilename(char),
    InvalidBodyLength(usize),
}

impl std::fmt::Display for HeaderParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAscii => write!(f, "header contains non-ASCII bytes"),
            Self::MissingTerminator => write!(f, "header is not CR LF terminated"),
            Self::MissingField(tag) => write!(f, "header is missing {tag}"),
            Self::InvalidNumber(tag) => write!(f, "header field {tag} is not a valid number"),
            Self::EmptyFilename => write!(f, "header filename is empty"),
            Self::InvalidFilename(c) => write!(f, "header filename contains {c:?}"),
            Self::InvalidBodyLength(n) => write!(f, "declared body length {n} is out of range"),
        }
    }
}

impl std::error::Error for HeaderParseError {}

/// Positional, whitespace-tolerant parse of the fixed 80-byte header.
///
/// `/PF`, `/PN`, `/PT` and `/CS` are mandatory; a missing field fails the
/// frame. `/FD` failures fall back to the epoch without failing the frame.
/// `/DL` switches the frame to V2 and declares the compressed body length.
pub fn parse_block_header(raw: &[u8]) -> Result<BlockHeader, HeaderParseError> {
    if !raw.is_ascii() {
        return Err(HeaderParseError::NotAscii);
    }
    let text = std::str::from_utf8(raw).map_err(|_| HeaderParseError::NotAscii)?;
    let line = text
        .strip_suffix("\r\n")
        .ok_or(HeaderParseError::MissingTerminator)?;

    let filename = parse_filename(line)?;
    let block_number = field_u32(line, "/PN")?;
    let total_blocks = field_u32(line, "/PT")?;
    let checksum = field_u32(line, "/CS")?;
    let timestamp = parse_timestamp(line, &filename);

    let (version, length) = match line.find("/DL") {
        Some(_) => {
            let declared = field_u32(line, "/DL")? as usize;
            if declared == 0 || declared > MAX_V2_BODY_SIZE {
                return Err(HeaderParseError::InvalidBodyLength(declared));
            }
            (ProtocolVersion::V2, declared)
        }
        None => (ProtocolVersion::V1, V1_BODY_SIZE),
    };

    Ok(BlockHeader {
        filename,
        block_number,
        total_blocks,
        checksum,
        timestamp,
        length,
        version,
        raw: text.to_string(),
    })
}

fn parse_filename(line: &str) -> Result<String, HeaderParseError> {
    let rest = line
        .strip_prefix("/PF")
        .ok_or(HeaderParseError::MissingField("/PF"))?;
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        return Err(HeaderParseError::EmptyFilename);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(HeaderParseError::InvalidFilename(c));
    }
    Ok(name.to_string())
}

fn field_u32(line: &str, tag: &'static str) -> Result<u32, HeaderParseError> {
    let at = line
        .find(tag)
        .ok_or(HeaderParseError::MissingField(tag))?;
    let rest = line[at + tag.len()..].trim_start();
    let digits: &str = rest
        .split_once(|c: char| !c.is_ascii_digit())
        .map_or(rest, |(d, _)| d);
    if digits.is_empty() {
        return Err(HeaderParseError::InvalidNumber(tag));
    }
    digits
        .parse::<u32>()
        .map_err(|_| HeaderParseError::InvalidNumber(tag))
}

/// `/FD` runs from its tag to the `/DL` tag or end of line; the date itself
/// contains slashes, so scanning for the next `/` would truncate it.
fn parse_timestamp(line: &str, filename: &str) -> DateTime<Utc> {
    let Some(at) = line.find("/FD") else {
        tracing::warn!(filename, "header has no /FD field; using epoch");
        return DateTime::UNIX_EPOCH;
    };
    let rest = &line[at + 3..];
    let date_str = rest.find("/DL").map_or(rest, |dl| &rest[..dl]).trim();
    match NaiveDateTime::parse_from_str(date_str, DATE_FORMAT) {
        Ok(naive) => naive.and_utc(),
        Err(err) => {
            tracing::warn!(filename, date = date_str, error = %err, "unparseable /FD; using epoch");
            DateTime::UNIX_EPOCH
        }
    }
}
