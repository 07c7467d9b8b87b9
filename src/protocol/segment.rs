use chrono::{DateTime, Utc};

/// Distinguished by the `/DL` header field: absent means a fixed 1024-byte
/// body, present means a zlib-compressed body of the declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// One decoded Quick Block Transfer fragment of one file.
///
/// `content` is the plaintext body (inflated for V2) with any padding left in
/// place; the assembler joins payloads verbatim. Invariants held by the
/// decoder: `1 <= block_number <= total_blocks` and the unsigned byte sum of
/// `content` equals `checksum`.
#[derive(Debug, Clone)]
pub struct QbtSegment {
    pub filename: String,
    pub block_number: u32,
    pub total_blocks: u32,
    pub content: Vec<u8>,
    /// Declared checksum from `/CS`.
    pub checksum: u32,
    /// Declared body length: 1024 for V1, the `/DL` value for V2.
    pub length: usize,
    pub version: ProtocolVersion,
    /// Origin timestamp from `/FD`; epoch when the field did not parse.
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// The 80-byte header as decoded text.
    pub header: String,
    /// Endpoint of the server that delivered this fragment.
    pub source: String,
}

impl std::fmt::Display for QbtSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} block {}/{} V{} len={} at {}",
            self.filename,
            self.block_number,
            self.total_blocks,
            self.version.number(),
            self.length,
            self.timestamp.to_rfc3339(),
        )
    }
}
