use crate::logging::warn_throttled;
use crate::protocol::buffer::XorBuffer;
use crate::protocol::header::{BlockHeader, parse_block_header};
use crate::protocol::segment::{ProtocolVersion, QbtSegment};
use crate::protocol::{
    HEADER_SIZE, MAX_INFLATED_BODY, MAX_SERVER_LIST_LEN, MAX_TOTAL_BLOCKS, SYNC_MARKER, codec,
};
use crate::servers::ServerList;
use chrono::Utc;
use std::time::Duration;

const WARN_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Resync,
    StartFrame,
    FrameType,
    BlockHeader,
    ServerList,
    BlockBody,
    Validate,
}

/// An in-band server-list announcement, raw text plus the parsed pools.
#[derive(Debug, Clone)]
pub struct ServerListUpdate {
    pub raw: String,
    pub list: ServerList,
}

#[derive(Debug, Clone)]
pub enum DecoderEvent {
    Segment(QbtSegment),
    ServerList(ServerListUpdate),
}

/// Resynchronizing frame decoder over the demasked byte stream.
///
/// Feed it network reads in any chunking; it emits validated segments and
/// server-list updates in stream order. Every malformed frame sends the
/// machine back to [`DecoderState::Resync`]; nothing here ever fails outward.
/// A run of failed frames with no valid emission in between is reported via
/// [`consecutive_failures`](Self::consecutive_failures) so the session owner
/// can enforce its exception budget.
#[derive(Debug)]
pub struct ProtocolDecoder {
    state: DecoderState,
    buffer: XorBuffer,
    pending_header: Option<BlockHeader>,
    pending_body: Option<Vec<u8>>,
    source: String,
    consecutive_failures: u32,
}

impl ProtocolDecoder {
    /// `source` is the server endpoint string stamped onto every segment.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            state: DecoderState::Resync,
            buffer: XorBuffer::new(),
            pending_header: None,
            pending_body: None,
            source: source.into(),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Failed frames since the last valid emission.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Ingest demasked bytes and drain every frame that is now complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecoderEvent> {
        self.buffer.append(data);
        let mut events = Vec::new();
        while self.step(&mut events) {}
        events
    }

    /// Run one state transition; false means more input is needed.
    fn step(&mut self, events: &mut Vec<DecoderEvent>) -> bool {
        match self.state {
            DecoderState::Resync => self.on_resync(),
            DecoderState::StartFrame => self.on_start_frame(),
            DecoderState::FrameType => self.on_frame_type(),
            DecoderState::BlockHeader => self.on_block_header(),
            DecoderState::BlockBody => self.on_block_body(),
            DecoderState::Validate => self.on_validate(events),
            DecoderState::ServerList => self.on_server_list(events),
        }
    }

    fn on_resync(&mut self) -> bool {
        match self.buffer.index_of(&SYNC_MARKER, 0) {
            Some(at) => {
                if at > 0 {
                    tracing::debug!(discarded = at, "resynchronized past garbage");
                }
                self.buffer.skip(at + SYNC_MARKER.len());
                self.state = DecoderState::StartFrame;
                true
            }
            None => {
                // Keep a marker-length tail so a sync split across reads is
                // still caught.
                if self.buffer.len() >= SYNC_MARKER.len() {
                    self.buffer.skip(self.buffer.len() - SYNC_MARKER.len() + 1);
                }
                false
            }
        }
    }

    fn on_start_frame(&mut self) -> bool {
        // Stray null fill between the marker and the frame prefix.
        loop {
            match self.buffer.peek(1).first().copied() {
                None => return false,
                Some(0x00) => {
                    self.buffer.skip(1);
                }
                Some(_) => {
                    self.state = DecoderState::FrameType;
                    return true;
                }
            }
        }
    }

    fn on_frame_type(&mut self) -> bool {
        if self.buffer.len() < 3 {
            return false;
        }
        let prefix = self.buffer.peek(3);
        if prefix == b"/PF" {
            self.state = DecoderState::BlockHeader;
        } else if prefix == b"/Se" {
            self.state = DecoderState::ServerList;
        } else {
            if warn_throttled("decoder_unknown_frame", WARN_EVERY) {
                tracing::warn!(prefix = ?prefix, "unknown frame type; resynchronizing");
            }
            self.buffer.skip(1);
            self.fail();
        }
        true
    }

    fn on_block_header(&mut self) -> bool {
        if self.buffer.len() < HEADER_SIZE {
            return false;
        }
        let raw = self.buffer.consume(HEADER_SIZE);
        match parse_block_header(&raw) {
            Ok(header) => {
                self.pending_header = Some(header);
                self.state = DecoderState::BlockBody;
            }
            Err(err) => {
                if warn_throttled("decoder_bad_header", WARN_EVERY) {
                    tracing::warn!(error = %err, "invalid block header; resynchronizing");
                }
                self.fail();
            }
        }
        true
    }

    fn on_block_body(&mut self) -> bool {
        let header = self
            .pending_header
            .as_ref()
            .expect("BlockBody entered without a parsed header");
        if self.buffer.len() < header.length {
            return false;
        }
        let body = self.buffer.consume(header.length);
        let content = match header.version {
            ProtocolVersion::V1 => body,
            ProtocolVersion::V2 => match codec::inflate_zlib(&body, MAX_INFLATED_BODY) {
                Ok(inflated) => inflated,
                Err(err) => {
                    if warn_throttled("decoder_inflate", WARN_EVERY) {
                        tracing::warn!(
                            filename = header.filename.as_str(),
                            error = %err,
                            "V2 body failed to inflate; resynchronizing"
                        );
                    }
                    self.fail();
                    return true;
                }
            },
        };
        self.pending_body = Some(content);
        self.state = DecoderState::Validate;
        true
    }

    fn on_validate(&mut self, events: &mut Vec<DecoderEvent>) -> bool {
        let header = self
            .pending_header
            .take()
            .expect("Validate entered without a parsed header");
        let content = self
            .pending_body
            .take()
            .expect("Validate entered without a body");

        if header.total_blocks == 0
            || header.total_blocks > MAX_TOTAL_BLOCKS
            || header.block_number == 0
            || header.block_number > header.total_blocks
        {
            if warn_throttled("decoder_block_range", WARN_EVERY) {
                tracing::warn!(
                    filename = header.filename.as_str(),
                    block = header.block_number,
                    total = header.total_blocks,
                    "block numbering out of range; frame discarded"
                );
            }
            self.fail();
            return true;
        }

        if !codec::verify_checksum(&content, header.checksum) {
            if warn_throttled("decoder_checksum", WARN_EVERY) {
                tracing::warn!(
                    filename = header.filename.as_str(),
                    block = header.block_number,
                    declared = header.checksum,
                    computed = codec::checksum(&content),
                    "checksum mismatch; frame discarded"
                );
            }
            self.fail();
            return true;
        }

        let segment = QbtSegment {
            filename: header.filename,
            block_number: header.block_number,
            total_blocks: header.total_blocks,
            content,
            checksum: header.checksum,
            length: header.length,
            version: header.version,
            timestamp: header.timestamp,
            received_at: Utc::now(),
            header: header.raw,
            source: self.source.clone(),
        };
        tracing::trace!(segment = %segment, "segment decoded");
        events.push(DecoderEvent::Segment(segment));
        self.consecutive_failures = 0;
        self.state = DecoderState::Resync;
        true
    }

    fn on_server_list(&mut self, events: &mut Vec<DecoderEvent>) -> bool {
        let Some(end) = self.buffer.index_of(b"\r\n", 0) else {
            if self.buffer.len() > MAX_SERVER_LIST_LEN {
                if warn_throttled("decoder_serverlist_runaway", WARN_EVERY) {
                    tracing::warn!(
                        buffered = self.buffer.len(),
                        "unterminated server list; resynchronizing"
                    );
                }
                self.fail();
                return true;
            }
            return false;
        };

        let raw_bytes = self.buffer.consume(end);
        self.buffer.skip(2);
        let raw: String = raw_bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect();

        match ServerList::from_frame(&raw) {
            Ok(list) => {
                tracing::info!(
                    servers = list.servers.len(),
                    sat_servers = list.sat_servers.len(),
                    "server list announcement decoded"
                );
                events.push(DecoderEvent::ServerList(ServerListUpdate { raw, list }));
                self.consecutive_failures = 0;
            }
            Err(err) => {
                if warn_throttled("decoder_serverlist", WARN_EVERY) {
                    tracing::warn!(error = %err, "unparseable server list; resynchronizing");
                }
                self.fail();
                return true;
            }
        }
        self.state = DecoderState::Resync;
        true
    }

    /// Every error path funnels here: count the failure, go back to scanning.
    fn fail(&mut self) {
        self.pending_header = None;
        self.pending_body = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = DecoderState::Resync;
    }
}
