//! Reassembly of interleaved Quick Block Transfer segments into whole files.

use crate::logging::warn_throttled;
use crate::protocol::segment::QbtSegment;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Filler broadcast when nothing real is queued; never assembled.
pub const FILL_FILENAME: &str = "FILLFILE.TXT";

const WARN_EVERY: Duration = Duration::from_secs(30);

/// A fully reassembled file, ready for subscribers.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub filename: String,
    /// Origin timestamp of the transmission (`/FD`).
    pub timestamp: DateTime<Utc>,
    /// Block contents concatenated in ascending block order, padding intact.
    pub data: Vec<u8>,
    pub block_count: u32,
    pub first_received_at: DateTime<Utc>,
    pub last_received_at: DateTime<Utc>,
    pub source: String,
}

/// Two transmissions of one filename with different origin timestamps are
/// distinct files; the same key twice is the mandated duplicate broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssemblyKey {
    filename: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Assembly {
    expected_blocks: u32,
    received: BTreeMap<u32, Vec<u8>>,
    first_received_at: DateTime<Utc>,
    last_update: Instant,
    source: String,
}

/// Groups segments by `(filename, timestamp)` and emits a completed file the
/// moment the final distinct block arrives.
///
/// The broadcast is lossy and open-ended, so pending state is bounded two
/// ways: assemblies idle past `idle_timeout` are dropped by [`sweep`], and
/// when `capacity` is exceeded the least-recently-updated assembly is
/// evicted. Completed duplicates are NOT collapsed; high-priority files are
/// intentionally broadcast twice and deduplication belongs to subscribers.
///
/// [`sweep`]: FileAssembler::sweep
#[derive(Debug)]
pub struct FileAssembler {
    pending: HashMap<AssemblyKey, Assembly>,
    idle_timeout: Duration,
    capacity: usize,
}

impl FileAssembler {
    pub fn new(idle_timeout: Duration, capacity: usize) -> Self {
        assert!(capacity > 0, "assembler capacity must be nonzero");
        Self {
            pending: HashMap::new(),
            idle_timeout,
            capacity,
        }
    }

    /// Number of partially assembled files currently held.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Insert one segment; returns the completed file when this segment was
    /// the last missing block.
    pub fn insert(&mut self, segment: QbtSegment) -> Option<CompletedFile> {
        if segment.filename == FILL_FILENAME {
            return None;
        }
        if segment.block_number == 0
            || segment.total_blocks == 0
            || segment.block_number > segment.total_blocks
        {
            if warn_throttled("assembler_block_range", WARN_EVERY) {
                tracing::warn!(
                    filename = segment.filename.as_str(),
                    block = segment.block_number,
                    total = segment.total_blocks,
                    "segment with impossible block numbering rejected"
                );
            }
            return None;
        }

        let key = AssemblyKey {
            filename: segment.filename.clone(),
            timestamp: segment.timestamp,
        };

        let assembly = self.pending.entry(key.clone()).or_insert_with(|| Assembly {
            expected_blocks: segment.total_blocks,
            received: BTreeMap::new(),
            first_received_at: segment.received_at,
            last_update: Instant::now(),
            source: segment.source.clone(),
        });

        // A changed block count means the sender restarted the transmission;
        // stale partial data would corrupt the output.
        if assembly.expected_blocks != segment.total_blocks {
            tracing::warn!(
                filename = segment.filename.as_str(),
                old_total = assembly.expected_blocks,
                new_total = segment.total_blocks,
                "total block count changed; restarting assembly"
            );
            assembly.expected_blocks = segment.total_blocks;
            assembly.received.clear();
            assembly.first_received_at = segment.received_at;
            assembly.source = segment.source.clone();
        }

        assembly.last_update = Instant::now();
        // First copy of a block wins; retransmitted duplicates are ignored.
        assembly
            .received
            .entry(segment.block_number)
            .or_insert(segment.content);

        if assembly.received.len() as u32 == assembly.expected_blocks {
            let assembly = self.pending.remove(&key).expect("assembly present");
            let data: Vec<u8> = assembly.received.into_values().flatten().collect();
            let completed = CompletedFile {
                filename: key.filename,
                timestamp: key.timestamp,
                data,
                block_count: assembly.expected_blocks,
                first_received_at: assembly.first_received_at,
                last_received_at: segment.received_at,
                source: assembly.source,
            };
            tracing::debug!(
                filename = completed.filename.as_str(),
                blocks = completed.block_count,
                bytes = completed.data.len(),
                "file completed"
            );
            return Some(completed);
        }

        self.enforce_capacity();
        None
    }

    /// Drop assemblies that have seen no insertions for the idle timeout.
    /// Call periodically; a missing final block must not leak memory forever.
    pub fn sweep(&mut self) {
        let idle = self.idle_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, assembly| assembly.last_update.elapsed() < idle);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            tracing::debug!(dropped, "evicted idle assemblies");
        }
    }

    /// Discard all pending state. Used on reconnection; the protocol has no
    /// resume semantics.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn enforce_capacity(&mut self) {
        while self.pending.len() > self.capacity {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, a)| a.last_update)
                .map(|(k, _)| k.clone())
            else {
                return;
            };
            if warn_throttled("assembler_capacity", WARN_EVERY) {
                tracing::warn!(
                    filename = oldest.filename.as_str(),
                    capacity = self.capacity,
                    "assembly cap exceeded; dropping least-recently-updated"
                );
            }
            self.pending.remove(&oldest);
        }
    }
}
