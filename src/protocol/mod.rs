//! Wire-level pieces of the ByteBlaster protocol: obfuscation codec, the
//! demasked byte buffer, the block-header grammar and the frame decoder.

pub mod auth;
pub mod buffer;
pub mod codec;
pub mod decoder;
pub mod header;
pub mod segment;

/// Frame synchronization marker as it appears in the demasked buffer.
///
/// The satellite draft frames with six null bytes; under the TCP leg's
/// universal XOR-0xFF masking the same prefix reads as six 0xFF once
/// demasked. This implementation always syncs on the demasked view.
pub const SYNC_MARKER: [u8; 6] = [0xFF; 6];

/// Header length in bytes, CR LF terminator included.
pub const HEADER_SIZE: usize = 80;

/// V1 blocks are fixed-size; V2 declares its compressed length via `/DL`.
pub const V1_BODY_SIZE: usize = 1024;

/// Upper bound for a `/DL` value. The compressed body never exceeds the
/// uncompressed block size.
pub const MAX_V2_BODY_SIZE: usize = 1024;

/// Cap on the inflated size of a V2 body. Anything larger is a corrupt frame.
pub const MAX_INFLATED_BODY: usize = 64 * 1024;

/// A server-list announcement without a terminator within this many bytes is
/// treated as garbage and resynced past.
pub const MAX_SERVER_LIST_LEN: usize = 4096;

/// `/PT` values beyond this are not plausible transmissions.
pub const MAX_TOTAL_BLOCKS: u32 = 999_999;
