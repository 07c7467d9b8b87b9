//! Receive-only client for the EMWIN ByteBlaster broadcast.
//!
//! ByteBlaster servers re-stream the EMWIN satellite feed over TCP, XOR-masked
//! with 0xFF and chunked into Quick Block Transfer segments. This crate
//! connects to one server out of a rotating pool, authenticates, decodes the
//! interleaved segment stream, reassembles whole files and fans both segments
//! and completed files out to subscribers. Server-list updates arrive in-band
//! and are persisted for the next restart.
//!
//! The entry point is [`ByteBlasterClient`]; the lower layers (decoder,
//! assembler, server-list store) are public for direct use and for tests.

pub mod assembler;
pub mod bus;
pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod servers;

pub use assembler::{CompletedFile, FileAssembler};
pub use bus::{EventBus, EventStream, Subscription};
pub use client::ByteBlasterClient;
pub use config::{ByteBlasterOptions, ConfigError};
pub use protocol::decoder::{DecoderEvent, ProtocolDecoder, ServerListUpdate};
pub use protocol::segment::{ProtocolVersion, QbtSegment};
pub use servers::store::ServerListStore;
pub use servers::{ServerEndpoint, ServerList};
