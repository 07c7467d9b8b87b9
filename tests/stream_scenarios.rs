//! End-to-end scenarios over the wire pipeline: masked bytes in, decoded
//! segments through the assembler, completed files out. Mirrors how the
//! session reader drives the stack, minus the socket.

use byteblaster::protocol::codec;
use byteblaster::protocol::decoder::{DecoderEvent, ProtocolDecoder};
use byteblaster::protocol::{SYNC_MARKER, V1_BODY_SIZE};
use byteblaster::{CompletedFile, FileAssembler, QbtSegment};
use std::time::Duration;

struct Pipeline {
    decoder: ProtocolDecoder,
    assembler: FileAssembler,
    segments: Vec<QbtSegment>,
    files: Vec<CompletedFile>,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            decoder: ProtocolDecoder::new("mock:2211"),
            assembler: FileAssembler::new(Duration::from_secs(600), 1024),
            segments: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Demask and feed the wire bytes in awkward chunk sizes, the way TCP
    /// would deliver them.
    fn feed_wire(&mut self, wire: &[u8], chunk_size: usize) {
        for chunk in wire.chunks(chunk_size.max(1)) {
            let mut plain = chunk.to_vec();
            codec::xor_mask_in_place(&mut plain);
            for event in self.decoder.feed(&plain) {
                match event {
                    DecoderEvent::Segment(segment) => {
                        if let Some(file) = self.assembler.insert(segment.clone()) {
                            self.files.push(file);
                        }
                        self.segments.push(segment);
                    }
                    DecoderEvent::ServerList(_) => {}
                }
            }
        }
    }
}

fn padded_header(body: &str) -> Vec<u8> {
    let mut line = body.as_bytes().to_vec();
    assert!(line.len() <= 78, "test header too long");
    line.resize(78, b' ');
    line.extend_from_slice(b"\r\n");
    line
}

/// Plaintext V1 frame: sync marker, 80-byte header, 1024-byte body.
fn v1_frame(filename: &str, block: u32, total: u32, content: &[u8]) -> Vec<u8> {
    assert_eq!(content.len(), V1_BODY_SIZE);
    let cs = codec::checksum(content);
    let mut frame = SYNC_MARKER.to_vec();
    frame.extend_from_slice(&padded_header(&format!(
        "/PF{filename} /PN {block} /PT {total} /CS {cs} /FD7/4/2025 3:05:09 PM"
    )));
    frame.extend_from_slice(content);
    frame
}

fn block(fill: u8) -> Vec<u8> {
    vec![fill; V1_BODY_SIZE]
}

fn to_wire(plaintext: &[u8]) -> Vec<u8> {
    codec::xor_mask(plaintext)
}

#[test]
fn s1_single_three_block_v1_file() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&v1_frame("TEST.TXT", 1, 3, &block(0x01)));
    stream.extend_from_slice(&v1_frame("TEST.TXT", 2, 3, &block(0x02)));
    stream.extend_from_slice(&v1_frame("TEST.TXT", 3, 3, &block(0x03)));

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 1400);

    assert_eq!(pipeline.segments.len(), 3);
    assert_eq!(pipeline.files.len(), 1);
    let file = &pipeline.files[0];
    assert_eq!(file.filename, "TEST.TXT");
    assert_eq!(file.data.len(), 3 * V1_BODY_SIZE);
    let mut expected = block(0x01);
    expected.extend_from_slice(&block(0x02));
    expected.extend_from_slice(&block(0x03));
    assert_eq!(file.data, expected);
}

#[test]
fn s2_interleaved_files_complete_in_priority_order() {
    // A1 A2 B1 B2 A3 A4: the high-priority file B preempts A mid-stream and
    // completes first.
    let mut stream = Vec::new();
    stream.extend_from_slice(&v1_frame("AAAA.TXT", 1, 4, &block(0xA1)));
    stream.extend_from_slice(&v1_frame("AAAA.TXT", 2, 4, &block(0xA2)));
    stream.extend_from_slice(&v1_frame("BBBB.TXT", 1, 2, &block(0xB1)));
    stream.extend_from_slice(&v1_frame("BBBB.TXT", 2, 2, &block(0xB2)));
    stream.extend_from_slice(&v1_frame("AAAA.TXT", 3, 4, &block(0xA3)));
    stream.extend_from_slice(&v1_frame("AAAA.TXT", 4, 4, &block(0xA4)));

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 333);

    let names: Vec<&str> = pipeline.files.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names, ["BBBB.TXT", "AAAA.TXT"]);

    // No cross-file contamination.
    let b = &pipeline.files[0];
    assert_eq!(b.data.len(), 2 * V1_BODY_SIZE);
    assert!(b.data[..V1_BODY_SIZE].iter().all(|&x| x == 0xB1));
    assert!(b.data[V1_BODY_SIZE..].iter().all(|&x| x == 0xB2));
    let a = &pipeline.files[1];
    assert_eq!(a.data.len(), 4 * V1_BODY_SIZE);
    assert!(a.data[..V1_BODY_SIZE].iter().all(|&x| x == 0xA1));
    assert!(a.data[3 * V1_BODY_SIZE..].iter().all(|&x| x == 0xA4));
}

#[test]
fn s3_checksum_corruption_leaves_file_pending() {
    let mut b1 = v1_frame("BBBB.TXT", 1, 2, &block(0xB1));
    let last = b1.len() - 1;
    b1[last] ^= 0x01; // flip a payload bit; declared checksum no longer matches

    let mut stream = Vec::new();
    stream.extend_from_slice(&b1);
    stream.extend_from_slice(&v1_frame("BBBB.TXT", 2, 2, &block(0xB2)));

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 512);

    assert_eq!(pipeline.segments.len(), 1, "corrupt B1 is discarded");
    assert_eq!(pipeline.segments[0].block_number, 2);
    assert!(pipeline.files.is_empty(), "B2 alone must not complete the file");
    assert_eq!(pipeline.assembler.pending_len(), 1, "B stays pending");

    // A retransmitted, intact B1 completes the file.
    pipeline.feed_wire(&to_wire(&v1_frame("BBBB.TXT", 1, 2, &block(0xB1))), 512);
    assert_eq!(pipeline.files.len(), 1);
}

#[test]
fn s4_resync_through_garbage() {
    // 200 bytes of plaintext nulls, then the marker and one valid frame.
    let mut stream = vec![0x00u8; 200];
    stream.extend_from_slice(&v1_frame("GOOD.TXT", 1, 1, &block(0x42)));

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 64);

    assert_eq!(pipeline.segments.len(), 1);
    assert_eq!(pipeline.files.len(), 1);
    assert_eq!(
        pipeline.decoder.consecutive_failures(),
        0,
        "garbage before the marker is not an error"
    );
}

#[test]
fn s5_duplicate_full_transmission_yields_two_files() {
    let mut one_pass = Vec::new();
    one_pass.extend_from_slice(&v1_frame("WARN.TXT", 1, 3, &block(0x01)));
    one_pass.extend_from_slice(&v1_frame("WARN.TXT", 2, 3, &block(0x02)));
    one_pass.extend_from_slice(&v1_frame("WARN.TXT", 3, 3, &block(0x03)));

    let mut stream = one_pass.clone();
    stream.extend_from_slice(&one_pass); // identical second broadcast, same /FD

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 1000);

    assert_eq!(pipeline.files.len(), 2, "double broadcast is not deduplicated");
    assert_eq!(pipeline.files[0].data, pipeline.files[1].data);
}

#[test]
fn segment_checksums_always_match_content() {
    let mut stream = Vec::new();
    for i in 1..=4u8 {
        stream.extend_from_slice(&v1_frame("SUMS.TXT", u32::from(i), 4, &block(i)));
    }

    let mut pipeline = Pipeline::new();
    pipeline.feed_wire(&to_wire(&stream), 97);

    assert_eq!(pipeline.segments.len(), 4);
    for segment in &pipeline.segments {
        assert_eq!(codec::checksum(&segment.content), segment.checksum);
    }
}

#[test]
fn chunk_size_does_not_change_the_outcome() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&v1_frame("CHNK.TXT", 1, 2, &block(0x10)));
    stream.extend_from_slice(&v1_frame("CHNK.TXT", 2, 2, &block(0x20)));
    let wire = to_wire(&stream);

    let mut reference: Option<Vec<u8>> = None;
    for chunk_size in [1, 7, 80, 1024, wire.len()] {
        let mut pipeline = Pipeline::new();
        pipeline.feed_wire(&wire, chunk_size);
        assert_eq!(pipeline.files.len(), 1, "chunk size {chunk_size}");
        let data = pipeline.files.pop().expect("file").data;
        match &reference {
            None => reference = Some(data),
            Some(expected) => assert_eq!(&data, expected, "chunk size {chunk_size}"),
        }
    }
}
