use anyhow::{Context, Result, bail};
use std::io::Read;

/// XOR-mask with 0xFF. Self-inverse; applied to every byte on the wire in
/// both directions.
pub fn xor_mask(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0xFF).collect()
}

pub fn xor_mask_in_place(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b ^= 0xFF;
    }
}

/// Unsigned sum of the plaintext payload bytes. u32 holds the maximum block
/// sum (1024 * 255) with room to spare.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().map(|&b| u32::from(b)).sum()
}

pub fn verify_checksum(data: &[u8], declared: u32) -> bool {
    checksum(data) == declared
}

/// Inflate a zlib stream with a hard output bound. V2 bodies that fail here
/// are corrupt frames and the decoder resyncs past them.
pub fn inflate_zlib(src: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let decoder = flate2::read::ZlibDecoder::new(src);
    let n = decoder
        .take(max_out as u64 + 1)
        .read_to_end(&mut out)
        .context("zlib inflate failed")?;
    if n > max_out {
        bail!("inflated body exceeds {max_out} bytes");
    }
    Ok(out)
}
