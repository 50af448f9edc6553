//! Wire framing (spec §6). Every record begins with a single 64-bit
//! big-endian header word packing a sector number (or, for `PROGRESS`, a
//! percentage) into the high bits and a flags nibble into the low
//! `SECTOR_BITS` bits.

use crate::{
    state::{CHUNK_SIZE, SECTOR_BITS, SECTOR_SIZE},
    stream::Stream,
};

pub const FLAG_DEVICE_BLOCK: u64 = 0x01;
pub const FLAG_EOS: u64 = 0x02;
pub const FLAG_PROGRESS: u64 = 0x04;

/// Mask isolating the flags field of a header word (spec §6: "mask =
/// SECTOR_SIZE - 1, i.e. 0x1FF").
pub const FLAGS_MASK: u64 = SECTOR_SIZE - 1;

/// Packs `(value << SECTOR_BITS) | flags` — `value` is a sector number for
/// `DEVICE_BLOCK`/no-op for `EOS`, or a 0..100 percentage for `PROGRESS`.
pub fn pack_header(value: u64, flags: u64) -> u64 {
    (value << SECTOR_BITS) | (flags & FLAGS_MASK)
}

/// Unpacks a header word into `(value, flags)`.
pub fn unpack_header(word: u64) -> (u64, u64) {
    (word >> SECTOR_BITS, word & FLAGS_MASK)
}

/// Sends one `DEVICE_BLOCK` record: header, one-byte name length, name
/// bytes, then exactly `CHUNK_SIZE` bytes of payload (spec §6).
///
/// `buf` must be at least `CHUNK_SIZE` bytes; only the first `CHUNK_SIZE`
/// are ever sent, even if the caller's buffer is larger (bulk/dirty
/// engines always allocate exactly one chunk, per spec §3).
pub async fn send_device_block(
    stream: &mut dyn Stream,
    sector: u64,
    device_name: &str,
    buf: &[u8],
) -> Result<(), crate::error::StreamError> {
    debug_assert!(buf.len() >= CHUNK_SIZE as usize);
    debug_assert!(device_name.len() <= u8::MAX as usize);
    stream.put_u64(pack_header(sector, FLAG_DEVICE_BLOCK)).await?;
    stream.put_u8(device_name.len() as u8).await?;
    stream.put_buf(device_name.as_bytes()).await?;
    stream.put_buf(&buf[.. CHUNK_SIZE as usize]).await?;
    Ok(())
}

/// Sends an `EOS` record: header only, no payload.
pub async fn send_eos(stream: &mut dyn Stream) -> Result<(), crate::error::StreamError> {
    stream.put_u64(pack_header(0, FLAG_EOS)).await
}

/// Sends a `PROGRESS` record: the percentage (0..100) packed into the
/// header's value field, no payload.
pub async fn send_progress(stream: &mut dyn Stream, percent: u8) -> Result<(), crate::error::StreamError> {
    stream.put_u64(pack_header(percent as u64, FLAG_PROGRESS)).await
}
