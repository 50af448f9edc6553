//! Per-device dirty-bitmap adaptor (spec §4.3).
//!
//! The external [`crate::device::BlockDevice`] owns the actual per-sector
//! dirty bit (set by the guest's write path, queried/reset by us). This
//! module only owns the chunk-granularity AIO-inflight bitmap that mediates
//! between a read submitted by the bulk/dirty engines and a guest write
//! landing on the same chunk while that read is still outstanding.
//!
//! Bit layout is private to this process and is never put on the wire.

use bit_vec::BitVec;

use crate::state::SECTORS_PER_CHUNK;

/// Tracks, at chunk granularity, which chunks of one device have an AIO
/// read outstanding.
#[derive(Debug, Clone)]
pub struct InflightBitmap {
    bits: BitVec,
    total_sectors: u64,
}

fn sector_to_chunk(sector: u64) -> usize {
    (sector / SECTORS_PER_CHUNK) as usize
}

impl InflightBitmap {
    /// Sizes the bitmap to `ceil(total_chunks)` bits for a device of
    /// `total_sectors` sectors (spec: `alloc`).
    pub fn alloc(total_sectors: u64) -> Self {
        let total_chunks = (total_sectors + SECTORS_PER_CHUNK - 1) / SECTORS_PER_CHUNK;
        Self {
            bits: BitVec::from_elem(total_chunks.max(1) as usize, false),
            total_sectors,
        }
    }

    /// Sets or clears the inflight bit for every chunk overlapping
    /// `[sector, sector + nr_sectors)` (spec: `set_inflight`).
    pub fn set_inflight(&mut self, sector: u64, nr_sectors: u64, value: bool) {
        assert!(nr_sectors > 0);
        let start = sector_to_chunk(sector);
        let end = sector_to_chunk(sector + nr_sectors - 1);
        for chunk in start ..= end {
            if chunk < self.bits.len() {
                self.bits.set(chunk, value);
            }
        }
    }

    /// Tests the chunk-bit covering `sector`. Sectors past end-of-device
    /// always report not-inflight (spec: `is_inflight`).
    pub fn is_inflight(&self, sector: u64) -> bool {
        if sector >= self.total_sectors {
            return false;
        }
        self.bits.get(sector_to_chunk(sector)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_all_clear() {
        let bm = InflightBitmap::alloc(10 * SECTORS_PER_CHUNK);
        assert!(!bm.is_inflight(0));
        assert!(!bm.is_inflight(5 * SECTORS_PER_CHUNK));
    }

    #[test]
    fn set_and_clear_single_chunk() {
        let mut bm = InflightBitmap::alloc(4 * SECTORS_PER_CHUNK);
        bm.set_inflight(SECTORS_PER_CHUNK, SECTORS_PER_CHUNK, true);
        assert!(!bm.is_inflight(0));
        assert!(bm.is_inflight(SECTORS_PER_CHUNK));
        assert!(bm.is_inflight(SECTORS_PER_CHUNK + 5));
        bm.set_inflight(SECTORS_PER_CHUNK, SECTORS_PER_CHUNK, false);
        assert!(!bm.is_inflight(SECTORS_PER_CHUNK));
    }

    #[test]
    fn spanning_write_sets_every_overlapped_chunk() {
        let mut bm = InflightBitmap::alloc(4 * SECTORS_PER_CHUNK);
        // a read spanning a chunk boundary marks both chunks inflight
        bm.set_inflight(SECTORS_PER_CHUNK - 1, 2, true);
        assert!(bm.is_inflight(SECTORS_PER_CHUNK - 1));
        assert!(bm.is_inflight(SECTORS_PER_CHUNK));
    }

    #[test]
    fn sectors_past_end_of_device_are_never_inflight() {
        let total = 3 * SECTORS_PER_CHUNK + 10;
        let mut bm = InflightBitmap::alloc(total);
        // even if we (incorrectly) set the tail chunk, querying past the
        // device boundary must report false
        bm.set_inflight(3 * SECTORS_PER_CHUNK, 10, true);
        assert!(bm.is_inflight(total - 1));
        assert!(!bm.is_inflight(total));
        assert!(!bm.is_inflight(total + 1000));
    }
}
