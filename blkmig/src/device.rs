//! The external block-device boundary (spec §1: "out of scope: Device").
//!
//! `blkmig` only calls through this trait; a production implementation
//! (SPDK bdev, a kernel block device, whatever the host platform offers)
//! lives outside this crate, exactly as the teacher's `core::BlockDevice`
//! wraps SPDK and nothing upstream of it is specified here either.
//! [`MemDevice`] is the in-memory double this crate's own tests exercise
//! the migration core against.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use bit_vec::BitVec;

use crate::error::DeviceError;

/// A live, writable block device whose contents this crate may migrate.
///
/// All sector offsets and lengths are in units of [`crate::state::SECTOR_SIZE`]-byte
/// sectors, never bytes.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Stable name used to address this device on the wire.
    fn device_name(&self) -> String;

    /// Device length in sectors.
    fn num_blocks(&self) -> u64;

    /// Whether the device is opened read-only (read-only devices are
    /// never migrated; spec §4.6 `save_setup`).
    fn read_only(&self) -> bool;

    /// Reports whether `[sector, sector + run)` is allocated, where `run`
    /// is capped at `max_search` sectors. Returns `(allocated, run)`; `run`
    /// is always `> 0` and `<= max_search`. Devices with no concept of
    /// sparse allocation should always report `(true, max_search)`.
    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64);

    /// Enables or disables per-sector dirty tracking for the guest's
    /// write path.
    fn set_dirty_tracking(&self, enable: bool) -> Result<(), DeviceError>;

    /// Tests the dirty bit covering `sector`.
    fn get_dirty(&self, sector: u64) -> bool;

    /// Clears the dirty bits over `[sector, sector + nr_sectors)`.
    fn reset_dirty(&self, sector: u64, nr_sectors: u64);

    /// Submits a read of `nr_sectors` sectors starting at `sector` into
    /// `buf` (`buf.len() >= nr_sectors * SECTOR_SIZE`). Modeled as a plain
    /// async fn rather than a callback-based AIO submission: the driver
    /// decides whether to `.await` it inline (the original's synchronous
    /// path) or hand it to a spawned task and track completion via the
    /// done-queue (the original's AIO path) — see `driver.rs`.
    async fn read_at(
        &self,
        sector: u64,
        nr_sectors: u64,
        buf: &mut [u8],
    ) -> Result<(), DeviceError>;

    /// Writes `nr_sectors` sectors starting at `sector` from `buf`. Used
    /// only by the receiving side (`receiver.rs`).
    fn write_at(&self, sector: u64, nr_sectors: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Increments the device's in-use refcount (`drive_get_ref` /
    /// `bdrv_set_in_use` in the original).
    fn acquire(&self);

    /// Decrements the device's in-use refcount (`drive_put_ref` /
    /// `bdrv_set_in_use(.., 0)`).
    fn release(&self);
}

/// A registry of devices the migration setup phase iterates (spec §4.6
/// `save_setup`: "iterate the external device registry").
pub trait DeviceRegistry: Send + Sync {
    fn iter_devices(&self) -> Vec<Arc<dyn BlockDevice>>;

    /// Looks a device up by name, used by the receiver (`receiver.rs`).
    fn by_name(&self, name: &str) -> Option<Arc<dyn BlockDevice>>;
}

/// A plain `Vec`-backed registry, the in-memory analogue of iterating
/// `bdrv_iterate`/a real block-device manager.
#[derive(Default, Clone)]
pub struct StaticRegistry {
    devices: Vec<Arc<dyn BlockDevice>>,
}

impl StaticRegistry {
    pub fn new(devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        Self { devices }
    }
}

impl DeviceRegistry for StaticRegistry {
    fn iter_devices(&self) -> Vec<Arc<dyn BlockDevice>> {
        self.devices.clone()
    }

    fn by_name(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .iter()
            .find(|d| d.device_name() == name)
            .cloned()
    }
}

/// An in-memory block device, used by this crate's own tests and by
/// `blkmigd`'s demo mode. Allocation is modeled by an explicit hole list
/// rather than real sparse-file semantics.
pub struct MemDevice {
    name: String,
    block_len: u64,
    num_blocks: u64,
    read_only: bool,
    data: std::sync::Mutex<Vec<u8>>,
    dirty: std::sync::Mutex<BitVec>,
    dirty_tracking: AtomicBool,
    in_use: AtomicUsize,
    /// Sector ranges reported as unallocated (holes), for shared-base
    /// tests. Ranges are `[start, end)` in sectors.
    holes: Vec<(u64, u64)>,
}

impl MemDevice {
    pub fn new(name: impl Into<String>, num_blocks: u64) -> Self {
        Self::with_holes(name, num_blocks, Vec::new())
    }

    pub fn with_holes(name: impl Into<String>, num_blocks: u64, holes: Vec<(u64, u64)>) -> Self {
        let block_len = crate::state::SECTOR_SIZE;
        Self {
            name: name.into(),
            block_len,
            num_blocks,
            read_only: false,
            data: std::sync::Mutex::new(vec![0u8; (num_blocks * block_len) as usize]),
            dirty: std::sync::Mutex::new(BitVec::from_elem(num_blocks as usize, false)),
            dirty_tracking: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            holes,
        }
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Test helper: fills `[sector, sector+nr_sectors)` with `pattern` and,
    /// if dirty tracking is enabled, marks those sectors dirty the way a
    /// guest write would.
    pub fn guest_write(&self, sector: u64, nr_sectors: u64, pattern: u8) {
        let off = (sector * self.block_len) as usize;
        let len = (nr_sectors * self.block_len) as usize;
        let mut data = self.data.lock().unwrap();
        data[off .. off + len].iter_mut().for_each(|b| *b = pattern);
        drop(data);
        if self.dirty_tracking.load(Ordering::SeqCst) {
            let mut dirty = self.dirty.lock().unwrap();
            for s in sector .. sector + nr_sectors {
                dirty.set(s as usize, true);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn dirty_tracking_enabled(&self) -> bool {
        self.dirty_tracking.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64) {
        for &(start, end) in &self.holes {
            if sector >= start && sector < end {
                let run = (end - sector).min(max_search);
                return (false, run);
            }
            if sector < start {
                let run = (start - sector).min(max_search);
                return (true, run);
            }
        }
        (true, max_search.min(self.num_blocks.saturating_sub(sector)).max(1))
    }

    fn set_dirty_tracking(&self, enable: bool) -> Result<(), DeviceError> {
        self.dirty_tracking.store(enable, Ordering::SeqCst);
        Ok(())
    }

    fn get_dirty(&self, sector: u64) -> bool {
        self.dirty.lock().unwrap().get(sector as usize).unwrap_or(false)
    }

    fn reset_dirty(&self, sector: u64, nr_sectors: u64) {
        let mut dirty = self.dirty.lock().unwrap();
        for s in sector .. (sector + nr_sectors).min(self.num_blocks) {
            dirty.set(s as usize, false);
        }
    }

    async fn read_at(
        &self,
        sector: u64,
        nr_sectors: u64,
        buf: &mut [u8],
    ) -> Result<(), DeviceError> {
        let off = (sector * self.block_len) as usize;
        let len = (nr_sectors * self.block_len) as usize;
        let data = self.data.lock().unwrap();
        if off + len > data.len() {
            return Err(DeviceError::ReadFailed {
                name: self.name.clone(),
                sector,
                len: nr_sectors,
            });
        }
        buf[.. len].copy_from_slice(&data[off .. off + len]);
        Ok(())
    }

    fn write_at(&self, sector: u64, nr_sectors: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let off = (sector * self.block_len) as usize;
        let len = (nr_sectors * self.block_len) as usize;
        let mut data = self.data.lock().unwrap();
        if off + len > data.len() || buf.len() < len {
            return Err(DeviceError::WriteFailed {
                name: self.name.clone(),
                sector,
                len: nr_sectors,
            });
        }
        data[off .. off + len].copy_from_slice(&buf[.. len]);
        Ok(())
    }

    fn acquire(&self) {
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
