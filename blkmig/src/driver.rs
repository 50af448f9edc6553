//! Transfer-loop driver (spec §4.6): the save-handler callbacks exposed
//! to the outer migration engine, sequencing bulk → iterate-dirty →
//! final-drain, honoring the rate limiter, and flushing the completion
//! queue to the stream.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use async_trait::async_trait;
use snafu::{ensure, ResultExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument};

use crate::{
    bulk,
    device::DeviceRegistry,
    dirty,
    error::{DeviceSnafu, MigrationError, StreamSnafu, SubmittedNotZeroSnafu},
    state::{DeviceState, MigrationState, Pipeline, CHUNK_SIZE, SECTORS_PER_CHUNK},
    stream::Stream,
    wire,
};

/// Control interval the original calls `BUFFER_DELAY`.
const BUFFER_DELAY_MS: u64 = 100;
/// `1000 / BUFFER_DELAY` (spec §6), converting a bytes/second bandwidth
/// limit into a per-tick byte budget.
const XFER_LIMIT_RATIO: u64 = 1000 / BUFFER_DELAY_MS;

/// Registration identifier and version the save handlers are registered
/// under with the outer migration engine (spec §6).
pub const SAVE_HANDLER_NAME: &str = "block";
pub const SAVE_HANDLER_VERSION: u32 = 1;

#[derive(Clone, Copy)]
struct PendingParams {
    blk: bool,
    shared: bool,
    bandwidth_limit: u64,
    max_downtime: Duration,
}

impl Default for PendingParams {
    fn default() -> Self {
        Self {
            blk: false,
            shared: false,
            bandwidth_limit: 0,
            max_downtime: Duration::from_secs(0),
        }
    }
}

/// The save-handler callbacks the outer migration engine invokes (spec
/// §6 "Callbacks registered with the migration engine").
#[async_trait]
pub trait SaveHandlers: Send + Sync {
    fn set_params(&self, blk: bool, shared: bool, bandwidth_limit: u64, max_downtime: Duration);
    async fn save_live_setup(&self, stream: &mut dyn Stream) -> Result<(), MigrationError>;
    async fn save_live_iterate(&self, stream: &mut dyn Stream) -> Result<(), MigrationError>;
    fn save_live_pending(&self, max: u64) -> u64;
    async fn save_live_complete(&self, stream: &mut dyn Stream) -> Result<(), MigrationError>;
    async fn cancel(&self);
    fn is_active(&self) -> bool;
}

/// Owns the block-scoped [`MigrationState`] across the handler calls; the
/// `tokio::sync::Mutex` around it is this rewrite's stand-in for the
/// original's global iothread lock (spec §5), taken around each
/// iterate/complete body.
pub struct MigrationDriver {
    registry: Arc<dyn DeviceRegistry>,
    params: std::sync::Mutex<PendingParams>,
    state: AsyncMutex<Option<MigrationState>>,
}

impl MigrationDriver {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            registry,
            params: std::sync::Mutex::new(PendingParams::default()),
            state: AsyncMutex::new(None),
        }
    }

    fn bytes_per_tick(&self) -> u64 {
        let bandwidth_limit = self.params.lock().unwrap().bandwidth_limit;
        if bandwidth_limit == 0 {
            u64::MAX
        } else {
            bandwidth_limit / XFER_LIMIT_RATIO
        }
    }
}

/// Waits for every outstanding AIO read across the whole migration to
/// complete (spec §4.5/§9 "drain"); the primary backpressure point. There
/// is no condition variable to wait on in this rewrite's lock-free
/// completion-queue design, so this polls `submitted` down to zero,
/// yielding the task between checks. Takes a [`Pipeline`] rather than
/// `&MigrationState` so the dirty engine (which holds `&mut
/// DeviceState` alongside this) can call it without an overlapping
/// borrow (DESIGN.md, "Pipeline handle").
pub async fn drain_all(pipeline: &Pipeline) {
    while pipeline.submitted.load(Ordering::SeqCst) > 0 {
        tokio::task::yield_now().await;
    }
}

/// Drains `done_queue` to `stream` while the stream is not rate-limited,
/// surfacing the first AIO read error encountered (spec §4.6 step 1).
async fn flush_blks(
    migration: &MigrationState,
    stream: &mut dyn Stream,
) -> Result<(), MigrationError> {
    while !stream.rate_limited() {
        let block = match migration.done_queue.pop() {
            Some(block) => block,
            None => break,
        };
        migration.read_done.fetch_sub(1, Ordering::SeqCst);
        match block.ret {
            Ok(()) => {
                wire::send_device_block(stream, block.sector, &block.device_name, &block.buf)
                    .await
                    .context(StreamSnafu)?;
            }
            Err(source) => {
                return Err(MigrationError::AioReadFailed {
                    device: block.device_name,
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Counts dirty chunks across every device, for `save_live_pending`.
fn dirty_chunk_count(devices: &[DeviceState]) -> u64 {
    let mut count = 0;
    for device in devices {
        let mut sector = 0;
        while sector < device.total_sectors {
            if device.device.get_dirty(sector) {
                count += 1;
            }
            sector += SECTORS_PER_CHUNK;
        }
    }
    count
}

/// Emits a `PROGRESS` frame if the overall percentage has advanced since
/// the last one sent, suppressing duplicates (spec §3 `prev_progress`).
async fn maybe_send_progress(
    migration: &MigrationState,
    stream: &mut dyn Stream,
) -> Result<(), MigrationError> {
    if migration.total_sector_sum == 0 {
        return Ok(());
    }
    let percent = (migration.bytes_transferred() * 100 / migration.bytes_total().max(1)) as i64;
    let prev = migration.prev_progress.swap(percent, Ordering::SeqCst);
    if prev != percent {
        wire::send_progress(stream, percent as u8).await.context(StreamSnafu)?;
    }
    Ok(())
}

#[async_trait]
impl SaveHandlers for MigrationDriver {
    fn set_params(&self, blk: bool, shared: bool, bandwidth_limit: u64, max_downtime: Duration) {
        // `shared` implies full block migration even if the caller forgot
        // to also set `blk` (preserved verbatim from block_set_params).
        let mut params = self.params.lock().unwrap();
        params.blk = blk || shared;
        params.shared = shared;
        params.bandwidth_limit = bandwidth_limit;
        params.max_downtime = max_downtime;
    }

    #[instrument(skip(self, stream))]
    async fn save_live_setup(&self, stream: &mut dyn Stream) -> Result<(), MigrationError> {
        let params = *self.params.lock().unwrap();
        let mut migration = MigrationState::new(params.blk, params.shared);

        for device in self.registry.iter_devices() {
            if device.read_only() || device.num_blocks() == 0 {
                continue;
            }
            device.acquire();
            device
                .set_dirty_tracking(true)
                .context(DeviceSnafu)?;
            let index = migration.devices.len();
            migration.total_sector_sum += device.num_blocks();
            migration.devices.push(DeviceState::new(index, device, params.shared));
        }

        info!(devices = migration.devices.len(), "migration setup complete");

        flush_blks(&migration, stream).await?;
        wire::send_eos(stream).await.context(StreamSnafu)?;

        *self.state.lock().await = Some(migration);
        Ok(())
    }

    #[instrument(skip(self, stream))]
    async fn save_live_iterate(&self, stream: &mut dyn Stream) -> Result<(), MigrationError> {
        let mut guard = self.state.lock().await;
        let migration = guard.as_mut().ok_or_else(|| MigrationError::UnexpectedState {
            operation: "save_live_iterate".to_string(),
            state: "uninitialized".to_string(),
        })?;
        let pipeline = migration.pipeline();

        flush_blks(migration, stream).await?;

        for device in migration.devices.iter_mut() {
            device.cur_dirty = 0;
        }

        let budget = self.bytes_per_tick();
        stream.reset_rate_limit(budget);

        let mut consecutive_done = 0usize;
        loop {
            let outstanding =
                (migration.submitted.load(Ordering::SeqCst) + migration.read_done.load(Ordering::SeqCst)) as u64
                    * CHUNK_SIZE;
            if outstanding >= budget {
                break;
            }

            if !migration.bulk_completed {
                match migration.devices.iter().position(|d| !d.bulk_completed) {
                    Some(idx) => {
                        let done = bulk::mig_save_bulk(&pipeline, &mut migration.devices[idx]).await;
                        if done && idx == migration.devices.len() - 1 {
                            migration.bulk_completed = true;
                        }
                    }
                    None => migration.bulk_completed = true,
                }
                continue;
            }

            let n = migration.devices.len();
            if n == 0 {
                break;
            }
            let idx = migration.next_dirty_device % n;
            let done = dirty::mig_save_dirty(&pipeline, &mut migration.devices[idx], stream, true).await?;
            if done {
                migration.next_dirty_device = (migration.next_dirty_device + 1) % n;
                consecutive_done += 1;
                if consecutive_done >= n {
                    break;
                }
            } else {
                consecutive_done = 0;
            }
        }

        flush_blks(migration, stream).await?;
        debug!(
            submitted = migration.submitted.load(Ordering::SeqCst),
            read_done = migration.read_done.load(Ordering::SeqCst),
            "iterate tick complete",
        );
        maybe_send_progress(migration, stream).await?;
        wire::send_eos(stream).await.context(StreamSnafu)?;
        Ok(())
    }

    fn save_live_pending(&self, _max: u64) -> u64 {
        let guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => return u64::MAX,
        };
        let migration = match guard.as_ref() {
            Some(migration) => migration,
            None => return 0,
        };
        if !migration.bulk_completed {
            // bulk still running: pending is effectively infinite from the
            // outer loop's perspective, which drives iteration regardless.
            return u64::MAX;
        }
        dirty_chunk_count(&migration.devices) * CHUNK_SIZE
    }

    #[instrument(skip(self, stream))]
    async fn save_live_complete(&self, stream: &mut dyn Stream) -> Result<(), MigrationError> {
        let mut guard = self.state.lock().await;
        let migration = guard.as_mut().ok_or_else(|| MigrationError::UnexpectedState {
            operation: "save_live_complete".to_string(),
            state: "uninitialized".to_string(),
        })?;
        let pipeline = migration.pipeline();

        flush_blks(migration, stream).await?;

        ensure!(
            migration.submitted.load(Ordering::SeqCst) == 0,
            SubmittedNotZeroSnafu { submitted: migration.submitted.load(Ordering::SeqCst) }
        );

        // synchronous final drain: keep sweeping every device until each
        // reports no more dirty chunks.
        let n = migration.devices.len();
        let mut pending: Vec<usize> = (0 .. n).collect();
        while !pending.is_empty() {
            let mut next_pending = Vec::new();
            for idx in pending {
                let done = dirty::mig_save_dirty(&pipeline, &mut migration.devices[idx], stream, false).await?;
                if !done {
                    next_pending.push(idx);
                }
            }
            pending = next_pending;
        }

        cleanup(migration).await;

        wire::send_progress(stream, 100).await.context(StreamSnafu)?;
        wire::send_eos(stream).await.context(StreamSnafu)?;

        *guard = None;
        Ok(())
    }

    async fn cancel(&self) {
        let mut guard = self.state.lock().await;
        if let Some(migration) = guard.as_mut() {
            cleanup(migration).await;
        }
        *guard = None;
    }

    fn is_active(&self) -> bool {
        match self.state.try_lock() {
            Ok(guard) => guard.as_ref().map(MigrationState::is_active).unwrap_or(false),
            Err(_) => true,
        }
    }
}

/// Drains all AIO, disables dirty tracking, and releases every device's
/// in-use refcount (spec §3 "Lifecycle", §4.6 `cleanup`).
async fn cleanup(migration: &mut MigrationState) {
    drain_all(&migration.pipeline()).await;
    for device in &migration.devices {
        let _ = device.device.set_dirty_tracking(false);
        device.device.release();
    }
    migration.devices.clear();
    while migration.done_queue.pop().is_some() {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        device::{MemDevice, StaticRegistry},
        stream::MemStream,
    };

    #[tokio::test]
    async fn complete_rejects_outstanding_aio() {
        let registry: Arc<dyn DeviceRegistry> =
            Arc::new(StaticRegistry::new(vec![Arc::new(MemDevice::new("disk0", SECTORS_PER_CHUNK))]));
        let driver = MigrationDriver::new(registry);
        driver.set_params(true, false, 0, Duration::from_millis(300));

        let mut stream = MemStream::new_writer();
        driver.save_live_setup(&mut stream).await.unwrap();

        // simulate an AIO read still outstanding, without actually
        // completing one — exercises the precondition check in isolation.
        {
            let mut guard = driver.state.lock().await;
            let migration = guard.as_mut().unwrap();
            migration.submitted.fetch_add(1, Ordering::SeqCst);
        }

        let mut stream = MemStream::new_writer();
        let err = driver.save_live_complete(&mut stream).await.unwrap_err();
        assert_matches!(err, MigrationError::SubmittedNotZero { submitted: 1 });
    }

    #[tokio::test]
    async fn set_params_shared_implies_blk() {
        let registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![]));
        let driver = MigrationDriver::new(registry);
        driver.set_params(false, true, 0, Duration::from_secs(0));
        assert!(driver.params.lock().unwrap().blk);
    }
}
