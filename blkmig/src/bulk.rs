//! Bulk-phase engine (spec §4.4): a per-device linear cursor emitting one
//! chunk per call, optionally hopping over unallocated extents when the
//! device is in shared-base mode.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::state::{Block, DeviceState, Pipeline, MAX_IS_ALLOCATED_SEARCH, SECTORS_PER_CHUNK};

/// Emits (schedules a read for) the next chunk of `device` and reports
/// whether this call finished the device's bulk phase.
///
/// The original signature threads a `stream` parameter through
/// `mig_save_bulk`; this rewrite drops it because bulk-phase chunks are
/// only ever queued onto `done_queue` here — the stream is touched solely
/// by `driver::flush_blks` when it later drains that queue (see
/// DESIGN.md). Takes a [`Pipeline`] rather than the owning
/// `MigrationState` so callers can hold this alongside `&mut
/// device`'s sibling in `MigrationState::devices` without a borrow
/// conflict (DESIGN.md, "Pipeline handle").
pub async fn mig_save_bulk(pipeline: &Pipeline, device: &mut DeviceState) -> bool {
    if device.shared_base {
        while device.cur_sector < device.total_sectors {
            let (allocated, run) = device
                .device
                .is_allocated(device.cur_sector, MAX_IS_ALLOCATED_SEARCH);
            if allocated {
                break;
            }
            trace!(
                device = %device.name(),
                sector = device.cur_sector,
                run,
                "bulk: skipping unallocated range",
            );
            device.cur_sector += run;
        }
    }

    if device.cur_sector >= device.total_sectors {
        device.completed_sectors = device.total_sectors;
        device.bulk_completed = true;
        return true;
    }

    // pre-increment progress before the chunk-alignment step below, per
    // spec step 3 — sectors already completed within a partial leading
    // chunk are re-read, which is cheap and simpler than a sub-chunk
    // cursor.
    device.completed_sectors = device.cur_sector;
    device.cur_sector -= device.cur_sector % SECTORS_PER_CHUNK;

    let sector = device.cur_sector;
    let nr_sectors = SECTORS_PER_CHUNK.min(device.total_sectors - sector);

    submit_read(pipeline, device, sector, nr_sectors).await;

    // the data just scheduled is "clean" for dirty-phase purposes from
    // this point on.
    device.device.reset_dirty(sector, nr_sectors);
    device.cur_sector += nr_sectors;

    device.bulk_completed = device.cur_sector >= device.total_sectors;
    if device.bulk_completed {
        device.completed_sectors = device.total_sectors;
    }
    device.bulk_completed
}

/// Submits the read backing one chunk, shared by the bulk engine and the
/// dirty engine's async path: spawns a task that awaits the device read,
/// latches the result onto a `Block`, and pushes it onto the shared
/// completion queue. This is the async stand-in for the original's
/// AIO-completion callback appending to `done_queue` (DESIGN.md, "AIO
/// callback context", strategy (b)).
pub(crate) async fn submit_read(
    pipeline: &Pipeline,
    device: &DeviceState,
    sector: u64,
    nr_sectors: u64,
) {
    device
        .aio_inflight
        .lock()
        .unwrap()
        .set_inflight(sector, nr_sectors, true);
    pipeline.submitted.fetch_add(1, Ordering::SeqCst);

    let dev = device.device.clone();
    let device_index = device.index;
    let device_name = device.name();
    let inflight = device.aio_inflight.clone();
    let done_queue = pipeline.done_queue.clone();
    let submitted = pipeline.submitted.clone();
    let read_done = pipeline.read_done.clone();

    tokio::spawn(async move {
        let mut buf = Block::new_buffer();
        let ret = dev.read_at(sector, nr_sectors, &mut buf).await;
        let block = Block {
            device_index,
            device_name,
            sector,
            nr_sectors,
            buf,
            ret,
        };
        done_queue.push(block);
        inflight.lock().unwrap().set_inflight(sector, nr_sectors, false);
        submitted.fetch_sub(1, Ordering::SeqCst);
        read_done.fetch_add(1, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{device::MemDevice, state::MigrationState};

    async fn drain(pipeline: &Pipeline) {
        for _ in 0 .. 16 {
            tokio::task::yield_now().await;
        }
        while !pipeline.done_queue.is_empty() {
            pipeline.done_queue.pop();
        }
    }

    #[tokio::test]
    async fn bulk_emits_one_chunk_per_call_until_done() {
        let migration = MigrationState::new(true, false);
        let pipeline = migration.pipeline();
        let device = Arc::new(MemDevice::new("disk0", 2 * SECTORS_PER_CHUNK));
        let mut state = DeviceState::new(0, device, false);

        assert!(!mig_save_bulk(&pipeline, &mut state).await);
        assert_eq!(state.cur_sector, SECTORS_PER_CHUNK);
        assert!(mig_save_bulk(&pipeline, &mut state).await);
        assert_eq!(state.cur_sector, 2 * SECTORS_PER_CHUNK);
        assert!(state.bulk_completed);
        drain(&pipeline).await;
    }

    #[tokio::test]
    async fn shared_base_skips_unallocated_holes() {
        let migration = MigrationState::new(true, true);
        let pipeline = migration.pipeline();
        // a 2-chunk hole followed by 1 chunk of allocated data.
        let device = Arc::new(MemDevice::with_holes(
            "disk0",
            3 * SECTORS_PER_CHUNK,
            vec![(0, 2 * SECTORS_PER_CHUNK)],
        ));
        let mut state = DeviceState::new(0, device, true);

        let done = mig_save_bulk(&pipeline, &mut state).await;
        assert_eq!(state.cur_sector, 3 * SECTORS_PER_CHUNK);
        assert!(done);
        assert!(state.bulk_completed);
        drain(&pipeline).await;
    }

    #[tokio::test]
    async fn fully_unallocated_shared_base_device_emits_nothing() {
        let migration = MigrationState::new(true, true);
        let pipeline = migration.pipeline();
        let device = Arc::new(MemDevice::with_holes(
            "disk0",
            2 * SECTORS_PER_CHUNK,
            vec![(0, 2 * SECTORS_PER_CHUNK)],
        ));
        let mut state = DeviceState::new(0, device, true);

        assert!(mig_save_bulk(&pipeline, &mut state).await);
        assert_eq!(pipeline.submitted.load(Ordering::SeqCst), 0);
    }
}
