//! Dirty-phase engine (spec §4.5): a per-device scanning cursor that
//! finds the next dirty chunk, issues either an async or a sync read for
//! it, and clears the dirty mark.

use snafu::ResultExt;

use crate::{
    bulk,
    error::{DirtyReadFailedSnafu, MigrationError, StreamSnafu},
    state::{Block, DeviceState, Pipeline, SECTORS_PER_CHUNK},
    stream::Stream,
    wire,
};

/// Scans `device` from its `cur_dirty` cursor for the next dirty chunk,
/// handles at most one chunk, and reports whether the scan reached the
/// end of the device with nothing left dirty.
///
/// `stream` is only touched on the synchronous (`is_async == false`,
/// stop-the-world) path, where the freshly read chunk is framed directly
/// onto it, bypassing `done_queue` entirely since the driver is not
/// iterating anymore. Takes a [`Pipeline`] rather than the owning
/// `MigrationState` for the same reason as `bulk::mig_save_bulk`
/// (DESIGN.md, "Pipeline handle").
pub async fn mig_save_dirty(
    pipeline: &Pipeline,
    device: &mut DeviceState,
    stream: &mut dyn Stream,
    is_async: bool,
) -> Result<bool, MigrationError> {
    let mut sector = device.cur_dirty;

    while sector < device.total_sectors {
        let inflight = device.aio_inflight.lock().unwrap().is_inflight(sector);
        if inflight {
            crate::driver::drain_all(pipeline).await;
        }

        if device.device.get_dirty(sector) {
            let nr_sectors = SECTORS_PER_CHUNK.min(device.total_sectors - sector);

            if is_async {
                bulk::submit_read(pipeline, device, sector, nr_sectors).await;
            } else {
                let mut buf = Block::new_buffer();
                device
                    .device
                    .read_at(sector, nr_sectors, &mut buf)
                    .await
                    .context(DirtyReadFailedSnafu { device: device.name() })?;
                wire::send_device_block(stream, sector, &device.name(), &buf)
                    .await
                    .context(StreamSnafu)?;
            }

            device.device.reset_dirty(sector, nr_sectors);
            device.cur_dirty = sector + nr_sectors;
            return Ok(false);
        }

        sector += SECTORS_PER_CHUNK;
        device.cur_dirty = sector;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{device::MemDevice, state::MigrationState, stream::MemStream};

    #[tokio::test]
    async fn sync_path_sends_dirty_chunk_directly_bypassing_done_queue() {
        let migration = MigrationState::new(true, false);
        let pipeline = migration.pipeline();
        let device = Arc::new(MemDevice::new("disk0", 2 * SECTORS_PER_CHUNK));
        device.guest_write(0, 1, 0xab); // no tracking yet, just data
        device.set_dirty_tracking(true).unwrap();
        device.guest_write(0, 1, 0xcd);
        let mut state = DeviceState::new(0, device, false);

        let mut stream = MemStream::new_writer();
        let done = mig_save_dirty(&pipeline, &mut state, &mut stream, false).await.unwrap();
        assert!(!done);
        assert!(pipeline.done_queue.is_empty());
        assert_eq!(state.cur_dirty, SECTORS_PER_CHUNK);

        let done = mig_save_dirty(&pipeline, &mut state, &mut stream, false).await.unwrap();
        assert!(done);

        let bytes = stream.into_written();
        // header + device block: 8 byte header + 1 byte name len + name + chunk
        assert!(bytes.len() >= 8 + 1 + "disk0".len() + crate::state::CHUNK_SIZE as usize);
    }

    #[tokio::test]
    async fn clean_device_reports_done_with_no_frames() {
        let migration = MigrationState::new(true, false);
        let pipeline = migration.pipeline();
        let device = Arc::new(MemDevice::new("disk0", SECTORS_PER_CHUNK));
        let mut state = DeviceState::new(0, device, false);
        let mut stream = MemStream::new_writer();

        let done = mig_save_dirty(&pipeline, &mut state, &mut stream, false).await.unwrap();
        assert!(done);
        assert!(stream.into_written().is_empty());
    }
}
