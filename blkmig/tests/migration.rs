//! End-to-end tests driving the full sender/receiver pipeline over
//! in-memory devices and streams (spec §8 concrete scenarios).

use std::sync::Arc;

use blkmig::{
    device::{BlockDevice, DeviceRegistry, MemDevice, StaticRegistry},
    driver::SaveHandlers,
    receiver,
    state::SECTORS_PER_CHUNK,
    stream::{MemStream, Stream},
    MigrationDriver,
};

async fn settle(migration_ticks: usize) {
    for _ in 0 .. migration_ticks {
        tokio::task::yield_now().await;
    }
}

/// Drives `driver` through setup, enough iterate ticks to exhaust both
/// bulk and dirty work, and a final complete; returns the concatenated
/// wire bytes of every phase plus how many phases were emitted (the
/// receiver must call `load` once per phase).
async fn run_sender(driver: &MigrationDriver, max_ticks: usize) -> (Vec<u8>, usize) {
    let mut all = Vec::new();
    let mut phases = 0;

    let mut stream = MemStream::new_writer();
    driver.save_live_setup(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;

    for _ in 0 .. max_ticks {
        let mut stream = MemStream::new_writer();
        driver.save_live_iterate(&mut stream).await.unwrap();
        all.extend(stream.into_written());
        phases += 1;
        settle(8).await;
    }

    let mut stream = MemStream::new_writer();
    driver.save_live_complete(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;

    (all, phases)
}

async fn run_receiver(bytes: Vec<u8>, phases: usize, registry: &dyn DeviceRegistry) {
    let mut stream = MemStream::new_reader(bytes);
    for _ in 0 .. phases {
        receiver::load(&mut stream, registry).await.unwrap();
    }
}

#[tokio::test]
async fn idle_guest_round_trip_is_byte_identical() {
    let source = Arc::new(MemDevice::new("disk0", 2 * SECTORS_PER_CHUNK));
    source.guest_write(0, 2 * SECTORS_PER_CHUNK, 0xab);
    let dest = Arc::new(MemDevice::new("disk0", 2 * SECTORS_PER_CHUNK));

    let src_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![source.clone() as Arc<dyn BlockDevice>]));
    let dest_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![dest.clone() as Arc<dyn BlockDevice>]));

    let driver = MigrationDriver::new(src_registry);
    driver.set_params(true, false, 0, std::time::Duration::from_millis(300));

    let (bytes, phases) = run_sender(&driver, 6).await;
    run_receiver(bytes, phases, dest_registry.as_ref()).await;

    assert_eq!(source.snapshot(), dest.snapshot());
}

#[tokio::test]
async fn partial_tail_chunk_is_handled() {
    // 1.5 MiB device: 3 * SECTORS_PER_CHUNK / 2 sectors when SECTORS_PER_CHUNK
    // covers 1 MiB; use 1.5 chunks worth regardless of the concrete chunk size.
    let total_sectors = SECTORS_PER_CHUNK + SECTORS_PER_CHUNK / 2;
    let source = Arc::new(MemDevice::new("disk0", total_sectors));
    source.guest_write(0, total_sectors, 0x42);
    let dest = Arc::new(MemDevice::new("disk0", total_sectors));

    let src_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![source.clone() as Arc<dyn BlockDevice>]));
    let dest_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![dest.clone() as Arc<dyn BlockDevice>]));

    let driver = MigrationDriver::new(src_registry);
    driver.set_params(true, false, 0, std::time::Duration::from_millis(300));

    let (bytes, phases) = run_sender(&driver, 6).await;
    run_receiver(bytes, phases, dest_registry.as_ref()).await;

    assert_eq!(source.snapshot(), dest.snapshot());
}

#[tokio::test]
async fn dirty_chunk_written_during_iterate_wins_last() {
    let total_sectors = SECTORS_PER_CHUNK;
    let source = Arc::new(MemDevice::new("disk0", total_sectors));
    source.guest_write(0, total_sectors, 0x11);
    let dest = Arc::new(MemDevice::new("disk0", total_sectors));

    let src_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![source.clone() as Arc<dyn BlockDevice>]));
    let dest_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![dest.clone() as Arc<dyn BlockDevice>]));

    let driver = MigrationDriver::new(src_registry);
    driver.set_params(true, false, 0, std::time::Duration::from_millis(300));

    let mut all = Vec::new();
    let mut phases = 0;

    let mut stream = MemStream::new_writer();
    driver.save_live_setup(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;

    // first iterate: bulk copies the whole (one-chunk) device.
    let mut stream = MemStream::new_writer();
    driver.save_live_iterate(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;
    settle(8).await;

    // guest dirties the device after the bulk send.
    source.set_dirty_tracking(true).unwrap();
    source.guest_write(0, total_sectors, 0x22);

    // second iterate: dirty phase resends the changed chunk.
    let mut stream = MemStream::new_writer();
    driver.save_live_iterate(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;
    settle(8).await;

    let mut stream = MemStream::new_writer();
    driver.save_live_complete(&mut stream).await.unwrap();
    all.extend(stream.into_written());
    phases += 1;

    run_receiver(all, phases, dest_registry.as_ref()).await;

    assert_eq!(dest.snapshot(), source.snapshot());
}

#[tokio::test]
async fn shared_base_hole_emits_no_frames_for_the_hole() {
    let total_sectors = 3 * SECTORS_PER_CHUNK;
    let source = Arc::new(MemDevice::with_holes(
        "disk0",
        total_sectors,
        vec![(0, 2 * SECTORS_PER_CHUNK)],
    ));
    source.guest_write(2 * SECTORS_PER_CHUNK, SECTORS_PER_CHUNK, 0x77);
    let dest = Arc::new(MemDevice::new("disk0", total_sectors));

    let src_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![source.clone() as Arc<dyn BlockDevice>]));
    let dest_registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![dest.clone() as Arc<dyn BlockDevice>]));

    let driver = MigrationDriver::new(src_registry);
    driver.set_params(true, true, 0, std::time::Duration::from_millis(300));

    let (bytes, phases) = run_sender(&driver, 6).await;
    // two full-chunk device-block frames worth of payload: 1 shared-base
    // skip leaves only the final allocated chunk to send.
    run_receiver(bytes, phases, dest_registry.as_ref()).await;

    assert_eq!(&dest.snapshot()[(2 * SECTORS_PER_CHUNK * 512) as usize ..], &source.snapshot()[(2 * SECTORS_PER_CHUNK * 512) as usize ..]);
}

#[tokio::test]
async fn cancel_releases_devices_and_disables_dirty_tracking() {
    let source = Arc::new(MemDevice::new("disk0", SECTORS_PER_CHUNK));
    let registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![source.clone() as Arc<dyn BlockDevice>]));

    let driver = MigrationDriver::new(registry);
    driver.set_params(true, false, 0, std::time::Duration::from_millis(300));

    let mut stream = MemStream::new_writer();
    driver.save_live_setup(&mut stream).await.unwrap();
    assert_eq!(source.in_use_count(), 1);
    assert!(source.dirty_tracking_enabled());

    driver.cancel().await;

    assert_eq!(source.in_use_count(), 0);
    assert!(!source.dirty_tracking_enabled());
    assert!(!driver.is_active());
}
