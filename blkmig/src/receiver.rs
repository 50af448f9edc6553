//! Receiving side (spec §4.6 `load`, §6, §7): reconstructs block-device
//! state from a framed stream until `EOS`.

use snafu::{OptionExt, ResultExt};
use tracing::info;

use crate::{
    device::DeviceRegistry,
    error::{DeviceWriteFailedSnafu, ReceiveError, StreamFailedSnafu},
    state::{CHUNK_SIZE, SECTORS_PER_CHUNK},
    stream::Stream,
    wire::{self, FLAG_DEVICE_BLOCK, FLAG_EOS, FLAG_PROGRESS},
};

/// Reads framed records from `stream` until `EOS`, writing `DEVICE_BLOCK`
/// payloads to the matching device in `registry` and logging `PROGRESS`
/// updates. Returns once a single save phase's stream slice is consumed —
/// callers invoke it again per `save_live_iterate`/`save_live_complete`
/// the sender emits, same as the original's per-phase framing.
pub async fn load(stream: &mut dyn Stream, registry: &dyn DeviceRegistry) -> Result<(), ReceiveError> {
    // one-time banner before the first progress line, matching the
    // original's `banner_printed` — cosmetic, not a protocol feature.
    let mut banner_printed = false;
    // cache avoids re-querying device length on every DEVICE_BLOCK for the
    // same device, mirroring the original.
    let mut cached_name: Option<String> = None;
    let mut cached_total_sectors: u64 = 0;

    loop {
        let header = stream.get_u64().await.context(StreamFailedSnafu)?;
        let (value, flags) = wire::unpack_header(header);

        match flags {
            f if f == FLAG_DEVICE_BLOCK => {
                let name_len = stream.get_u8().await.context(StreamFailedSnafu)? as usize;
                let mut name_buf = vec![0u8; name_len];
                stream.get_buf(&mut name_buf).await.context(StreamFailedSnafu)?;
                let name = String::from_utf8_lossy(&name_buf).into_owned();

                let device = registry
                    .by_name(&name)
                    .context(crate::error::UnknownDeviceSnafu { name: name.clone() })?;

                if cached_name.as_deref() != Some(name.as_str()) {
                    cached_total_sectors = device.num_blocks();
                    cached_name = Some(name.clone());
                    if cached_total_sectors == 0 {
                        return Err(ReceiveError::ZeroLengthDevice { name });
                    }
                }

                let sector = value;
                let mut payload = vec![0u8; CHUNK_SIZE as usize];
                stream.get_buf(&mut payload).await.context(StreamFailedSnafu)?;

                let nr_sectors = SECTORS_PER_CHUNK.min(cached_total_sectors.saturating_sub(sector));
                device
                    .write_at(sector, nr_sectors, &payload)
                    .context(DeviceWriteFailedSnafu)?;
            }
            f if f == FLAG_PROGRESS => {
                if !banner_printed {
                    info!("receiving block migration data");
                    banner_printed = true;
                }
                info!(percent = value, "migration progress");
            }
            f if f == FLAG_EOS => {
                return Ok(());
            }
            other => {
                return Err(ReceiveError::UnknownFlag { flags: other });
            }
        }
    }
}
