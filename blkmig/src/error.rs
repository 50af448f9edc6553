//! Error types for the migration core, one `snafu` enum per failure domain,
//! mirroring the granularity the rebuild job used upstream.

use snafu::Snafu;

/// Obtain the full error chain as a single formatted string.
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    fn verbose(&self) -> String {
        let mut msg = format!("{}", self);
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{}: {}", msg, source);
            opt_source = source.source();
        }
        msg
    }
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum DeviceError {
    #[snafu(display("device {} not found", name))]
    NotFound { name: String },
    #[snafu(display("failed to read {} bytes at sector {} of {}", len, sector, name))]
    ReadFailed { name: String, sector: u64, len: u64 },
    #[snafu(display("failed to write {} bytes at sector {} of {}", len, sector, name))]
    WriteFailed { name: String, sector: u64, len: u64 },
    #[snafu(display("failed to toggle dirty tracking on {}", name))]
    DirtyTrackingFailed { name: String },
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum StreamError {
    #[snafu(display("stream write failed"))]
    Write,
    #[snafu(display("stream read failed"))]
    Read,
    #[snafu(display("stream would block"))]
    WouldBlock,
    #[snafu(display("stream ended unexpectedly"))]
    Eof,
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum MigrationError {
    #[snafu(display("device error: {}", source))]
    Device { source: DeviceError },
    #[snafu(display("stream error: {}", source))]
    Stream { source: StreamError },
    #[snafu(display("dirty-phase read failed for device {}", device))]
    DirtyReadFailed { device: String, source: DeviceError },
    #[snafu(display("aio read failed for device {}", device))]
    AioReadFailed { device: String, source: DeviceError },
    #[snafu(display(
        "save_complete invoked with {} AIO reads still outstanding",
        submitted
    ))]
    SubmittedNotZero { submitted: usize },
    #[snafu(display("operation {} invalid while migration is {}", operation, state))]
    UnexpectedState { operation: String, state: String },
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum ReceiveError {
    #[snafu(display("unknown block device {}", name))]
    UnknownDevice { name: String },
    #[snafu(display("device {} reported zero length", name))]
    ZeroLengthDevice { name: String },
    #[snafu(display("unrecognised flag bits {:#x} in stream header", flags))]
    UnknownFlag { flags: u64 },
    #[snafu(display("write to destination device failed: {}", source))]
    DeviceWriteFailed { source: DeviceError },
    #[snafu(display("stream error while receiving: {}", source))]
    StreamFailed { source: StreamError },
}
