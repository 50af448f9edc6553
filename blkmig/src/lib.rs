//! Core of a live block-device migration subsystem: streams the contents
//! of one or more live, writable block devices from a running source to
//! a destination while the source continues to mutate them.
//!
//! This crate implements the transfer-loop state machine, the dirty
//! bitmap tracker, the bounded queue of asynchronous reads, the
//! bandwidth-throttling writer, and the iovec scatter/gather helper used
//! by the framing layer. The block-device and byte-stream transports
//! themselves, RAM migration, and the outer QMP-style command surface are
//! external collaborators this crate only calls through trait objects.

pub mod bitmap;
pub mod bulk;
pub mod config;
pub mod coro_io;
pub mod device;
pub mod dirty;
pub mod driver;
pub mod error;
pub mod iov;
pub mod logging;
pub mod receiver;
pub mod state;
pub mod stream;
pub mod wire;

pub use config::{MigrationCliArgs, MigrationConfig};
pub use driver::{MigrationDriver, SaveHandlers};
pub use error::{DeviceError, MigrationError, ReceiveError, StreamError, VerboseError};
