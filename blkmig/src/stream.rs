//! The external byte-oriented transport (spec §1 "out of scope: Stream";
//! §6 wire format). `blkmig` only ever calls through [`Stream`]; the
//! concrete transport (tcp/unix/fd/exec per spec §6) is the migration
//! driver's concern outside this crate. [`TcpMigrationStream`] is the one
//! production transport this crate ships, and [`MemStream`] is the
//! in-memory double this crate's own tests round-trip against.

use std::{
    net::TcpStream as StdTcpStream,
    os::unix::io::{AsRawFd, RawFd},
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use crate::{coro_io, error::StreamError};

/// A byte-oriented sink/source with big-endian primitive put/get,
/// rate-limit query, current byte offset, and error latching (spec §1).
#[async_trait]
pub trait Stream: Send + Sync {
    async fn put_buf(&mut self, buf: &[u8]) -> Result<(), StreamError>;
    async fn get_buf(&mut self, buf: &mut [u8]) -> Result<(), StreamError>;

    async fn put_u64(&mut self, v: u64) -> Result<(), StreamError> {
        self.put_buf(&v.to_be_bytes()).await
    }

    async fn get_u64(&mut self) -> Result<u64, StreamError> {
        let mut b = [0u8; 8];
        self.get_buf(&mut b).await?;
        Ok(u64::from_be_bytes(b))
    }

    async fn put_u8(&mut self, v: u8) -> Result<(), StreamError> {
        self.put_buf(&[v]).await
    }

    async fn get_u8(&mut self) -> Result<u8, StreamError> {
        let mut b = [0u8; 1];
        self.get_buf(&mut b).await?;
        Ok(b[0])
    }

    /// Whether this tick's byte budget is exhausted; `flush_blks` (see
    /// `driver.rs`) stops flushing rather than blocking when this is true.
    fn rate_limited(&self) -> bool;

    /// Resets the per-tick budget; called once per `save_iterate` tick by
    /// the driver with `bandwidth_limit / XFER_LIMIT_RATIO` bytes.
    fn reset_rate_limit(&self, bytes_per_tick: u64);

    /// Total bytes written so far.
    fn byte_offset(&self) -> u64;

    fn has_error(&self) -> bool;

    fn latch_error(&mut self, err: StreamError);
}

/// Tracks the per-tick rate-limit budget shared by both concrete streams.
struct RateBudget {
    remaining: AtomicI64,
}

impl RateBudget {
    fn new() -> Self {
        // unlimited until the driver calls reset_rate_limit once it knows
        // the configured bandwidth_limit.
        Self { remaining: AtomicI64::new(i64::MAX) }
    }

    fn consume(&self, n: u64) {
        self.remaining.fetch_sub(n as i64, Ordering::SeqCst);
    }

    fn reset(&self, bytes_per_tick: u64) {
        self.remaining.store(bytes_per_tick as i64, Ordering::SeqCst);
    }

    fn limited(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) <= 0
    }
}

/// A TCP transport, the concrete stand-in for the original's `tcp`
/// migration transport (`unix`/`fd`/`exec` are the driver's concern, not
/// this crate's — spec §1).
pub struct TcpMigrationStream {
    // kept alive so the fd stays open and to allow graceful shutdown.
    _socket: StdTcpStream,
    async_fd: AsyncFd<RawFd>,
    offset: AtomicU64,
    error: Option<StreamError>,
    budget: RateBudget,
}

impl TcpMigrationStream {
    /// Wraps an already-connected socket. The caller is responsible for
    /// connecting/accepting; this type only frames bytes over it.
    pub fn new(socket: StdTcpStream) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
            _socket: socket,
            offset: AtomicU64::new(0),
            error: None,
            budget: RateBudget::new(),
        })
    }
}

#[async_trait]
impl Stream for TcpMigrationStream {
    async fn put_buf(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        let iov: [&[u8]; 1] = [buf];
        let done = coro_io::co_send(&self.async_fd, &iov, 0, buf.len()).await?;
        self.offset.fetch_add(done as u64, Ordering::SeqCst);
        self.budget.consume(done as u64);
        if done < buf.len() {
            self.error = Some(StreamError::Write);
            return Err(StreamError::Write);
        }
        Ok(())
    }

    async fn get_buf(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let done = coro_io::co_recv(&self.async_fd, buf).await?;
        if done < buf.len() {
            self.error = Some(StreamError::Eof);
            return Err(StreamError::Eof);
        }
        Ok(())
    }

    fn rate_limited(&self) -> bool {
        self.budget.limited()
    }

    fn reset_rate_limit(&self, bytes_per_tick: u64) {
        self.budget.reset(bytes_per_tick);
    }

    fn byte_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    fn has_error(&self) -> bool {
        self.error.is_some()
    }

    fn latch_error(&mut self, err: StreamError) {
        self.error = Some(err);
    }
}

/// An in-memory stream: a write side that accumulates bytes and a read
/// side that consumes a caller-supplied buffer. Used by this crate's own
/// tests to round-trip a sender's output straight into a receiver without
/// a socket (spec's `MemStream`/`MemDevice` test-tooling pairing).
#[derive(Default)]
pub struct MemStream {
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
    offset: AtomicU64,
    error: Option<StreamError>,
    budget: Option<RateBudget>,
}

impl MemStream {
    pub fn new_writer() -> Self {
        Self {
            budget: Some(RateBudget::new()),
            ..Default::default()
        }
    }

    pub fn new_reader(data: Vec<u8>) -> Self {
        Self {
            read_buf: data,
            ..Default::default()
        }
    }

    /// Hands back everything written so far, e.g. to feed a paired reader.
    pub fn into_written(self) -> Vec<u8> {
        self.write_buf
    }
}

#[async_trait]
impl Stream for MemStream {
    async fn put_buf(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.write_buf.extend_from_slice(buf);
        self.offset.fetch_add(buf.len() as u64, Ordering::SeqCst);
        if let Some(budget) = &self.budget {
            budget.consume(buf.len() as u64);
        }
        Ok(())
    }

    async fn get_buf(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let remaining = self.read_buf.len() - self.read_pos;
        if remaining < buf.len() {
            self.error = Some(StreamError::Eof);
            return Err(StreamError::Eof);
        }
        buf.copy_from_slice(&self.read_buf[self.read_pos .. self.read_pos + buf.len()]);
        self.read_pos += buf.len();
        Ok(())
    }

    fn rate_limited(&self) -> bool {
        self.budget.as_ref().map(RateBudget::limited).unwrap_or(false)
    }

    fn reset_rate_limit(&self, bytes_per_tick: u64) {
        if let Some(budget) = &self.budget {
            budget.reset(bytes_per_tick);
        }
    }

    fn byte_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    fn has_error(&self) -> bool {
        self.error.is_some()
    }

    fn latch_error(&mut self, err: StreamError) {
        self.error = Some(err);
    }
}
