//! Cooperative socket I/O (spec §4.2), modeled on
//! `examples/original_source/qemu-coroutine-io.c`'s `qemu_co_sendv_recvv`.
//!
//! The original suspends a coroutine on `EAGAIN` and resumes it when the
//! fd's poller fires. Tokio's `AsyncFd` readiness primitive *is* that
//! poller (design note §9: "map to the host runtime's suspension
//! primitive"), so the loop below awaits `AsyncFd::writable`/`readable`
//! instead of hand-rolling a yield-and-retry spin.

use std::os::unix::io::RawFd;

use tokio::io::unix::AsyncFd;

use crate::{
    error::StreamError,
    iov::{self, Progress},
};

/// Sends `bytes` bytes from `iov` starting at `offset`, looping until all
/// bytes are moved or a hard error occurs.
///
/// Returns `Ok(done)` with `done` in `0..=bytes`: partial progress is only
/// possible after a hard error, matching the original's "return -1 only if
/// nothing moved; otherwise return bytes moved so far" contract — here
/// expressed as `Err` only when `done == 0`.
pub async fn co_send(
    async_fd: &AsyncFd<RawFd>,
    iov: &[&[u8]],
    offset: usize,
    bytes: usize,
) -> Result<usize, StreamError> {
    let mut done = 0;
    loop {
        if done == bytes {
            return Ok(done);
        }
        let progress = iov::send(*async_fd.get_ref(), iov, offset + done, bytes - done);
        match progress {
            Progress::Moved(0) => {
                // send returning 0 is not expected; retry rather than
                // treat it as EOF, per spec §4.2.
                continue;
            }
            Progress::Moved(n) => {
                done += n;
            }
            Progress::WouldBlock => {
                let mut guard = async_fd.writable().await.map_err(|_| StreamError::Write)?;
                guard.clear_ready();
            }
            Progress::Error => {
                return if done == 0 { Err(StreamError::Write) } else { Ok(done) };
            }
        }
    }
}

/// Receives `bytes` bytes into `buf`, looping until full, EOF, or a hard
/// error occurs.
pub async fn co_recv(
    async_fd: &AsyncFd<RawFd>,
    buf: &mut [u8],
) -> Result<usize, StreamError> {
    let bytes = buf.len();
    let mut done = 0;
    loop {
        if done == bytes {
            return Ok(done);
        }
        let progress = iov::recv_into_fd(*async_fd.get_ref(), &mut buf[done ..]);
        match progress {
            Progress::Moved(0) => {
                // end-of-stream: break with whatever was transferred.
                return Ok(done);
            }
            Progress::Moved(n) => {
                done += n;
            }
            Progress::WouldBlock => {
                let mut guard = async_fd.readable().await.map_err(|_| StreamError::Read)?;
                guard.clear_ready();
            }
            Progress::Error => {
                return if done == 0 { Err(StreamError::Read) } else { Ok(done) };
            }
        }
    }
}
