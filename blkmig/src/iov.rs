//! Scatter/gather vector utility (spec §4.1), used by `wire.rs` to frame
//! device-block payloads and by `coro_io.rs` for the cooperative socket
//! loop. Modeled on `examples/original_source/iov.c`; ported to borrowed
//! Rust slices instead of raw `(base, len)` pairs, so bounds are enforced
//! by the type system rather than by assertion where that's free.

use std::os::unix::io::RawFd;

use nix::{
    errno::Errno,
    sys::uio::{readv, writev, IoVec as NixIoVec},
};

use crate::error::StreamError;

/// Total size in bytes of a scatter/gather vector.
pub fn size(iov: &[&[u8]]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

/// Total size in bytes of a mutable scatter/gather vector.
pub fn size_mut(iov: &[&mut [u8]]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

/// Copies `bytes` bytes of `src` into `iov`, skipping the first `offset`
/// logical bytes of `iov`. Returns the number of bytes actually copied:
/// `min(bytes, size(iov) - offset)`.
///
/// # Panics
/// If `offset > size(iov)` — a programming error, per spec §4.1 "all
/// bounds violations are programming errors (asserted)".
pub fn from_buf(iov: &mut [&mut [u8]], offset: usize, src: &[u8], bytes: usize) -> usize {
    let total = size_mut(iov);
    assert!(offset <= total, "iov::from_buf: offset past end of vector");
    let want = bytes.min(total - offset);
    let mut skip = offset;
    let mut copied = 0;
    let mut src_off = 0;
    for seg in iov.iter_mut() {
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let seg_start = skip;
        skip = 0;
        let remaining = want - copied;
        if remaining == 0 {
            break;
        }
        let n = (seg.len() - seg_start).min(remaining);
        seg[seg_start .. seg_start + n].copy_from_slice(&src[src_off .. src_off + n]);
        copied += n;
        src_off += n;
    }
    copied
}

/// Copies up to `bytes` bytes from `iov` (starting `offset` logical bytes
/// in) into `dst`. Returns the number of bytes actually copied.
pub fn to_buf(iov: &[&[u8]], offset: usize, dst: &mut [u8], bytes: usize) -> usize {
    let total = size(iov);
    assert!(offset <= total, "iov::to_buf: offset past end of vector");
    let want = bytes.min(total - offset).min(dst.len());
    let mut skip = offset;
    let mut copied = 0;
    let mut dst_off = 0;
    for seg in iov.iter() {
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let seg_start = skip;
        skip = 0;
        let remaining = want - copied;
        if remaining == 0 {
            break;
        }
        let n = (seg.len() - seg_start).min(remaining);
        dst[dst_off .. dst_off + n].copy_from_slice(&seg[seg_start .. seg_start + n]);
        copied += n;
        dst_off += n;
    }
    copied
}

/// Fills up to `bytes` logical bytes of `iov`, starting `offset` bytes in,
/// with `fill`. Returns the number of bytes actually filled.
pub fn memset(iov: &mut [&mut [u8]], offset: usize, fill: u8, bytes: usize) -> usize {
    let total = size_mut(iov);
    assert!(offset <= total, "iov::memset: offset past end of vector");
    let want = bytes.min(total - offset);
    let mut skip = offset;
    let mut done = 0;
    for seg in iov.iter_mut() {
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let seg_start = skip;
        skip = 0;
        let remaining = want - done;
        if remaining == 0 {
            break;
        }
        let n = (seg.len() - seg_start).min(remaining);
        seg[seg_start .. seg_start + n].iter_mut().for_each(|b| *b = fill);
        done += n;
    }
    done
}

/// Produces a view — borrowed sub-slices, nothing copied — of the
/// `[offset, offset + bytes)` logical window of `src`.
pub fn copy<'a>(src: &[&'a [u8]], offset: usize, bytes: usize) -> Vec<&'a [u8]> {
    let total = size(src);
    assert!(offset <= total, "iov::copy: offset past end of vector");
    let want = bytes.min(total - offset);
    let mut skip = offset;
    let mut remaining = want;
    let mut out = Vec::new();
    for seg in src.iter() {
        if remaining == 0 {
            break;
        }
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let seg_start = skip;
        skip = 0;
        let n = (seg.len() - seg_start).min(remaining);
        out.push(&seg[seg_start .. seg_start + n]);
        remaining -= n;
    }
    out
}

/// Outcome of a single `send`/`recv_into_fd` attempt: the edge case the
/// coroutine loop in `coro_io.rs` branches on.
pub enum Progress {
    /// `n` bytes moved (`n` may be 0 for a send retry or a recv EOF).
    Moved(usize),
    /// The fd would have blocked; nothing moved on this attempt.
    WouldBlock,
    /// A hard I/O error; nothing moved on this attempt.
    Error,
}

/// Sends up to `bytes` bytes through the `[offset, offset + bytes)`
/// logical window of `iov`, using a single scatter/gather syscall when
/// the window spans more than one segment.
///
/// `iov` is borrowed read-only, so this only ever covers the send
/// direction — the recv direction needs a mutable destination, which
/// `recv_into_fd` provides instead; `coro_io::co_recv` calls that
/// directly rather than through this function.
///
/// `bytes == 0` returns `Progress::Moved(0)` immediately — an empty
/// scatter/gather array is not portable, per spec §4.1.
pub fn send(fd: RawFd, iov: &[&[u8]], offset: usize, bytes: usize) -> Progress {
    if bytes == 0 {
        return Progress::Moved(0);
    }
    let windowed = copy(iov, offset, bytes);
    let slices: Vec<NixIoVec<&[u8]>> = windowed.iter().map(|s| NixIoVec::from_slice(s)).collect();
    match writev(fd, &slices) {
        Ok(n) => Progress::Moved(n),
        Err(Errno::EINTR) => Progress::Moved(0),
        Err(Errno::EAGAIN) => Progress::WouldBlock,
        Err(_) => Progress::Error,
    }
}

/// Receives up to `buf.len()` bytes into `buf` directly, used by
/// `coro_io::co_recv`.
pub fn recv_into_fd(fd: RawFd, buf: &mut [u8]) -> Progress {
    let mut iov = [NixIoVec::from_mut_slice(buf)];
    match readv(fd, &mut iov) {
        Ok(0) => Progress::Moved(0),
        Ok(n) => Progress::Moved(n),
        Err(Errno::EINTR) => Progress::Moved(0),
        Err(Errno::EAGAIN) => Progress::WouldBlock,
        Err(_) => Progress::Error,
    }
}

/// A growable scatter/gather vector over owned segments (`QEMUIOVector`
/// in the original): `add` grows geometrically, `concat` splices another
/// vector's segments by reference, `reset` keeps capacity, `destroy` frees
/// it. Rust's `Vec` already gives us geometric growth and drop-on-scope,
/// so this wrapper exists mainly to mirror the original's explicit API
/// surface for callers translating directly from it.
#[derive(Default)]
pub struct GrowableIov {
    segments: Vec<Vec<u8>>,
    /// Mirrors the original's `nalloc == -1` poison for a vector that
    /// wraps caller-owned storage and must not be grown or freed here.
    external: bool,
}

impl GrowableIov {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps externally-owned segments; `add`/`concat` on the result are
    /// programming errors, mirroring `qemu_iovec_init_external`'s
    /// `nalloc = -1` poison.
    pub fn init_external(segments: Vec<Vec<u8>>) -> Self {
        Self {
            segments,
            external: true,
        }
    }

    pub fn add(&mut self, segment: Vec<u8>) {
        assert!(!self.external, "GrowableIov::add on an externally-owned vector");
        self.segments.push(segment);
    }

    /// Appends a sub-range `[offset, offset+bytes)` of `other`'s logical
    /// content by reference (copied here, since Rust's `Vec<u8>` owns its
    /// bytes — the original's by-reference splice only avoided a copy
    /// because it aliased raw pointers).
    pub fn concat(&mut self, other: &GrowableIov, offset: usize, bytes: usize) {
        assert!(!self.external, "GrowableIov::concat on an externally-owned vector");
        let refs: Vec<&[u8]> = other.segments.iter().map(|s| s.as_slice()).collect();
        for seg in copy(&refs, offset, bytes) {
            self.segments.push(seg.to_vec());
        }
    }

    pub fn reset(&mut self) {
        self.segments.clear();
    }

    pub fn destroy(self) {
        drop(self);
    }

    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn as_refs(&self) -> Vec<&[u8]> {
        self.segments.iter().map(|s| s.as_slice()).collect()
    }
}

pub fn stream_err_for(progress: &Progress, do_send: bool) -> Option<StreamError> {
    match progress {
        Progress::Error => Some(if do_send { StreamError::Write } else { StreamError::Read }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_sums_segments() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        let iov: Vec<&[u8]> = vec![&a, &b];
        assert_eq!(size(&iov), 5);
    }

    #[test]
    fn from_buf_spans_segments_and_respects_offset() {
        let mut a = [0u8; 3];
        let mut b = [0u8; 3];
        let src = [9u8, 8, 7, 6];
        {
            let mut iov: Vec<&mut [u8]> = vec![&mut a, &mut b];
            let copied = from_buf(&mut iov, 2, &src, 4);
            // 6 total bytes, offset 2 -> 4 available, src has 4 -> all copied
            assert_eq!(copied, 4);
        }
        assert_eq!(a, [0, 0, 9]);
        assert_eq!(b, [8, 7, 6]);
    }

    #[test]
    fn to_buf_truncates_to_requested_bytes() {
        let a = [1u8, 2, 3, 4];
        let iov: Vec<&[u8]> = vec![&a];
        let mut dst = [0u8; 2];
        let copied = to_buf(&iov, 1, &mut dst, 2);
        assert_eq!(copied, 2);
        assert_eq!(dst, [2, 3]);
    }

    #[test]
    fn memset_fills_only_the_window() {
        let mut a = [0u8; 4];
        {
            let mut iov: Vec<&mut [u8]> = vec![&mut a];
            let filled = memset(&mut iov, 1, 0xff, 2);
            assert_eq!(filled, 2);
        }
        assert_eq!(a, [0, 0xff, 0xff, 0]);
    }

    #[test]
    fn copy_produces_a_view_without_mutating_source() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5, 6];
        let iov: Vec<&[u8]> = vec![&a, &b];
        let view = copy(&iov, 2, 3);
        let mut flat = Vec::new();
        for seg in &view {
            flat.extend_from_slice(seg);
        }
        assert_eq!(flat, vec![3, 4, 5]);
    }

    #[test]
    fn zero_bytes_window_is_empty() {
        let a = [1u8, 2, 3];
        let iov: Vec<&[u8]> = vec![&a];
        assert!(copy(&iov, 0, 0).is_empty());
    }

    #[test]
    fn growable_iov_add_and_size() {
        let mut g = GrowableIov::new();
        g.add(vec![1, 2, 3]);
        g.add(vec![4, 5]);
        assert_eq!(g.size(), 5);
        g.reset();
        assert_eq!(g.size(), 0);
    }
}
