//! Recycled buffers for the scatter-read hot path.
//!
//! Refinement scans issue one scatter syscall per [`IOV_MAX`] survivors; the
//! iovec arrays and read buffers backing those calls are recycled instead of
//! reallocated. Guards return their storage on drop, so release happens on
//! every exit path.

use std::ops::{Deref, DerefMut};
use std::ptr;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::process::IOV_MAX;

/// Big enough for one syscall worth of any fixed-width value.
const READ_BUFFER_SIZE: usize = IOV_MAX * 8;

/// An owned iovec array between uses.
///
/// The pointers inside are dead whenever the array sits in the pool; a guard
/// holder rewrites every element it passes to the kernel.
struct IovecStorage(Vec<libc::iovec>);

unsafe impl Send for IovecStorage {}

static IOVEC_POOL: Lazy<Mutex<Vec<IovecStorage>>> = Lazy::new(|| Mutex::new(Vec::new()));
static READ_BUFFER_POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub(crate) struct IovecGuard(IovecStorage);

impl Deref for IovecGuard {
    type Target = [libc::iovec];

    fn deref(&self) -> &[libc::iovec] {
        &self.0 .0
    }
}

impl DerefMut for IovecGuard {
    fn deref_mut(&mut self) -> &mut [libc::iovec] {
        &mut self.0 .0
    }
}

impl Drop for IovecGuard {
    fn drop(&mut self) {
        let storage = std::mem::replace(&mut self.0, IovecStorage(Vec::new()));
        IOVEC_POOL.lock().push(storage);
    }
}

/// Acquire an iovec array of [`IOV_MAX`] entries.
pub(crate) fn iovec_array() -> IovecGuard {
    let storage = IOVEC_POOL.lock().pop().unwrap_or_else(|| {
        IovecStorage(vec![
            libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            };
            IOV_MAX
        ])
    });

    IovecGuard(storage)
}

pub(crate) struct BufferGuard(Vec<u8>);

impl Deref for BufferGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufferGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.0);
        READ_BUFFER_POOL.lock().push(buf);
    }
}

/// Acquire a zeroed read buffer of at least `needed` bytes.
pub(crate) fn read_buffer(needed: usize) -> BufferGuard {
    let mut buf = READ_BUFFER_POOL
        .lock()
        .pop()
        .unwrap_or_else(|| vec![0u8; READ_BUFFER_SIZE]);

    if buf.len() < needed {
        buf = vec![0u8; needed];
    } else {
        buf[..needed].fill(0);
    }

    BufferGuard(buf)
}
