//! The target process and the cross-process memory transport.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::pool;
use crate::value::Value;
use crate::ProcessId;

/// getconf IOV_MAX
pub const IOV_MAX: usize = 1024;

/// A handle on the target process.
///
/// The core does not enumerate processes; the caller supplies a pid it
/// obtained elsewhere.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub pid: ProcessId,
}

impl Process {
    pub fn new(pid: ProcessId) -> Process {
        Process { pid }
    }

    /// Probe the target with a null signal.
    pub fn alive(&self) -> bool {
        kill(Pid::from_raw(self.pid), None).is_ok()
    }

    /// Stop the target. Returns whether the signal was delivered.
    pub fn pause(&self) -> bool {
        kill(Pid::from_raw(self.pid), Signal::SIGSTOP).is_ok()
    }

    /// Resume a stopped target.
    pub fn resume(&self) -> bool {
        kill(Pid::from_raw(self.pid), Signal::SIGCONT).is_ok()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

fn vm_readv(
    pid: ProcessId,
    local: &[libc::iovec],
    remote: &[libc::iovec],
) -> (usize, Option<Errno>) {
    if local.is_empty() || remote.is_empty() {
        return (0, None);
    }

    let n = unsafe {
        libc::process_vm_readv(
            pid,
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        )
    };

    if n < 0 {
        (0, Some(Errno::last()))
    } else {
        (n as usize, None)
    }
}

fn vm_writev(
    pid: ProcessId,
    local: &[libc::iovec],
    remote: &[libc::iovec],
) -> (usize, Option<Errno>) {
    if local.is_empty() || remote.is_empty() {
        return (0, None);
    }

    let n = unsafe {
        libc::process_vm_writev(
            pid,
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        )
    };

    if n < 0 {
        (0, Some(Errno::last()))
    } else {
        (n as usize, None)
    }
}

/// Scatter-read `size` bytes from each address into `buf`.
///
/// The syscall stops at the first bad address; the loop advances past the
/// slots that succeeded, poisons the first byte of the failed slot with
/// `disturb` so stale buffer contents cannot compare equal, skips it and
/// retries with the remainder. Only an error other than a bad address with
/// zero forward progress ends the batch early.
///
/// `addresses` must not exceed [`IOV_MAX`] entries and `buf` must hold
/// `addresses.len() * size` bytes. Returns the total bytes read.
pub fn read_batch(
    pid: ProcessId,
    addresses: &[u64],
    size: usize,
    disturb: u8,
    buf: &mut [u8],
) -> usize {
    let n = addresses.len();

    if n == 0 || size == 0 {
        return 0;
    }

    debug_assert!(n <= IOV_MAX);
    debug_assert!(buf.len() >= n * size);

    let mut local = pool::iovec_array();
    let mut remote = pool::iovec_array();

    let mut total = 0usize;
    let mut current = 0usize;

    while current < n {
        let remaining = n - current;

        for i in 0..remaining {
            let idx = current + i;

            local[i] = libc::iovec {
                iov_base: buf[idx * size..].as_mut_ptr() as *mut libc::c_void,
                iov_len: size,
            };
            remote[i] = libc::iovec {
                iov_base: addresses[idx] as *mut libc::c_void,
                iov_len: size,
            };
        }

        let (n_read, err) = vm_readv(pid, &local[..remaining], &remote[..remaining]);

        total += n_read;
        current += n_read / size;

        if current < n {
            buf[current * size] = disturb;
            current += 1;
        }

        if let Some(errno) = err {
            if errno != Errno::EFAULT && n_read == 0 {
                break;
            }
        }
    }

    total
}

/// Scatter-write the value bytes to each address, with the same skip
/// discipline as [`read_batch`]. Returns the total bytes written.
pub fn write_batch(pid: ProcessId, addresses: &[u64], value: &Value) -> usize {
    let n = addresses.len();
    let size = value.size();

    if n == 0 || size == 0 {
        return 0;
    }

    debug_assert!(n <= IOV_MAX);

    let data = value.bytes();

    let mut local = pool::iovec_array();
    let mut remote = pool::iovec_array();

    let mut total = 0usize;
    let mut current = 0usize;

    while current < n {
        let remaining = n - current;

        for i in 0..remaining {
            // Every local iovec points at the same source bytes.
            local[i] = libc::iovec {
                iov_base: data.as_ptr() as *mut libc::c_void,
                iov_len: size,
            };
            remote[i] = libc::iovec {
                iov_base: addresses[current + i] as *mut libc::c_void,
                iov_len: size,
            };
        }

        let (n_write, err) = vm_writev(pid, &local[..remaining], &remote[..remaining]);

        total += n_write;
        current += n_write / size;

        if current < n {
            if let Some(errno) = err {
                if errno != Errno::EFAULT && n_write == 0 {
                    return total;
                }
            }

            // Skip the unwritable slot.
            current += 1;
        }
    }

    total
}

/// Sequential, seekable reads over one span of the target's address space.
///
/// Reads clamp to the remainder of the span and advance by whatever the
/// syscall managed; errors are surfaced so the streaming matcher can attempt
/// page-alignment recovery.
pub struct RegionReader {
    pid: ProcessId,
    start: u64,
    size: u64,
    off: u64,
}

impl RegionReader {
    pub fn new(pid: ProcessId, start: u64, end: u64) -> RegionReader {
        RegionReader {
            pid,
            start,
            size: end.saturating_sub(start),
            off: 0,
        }
    }
}

impl Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.off >= self.size {
            return Ok(0);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(self.size - self.off) as usize;
        let addr = self.start + self.off;

        let local = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: len,
        }];
        let remote = [libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: len,
        }];

        let (n, err) = vm_readv(self.pid, &local, &remote);

        if n > 0 {
            self.off += n as u64;
            return Ok(n);
        }

        match err {
            Some(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
            None => Ok(0),
        }
    }
}

impl Seek for RegionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let abs = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.off as i64 + offset,
            SeekFrom::End(offset) => self.size as i64 + offset,
        };

        if abs < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }

        self.off = abs as u64;
        Ok(self.off)
    }
}
