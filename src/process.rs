//! Host process utilities.
//!
//! Liveness checks for VMM processes and the Linux primitives used to
//! reclaim guest memory from outside the VMM: `pidfd_open(2)`,
//! `process_madvise(2)` with `MADV_PAGEOUT`, and guest memory discovery
//! through `/proc/<pid>/maps`.

use crate::error::{Error, Result};

/// Check if a process is alive.
///
/// Returns true if the process exists and is running.
pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// A mapped region of a process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Start address in the target process.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

impl MemoryRegion {
    /// The highest `len` bytes of the region, or all of it when smaller.
    pub fn tail(self, len: u64) -> MemoryRegion {
        let len = len.min(self.len);
        MemoryRegion {
            start: self.start + (self.len - len),
            len,
        }
    }
}

/// Parse one line of `/proc/<pid>/maps`.
///
/// Returns the region when it is a private or shared writable mapping that
/// could back guest memory: anonymous (inode 0, no path) or a memfd.
fn parse_guest_candidate(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;
    let path = fields.next();

    if !perms.starts_with("rw") {
        return None;
    }
    let anonymous = inode == "0" && path.is_none();
    let memfd = path.is_some_and(|p| p.starts_with("/memfd:"));
    if !anonymous && !memfd {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end <= start {
        return None;
    }
    Some(MemoryRegion {
        start,
        len: end - start,
    })
}

/// Find guest memory regions in a maps listing.
///
/// Picks the writable anonymous (or memfd) mappings whose size exactly
/// equals `guest_bytes`. A VMM maps guest RAM as one contiguous region
/// per memory slot, so this identifies it without VMM cooperation.
pub fn find_guest_memory(maps: &str, guest_bytes: u64) -> Vec<MemoryRegion> {
    maps.lines()
        .filter_map(parse_guest_candidate)
        .filter(|r| r.len == guest_bytes)
        .collect()
}

/// Open a pidfd for `pid`.
#[cfg(target_os = "linux")]
pub fn pidfd_open(pid: libc::pid_t) -> Result<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: the kernel returned a fresh file descriptor we now own.
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd as libc::c_int) })
}

/// Ask the kernel to page out `region` of the process behind `pidfd`.
///
/// Returns the number of bytes the kernel accepted. `MADV_PAGEOUT` is a
/// hint: resident pages are written to swap or dropped, absent pages are
/// skipped.
#[cfg(target_os = "linux")]
pub fn pageout(pidfd: &std::os::fd::OwnedFd, region: MemoryRegion) -> Result<u64> {
    use std::os::fd::AsRawFd;

    // Kernels cap a single process_madvise call, so advise in chunks.
    const CHUNK: u64 = 64 * 1024 * 1024;

    let mut advised = 0u64;
    while advised < region.len {
        let len = (region.len - advised).min(CHUNK);
        let iov = libc::iovec {
            iov_base: (region.start + advised) as *mut libc::c_void,
            iov_len: len as usize,
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_process_madvise,
                pidfd.as_raw_fd(),
                &iov as *const libc::iovec,
                1usize,
                libc::MADV_PAGEOUT,
                0u32,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if advised > 0 {
                tracing::debug!(advised, error = %err, "process_madvise stopped early");
                break;
            }
            return Err(Error::Io(err));
        }
        if ret == 0 {
            break;
        }
        advised += ret as u64;
    }
    Ok(advised)
}

/// Page out a process's memory regions.
#[cfg(not(target_os = "linux"))]
pub fn pageout_regions(_pid: libc::pid_t, _regions: &[MemoryRegion]) -> Result<u64> {
    Err(Error::Unsupported(
        "host page reclaim requires Linux process_madvise".into(),
    ))
}

/// Page out a process's memory regions.
#[cfg(target_os = "linux")]
pub fn pageout_regions(pid: libc::pid_t, regions: &[MemoryRegion]) -> Result<u64> {
    let pidfd = pidfd_open(pid)?;
    let mut total = 0;
    for region in regions {
        total += pageout(&pidfd, *region)?;
    }
    Ok(total)
}

/// Read `/proc/<pid>/maps`.
pub fn read_maps(pid: libc::pid_t) -> Result<String> {
    Ok(std::fs::read_to_string(format!("/proc/{}/maps", pid))?)
}
