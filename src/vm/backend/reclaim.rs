//! Host page reclaim for an external VMM process.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::process;
use crate::util::mib_to_bytes;
use crate::vm::{PageReclaimer, ReclaimHint};

/// Pages out a VMM's guest memory with `process_madvise(MADV_PAGEOUT)`.
///
/// The advised range never exceeds the memory the balloon just freed. The
/// balloon's guest frames are not visible from the host, so the range is
/// the top `freed_mib` of the guest mapping. Reclaim is refused when more
/// than one mapping matches the guest size. Without a VMM pid, reclaim is
/// skipped.
#[derive(Debug, Clone)]
pub struct ProcessReclaimer {
    pid: Option<libc::pid_t>,
    mem_size_mib: u32,
}

impl ProcessReclaimer {
    /// Create a reclaimer for the VMM process `pid`.
    pub fn new(pid: Option<libc::pid_t>, mem_size_mib: u32) -> Self {
        Self { pid, mem_size_mib }
    }
}

#[async_trait]
impl PageReclaimer for ProcessReclaimer {
    async fn reclaim(&self, hint: ReclaimHint) -> Result<u64> {
        let Some(pid) = self.pid else {
            tracing::debug!(freed_mib = hint.freed_mib, "no VMM pid configured, skipping host reclaim");
            return Ok(0);
        };
        if hint.freed_mib == 0 {
            return Ok(0);
        }

        let guest_bytes = mib_to_bytes(self.mem_size_mib);
        let budget = mib_to_bytes(hint.freed_mib);
        let advised = tokio::task::spawn_blocking(move || -> Result<u64> {
            let maps = process::read_maps(pid)?;
            let region = pageout_target(&maps, guest_bytes, budget)?;
            process::pageout_regions(pid, &[region])
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        tracing::debug!(
            pid,
            freed_mib = hint.freed_mib,
            balloon_mib = hint.balloon_mib,
            advised_bytes = advised,
            "host reclaim hint applied"
        );
        Ok(advised)
    }
}

/// Range of the guest mapping to advise for `budget` freed bytes.
fn pageout_target(maps: &str, guest_bytes: u64, budget: u64) -> Result<process::MemoryRegion> {
    match process::find_guest_memory(maps, guest_bytes).as_slice() {
        [] => Err(Error::Unsupported(format!(
            "no {} byte guest memory mapping found",
            guest_bytes
        ))),
        [region] => Ok(region.tail(budget)),
        regions => Err(Error::Unsupported(format!(
            "{} mappings of {} bytes, guest memory is ambiguous",
            regions.len(),
            guest_bytes
        ))),
    }
}
