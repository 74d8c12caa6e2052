//! Reading the OS's memory counters and this process's footprint.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// System-wide counters plus this process's footprint, all in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub total: u64,
    pub free: u64,
    pub active: u64,
    pub inactive: u64,
    pub wired: u64,
    pub compressed: u64,
    pub speculative: u64,
    pub purgeable: u64,
    pub footprint: u64,
}

impl MemorySnapshot {
    /// Memory the OS could hand out without evicting anyone.
    pub fn available(&self) -> u64 {
        self.free + self.speculative + self.purgeable
    }

    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available())
    }

    /// Active and inactive memory that isn't ours.
    pub fn other_apps(&self) -> u64 {
        (self.active + self.inactive + self.speculative).saturating_sub(self.footprint)
    }
}

/// Source of memory measurements. The probe loop only ever talks to the OS through this (and the
/// allocation backend), so tests can substitute a simulated device.
pub trait MemoryAccountant: Send + Sync {
    fn system_snapshot(&self) -> Result<MemorySnapshot>;

    /// Physical memory committed to this process: touched pages, whether resident, compressed or
    /// swapped. Never the size of the address space.
    fn process_footprint(&self) -> Result<u64>;
}

/// Measurements from the running OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccountant;

impl MemoryAccountant for SystemAccountant {
    fn system_snapshot(&self) -> Result<MemorySnapshot> {
        let mut snap = sys::counters()?;
        snap.footprint = sys::footprint()?;
        Ok(snap)
    }

    fn process_footprint(&self) -> Result<u64> {
        sys::footprint()
    }
}

/// Pull `<key>: <n> kB` values out of a `/proc` status-style file.
fn parse_kb_fields<'a>(text: &'a str) -> impl Iterator<Item = (&'a str, u64)> + 'a {
    text.lines().filter_map(|line| {
        let (key, rest) = line.split_once(':')?;
        let mut parts = rest.split_whitespace();
        let n: u64 = parts.next()?.parse().ok()?;
        let scale = match parts.next() {
            Some("kB") => 1024,
            None => 1,
            Some(_) => return None,
        };
        Some((key.trim(), n * scale))
    })
}

fn snapshot_from_meminfo(text: &str) -> MemorySnapshot {
    let mut snap = MemorySnapshot::default();
    for (key, bytes) in parse_kb_fields(text) {
        match key {
            "MemTotal" => snap.total = bytes,
            "MemFree" => snap.free = bytes,
            "Active" => snap.active = bytes,
            "Inactive" => snap.inactive = bytes,
            "Unevictable" | "KernelStack" | "PageTables" | "SUnreclaim" => snap.wired += bytes,
            "Zswap" => snap.compressed = bytes,
            "Buffers" => snap.speculative = bytes,
            "SReclaimable" => snap.purgeable = bytes,
            _ => {}
        }
    }
    snap
}

/// `RssAnon + VmSwap` is the closest Linux has to a physical footprint. Kernels too old to split
/// RSS only give us `VmRSS`.
fn footprint_from_status(text: &str) -> Option<u64> {
    let (mut anon, mut swap, mut rss) = (None, 0, None);
    for (key, bytes) in parse_kb_fields(text) {
        match key {
            "RssAnon" => anon = Some(bytes),
            "VmSwap" => swap = bytes,
            "VmRSS" => rss = Some(bytes),
            _ => {}
        }
    }
    anon.map(|a| a + swap).or(rss)
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{MemorySnapshot, footprint_from_status, snapshot_from_meminfo};
    use crate::error::{ProbeError, Result};
    use std::fs;

    fn read(path: &str) -> Result<String> {
        fs::read_to_string(path).map_err(|e| ProbeError::DeviceQueryFailed(format!("{path}: {e}")))
    }

    pub fn counters() -> Result<MemorySnapshot> {
        let snap = snapshot_from_meminfo(&read("/proc/meminfo")?);
        if snap.total == 0 {
            return Err(ProbeError::DeviceQueryFailed("/proc/meminfo has no MemTotal".to_string()));
        }
        Ok(snap)
    }

    pub fn footprint() -> Result<u64> {
        footprint_from_status(&read("/proc/self/status")?)
            .ok_or_else(|| ProbeError::DeviceQueryFailed("/proc/self/status has no RSS fields".to_string()))
    }
}

#[cfg(target_vendor = "apple")]
mod sys {
    use super::MemorySnapshot;
    use crate::error::{ProbeError, Result};
    use crate::platformalloc::page_size;
    use std::mem::{MaybeUninit, size_of};

    pub fn counters() -> Result<MemorySnapshot> {
        let mut stats: MaybeUninit<libc::vm_statistics64> = MaybeUninit::zeroed();
        let mut count = libc::HOST_VM_INFO64_COUNT;
        let retval = unsafe {
            libc::host_statistics64(
                libc::mach_host_self(),
                libc::HOST_VM_INFO64,
                stats.as_mut_ptr() as libc::host_info64_t,
                &mut count,
            )
        };
        if retval != libc::KERN_SUCCESS {
            return Err(ProbeError::DeviceQueryFailed(format!("host_statistics64 returned {retval}")));
        }
        let stats = unsafe { stats.assume_init() };
        let page = page_size() as u64;

        let mut total: u64 = 0;
        let mut len = size_of::<u64>();
        unsafe {
            libc::sysctlbyname(c"hw.memsize".as_ptr(), &mut total as *mut u64 as *mut libc::c_void, &mut len, std::ptr::null_mut(), 0);
        }

        Ok(MemorySnapshot {
            total,
            free: stats.free_count as u64 * page,
            active: stats.active_count as u64 * page,
            inactive: stats.inactive_count as u64 * page,
            wired: stats.wire_count as u64 * page,
            compressed: stats.compressor_page_count as u64 * page,
            speculative: stats.speculative_count as u64 * page,
            purgeable: stats.purgeable_count as u64 * page,
            footprint: 0,
        })
    }

    pub fn footprint() -> Result<u64> {
        let mut info: MaybeUninit<libc::rusage_info_v2> = MaybeUninit::zeroed();
        let retval = unsafe {
            libc::proc_pid_rusage(libc::getpid(), libc::RUSAGE_INFO_V2, info.as_mut_ptr() as *mut libc::rusage_info_t)
        };
        if retval != 0 {
            return Err(ProbeError::DeviceQueryFailed(format!("proc_pid_rusage returned {retval}")));
        }
        Ok(unsafe { info.assume_init() }.ri_phys_footprint)
    }
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
mod sys {
    use super::MemorySnapshot;
    use crate::error::{ProbeError, Result};

    pub fn counters() -> Result<MemorySnapshot> {
        Err(ProbeError::DeviceQueryFailed("no memory counters on this platform".to_string()))
    }

    pub fn footprint() -> Result<u64> {
        Err(ProbeError::DeviceQueryFailed("no footprint query on this platform".to_string()))
    }
}
