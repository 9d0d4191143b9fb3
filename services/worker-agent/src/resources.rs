//! Host capacity measurement.

use gpufleet_types::{Capacity, GpuDevice};

/// CPU and memory of the host, as reported to the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl HostResources {
    pub fn measure() -> Self {
        Self {
            cpu_millis: cpu_count() * 1000,
            memory_bytes: total_memory(),
        }
    }

    /// Capacity with the configured GPU inventory.
    pub fn capacity(&self, gpus: Vec<GpuDevice>) -> Capacity {
        Capacity {
            gpus,
            cpu_millis: self.cpu_millis,
            memory_bytes: self.memory_bytes,
        }
    }
}

fn cpu_count() -> u64 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u64;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u64)
        .unwrap_or(1)
}

const FALLBACK_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

#[cfg(target_os = "linux")]
fn total_memory() -> u64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(total) = parse_mem_total(&meminfo) {
            return total;
        }
    }
    sysconf_memory().unwrap_or(FALLBACK_MEMORY)
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> u64 {
    sysconf_memory().unwrap_or(FALLBACK_MEMORY)
}

fn sysconf_memory() -> Option<u64> {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && pages > 0 {
            return Some(page_size as u64 * pages as u64);
        }
    }
    None
}

/// `MemTotal` from `/proc/meminfo`, in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "MemTotal:" {
            return None;
        }
        let kib: u64 = parts.next()?.parse().ok()?;
        Some(kib * 1024)
    })
}
