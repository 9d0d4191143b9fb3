//! Port allocation for backend processes.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Mutex;

/// Hands out ports from a fixed range. A port is only handed out when nothing
/// else on the host is bound to it.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lowest free port in the range.
    pub fn allocate(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let port = self
            .range
            .clone()
            .filter(|p| !in_use.contains(p))
            .find(|p| TcpListener::bind(("0.0.0.0", *p)).is_ok())?;
        in_use.insert(port);
        Some(port)
    }

    pub fn release(&self, port: u16) {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }

    pub fn allocated(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
