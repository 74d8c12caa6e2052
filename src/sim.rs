//! A pretend device: a byte budget standing in for RAM, so the probe can be exercised end to end
//! without committing any real memory.

use crate::accountant::{MemoryAccountant, MemorySnapshot};
use crate::backend::{AllocationBackend, AllocationKind, AllocationRecord};
use crate::error::{ProbeError, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One granted request, as the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub kind: AllocationKind,
    pub size: usize,
    /// Bytes resident before this grant.
    pub resident_before: u64,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    total: u64,
    /// How much the device will grant before refusing. The rest belongs to the OS and other apps.
    limit: u64,
    /// Footprint of the process before it allocates anything.
    baseline: u64,
    resident: AtomicU64,
    attempts: AtomicU64,
    deny_all: AtomicBool,
    deny_after: AtomicU64,
    fail_verification: AtomicBool,
    grants: Mutex<Vec<Grant>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedDevice {
    /// A device with `total` bytes of RAM, three quarters of which it will grant.
    pub fn new(total: u64) -> Self {
        Self::with_limit(total, total / 4 * 3)
    }

    pub fn with_limit(total: u64, limit: u64) -> Self {
        Self {
            total,
            limit: limit.min(total),
            baseline: 0,
            resident: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            deny_all: AtomicBool::new(false),
            deny_after: AtomicU64::new(u64::MAX),
            fail_verification: AtomicBool::new(false),
            grants: Mutex::new(Vec::new()),
        }
    }

    pub fn with_baseline(mut self, baseline: u64) -> Self {
        self.baseline = baseline;
        self
    }

    /// Split into the backend and accountant halves, both backed by this device.
    pub fn into_parts(self) -> (Arc<Self>, SimulatedBackend, SimulatedAccountant) {
        let device = Arc::new(self);
        (device.clone(), SimulatedBackend { device: device.clone() }, SimulatedAccountant { device })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    /// Every `allocate()` call, granted or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn grants(&self) -> Vec<Grant> {
        lock(&self.grants).clone()
    }

    pub fn deny_all(&self, deny: bool) {
        self.deny_all.store(deny, Ordering::SeqCst);
    }

    /// Refuse everything once `n` requests have been granted.
    pub fn deny_after(&self, n: u64) {
        self.deny_after.store(n, Ordering::SeqCst);
    }

    /// Grant, then fail the readback, as if the pages never became real.
    pub fn fail_verification(&self, fail: bool) {
        self.fail_verification.store(fail, Ordering::SeqCst);
    }

    fn grant(&self, kind: AllocationKind, size: usize) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut grants = lock(&self.grants);
        if self.deny_all.load(Ordering::SeqCst) || grants.len() as u64 >= self.deny_after.load(Ordering::SeqCst) {
            return Err(ProbeError::AllocationDenied { size });
        }
        let resident = self.resident.load(Ordering::SeqCst);
        if resident + size as u64 > self.limit {
            return Err(ProbeError::AllocationDenied { size });
        }
        if self.fail_verification.load(Ordering::SeqCst) {
            // Granted and released on the spot, so nothing stays resident.
            return Err(ProbeError::VerificationFailed { size, offset: 0 });
        }

        self.resident.fetch_add(size as u64, Ordering::SeqCst);
        grants.push(Grant { kind, size, resident_before: resident });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    device: Arc<SimulatedDevice>,
}

impl AllocationBackend for SimulatedBackend {
    fn allocate(&mut self, kind: AllocationKind, size: usize) -> Result<AllocationRecord> {
        if size == 0 {
            return Err(ProbeError::AllocationDenied { size });
        }
        self.device.grant(kind, size)?;
        Ok(AllocationRecord::new(kind, NonNull::dangling(), size))
    }

    fn release(&mut self, record: AllocationRecord) {
        self.device.resident.fetch_sub(record.size() as u64, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedAccountant {
    device: Arc<SimulatedDevice>,
}

impl MemoryAccountant for SimulatedAccountant {
    fn system_snapshot(&self) -> Result<MemorySnapshot> {
        let d = &self.device;
        let resident = d.resident();
        let others = d.total - d.limit;
        Ok(MemorySnapshot {
            total: d.total,
            free: d.limit.saturating_sub(resident),
            active: d.baseline + resident + others / 4,
            inactive: others / 4,
            wired: others / 2,
            footprint: d.baseline + resident,
            ..MemorySnapshot::default()
        })
    }

    fn process_footprint(&self) -> Result<u64> {
        Ok(self.device.baseline + self.device.resident())
    }
}
