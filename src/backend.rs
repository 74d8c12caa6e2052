//! Getting memory from the OS and making sure it is really ours.

use crate::error::{ProbeError, Result};
use crate::platformalloc::{page_size, sys_release, sys_reserve};
use crate::verify::{SentinelVerifier, Verify, heap_offsets, reservation_offsets};
use serde::{Deserialize, Serialize};
use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::ptr::{self, NonNull};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationKind {
    /// Fresh anonymous address space from the VM layer, committed by touching every page.
    Reservation,
    /// The global allocator, committed by filling the span.
    Heap,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocationKind::Reservation => "reservation",
            AllocationKind::Heap => "heap",
        })
    }
}

/// One live, committed, verified allocation. Not `Clone`: handing it back to
/// `AllocationBackend::release()` consumes it.
#[derive(Debug)]
pub struct AllocationRecord {
    kind: AllocationKind,
    ptr: NonNull<u8>,
    size: usize,
}

// The pointer is only an address to give back to the OS; nothing reads through it after
// verification.
unsafe impl Send for AllocationRecord {}

impl AllocationRecord {
    pub fn new(kind: AllocationKind, ptr: NonNull<u8>, size: usize) -> Self {
        Self { kind, ptr, size }
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub trait AllocationBackend: Send {
    /// Reserve, commit and verify `size` bytes. On error nothing stays allocated.
    fn allocate(&mut self, kind: AllocationKind, size: usize) -> Result<AllocationRecord>;

    fn release(&mut self, record: AllocationRecord);
}

/// The backend that talks to the real OS.
#[derive(Debug)]
pub struct SystemBackend<V: Verify = SentinelVerifier> {
    verifier: V,
    sample_cap: usize,
}

impl SystemBackend {
    pub fn new(sample_cap: usize) -> Self {
        Self::with_verifier(SentinelVerifier::new(), sample_cap)
    }
}

impl<V: Verify> SystemBackend<V> {
    pub fn with_verifier(verifier: V, sample_cap: usize) -> Self {
        Self { verifier, sample_cap }
    }

    fn heap_layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, page_size()).map_err(|_| ProbeError::AllocationDenied { size })
    }

    fn reserve_and_touch(&mut self, size: usize) -> Result<NonNull<u8>> {
        let page = page_size();
        let p = sys_reserve(size)?;

        // One write per page is what turns address space into committed memory.
        let mut off = 0;
        while off < size {
            unsafe { p.as_ptr().add(off).write_volatile(0xA5) };
            off += page;
        }

        let offsets = reservation_offsets(size, page, self.sample_cap);
        if let Err(e) = unsafe { self.verifier.check(p, size, &offsets) } {
            sys_release(p, size);
            return Err(e);
        }
        Ok(p)
    }

    fn alloc_and_fill(&mut self, size: usize) -> Result<NonNull<u8>> {
        let layout = Self::heap_layout(size)?;
        let p = NonNull::new(unsafe { alloc(layout) }).ok_or(ProbeError::AllocationDenied { size })?;

        unsafe { ptr::write_bytes(p.as_ptr(), 0xA5, size) };

        if let Err(e) = unsafe { self.verifier.check(p, size, &heap_offsets(size)) } {
            unsafe { dealloc(p.as_ptr(), layout) };
            return Err(e);
        }
        Ok(p)
    }
}

impl<V: Verify> AllocationBackend for SystemBackend<V> {
    fn allocate(&mut self, kind: AllocationKind, size: usize) -> Result<AllocationRecord> {
        if size == 0 {
            return Err(ProbeError::AllocationDenied { size });
        }
        let p = match kind {
            AllocationKind::Reservation => self.reserve_and_touch(size)?,
            AllocationKind::Heap => self.alloc_and_fill(size)?,
        };
        Ok(AllocationRecord::new(kind, p, size))
    }

    fn release(&mut self, record: AllocationRecord) {
        match record.kind {
            AllocationKind::Reservation => sys_release(record.ptr, record.size),
            AllocationKind::Heap => {
                if let Ok(layout) = Self::heap_layout(record.size) {
                    unsafe { dealloc(record.ptr.as_ptr(), layout) };
                }
            }
        }
    }
}
