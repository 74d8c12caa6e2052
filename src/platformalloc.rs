// Abstract over system virtual memory functions

use crate::error::Result;
use std::ptr::NonNull;

lazy_static::lazy_static! {
    /// The VM page size, queried once.
    pub static ref PAGE_SIZE: usize = vendor::page_size();
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Reserve `size` bytes of fresh, private, readable and writable address space. Nothing is
/// committed until the pages are touched.
pub fn sys_reserve(size: usize) -> Result<NonNull<u8>> {
    debug_assert!(size > 0);

    let p = vendor::sys_reserve(size)?;
    debug_assert!(p.as_ptr().addr() % page_size() == 0);

    Ok(p)
}

/// Return a range obtained from `sys_reserve()` to the OS. `size` must be the size it was reserved
/// with.
pub fn sys_release(ptr: NonNull<u8>, size: usize) {
    debug_assert!(size > 0);

    vendor::sys_release(ptr, size)
}

#[cfg(target_os = "linux")]
pub mod vendor {
    use crate::error::{ProbeError, Result};
    use rustix::mm::{MapFlags, ProtFlags, mmap_anonymous, munmap};
    use std::ffi::c_void;
    use std::ptr::{self, NonNull};

    pub fn page_size() -> usize {
        rustix::param::page_size()
    }

    // No NORESERVE here: with it the kernel never refuses the mapping and the first sign of
    // exhaustion would be the OOM killer instead of an error we can back off from.
    pub fn sys_reserve(reqsize: usize) -> Result<NonNull<u8>> {
        match unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                reqsize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        } {
            Ok(p) => NonNull::new(p as *mut u8).ok_or(ProbeError::AllocationDenied { size: reqsize }),
            Err(_) => Err(ProbeError::AllocationDenied { size: reqsize }),
        }
    }

    pub fn sys_release(p: NonNull<u8>, size: usize) {
        unsafe {
            munmap(p.as_ptr() as *mut c_void, size).ok();
        }
    }
}

#[cfg(target_vendor = "apple")]
pub mod vendor {
    use crate::error::{ProbeError, Result};
    use mach_sys::kern_return::KERN_SUCCESS;
    use mach_sys::port::mach_port_t;
    use mach_sys::traps::mach_task_self;
    use mach_sys::vm::{mach_vm_allocate, mach_vm_deallocate};
    use mach_sys::vm_statistics::VM_FLAGS_ANYWHERE;
    use mach_sys::vm_types::{mach_vm_address_t, mach_vm_size_t};
    use std::mem::size_of;
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 16_384 }
    }

    pub fn sys_reserve(size: usize) -> Result<NonNull<u8>> {
        let task: mach_port_t = unsafe { mach_task_self() };
        let mut address: mach_vm_address_t = 0;
        let reqsize: mach_vm_size_t = size as mach_vm_size_t;

        let retval;
        unsafe {
            retval = mach_vm_allocate(task, &mut address, reqsize, VM_FLAGS_ANYWHERE);
        }
        if retval == KERN_SUCCESS {
            NonNull::new(address as *mut u8).ok_or(ProbeError::AllocationDenied { size })
        } else {
            Err(ProbeError::AllocationDenied { size })
        }
    }

    pub fn sys_release(p: NonNull<u8>, size: usize) {
        debug_assert!(size_of::<usize>() == size_of::<u64>());

        unsafe {
            let retval = mach_vm_deallocate(mach_task_self(), p.as_ptr().addr() as u64, size as u64);
            debug_assert!(retval == KERN_SUCCESS);
        }
    }
}

// Elsewhere the global allocator stands in for the VM layer, page-aligned so touching one byte
// per page still commits every page.
#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
pub mod vendor {
    use crate::error::{ProbeError, Result};
    use std::alloc::{Layout, alloc, dealloc};
    use std::ptr::NonNull;

    pub fn page_size() -> usize {
        4096
    }

    pub fn sys_reserve(size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, page_size()).map_err(|_| ProbeError::AllocationDenied { size })?;
        NonNull::new(unsafe { alloc(layout) }).ok_or(ProbeError::AllocationDenied { size })
    }

    pub fn sys_release(p: NonNull<u8>, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, page_size()) {
            unsafe { dealloc(p.as_ptr(), layout) };
        }
    }
}
