//! Checking that freshly committed memory really holds what we write into it.

use crate::error::{ProbeError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;

/// Offsets a reservation of `size` bytes is sampled at: one per page, evenly strided across the
/// pages when there are more than `cap` of them.
pub fn reservation_offsets(size: usize, page: usize, cap: usize) -> Vec<usize> {
    let pages = size.div_ceil(page);
    if pages == 0 || cap == 0 {
        return Vec::new();
    }
    let n = pages.min(cap);
    (0..n).map(|i| (i * pages / n) * page).collect()
}

/// First byte, each quartile, and the last byte.
pub fn heap_offsets(size: usize) -> Vec<usize> {
    if size == 0 {
        return Vec::new();
    }
    let mut v = vec![0, size / 4, size / 2, 3 * size / 4, size - 1];
    v.dedup();
    v
}

/// Writes a sentinel and reads it back at every offset.
pub trait Verify: Send {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes, and every offset must be `< size`.
    unsafe fn check(&mut self, ptr: NonNull<u8>, size: usize, offsets: &[usize]) -> Result<()>;
}

/// The verifier the system backend uses: a random non-zero sentinel per sample.
#[derive(Debug)]
pub struct SentinelVerifier {
    rng: StdRng,
}

impl SentinelVerifier {
    pub fn new() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Default for SentinelVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verify for SentinelVerifier {
    unsafe fn check(&mut self, ptr: NonNull<u8>, size: usize, offsets: &[usize]) -> Result<()> {
        for &offset in offsets {
            debug_assert!(offset < size);
            let sentinel: u8 = self.rng.random_range(1..=255);
            let p = unsafe { ptr.as_ptr().add(offset) };
            let readback = unsafe {
                p.write_volatile(sentinel);
                p.read_volatile()
            };
            if readback != sentinel {
                return Err(ProbeError::VerificationFailed { size, offset });
            }
        }
        Ok(())
    }
}

/// Fails every check. Stands in for memory that was granted but doesn't hold data.
#[derive(Debug, Default)]
pub struct RejectingVerifier;

impl Verify for RejectingVerifier {
    unsafe fn check(&mut self, _ptr: NonNull<u8>, size: usize, offsets: &[usize]) -> Result<()> {
        Err(ProbeError::VerificationFailed { size, offset: offsets.first().copied().unwrap_or(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_sample_per_page_under_the_cap() {
        assert_eq!(reservation_offsets(4 * 4096, 4096, 64), vec![0, 4096, 8192, 12288]);
        // A partial last page still gets its sample.
        assert_eq!(reservation_offsets(4096 + 1, 4096, 64), vec![0, 4096]);
    }

    #[test]
    fn strided_over_the_cap() {
        let offs = reservation_offsets(1024 * 4096, 4096, 64);
        assert_eq!(offs.len(), 64);
        assert_eq!(offs[0], 0);
        assert!(offs.windows(2).all(|w| w[1] - w[0] == 16 * 4096));
        assert!(*offs.last().unwrap() < 1024 * 4096);
    }

    #[test]
    fn heap_quartiles() {
        assert_eq!(heap_offsets(100), vec![0, 25, 50, 75, 99]);
        assert_eq!(heap_offsets(1), vec![0]);
        assert!(heap_offsets(0).is_empty());
    }

    #[test]
    fn sentinel_round_trips_on_real_memory() {
        let mut buf = vec![0u8; 4096];
        let p = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut v = SentinelVerifier::seeded(1);
        unsafe { v.check(p, buf.len(), &heap_offsets(buf.len())) }.unwrap();
        assert!(buf[0] != 0 && buf[4095] != 0);
    }

    #[test]
    fn rejecting_verifier_rejects() {
        let mut buf = vec![0u8; 16];
        let p = NonNull::new(buf.as_mut_ptr()).unwrap();
        let r = unsafe { RejectingVerifier.check(p, 16, &[3]) };
        assert!(matches!(r, Err(ProbeError::VerificationFailed { size: 16, offset: 3 })));
    }
}
