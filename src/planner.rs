//! How big the next request should be.
//!
//! The table starts coarse (tens of MiB while the device is mostly empty) and narrows towards the
//! ceiling, so the run spends its time resolving the last few percent rather than the first.

use crate::device::{DeviceProfile, FormFactor};
use crate::{GIB, KIB, MIB};

/// Lower bounds (inclusive) of each fraction band, highest first.
const BAND_FLOORS: [f64; 7] = [0.95, 0.90, 0.80, 0.60, 0.40, 0.20, 0.0];

// Base chunk per band for devices under 12 GiB, under 16 GiB, and 16 GiB or more. Every column is
// non-increasing from the bottom band up, which is what keeps next_chunk() monotone.
const BASE_CHUNKS: [[u64; 3]; 7] = [
    [64 * KIB, MIB, 2 * MIB],
    [128 * KIB, 2 * MIB, 4 * MIB],
    [512 * KIB, 4 * MIB, 8 * MIB],
    [4 * MIB, 8 * MIB, 16 * MIB],
    [16 * MIB, 24 * MIB, 32 * MIB],
    [24 * MIB, 48 * MIB, 64 * MIB],
    [64 * MIB, 96 * MIB, 128 * MIB],
];

/// Chunks are whole multiples of this. Fixed rather than the runtime page size so the planner
/// gives the same answer everywhere.
pub const CHUNK_GRANULE: usize = 4096;

fn band(fraction: f64) -> usize {
    let fraction = if fraction.is_nan() { 0.0 } else { fraction.max(0.0) };
    BAND_FLOORS.iter().position(|&lo| fraction >= lo).unwrap_or(BAND_FLOORS.len() - 1)
}

fn capacity_column(profile: &DeviceProfile) -> usize {
    if profile.capacity_bytes >= 16 * GIB {
        2
    } else if profile.capacity_bytes >= 12 * GIB {
        1
    } else {
        0
    }
}

/// Size of the next request, given the fraction of capacity already committed.
pub fn next_chunk(fraction: f64, profile: &DeviceProfile) -> usize {
    let b = band(fraction);
    let mut base = BASE_CHUNKS[b][capacity_column(profile)];

    // Tablets start out twice as coarse.
    if b == BAND_FLOORS.len() - 1 && profile.form_factor == FormFactor::Tablet {
        base *= 2;
    }

    let multiplier = profile.compute_tier.multiplier().max(1.0) * profile.form_factor.multiplier();
    let scaled = (base as f64 * multiplier) as usize;

    (scaled / CHUNK_GRANULE).max(1) * CHUNK_GRANULE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CAPACITY_LADDER_GIB, ComputeTier};

    fn all_profiles() -> Vec<DeviceProfile> {
        let mut v = Vec::new();
        for gib in CAPACITY_LADDER_GIB {
            for tier in [ComputeTier::Standard, ComputeTier::Modern] {
                for form in [FormFactor::Handset, FormFactor::Tablet] {
                    v.push(DeviceProfile::new(gib * GIB, tier, form));
                }
            }
        }
        v
    }

    fn fractions() -> Vec<f64> {
        (0..=1100).map(|i| i as f64 / 1000.0).collect()
    }

    #[test]
    fn deterministic() {
        for p in all_profiles() {
            for f in fractions() {
                assert_eq!(next_chunk(f, &p), next_chunk(f, &p.clone()));
            }
        }
    }

    #[test]
    fn monotone_non_increasing() {
        for p in all_profiles() {
            let mut prev = usize::MAX;
            for f in fractions() {
                let c = next_chunk(f, &p);
                assert!(c <= prev, "profile: {p:?}, fraction: {f}, chunk: {c}, previous: {prev}");
                prev = c;
            }
        }
    }

    #[test]
    fn chunks_are_granule_multiples() {
        for p in all_profiles() {
            for f in fractions() {
                assert_eq!(next_chunk(f, &p) % CHUNK_GRANULE, 0);
            }
        }
    }

    #[test]
    fn band_edges_are_inclusive_below() {
        let p = DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Handset);
        assert_eq!(next_chunk(0.0, &p), 64 * MIB as usize);
        assert_eq!(next_chunk(0.1999, &p), 64 * MIB as usize);
        assert_eq!(next_chunk(0.20, &p), 24 * MIB as usize);
        assert_eq!(next_chunk(0.60, &p), 4 * MIB as usize);
        assert_eq!(next_chunk(0.8999, &p), 512 * KIB as usize);
        assert_eq!(next_chunk(0.90, &p), 128 * KIB as usize);
        assert_eq!(next_chunk(0.95, &p), 64 * KIB as usize);
        assert_eq!(next_chunk(1.5, &p), 64 * KIB as usize);
    }

    #[test]
    fn bigger_devices_take_bigger_bites() {
        let small = DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Handset);
        let mid = DeviceProfile::new(12 * GIB, ComputeTier::Standard, FormFactor::Handset);
        let big = DeviceProfile::new(16 * GIB, ComputeTier::Standard, FormFactor::Handset);
        assert_eq!(next_chunk(0.97, &small), 64 * KIB as usize);
        assert_eq!(next_chunk(0.97, &mid), MIB as usize);
        assert_eq!(next_chunk(0.97, &big), 2 * MIB as usize);
        assert_eq!(next_chunk(0.0, &big), 128 * MIB as usize);
    }

    #[test]
    fn multipliers_apply() {
        let modern = DeviceProfile::new(8 * GIB, ComputeTier::Modern, FormFactor::Handset);
        assert_eq!(next_chunk(0.5, &modern), (16.0 * MIB as f64 * 1.2) as usize / CHUNK_GRANULE * CHUNK_GRANULE);

        // Tablets get the doubled first band and the form factor multiplier.
        let tablet = DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Tablet);
        assert_eq!(next_chunk(0.0, &tablet), (128.0 * MIB as f64 * 1.3) as usize / CHUNK_GRANULE * CHUNK_GRANULE);
        assert_eq!(next_chunk(0.5, &tablet), (16.0 * MIB as f64 * 1.3) as usize / CHUNK_GRANULE * CHUNK_GRANULE);
    }

    #[test]
    fn out_of_range_fractions_clamp() {
        let p = DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Handset);
        assert_eq!(next_chunk(f64::NAN, &p), next_chunk(0.0, &p));
        assert_eq!(next_chunk(-1.0, &p), next_chunk(0.0, &p));
        assert_eq!(next_chunk(f64::INFINITY, &p), next_chunk(1.0, &p));
    }
}
