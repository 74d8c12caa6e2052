//! Which backend the next request goes through.

use crate::backend::AllocationKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Below this fraction every request is a reservation.
pub const RESERVATION_ONLY_BELOW: f64 = 0.3;
/// At or above this fraction every request goes to the heap.
pub const HEAP_ONLY_FROM: f64 = 0.6;

#[derive(Debug, Clone)]
pub enum BackendPolicy {
    /// Reservations while the device is mostly empty, a coin toss in the middle band, the heap near
    /// the top.
    Adaptive(StdRng),
    Fixed(AllocationKind),
}

impl BackendPolicy {
    pub fn adaptive(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => BackendPolicy::Adaptive(StdRng::seed_from_u64(s)),
            None => BackendPolicy::Adaptive(StdRng::from_os_rng()),
        }
    }

    pub fn fixed(kind: AllocationKind) -> Self {
        BackendPolicy::Fixed(kind)
    }

    pub fn choose(&mut self, fraction: f64) -> AllocationKind {
        match self {
            BackendPolicy::Fixed(kind) => *kind,
            BackendPolicy::Adaptive(rng) => {
                if !(fraction >= RESERVATION_ONLY_BELOW) {
                    AllocationKind::Reservation
                } else if fraction >= HEAP_ONLY_FROM {
                    AllocationKind::Heap
                } else if rng.random_bool(0.5) {
                    AllocationKind::Reservation
                } else {
                    AllocationKind::Heap
                }
            }
        }
    }
}
