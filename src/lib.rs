//! rambench: find out how much memory this device will actually let one process commit.
//!
//! A [`Probe`] commits memory in steps, large while the device is mostly empty and smaller as it
//! fills, backing off when the OS refuses, until it can go no further. Each run is recorded in a
//! JSON ledger together with the device it ran on.

pub mod accountant;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod planner;
pub mod platformalloc;
pub mod policy;
pub mod probe;
pub mod sim;
pub mod store;
pub mod verify;

pub use accountant::{MemoryAccountant, MemorySnapshot, SystemAccountant};
pub use backend::{AllocationBackend, AllocationKind, AllocationRecord, SystemBackend};
pub use config::{Backoff, ProbeConfig};
pub use device::{ComputeTier, DeviceProfile, FormFactor};
pub use error::{ProbeError, Result};
pub use planner::next_chunk;
pub use policy::BackendPolicy;
pub use probe::{Probe, ProbeState};
pub use store::{BenchmarkRun, ResultStore, RunStatus};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// `12582912` -> `"12.0 MiB"`.
pub fn fmt_bytes(size: u64) -> String {
    bytesize::ByteSize::b(size).to_string_as(true) // true for binary units (KiB, MiB, GiB, etc.)
}
