// These measure this process's physical footprint, so they live in their own test binary and run
// one after another inside a single test.

#![cfg(any(target_os = "linux", target_vendor = "apple"))]

use rambench::accountant::{MemoryAccountant, SystemAccountant};
use rambench::backend::{AllocationBackend, AllocationKind, SystemBackend};
use rambench::device::DeviceProfile;
use rambench::probe::{Probe, ProbeState};
use rambench::store::ResultStore;
use rambench::verify::RejectingVerifier;
use rambench::{MIB, ProbeConfig};
use std::time::Duration;

fn footprint() -> u64 {
    SystemAccountant.process_footprint().unwrap()
}

#[test]
fn real_memory_is_committed_and_given_back() {
    // Memory that fails verification must not stay behind. Allowing one chunk of slack covers the
    // allocator keeping a freed heap span around for reuse.
    let chunk = 16 * MIB as usize;
    let mut rejecting = SystemBackend::with_verifier(RejectingVerifier, 64);
    let before = footprint();
    for kind in [AllocationKind::Reservation, AllocationKind::Heap] {
        for _ in 0..12 {
            assert!(rejecting.allocate(kind, chunk).unwrap_err().is_denial());
        }
    }
    let after = footprint();
    assert!(after < before + 3 * chunk as u64, "before: {before}, after: {after}");

    // A real, capped run commits what it says it did, and clear() returns it.
    let config = ProbeConfig {
        step_delay: Some(Duration::ZERO),
        commit_ceiling: Some(32 * MIB),
        policy_seed: Some(0),
        ..ProbeConfig::default()
    };
    let profile = DeviceProfile::resolve(&config);
    let probe = Probe::with_parts(profile, config, SystemBackend::new(64), SystemAccountant, ResultStore::in_memory());

    let baseline = footprint();
    assert!(probe.start(|_| {}));
    probe.wait();
    assert_eq!(probe.state(), ProbeState::Completed);
    assert_eq!(probe.committed_bytes(), 32 * MIB);
    assert_eq!(probe.audit(), (32 * MIB, 32 * MIB));

    let during = footprint();
    assert!(during >= baseline + 24 * MIB, "baseline: {baseline}, during: {during}");

    probe.clear();
    let cleared = footprint();
    assert!(cleared + 24 * MIB <= during, "during: {during}, cleared: {cleared}");
    // Back to where the run started, give or take what the allocator keeps cached.
    assert!(cleared <= baseline + 8 * MIB, "baseline: {baseline}, cleared: {cleared}");
}
