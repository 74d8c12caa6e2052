use criterion::{Criterion, criterion_group, criterion_main};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use core::time::Duration;
use std::hint::black_box;
use std::ptr::NonNull;

use rambench::device::{CAPACITY_LADDER_GIB, ComputeTier, DeviceProfile, FormFactor};
use rambench::policy::BackendPolicy;
use rambench::verify::{SentinelVerifier, Verify, heap_offsets, reservation_offsets};
use rambench::{GIB, MIB, next_chunk};

const NUM_ARGS: usize = 50_000;

fn bench_next_chunk(c: &mut Criterion) {
    let mut r = StdRng::seed_from_u64(0);
    let fractions: Vec<f64> = (0..NUM_ARGS).map(|_| r.random_range(0.0..1.05)).collect();
    let profiles: Vec<DeviceProfile> = (0..NUM_ARGS)
        .map(|_| {
            let gib = CAPACITY_LADDER_GIB[r.random_range(0..CAPACITY_LADDER_GIB.len())];
            let tier = if r.random_bool(0.5) { ComputeTier::Modern } else { ComputeTier::Standard };
            let form = if r.random_bool(0.5) { FormFactor::Tablet } else { FormFactor::Handset };
            DeviceProfile::new(gib * GIB, tier, form)
        })
        .collect();
    let mut i = 0;

    c.bench_function("next_chunk", |b| b.iter(|| {
        black_box(next_chunk(black_box(fractions[i % NUM_ARGS]), &profiles[i % NUM_ARGS]));

        i += 1;
    }));
}

fn bench_policy_choose(c: &mut Criterion) {
    let mut r = StdRng::seed_from_u64(0);
    let fractions: Vec<f64> = (0..NUM_ARGS).map(|_| r.random_range(0.0..1.0)).collect();
    let mut policy = BackendPolicy::adaptive(Some(0));
    let mut i = 0;

    c.bench_function("policy_choose", |b| b.iter(|| {
        black_box(policy.choose(black_box(fractions[i % NUM_ARGS])));

        i += 1;
    }));
}

fn bench_verify(c: &mut Criterion) {
    let size = 16 * MIB as usize;
    let mut buf = vec![0u8; size];
    let p = NonNull::new(buf.as_mut_ptr()).unwrap();
    let mut v = SentinelVerifier::seeded(0);

    let offs = reservation_offsets(size, 4096, 64);
    c.bench_function("verify_reservation_16MiB", |b| b.iter(|| {
        black_box(unsafe { v.check(p, size, &offs) }).unwrap();
    }));

    let offs = heap_offsets(size);
    c.bench_function("verify_heap_16MiB", |b| b.iter(|| {
        black_box(unsafe { v.check(p, size, &offs) }).unwrap();
    }));
}

criterion_group!{
    name = planner;
    config = Criterion::default().warm_up_time(Duration::from_millis(100)).measurement_time(Duration::from_millis(1000));
    targets = bench_next_chunk, bench_policy_choose, bench_verify
}

criterion_main!(planner);
