//! The probe loop: commit memory in shrinking steps until the OS says no, and record how far it
//! got.
//!
//! A run is a loop on one worker thread. Each step asks the planner for a size (or retries the
//! pending backoff candidate), asks the policy for a backend, and tries to allocate. Successes
//! are kept until `clear()`, denials shrink the next request, and the run completes once the
//! shrunken request would fall below the floor or too many denials come in a row.
//!
//! Everything a step mutates lives under the session mutex. The committed total, running flag and
//! state are mirrored into atomics so readers never wait on a step.

use crate::accountant::{MemoryAccountant, MemorySnapshot, SystemAccountant};
use crate::backend::{AllocationBackend, AllocationRecord, SystemBackend};
use crate::config::{Backoff, ProbeConfig};
use crate::device::DeviceProfile;
use crate::error::Result;
use crate::fmt_bytes;
use crate::planner::next_chunk;
use crate::policy::BackendPolicy;
use crate::store::{BenchmarkRun, ResultStore, RunStatus};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Idle = 0,
    Running = 1,
    Completed = 2,
}

impl ProbeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProbeState::Running,
            2 => ProbeState::Completed,
            _ => ProbeState::Idle,
        }
    }
}

type Callback = Box<dyn FnOnce(u64) + Send>;

struct Session<B: AllocationBackend> {
    backend: B,
    records: Vec<AllocationRecord>,
    policy: BackendPolicy,
    /// Size to retry after a denial, instead of asking the planner.
    candidate: Option<usize>,
    failures: u32,
    attempts: u64,
    last_snapshot: Option<MemorySnapshot>,
    on_complete: Option<Callback>,
}

impl<B: AllocationBackend> Session<B> {
    fn release_all(&mut self) {
        for record in self.records.drain(..) {
            self.backend.release(record);
        }
    }

    fn record_total(&self) -> u64 {
        self.records.iter().map(|r| r.size() as u64).sum()
    }
}

impl<B: AllocationBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

enum Step {
    Continue,
    Finished,
}

struct Shared<B: AllocationBackend, A: MemoryAccountant> {
    profile: DeviceProfile,
    config: ProbeConfig,
    accountant: A,
    session: Mutex<Session<B>>,
    // Only ever locked while holding `session`, or on its own for reads.
    store: Mutex<ResultStore>,
    committed: AtomicU64,
    running: AtomicBool,
    state: AtomicU8,
    generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Probe<B: AllocationBackend + 'static = SystemBackend, A: MemoryAccountant + 'static = SystemAccountant> {
    shared: Arc<Shared<B, A>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Probe {
    /// A probe on this host: real backend, real counters, the ledger at the configured path.
    ///
    /// An unreadable ledger is not fatal; the probe then keeps its runs in memory only.
    pub fn new(config: ProbeConfig) -> Self {
        let profile = DeviceProfile::resolve(&config);
        let store = match config.resolved_history_path() {
            Some(path) => ResultStore::open(path).unwrap_or_else(|e| {
                tracing::warn!("{e}; keeping run history in memory only");
                ResultStore::in_memory()
            }),
            None => {
                tracing::warn!("no data directory; keeping run history in memory only");
                ResultStore::in_memory()
            }
        };
        let backend = SystemBackend::new(config.sample_cap);
        Self::with_parts(profile, config, backend, SystemAccountant, store)
    }
}

impl<B: AllocationBackend + 'static, A: MemoryAccountant + 'static> Probe<B, A> {
    pub fn with_parts(profile: DeviceProfile, config: ProbeConfig, backend: B, accountant: A, store: ResultStore) -> Self {
        let policy = BackendPolicy::adaptive(config.policy_seed);
        let session = Session {
            backend,
            records: Vec::new(),
            policy,
            candidate: None,
            failures: 0,
            attempts: 0,
            last_snapshot: None,
            on_complete: None,
        };
        Self {
            shared: Arc::new(Shared {
                profile,
                config,
                accountant,
                session: Mutex::new(session),
                store: Mutex::new(store),
                committed: AtomicU64::new(0),
                running: AtomicBool::new(false),
                state: AtomicU8::new(ProbeState::Idle as u8),
                generation: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Replace the backend selection policy. Takes effect from the next step.
    pub fn set_policy(&self, policy: BackendPolicy) {
        lock(&self.shared.session).policy = policy;
    }

    /// Begin a run. Returns false, and does nothing, if one is already running.
    ///
    /// Memory still held from a previous completed run is released first. `on_complete` gets the
    /// final committed total, on the worker thread, unless the run is cleared first.
    pub fn start<F: FnOnce(u64) + Send + 'static>(&self, on_complete: F) -> bool {
        let shared = &self.shared;
        let mut session = lock(&shared.session);
        if shared.running.load(Ordering::SeqCst) {
            return false;
        }

        session.release_all();
        session.candidate = None;
        session.failures = 0;
        session.attempts = 0;
        session.last_snapshot = None;
        session.on_complete = Some(Box::new(on_complete));
        shared.committed.store(0, Ordering::SeqCst);

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut store = lock(&shared.store);
            let run = BenchmarkRun::new(store.next_id(), &shared.profile);
            if let Err(e) = store.append(run) {
                tracing::warn!("{e}");
            }
        }
        shared.running.store(true, Ordering::SeqCst);
        shared.state.store(ProbeState::Running as u8, Ordering::SeqCst);

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("rambench-probe".to_string())
            .spawn(move || worker_shared.run(generation));
        match spawned {
            Ok(handle) => {
                // Any earlier worker has either finished or will exit on its next step.
                *lock(&self.worker) = Some(handle);
                tracing::info!(
                    capacity = %fmt_bytes(shared.profile.capacity_bytes),
                    form_factor = %shared.profile.form_factor,
                    compute_tier = %shared.profile.compute_tier,
                    "probe started"
                );
                true
            }
            Err(e) => {
                tracing::warn!("could not spawn the probe worker: {e}");
                session.on_complete = None;
                shared.finish(&mut session, ProbeState::Idle);
                false
            }
        }
    }

    /// Cancel any run, give all memory back, and go idle. A run cancelled mid-way is recorded
    /// as completed with whatever it had committed.
    pub fn clear(&self) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::SeqCst);

        let mut session = lock(&shared.session);
        session.on_complete = None;
        if shared.running.load(Ordering::SeqCst) {
            shared.finish(&mut session, ProbeState::Idle);
        }
        session.release_all();
        session.candidate = None;
        session.failures = 0;
        shared.committed.store(0, Ordering::SeqCst);
        shared.state.store(ProbeState::Idle as u8, Ordering::SeqCst);
        tracing::debug!("probe cleared");
    }

    pub fn clear_history(&self) -> Result<()> {
        lock(&self.shared.store).clear()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.shared.committed.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<BenchmarkRun> {
        lock(&self.shared.store).runs().to_vec()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProbeState {
        ProbeState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.shared.profile
    }

    /// The most recent memory snapshot taken during a run.
    pub fn last_snapshot(&self) -> Option<MemorySnapshot> {
        lock(&self.shared.session).last_snapshot
    }

    /// Allocation attempts made by the current (or last) run.
    pub fn attempts(&self) -> u64 {
        lock(&self.shared.session).attempts
    }

    /// The sum of live record sizes and the published committed total, read together.
    pub fn audit(&self) -> (u64, u64) {
        let session = lock(&self.shared.session);
        (session.record_total(), self.shared.committed.load(Ordering::SeqCst))
    }

    /// Block until the current worker, if any, exits.
    pub fn wait(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::warn!("probe worker panicked");
        }
    }
}

impl<B: AllocationBackend + 'static, A: MemoryAccountant + 'static> Drop for Probe<B, A> {
    fn drop(&mut self) {
        // The worker holds its own reference to the shared state; clearing makes it exit.
        self.clear();
    }
}

impl<B: AllocationBackend, A: MemoryAccountant> Shared<B, A> {
    fn run(&self, generation: u64) {
        let delay = self.config.step_delay_for(&self.profile);
        loop {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let mut session = lock(&self.session);
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "stale probe worker exiting");
                return;
            }
            match self.step(&mut session) {
                Step::Continue => {}
                Step::Finished => {
                    let callback = session.on_complete.take();
                    let total = self.committed.load(Ordering::SeqCst);
                    drop(session);
                    if let Some(callback) = callback {
                        callback(total);
                    }
                    return;
                }
            }
        }
    }

    fn step(&self, s: &mut Session<B>) -> Step {
        let committed = self.committed.load(Ordering::SeqCst);
        let ceiling = self.config.commit_ceiling;
        if ceiling.is_some_and(|c| committed >= c) {
            return self.complete(s);
        }

        let footprint = match self.accountant.process_footprint() {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("{e}; using the committed total");
                committed
            }
        };
        let fraction = committed.max(footprint) as f64 / self.profile.capacity_bytes.max(1) as f64;

        let mut size = s.candidate.unwrap_or_else(|| next_chunk(fraction, &self.profile));
        if let Some(c) = ceiling {
            size = size.min((c - committed) as usize);
        }
        let kind = s.policy.choose(fraction);
        s.attempts += 1;

        match s.backend.allocate(kind, size) {
            Ok(record) => {
                s.records.push(record);
                let committed = committed + size as u64;
                self.committed.store(committed, Ordering::SeqCst);
                s.candidate = None;
                s.failures = 0;

                match self.accountant.system_snapshot() {
                    Ok(snap) => s.last_snapshot = Some(snap),
                    Err(e) => tracing::debug!("{e}; keeping the last snapshot"),
                }
                self.update_tail(committed, s.last_snapshot, RunStatus::Running);

                tracing::debug!(
                    %kind,
                    size = %fmt_bytes(size as u64),
                    committed = %fmt_bytes(committed),
                    fraction = format_args!("{fraction:.3}"),
                    "step committed"
                );

                if ceiling.is_some_and(|c| committed >= c) {
                    return self.complete(s);
                }
                Step::Continue
            }
            Err(e) => {
                s.failures += 1;
                if e.is_denial() {
                    tracing::debug!(%kind, size = %fmt_bytes(size as u64), failures = s.failures, "{e}");
                } else {
                    tracing::warn!(%kind, size = %fmt_bytes(size as u64), failures = s.failures, "unexpected backend error: {e}");
                }

                if s.failures >= self.config.max_consecutive_failures {
                    return self.complete(s);
                }
                match Backoff::for_form_factor(self.profile.form_factor).shrink(size) {
                    Some(next) => {
                        s.candidate = Some(next);
                        Step::Continue
                    }
                    None => self.complete(s),
                }
            }
        }
    }

    fn complete(&self, s: &mut Session<B>) -> Step {
        self.finish(s, ProbeState::Completed);
        tracing::info!(
            committed = %fmt_bytes(self.committed.load(Ordering::SeqCst)),
            attempts = s.attempts,
            "probe completed"
        );
        Step::Finished
    }

    /// Close out the tail run with the current total and leave the running state.
    fn finish(&self, s: &mut Session<B>, state: ProbeState) {
        self.update_tail(self.committed.load(Ordering::SeqCst), s.last_snapshot, RunStatus::Completed);
        self.running.store(false, Ordering::SeqCst);
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn update_tail(&self, committed: u64, snapshot: Option<MemorySnapshot>, status: RunStatus) {
        if let Err(e) = lock(&self.store).update_tail(committed, snapshot, status) {
            tracing::warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GIB;
    use crate::MIB;
    use crate::device::{ComputeTier, FormFactor};
    use crate::sim::{SimulatedAccountant, SimulatedBackend, SimulatedDevice};
    use std::sync::mpsc;
    use std::time::Duration;

    fn quick() -> ProbeConfig {
        ProbeConfig { step_delay: Some(Duration::ZERO), policy_seed: Some(1), ..ProbeConfig::default() }
    }

    fn sim_probe(device: SimulatedDevice, config: ProbeConfig) -> (Arc<SimulatedDevice>, Probe<SimulatedBackend, SimulatedAccountant>) {
        let profile = DeviceProfile::new(device.total(), ComputeTier::Standard, FormFactor::Handset);
        let (dev, backend, acct) = device.into_parts();
        (dev, Probe::with_parts(profile, config, backend, acct, ResultStore::in_memory()))
    }

    #[test]
    fn runs_to_completion_and_reports_the_total() {
        let (dev, probe) = sim_probe(SimulatedDevice::with_limit(GIB, 700 * MIB), quick());
        let (tx, rx) = mpsc::channel();
        assert!(probe.start(move |total| tx.send(total).unwrap()));

        let total = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        probe.wait();
        assert_eq!(total, probe.committed_bytes());
        assert_eq!(total, dev.resident());
        assert!(total > 600 * MIB && total <= 700 * MIB);
        assert_eq!(probe.state(), ProbeState::Completed);
        assert!(!probe.is_running());

        let runs = probe.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].committed_bytes, total);
        assert!(runs[0].snapshot.is_some());
    }

    #[test]
    fn second_start_while_running_is_rejected() {
        let config = ProbeConfig { step_delay: Some(Duration::from_millis(50)), ..quick() };
        let (_dev, probe) = sim_probe(SimulatedDevice::new(GIB), config);
        assert!(probe.start(|_| {}));
        assert!(!probe.start(|_| panic!("never called")));
        assert_eq!(probe.runs().len(), 1);
        probe.clear();
        probe.wait();
    }

    #[test]
    fn ceiling_clamps_the_last_chunk() {
        let config = ProbeConfig { commit_ceiling: Some(100 * MIB), ..quick() };
        let (dev, probe) = sim_probe(SimulatedDevice::new(8 * GIB), config);
        assert!(probe.start(|_| {}));
        probe.wait();
        assert_eq!(probe.committed_bytes(), 100 * MIB);
        let sizes: Vec<usize> = dev.grants().iter().map(|g| g.size).collect();
        assert_eq!(sizes, vec![64 * MIB as usize, 36 * MIB as usize]);
    }

    #[test]
    fn backoff_shrinks_by_the_handset_factor() {
        // Room for exactly one first chunk, then everything is refused.
        let (dev, probe) = sim_probe(SimulatedDevice::with_limit(8 * GIB, 64 * MIB), quick());
        assert!(probe.start(|_| {}));
        probe.wait();
        assert_eq!(dev.grants().len(), 1);
        // 1 grant, then 5 denials: 64 MiB, 40 MiB, 25 MiB, 15.6 MiB, 9.8 MiB.
        assert_eq!(dev.attempts(), 6);
        assert_eq!(probe.committed_bytes(), 64 * MIB);
    }

    #[test]
    fn clear_cancels_and_marks_the_run_completed() {
        let config = ProbeConfig { step_delay: Some(Duration::from_millis(5)), ..quick() };
        let (dev, probe) = sim_probe(SimulatedDevice::new(64 * GIB), config);
        assert!(probe.start(|_| panic!("a cleared run does not complete")));
        while probe.committed_bytes() < 256 * MIB {
            thread::sleep(Duration::from_millis(5));
        }
        probe.clear();
        probe.wait();

        assert_eq!(probe.committed_bytes(), 0);
        assert_eq!(dev.resident(), 0);
        assert_eq!(probe.state(), ProbeState::Idle);
        assert_eq!(probe.audit(), (0, 0));
        let runs = probe.runs();
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert!(runs[0].committed_bytes >= 256 * MIB);
    }

    /// Fails every request with an error that is not a refusal.
    struct BrokenBackend {
        attempts: u64,
    }

    impl AllocationBackend for BrokenBackend {
        fn allocate(&mut self, _kind: crate::AllocationKind, _size: usize) -> Result<AllocationRecord> {
            self.attempts += 1;
            Err(crate::ProbeError::DeviceQueryFailed("backend unavailable".to_string()))
        }

        fn release(&mut self, _record: AllocationRecord) {}
    }

    #[test]
    fn other_backend_errors_count_against_the_failure_limit() {
        assert!(!crate::ProbeError::DeviceQueryFailed(String::new()).is_denial());

        let profile = DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Handset);
        let (_dev, _, acct) = SimulatedDevice::new(8 * GIB).into_parts();
        let probe = Probe::with_parts(profile, quick(), BrokenBackend { attempts: 0 }, acct, ResultStore::in_memory());
        assert!(probe.start(|_| {}));
        probe.wait();
        assert_eq!(probe.state(), ProbeState::Completed);
        assert_eq!(probe.attempts(), 5);
        assert_eq!(lock(&probe.shared.session).backend.attempts, 5);
        assert_eq!(probe.committed_bytes(), 0);
    }

    #[test]
    fn dropping_the_probe_releases_everything() {
        let (dev, probe) = sim_probe(SimulatedDevice::with_limit(GIB, 200 * MIB), quick());
        assert!(probe.start(|_| {}));
        probe.wait();
        assert!(dev.resident() > 0);
        drop(probe);
        assert_eq!(dev.resident(), 0);
    }
}
