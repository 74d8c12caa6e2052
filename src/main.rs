use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rambench::accountant::{MemoryAccountant, SystemAccountant};
use rambench::backend::{AllocationBackend, AllocationKind};
use rambench::config::{ENV_HISTORY, ProbeConfig, parse_size};
use rambench::device::{ComputeTier, DeviceProfile, FormFactor};
use rambench::policy::BackendPolicy;
use rambench::probe::Probe;
use rambench::sim::SimulatedDevice;
use rambench::store::ResultStore;
use rambench::{MemorySnapshot, fmt_bytes};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thousands::Separable;

#[derive(Parser)]
#[command(name = "rambench")]
#[command(about = "Measure how much memory this device lets one process commit")]
#[command(version)]
struct Cli {
    /// Run ledger location (default: the per-user data directory)
    #[arg(long, global = true, env = ENV_HISTORY, value_name = "PATH")]
    history: Option<PathBuf>,

    /// Log every step
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Commit memory until the device refuses, and record the result
    Run(RunArgs),
    /// List recorded runs
    History {
        #[arg(long)]
        json: bool,
    },
    /// Delete every recorded run
    ClearHistory,
    /// Print the OS memory counters
    Snapshot {
        #[arg(long)]
        json: bool,
    },
    /// Print the detected device profile
    Profile {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Probe a simulated device with this much RAM instead of this host; nothing is recorded
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    simulate: Option<u64>,

    /// Stop once this much is committed, e.g. 512MiB
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    ceiling: Option<u64>,

    /// Seed for the backend choice, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    #[arg(long)]
    form_factor: Option<FormFactor>,

    #[arg(long)]
    compute_tier: Option<ComputeTier>,

    /// Pause between steps (default: calibrated to the device)
    #[arg(long, value_name = "MS")]
    step_delay_ms: Option<u64>,

    /// No progress output
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Reservations while mostly empty, the heap near the top
    Auto,
    Reservation,
    Heap,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "rambench=debug" } else { "rambench=warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(io::stderr).compact().init();

    let mut config = ProbeConfig::from_env()?;
    if cli.history.is_some() {
        config.history_path = cli.history.clone();
    }

    match cli.command {
        Command::Run(args) => run(config, args),
        Command::History { json } => history(&config, json),
        Command::ClearHistory => {
            let mut store = open_store(&config)?;
            let n = store.runs().len();
            store.clear()?;
            match store.path() {
                Some(path) => println!("removed {n} runs from {}", path.display()),
                None => println!("removed {n} runs"),
            }
            Ok(())
        }
        Command::Snapshot { json } => {
            let snap = SystemAccountant.system_snapshot()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                print_snapshot(&snap);
            }
            Ok(())
        }
        Command::Profile { json } => {
            let profile = DeviceProfile::resolve(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                print_profile(&profile);
            }
            Ok(())
        }
    }
}

fn run(mut config: ProbeConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.ceiling.is_some() {
        config.commit_ceiling = args.ceiling;
    }
    if args.seed.is_some() {
        config.policy_seed = args.seed;
    }
    if args.form_factor.is_some() {
        config.form_factor = args.form_factor;
    }
    if args.compute_tier.is_some() {
        config.compute_tier = args.compute_tier;
    }
    if let Some(ms) = args.step_delay_ms {
        config.step_delay = Some(Duration::from_millis(ms));
    }
    let config = config.validate()?;

    let policy = match args.backend {
        BackendArg::Auto => None,
        BackendArg::Reservation => Some(BackendPolicy::fixed(AllocationKind::Reservation)),
        BackendArg::Heap => Some(BackendPolicy::fixed(AllocationKind::Heap)),
    };

    match args.simulate {
        Some(total) => {
            let profile = DeviceProfile::new(
                total,
                config.compute_tier.unwrap_or(ComputeTier::Standard),
                config.form_factor.unwrap_or(FormFactor::Handset),
            )
            .with_labels("simulated", std::env::consts::OS);
            let (_, backend, accountant) = SimulatedDevice::new(total).into_parts();
            drive(Probe::with_parts(profile, config, backend, accountant, ResultStore::in_memory()), policy, args.quiet)
        }
        None => drive(Probe::new(config), policy, args.quiet),
    }
}

fn drive<B: AllocationBackend + 'static, A: MemoryAccountant + 'static>(
    probe: Probe<B, A>,
    policy: Option<BackendPolicy>,
    quiet: bool,
) -> anyhow::Result<()> {
    if let Some(policy) = policy {
        probe.set_policy(policy);
    }
    print_profile(probe.profile());
    let capacity = probe.profile().capacity_bytes;

    let (tx, rx) = mpsc::channel();
    if !probe.start(move |total| {
        let _ = tx.send(total);
    }) {
        bail!("a run is already in progress");
    }

    let mut progress = RunProgress::new(capacity, quiet);
    let total = loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(total) => break total,
            Err(RecvTimeoutError::Timeout) => progress.update(probe.committed_bytes()),
            // The worker went away without completing, e.g. it panicked.
            Err(RecvTimeoutError::Disconnected) => break probe.committed_bytes(),
        }
    };
    probe.wait();
    progress.finish();

    println!(
        "committed {} ({} bytes), {:.1}% of {} in {} attempts",
        fmt_bytes(total),
        total.separate_with_commas(),
        percent(total, capacity),
        fmt_bytes(capacity),
        probe.attempts()
    );
    if let Some(snap) = probe.last_snapshot() {
        print_snapshot(&snap);
    }
    Ok(())
}

/// Minimum gap between progress lines when stdout is not a terminal.
const PLAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Live progress for a run: a bar on a terminal, an occasional plain line when piped.
enum RunProgress {
    Bar(ProgressBar),
    Lines { capacity: u64, last: Option<Instant> },
    Hidden,
}

impl RunProgress {
    fn new(capacity: u64, quiet: bool) -> Self {
        if quiet {
            Self::Hidden
        } else if io::stdout().is_terminal() {
            let bar = ProgressBar::with_draw_target(Some(capacity), ProgressDrawTarget::stdout());
            bar.set_style(bar_style());
            Self::Bar(bar)
        } else {
            Self::Lines { capacity, last: None }
        }
    }

    fn update(&mut self, committed: u64) {
        match self {
            Self::Bar(bar) => bar.set_position(committed),
            Self::Lines { capacity, last } => {
                let now = Instant::now();
                if last.is_some_and(|t| now.duration_since(t) < PLAIN_INTERVAL) {
                    return;
                }
                *last = Some(now);
                println!("{}", progress_line(committed, *capacity));
            }
            Self::Hidden => {}
        }
    }

    fn finish(self) {
        if let Self::Bar(bar) = self {
            bar.finish_and_clear();
        }
    }
}

const BAR_TEMPLATE: &str = "[{elapsed_precise}] {bar:32.cyan/blue} {binary_bytes:>10} / {binary_total_bytes:>10} ({percent:>3}%)";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn progress_line(committed: u64, capacity: u64) -> String {
    format!("committed {:>12} ({:5.1}%)", fmt_bytes(committed), percent(committed, capacity))
}

fn history(config: &ProbeConfig, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(store.runs())?);
        return Ok(());
    }
    if store.runs().is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    println!("{:>4} {:>19} {:>20} {:>12} {:>10} {:>12} {:>6} {:>9}", "id", "when", "device", "os", "capacity", "committed", "%", "status");
    for run in store.runs() {
        println!(
            "{:>4} {:>19} {:>20} {:>12} {:>10} {:>12} {:>6.1} {:>9}",
            run.id,
            run.timestamp.format("%Y-%m-%d %H:%M:%S"),
            run.device_label,
            run.os_version_label,
            fmt_bytes(run.device_capacity_bytes),
            fmt_bytes(run.committed_bytes),
            percent(run.committed_bytes, run.device_capacity_bytes),
            format!("{:?}", run.status).to_lowercase(),
        );
    }
    Ok(())
}

fn open_store(config: &ProbeConfig) -> anyhow::Result<ResultStore> {
    let path = config.resolved_history_path().context("no data directory for the run history; pass --history")?;
    Ok(ResultStore::open(path)?)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 * 100.0 / whole as f64 }
}

fn print_profile(p: &DeviceProfile) {
    let reported = p.reported_bytes.map_or_else(|| "unknown".to_string(), |b| b.separate_with_commas());
    println!("device:    {} ({})", p.device_label, p.os_version);
    println!("capacity:  {} (reported {reported} bytes)", fmt_bytes(p.capacity_bytes));
    println!("class:     {} {}", p.compute_tier, p.form_factor);
}

fn print_snapshot(s: &MemorySnapshot) {
    let rows = [
        ("total", s.total),
        ("free", s.free),
        ("active", s.active),
        ("inactive", s.inactive),
        ("wired", s.wired),
        ("compressed", s.compressed),
        ("speculative", s.speculative),
        ("purgeable", s.purgeable),
        ("footprint", s.footprint),
        ("available", s.available()),
        ("used", s.used()),
        ("other apps", s.other_apps()),
    ];
    for (name, bytes) in rows {
        println!("{name:>12} {:>12} {:>19}", fmt_bytes(bytes), bytes.separate_with_commas());
    }
}
