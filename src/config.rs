//! Tunables for a probe run.
//!
//! Defaults come from `ProbeConfig::default()`. `ProbeConfig::from_env()` layers `RAMBENCH_*`
//! environment variables on top, and the CLI layers its flags on top of that.

use crate::device::{ComputeTier, DeviceProfile, FormFactor};
use crate::error::{ProbeError, Result};
use crate::KIB;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_STEP_DELAY_MS: &str = "RAMBENCH_STEP_DELAY_MS";
pub const ENV_MAX_FAILURES: &str = "RAMBENCH_MAX_FAILURES";
pub const ENV_SAMPLE_CAP: &str = "RAMBENCH_SAMPLE_CAP";
pub const ENV_CEILING: &str = "RAMBENCH_CEILING";
pub const ENV_SEED: &str = "RAMBENCH_SEED";
pub const ENV_FORM_FACTOR: &str = "RAMBENCH_FORM_FACTOR";
pub const ENV_COMPUTE_TIER: &str = "RAMBENCH_COMPUTE_TIER";
pub const ENV_HISTORY: &str = "RAMBENCH_HISTORY";

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_SAMPLE_CAP: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Pause between steps. `None` means calibrate from the device capacity.
    pub step_delay: Option<Duration>,
    /// Consecutive denials after which a run completes.
    pub max_consecutive_failures: u32,
    /// Most sentinel samples the verifier takes from one reservation.
    pub sample_cap: usize,
    /// Stop once this many bytes are committed.
    pub commit_ceiling: Option<u64>,
    /// Seed for the backend choice in the mixed band. `None` seeds from the OS.
    pub policy_seed: Option<u64>,
    pub form_factor: Option<FormFactor>,
    pub compute_tier: Option<ComputeTier>,
    /// Where the run ledger lives. `None` means the default location.
    pub history_path: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            step_delay: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            sample_cap: DEFAULT_SAMPLE_CAP,
            commit_ceiling: None,
            policy_seed: None,
            form_factor: None,
            compute_tier: None,
            history_path: None,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>(ENV_STEP_DELAY_MS)? {
            config.step_delay = Some(Duration::from_millis(ms));
        }
        if let Some(n) = env_parse::<u32>(ENV_MAX_FAILURES)? {
            config.max_consecutive_failures = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_SAMPLE_CAP)? {
            config.sample_cap = n;
        }
        if let Some(s) = env_string(ENV_CEILING) {
            config.commit_ceiling = Some(parse_size(&s).map_err(|reason| invalid(ENV_CEILING, reason))?);
        }
        config.policy_seed = env_parse::<u64>(ENV_SEED)?;
        config.form_factor = env_parse::<FormFactor>(ENV_FORM_FACTOR)?;
        config.compute_tier = env_parse::<ComputeTier>(ENV_COMPUTE_TIER)?;
        config.history_path = env_string(ENV_HISTORY).map(PathBuf::from);

        config.validate()
    }

    pub fn validate(self) -> Result<Self> {
        if self.max_consecutive_failures == 0 {
            return Err(invalid("max consecutive failures", "must be at least 1".to_string()));
        }
        if self.sample_cap == 0 {
            return Err(invalid("sample cap", "must be at least 1".to_string()));
        }
        Ok(self)
    }

    /// The configured step delay, or the capacity-calibrated one. Smaller devices get the longer
    /// pause since their chunks are smaller.
    pub fn step_delay_for(&self, profile: &DeviceProfile) -> Duration {
        self.step_delay.unwrap_or_else(|| {
            if profile.capacity_bytes > 8 * crate::GIB {
                Duration::from_millis(20)
            } else {
                Duration::from_millis(40)
            }
        })
    }

    /// The configured ledger path, or `<data dir>/rambench/history.json`.
    pub fn resolved_history_path(&self) -> Option<PathBuf> {
        self.history_path
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("rambench").join("history.json")))
    }
}

/// How the probe shrinks a denied request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub reduction: f64,
    pub floor: usize,
}

impl Backoff {
    pub fn for_form_factor(form: FormFactor) -> Self {
        match form {
            FormFactor::Handset => Self { reduction: 1.6, floor: 64 * KIB as usize },
            FormFactor::Tablet => Self { reduction: 2.0, floor: 256 * KIB as usize },
        }
    }

    /// The next candidate after a denial of `size`, or `None` once it would fall below the floor.
    pub fn shrink(&self, size: usize) -> Option<usize> {
        let next = (size as f64 / self.reduction) as usize;
        (next >= self.floor).then_some(next)
    }
}

/// Parse a byte count such as `512MiB`, `8GiB`, `8G`, `4096` or `1.5 GiB`.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().map_err(|_| format!("`{s}` is not a size"))?;
    let mult: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => crate::MIB,
        "g" | "gb" | "gib" => crate::GIB,
        "t" | "tb" | "tib" => crate::GIB * 1024,
        other => return Err(format!("unknown unit `{other}` in `{s}`")),
    };
    Ok((value * mult as f64) as u64)
}

fn invalid(key: &str, reason: String) -> ProbeError {
    ProbeError::InvalidConfig { key: key.to_string(), reason }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(s) => s.trim().parse::<T>().map(Some).map_err(|e| invalid(key, e.to_string())),
    }
}
