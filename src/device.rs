//! One-shot classification of the host: canonical memory capacity, compute tier and form factor.

use crate::config::ProbeConfig;
use crate::error::{ProbeError, Result};
use crate::GIB;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The "round" RAM sizes devices are sold with, in GiB. Raw readings are snapped to the nearest.
pub const CAPACITY_LADDER_GIB: [u64; 13] = [1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTier {
    Standard,
    Modern,
}

impl ComputeTier {
    pub fn multiplier(self) -> f64 {
        match self {
            ComputeTier::Standard => 1.0,
            ComputeTier::Modern => 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    Handset,
    Tablet,
}

impl FormFactor {
    pub fn multiplier(self) -> f64 {
        match self {
            FormFactor::Handset => 1.0,
            FormFactor::Tablet => 1.3,
        }
    }
}

impl fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeTier::Standard => write!(f, "standard"),
            ComputeTier::Modern => write!(f, "modern"),
        }
    }
}

impl fmt::Display for FormFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormFactor::Handset => write!(f, "handset"),
            FormFactor::Tablet => write!(f, "tablet"),
        }
    }
}

impl FromStr for ComputeTier {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(ComputeTier::Standard),
            "modern" => Ok(ComputeTier::Modern),
            other => Err(ProbeError::InvalidConfig {
                key: "compute tier".to_string(),
                reason: format!("expected `standard` or `modern`, got `{other}`"),
            }),
        }
    }
}

impl FromStr for FormFactor {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handset" | "phone" => Ok(FormFactor::Handset),
            "tablet" => Ok(FormFactor::Tablet),
            other => Err(ProbeError::InvalidConfig {
                key: "form factor".to_string(),
                reason: format!("expected `handset` or `tablet`, got `{other}`"),
            }),
        }
    }
}

/// What the probe knows about the device. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Canonical capacity: a rung of `CAPACITY_LADDER_GIB`, in bytes.
    pub capacity_bytes: u64,
    /// What the OS reported before rounding, if it reported anything.
    pub reported_bytes: Option<u64>,
    pub compute_tier: ComputeTier,
    pub form_factor: FormFactor,
    pub device_label: String,
    pub os_version: String,
}

impl DeviceProfile {
    /// A profile for a device reporting `raw_bytes` of RAM. Labels are left generic.
    pub fn new(raw_bytes: u64, compute_tier: ComputeTier, form_factor: FormFactor) -> Self {
        Self {
            capacity_bytes: round_to_tier(raw_bytes),
            reported_bytes: Some(raw_bytes),
            compute_tier,
            form_factor,
            device_label: "unknown".to_string(),
            os_version: "unknown".to_string(),
        }
    }

    pub fn with_labels(mut self, device_label: impl Into<String>, os_version: impl Into<String>) -> Self {
        self.device_label = device_label.into();
        self.os_version = os_version.into();
        self
    }

    /// Query the host. Never fails: an unreadable memory size becomes the smallest rung.
    pub fn resolve(config: &ProbeConfig) -> Self {
        let reported = match sys::total_memory() {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!("{e}; assuming the smallest capacity tier");
                None
            }
        };
        let identifier = sys::model_identifier().unwrap_or_else(|| "unknown".to_string());
        let os_version = sys::os_version().unwrap_or_else(|| "unknown".to_string());

        let (detected_form, detected_tier) = classify_identifier(&identifier);
        let device_label = display_name(&identifier);
        let form_factor = config.form_factor.or(detected_form).unwrap_or(FormFactor::Handset);
        let compute_tier = config.compute_tier.or(detected_tier).unwrap_or_else(tier_from_cpu_count);

        let profile = Self {
            capacity_bytes: round_to_tier(reported.unwrap_or(0)),
            reported_bytes: reported,
            compute_tier,
            form_factor,
            device_label,
            os_version,
        };
        tracing::debug!(?profile, "resolved device profile");
        profile
    }
}

/// Snap a raw byte count to the nearest ladder rung, by absolute distance in GiB. Ties go to the
/// smaller rung.
pub fn round_to_tier(raw_bytes: u64) -> u64 {
    let gib = raw_bytes as f64 / GIB as f64;
    let mut best = CAPACITY_LADDER_GIB[0];
    for rung in CAPACITY_LADDER_GIB {
        if (rung as f64 - gib).abs() < (best as f64 - gib).abs() {
            best = rung;
        }
    }
    best * GIB
}

/// Marketing name for an Apple model identifier such as `iPhone15,2`.
pub fn marketing_name(identifier: &str) -> Option<&'static str> {
    let name = match identifier {
        "iPhone8,1" => "iPhone 6s",
        "iPhone8,2" => "iPhone 6s Plus",
        "iPhone8,4" => "iPhone SE (1st generation)",
        "iPhone9,1" | "iPhone9,3" => "iPhone 7",
        "iPhone9,2" | "iPhone9,4" => "iPhone 7 Plus",
        "iPhone10,1" | "iPhone10,4" => "iPhone 8",
        "iPhone10,2" | "iPhone10,5" => "iPhone 8 Plus",
        "iPhone10,3" | "iPhone10,6" => "iPhone X",
        "iPhone11,2" => "iPhone XS",
        "iPhone11,4" | "iPhone11,6" => "iPhone XS Max",
        "iPhone11,8" => "iPhone XR",
        "iPhone12,1" => "iPhone 11",
        "iPhone12,3" => "iPhone 11 Pro",
        "iPhone12,5" => "iPhone 11 Pro Max",
        "iPhone12,8" => "iPhone SE (2nd generation)",
        "iPhone13,1" => "iPhone 12 mini",
        "iPhone13,2" => "iPhone 12",
        "iPhone13,3" => "iPhone 12 Pro",
        "iPhone13,4" => "iPhone 12 Pro Max",
        "iPhone14,2" => "iPhone 13 Pro",
        "iPhone14,3" => "iPhone 13 Pro Max",
        "iPhone14,4" => "iPhone 13 mini",
        "iPhone14,5" => "iPhone 13",
        "iPhone14,6" => "iPhone SE (3rd generation)",
        "iPhone14,7" => "iPhone 14",
        "iPhone14,8" => "iPhone 14 Plus",
        "iPhone15,2" => "iPhone 14 Pro",
        "iPhone15,3" => "iPhone 14 Pro Max",
        "iPhone15,4" => "iPhone 15",
        "iPhone15,5" => "iPhone 15 Plus",
        "iPhone16,1" => "iPhone 15 Pro",
        "iPhone16,2" => "iPhone 15 Pro Max",
        "iPhone17,1" => "iPhone 16 Pro",
        "iPhone17,2" => "iPhone 16 Pro Max",
        "iPhone17,3" => "iPhone 16",
        "iPhone17,4" => "iPhone 16 Plus",
        "iPhone17,5" => "iPhone 16e",

        "iPad2,1" | "iPad2,2" | "iPad2,3" | "iPad2,4" => "iPad 2",
        "iPad3,1" | "iPad3,2" | "iPad3,3" => "iPad (3rd generation)",
        "iPad3,4" | "iPad3,5" | "iPad3,6" => "iPad (4th generation)",
        "iPad6,11" | "iPad6,12" => "iPad (5th generation)",
        "iPad7,5" | "iPad7,6" => "iPad (6th generation)",
        "iPad7,11" | "iPad7,12" => "iPad (7th generation)",
        "iPad11,6" | "iPad11,7" => "iPad (8th generation)",
        "iPad12,1" | "iPad12,2" => "iPad (9th generation)",
        "iPad13,18" | "iPad13,19" => "iPad (10th generation)",
        "iPad15,7" | "iPad15,8" => "iPad (11th generation)",

        "iPad4,1" | "iPad4,2" | "iPad4,3" => "iPad Air",
        "iPad5,3" | "iPad5,4" => "iPad Air 2",
        "iPad11,3" | "iPad11,4" => "iPad Air (3rd generation)",
        "iPad13,1" | "iPad13,2" => "iPad Air (4th generation)",
        "iPad13,16" | "iPad13,17" => "iPad Air (5th generation)",
        "iPad14,8" | "iPad14,9" => "iPad Air 11-inch (M2)",
        "iPad14,10" | "iPad14,11" => "iPad Air 13-inch (M2)",
        "iPad15,3" | "iPad15,4" => "iPad Air 11-inch (M3)",
        "iPad15,5" | "iPad15,6" => "iPad Air 13-inch (M3)",

        "iPad6,3" | "iPad6,4" => "iPad Pro 9.7-inch",
        "iPad6,7" | "iPad6,8" => "iPad Pro 12.9-inch (1st generation)",
        "iPad7,1" | "iPad7,2" => "iPad Pro 12.9-inch (2nd generation)",
        "iPad7,3" | "iPad7,4" => "iPad Pro 10.5-inch",
        "iPad8,1" | "iPad8,2" | "iPad8,3" | "iPad8,4" => "iPad Pro 11-inch (1st generation)",
        "iPad8,5" | "iPad8,6" | "iPad8,7" | "iPad8,8" => "iPad Pro 12.9-inch (3rd generation)",
        "iPad8,9" | "iPad8,10" => "iPad Pro 11-inch (2nd generation)",
        "iPad8,11" | "iPad8,12" => "iPad Pro 12.9-inch (4th generation)",
        "iPad13,4" | "iPad13,5" | "iPad13,6" | "iPad13,7" => "iPad Pro 11-inch (M1)",
        "iPad13,8" | "iPad13,9" | "iPad13,10" | "iPad13,11" => "iPad Pro 12.9-inch (M1)",
        "iPad14,3" | "iPad14,4" => "iPad Pro 11-inch (M2)",
        "iPad14,5" | "iPad14,6" => "iPad Pro 12.9-inch (M2)",
        "iPad16,3" | "iPad16,4" => "iPad Pro 11-inch (M4)",
        "iPad16,5" | "iPad16,6" => "iPad Pro 13-inch (M4)",

        "iPad2,5" | "iPad2,6" | "iPad2,7" => "iPad mini",
        "iPad4,4" | "iPad4,5" | "iPad4,6" => "iPad mini 2",
        "iPad4,7" | "iPad4,8" | "iPad4,9" => "iPad mini 3",
        "iPad5,1" | "iPad5,2" => "iPad mini 4",
        "iPad11,1" | "iPad11,2" => "iPad mini (5th generation)",
        "iPad14,1" | "iPad14,2" => "iPad mini (6th generation)",
        _ => return None,
    };
    Some(name)
}

/// The label runs are recorded under: the marketing name when the identifier is known, the
/// identifier itself otherwise.
pub fn display_name(identifier: &str) -> String {
    marketing_name(identifier).unwrap_or(identifier).to_string()
}

/// Chip families and phone lines that count as the modern compute tier.
const MODERN_MARKERS: [&str; 9] = ["M1", "M2", "M3", "M4", "iPhone 12", "iPhone 13", "iPhone 14", "iPhone 15", "iPhone 16"];

/// Form factor and compute tier of an Apple model identifier such as `iPhone15,2` or `iPad13,4`.
/// The tier follows the marketing name, so an iPad Air (4th generation) is standard even though
/// it shares its identifier generation with the M1 iPad Pro. Non-Apple identifiers classify as
/// unknown.
pub fn classify_identifier(identifier: &str) -> (Option<FormFactor>, Option<ComputeTier>) {
    let form = if identifier.starts_with("iPad") {
        FormFactor::Tablet
    } else if identifier.starts_with("iPhone") {
        FormFactor::Handset
    } else {
        return (None, None);
    };

    let name = display_name(identifier);
    let tier = if MODERN_MARKERS.iter().any(|m| name.contains(m)) { ComputeTier::Modern } else { ComputeTier::Standard };
    (Some(form), Some(tier))
}

fn tier_from_cpu_count() -> ComputeTier {
    match std::thread::available_parallelism() {
        Ok(n) if n.get() >= 8 => ComputeTier::Modern,
        _ => ComputeTier::Standard,
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use crate::error::{ProbeError, Result};
    use std::fs;

    pub fn total_memory() -> Result<u64> {
        let info = rustix::system::sysinfo();
        let total = info.totalram as u64 * (info.mem_unit as u64).max(1);
        if total == 0 {
            return Err(ProbeError::DeviceQueryFailed("sysinfo reported no RAM".to_string()));
        }
        Ok(total)
    }

    pub fn model_identifier() -> Option<String> {
        for path in ["/sys/devices/virtual/dmi/id/product_name", "/proc/device-tree/model"] {
            if let Ok(s) = fs::read_to_string(path) {
                let s = s.trim_matches(|c: char| c.is_whitespace() || c == '\0');
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
        Some(rustix::system::uname().machine().to_string_lossy().into_owned())
    }

    pub fn os_version() -> Option<String> {
        let u = rustix::system::uname();
        Some(format!("{} {}", u.sysname().to_string_lossy(), u.release().to_string_lossy()))
    }
}

#[cfg(target_vendor = "apple")]
mod sys {
    use crate::error::{ProbeError, Result};
    use std::ffi::{CStr, c_void};
    use std::mem::size_of;
    use std::ptr;

    fn sysctl_u64(name: &CStr) -> Option<u64> {
        let mut value: u64 = 0;
        let mut len = size_of::<u64>();
        let r = unsafe { libc::sysctlbyname(name.as_ptr(), &mut value as *mut u64 as *mut c_void, &mut len, ptr::null_mut(), 0) };
        (r == 0).then_some(value)
    }

    fn sysctl_string(name: &CStr) -> Option<String> {
        let mut len: usize = 0;
        let r = unsafe { libc::sysctlbyname(name.as_ptr(), ptr::null_mut(), &mut len, ptr::null_mut(), 0) };
        if r != 0 || len == 0 {
            return None;
        }
        let mut buf = vec![0u8; len];
        let r = unsafe { libc::sysctlbyname(name.as_ptr(), buf.as_mut_ptr() as *mut c_void, &mut len, ptr::null_mut(), 0) };
        if r != 0 {
            return None;
        }
        let s = String::from_utf8_lossy(&buf[..len]).trim_end_matches('\0').trim().to_string();
        (!s.is_empty()).then_some(s)
    }

    pub fn total_memory() -> Result<u64> {
        sysctl_u64(c"hw.memsize").ok_or_else(|| ProbeError::DeviceQueryFailed("sysctl hw.memsize failed".to_string()))
    }

    pub fn model_identifier() -> Option<String> {
        // hw.machine is the model identifier on iOS and the architecture on macOS.
        sysctl_string(c"hw.machine")
            .filter(|m| m.starts_with("iP"))
            .or_else(|| sysctl_string(c"hw.model"))
    }

    pub fn os_version() -> Option<String> {
        sysctl_string(c"kern.osproductversion")
    }
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
mod sys {
    use crate::error::{ProbeError, Result};

    pub fn total_memory() -> Result<u64> {
        Err(ProbeError::DeviceQueryFailed("no memory size query on this platform".to_string()))
    }

    pub fn model_identifier() -> Option<String> {
        Some(std::env::consts::ARCH.to_string())
    }

    pub fn os_version() -> Option<String> {
        Some(std::env::consts::OS.to_string())
    }
}
