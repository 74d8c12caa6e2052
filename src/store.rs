//! The run ledger: every run this host has measured, oldest first, in one JSON file.

use crate::accountant::MemorySnapshot;
use crate::device::{ComputeTier, DeviceProfile, FormFactor};
use crate::error::{ProbeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkRun {
    pub id: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub committed_bytes: u64,
    pub os_version_label: String,
    pub device_capacity_bytes: u64,
    pub device_label: String,
    pub form_factor: FormFactor,
    pub compute_tier: ComputeTier,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MemorySnapshot>,
}

impl BenchmarkRun {
    /// A fresh run on `profile`, nothing committed yet.
    pub fn new(id: u64, profile: &DeviceProfile) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            committed_bytes: 0,
            os_version_label: profile.os_version.clone(),
            device_capacity_bytes: profile.capacity_bytes,
            device_label: profile.device_label.clone(),
            form_factor: profile.form_factor,
            compute_tier: profile.compute_tier,
            status: RunStatus::Running,
            snapshot: None,
        }
    }
}

/// Mutations always apply in memory. An `Err` from one of them only means the file on disk is
/// behind; the next successful persist catches it up.
#[derive(Debug)]
pub struct ResultStore {
    path: Option<PathBuf>,
    runs: Vec<BenchmarkRun>,
    dirty: bool,
}

impl ResultStore {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut runs: Vec<BenchmarkRun> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| unavailable(&path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(unavailable(&path, e)),
        };

        // A run still marked Running was cut short by its process dying. Whatever it had persisted
        // by then is its measurement.
        let mut dirty = false;
        if let Some(tail) = runs.last_mut()
            && tail.status == RunStatus::Running
        {
            tracing::info!(id = tail.id, "marking interrupted run completed");
            tail.status = RunStatus::Completed;
            dirty = true;
        }

        let mut store = Self { path: Some(path), runs, dirty };
        if store.dirty
            && let Err(e) = store.persist()
        {
            tracing::warn!("{e}");
        }
        Ok(store)
    }

    /// A ledger that lives and dies with this process.
    pub fn in_memory() -> Self {
        Self { path: None, runs: Vec::new(), dirty: false }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn runs(&self) -> &[BenchmarkRun] {
        &self.runs
    }

    pub fn tail(&self) -> Option<&BenchmarkRun> {
        self.runs.last()
    }

    pub fn next_id(&self) -> u64 {
        self.runs.last().map_or(1, |r| r.id + 1)
    }

    pub fn append(&mut self, run: BenchmarkRun) -> Result<()> {
        self.runs.push(run);
        self.dirty = true;
        self.persist()
    }

    /// Record progress on the tail run. Completed runs are never touched again, so this does
    /// nothing unless the tail is still running.
    pub fn update_tail(&mut self, committed_bytes: u64, snapshot: Option<MemorySnapshot>, status: RunStatus) -> Result<()> {
        let Some(tail) = self.runs.last_mut() else {
            return Ok(());
        };
        if tail.status != RunStatus::Running {
            return Ok(());
        }
        tail.committed_bytes = committed_bytes;
        if snapshot.is_some() {
            tail.snapshot = snapshot;
        }
        tail.status = status;
        self.dirty = true;
        self.persist()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.runs.clear();
        self.dirty = true;
        self.persist()
    }

    /// Write the ledger out if it changed since the last successful write.
    pub fn persist(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        write_atomically(path, &self.runs).map_err(|e| unavailable(path, e))?;
        self.dirty = false;
        Ok(())
    }
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> ProbeError {
    ProbeError::StorageUnavailable { path: path.to_path_buf(), reason: e.to_string() }
}

/// Write to `<path>.tmp`, then rename over `path`, so a reader never sees half a ledger.
fn write_atomically(path: &Path, runs: &[BenchmarkRun]) -> io::Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_vec_pretty(runs).map_err(io::Error::other)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GIB;
    use tempfile::TempDir;

    fn profile() -> DeviceProfile {
        DeviceProfile::new(8 * GIB, ComputeTier::Standard, FormFactor::Handset).with_labels("iPhone14,2", "17.5")
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let store = ResultStore::open(&path).unwrap();
        assert!(store.runs().is_empty());
        assert_eq!(store.next_id(), 1);
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(ResultStore::in_memory().path(), None);
    }

    #[test]
    fn survives_a_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        let mut store = ResultStore::open(&path).unwrap();
        store.append(BenchmarkRun::new(store.next_id(), &profile())).unwrap();
        store.update_tail(3 * GIB, Some(MemorySnapshot { total: 8 * GIB, ..Default::default() }), RunStatus::Completed).unwrap();
        store.append(BenchmarkRun::new(store.next_id(), &profile())).unwrap();
        store.update_tail(GIB, None, RunStatus::Completed).unwrap();

        let reopened = ResultStore::open(&path).unwrap();
        assert_eq!(reopened.runs(), store.runs());
        assert_eq!(reopened.runs().len(), 2);
        assert_eq!(reopened.runs()[0].committed_bytes, 3 * GIB);
        assert_eq!(reopened.runs()[1].id, 2);
        assert!(!dir.path().join("history.json.tmp").exists());
    }

    #[test]
    fn persisted_field_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let mut store = ResultStore::open(&path).unwrap();
        store.append(BenchmarkRun::new(1, &profile())).unwrap();

        let v: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let run = &v[0];
        for key in ["id", "timestamp", "committedBytes", "osVersionLabel", "deviceCapacityBytes", "deviceLabel", "formFactor", "computeTier", "status"] {
            assert!(run.get(key).is_some(), "missing {key}");
        }
        assert!(run["timestamp"].is_i64());
        assert_eq!(run["deviceCapacityBytes"], 8 * GIB);
        assert_eq!(run["status"], "running");
        assert_eq!(run["formFactor"], "handset");
    }

    #[test]
    fn only_a_running_tail_changes() {
        let mut store = ResultStore::in_memory();
        store.append(BenchmarkRun::new(1, &profile())).unwrap();
        store.update_tail(10, None, RunStatus::Running).unwrap();
        store.update_tail(20, None, RunStatus::Completed).unwrap();
        store.update_tail(30, None, RunStatus::Running).unwrap();
        assert_eq!(store.runs()[0].committed_bytes, 20);
        assert_eq!(store.runs()[0].status, RunStatus::Completed);
    }

    #[test]
    fn stale_running_tail_is_completed_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        {
            let mut store = ResultStore::open(&path).unwrap();
            store.append(BenchmarkRun::new(1, &profile())).unwrap();
            store.update_tail(5 * GIB, None, RunStatus::Running).unwrap();
        }
        let store = ResultStore::open(&path).unwrap();
        assert_eq!(store.tail().unwrap().status, RunStatus::Completed);
        assert_eq!(store.tail().unwrap().committed_bytes, 5 * GIB);

        // And the repair itself was written back.
        let raw: Vec<BenchmarkRun> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw[0].status, RunStatus::Completed);
    }

    #[test]
    fn clear_empties_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let mut store = ResultStore::open(&path).unwrap();
        store.append(BenchmarkRun::new(1, &profile())).unwrap();
        store.clear().unwrap();
        assert!(ResultStore::open(&path).unwrap().runs().is_empty());
    }

    #[test]
    fn unwritable_path_keeps_the_ledger_in_memory() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes every rename fail.
        let path = dir.path().join("history.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), b"x").unwrap();

        let mut store = ResultStore { path: Some(path.clone()), runs: Vec::new(), dirty: false };
        let err = store.append(BenchmarkRun::new(1, &profile())).unwrap_err();
        assert!(matches!(err, ProbeError::StorageUnavailable { .. }));
        assert_eq!(store.runs().len(), 1);
        assert!(store.dirty);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(ResultStore::open(&path), Err(ProbeError::StorageUnavailable { .. })));
    }
}
