//! Per-execution records under `<workspace>/<runtime-id>/runs/<run-id>/`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Hit,
    Miss,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub runtime_id: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_record(run_dir: &Path, record: &RunRecord) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, record)
        .with_context(|| format!("Failed to write run record '{}'", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("Failed to serialize run record")?;
    fs::write(&tmp, payload).with_context(|| format!("Failed to write temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_run_records(runs_dir: &Path) -> Result<Vec<RunRecord>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("Failed to read runs directory '{}'", runs_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("Failed to iterate runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read run record '{}'", path.display()))?;
        let parsed: RunRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse run record '{}'", path.display()))?;
        runs.push(parsed);
    }
    Ok(runs)
}

pub fn latest_successful_run_id(runs_dir: &Path) -> Result<Option<String>> {
    let mut runs = load_run_records(runs_dir)?;
    runs.retain(RunRecord::is_success);
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs.first().map(|r| r.run_id.clone()))
}

/// Keep the newest `keep` runs and delete the rest. Returns how many were removed.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<usize> {
    let mut runs = load_run_records(runs_dir)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    let mut removed = 0;
    for run in runs.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

fn run_sort_key(run: &RunRecord) -> (String, String) {
    let at = run
        .finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone());
    (at, run.run_id.clone())
}

/// Create a fresh, uniquely named run directory.
pub fn allocate_run_dir(runs_dir: &Path) -> Result<(String, PathBuf)> {
    for _ in 0..32 {
        let run_id = generate_run_id()?;
        let run_root = runs_dir.join(&run_id);
        if run_root.exists() {
            continue;
        }
        fs::create_dir_all(&run_root)
            .with_context(|| format!("Failed to create run directory '{}'", run_root.display()))?;
        return Ok((run_id, run_root));
    }
    bail!(
        "failed allocating unique run directory under '{}'",
        runs_dir.display()
    )
}

/// Sortable run identifier built from the clock, pid and a process counter.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let mut suffix = base62_encode_u128(entropy);
    suffix = suffix.trim_start_matches('0').to_string();
    if suffix.is_empty() {
        suffix.push('0');
    }
    if suffix.len() > 22 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(suffix)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(run_id: &str, status: &str, finished: Option<&str>) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            runtime_id: "client-1.20.4-client".to_string(),
            status: status.to_string(),
            created_at_utc: "20260101T000000Z".to_string(),
            finished_at_utc: finished.map(str::to_string),
            steps: vec![StepRecord {
                name: "extractClient".to_string(),
                outcome: StepOutcome::Miss,
                fingerprint: Some("ab".repeat(32)),
                output: None,
                error: None,
            }],
        }
    }

    #[test]
    fn latest_success_ignores_failed_runs() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path();
        write_run_record(&runs.join("a"), &record("a", STATUS_SUCCESS, Some("20260101T000100Z")))
            .unwrap();
        write_run_record(&runs.join("b"), &record("b", STATUS_SUCCESS, Some("20260101T000200Z")))
            .unwrap();
        write_run_record(&runs.join("c"), &record("c", STATUS_FAILED, Some("20260101T000300Z")))
            .unwrap();

        assert_eq!(latest_successful_run_id(runs).unwrap().as_deref(), Some("b"));
        let loaded = load_run_records(runs).unwrap();
        assert_eq!(loaded.len(), 3);
        let b = loaded.iter().find(|r| r.run_id == "b").unwrap();
        assert_eq!(b.step("extractClient").unwrap().outcome, StepOutcome::Miss);
    }

    #[test]
    fn prune_keeps_newest() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path();
        for (id, at) in [("a", "20260101T000100Z"), ("b", "20260101T000200Z"), ("c", "20260101T000300Z")] {
            write_run_record(&runs.join(id), &record(id, STATUS_SUCCESS, Some(at))).unwrap();
        }
        assert_eq!(prune_old_runs(runs, 1).unwrap(), 2);
        assert!(runs.join("c").is_dir());
        assert!(!runs.join("a").exists());
        assert!(!runs.join("b").exists());
    }

    #[test]
    fn missing_runs_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(latest_successful_run_id(&tmp.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn run_ids_are_unique() {
        let tmp = TempDir::new().unwrap();
        let (a, dir_a) = allocate_run_dir(tmp.path()).unwrap();
        let (b, _) = allocate_run_dir(tmp.path()).unwrap();
        assert_ne!(a, b);
        assert!(dir_a.is_dir());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn compact_timestamp_shape() {
        let ts = now_utc_compact();
        assert_eq!(ts.len(), 16);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[8..9], "T");
    }
}
