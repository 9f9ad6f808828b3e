//! Content-addressed cache for runtime step outputs.
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/sha256/<ab>/<sha256>        published outputs, addressed by content
//! index/<kind>/<fingerprint>.json   fingerprint -> blob mapping
//! locks/<kind>/<fingerprint>.lock   cross-process producer locks
//! tmp/                              scratch space for in-flight producers
//! ```
//!
//! A producer writes into `tmp/`; only after it succeeds is the output hashed,
//! renamed into `blobs/` and the index entry written (also via rename). A
//! crash at any point leaves at most an orphaned temp file, never an index
//! entry pointing at partial bytes.

mod archive;
pub mod fingerprint;
pub(crate) mod io;

pub use fingerprint::{Fingerprint, FingerprintBuilder};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::RuntimeError;
use archive::{create_tar_zst, materialize_tar_zst_dir};
use io::{atomic_rename, copy_into_place, is_hex_64, now_unix, sha256_file, tmp_name};

/// Directory name used under the platform cache dir when no root is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = "mc-runtime";

/// Environment override for the cache root.
pub const CACHE_DIR_ENV: &str = "MC_RUNTIME_CACHE";

/// Encoding of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// A single file blob.
    File,
    /// A directory packed as tar + zstd.
    TarZst,
}

/// Index entry mapping a fingerprint to a content-addressed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub kind: String,
    pub fingerprint: String,
    pub blob_sha256: String,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// An index entry together with its blob location.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub entry: CacheEntry,
    pub blob_path: PathBuf,
}

/// Whether a lookup reused an earlier result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// Result of [`ContentAddressedCache::cached`].
#[derive(Debug, Clone)]
pub struct CacheResult {
    /// Read-only location of the published output.
    pub path: PathBuf,
    pub blob_sha256: String,
    pub outcome: CacheOutcome,
}

/// Basic cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub index_entries: u64,
    pub referenced_blobs: u64,
    pub referenced_bytes: u64,
}

/// Fingerprint-keyed output cache, safe to share across threads and processes.
#[derive(Debug, Clone)]
pub struct ContentAddressedCache {
    root: PathBuf,
    key_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ContentAddressedCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        cache.ensure_layout()?;
        Ok(cache)
    }

    /// Open the cache at `$MC_RUNTIME_CACHE`, falling back to the platform cache dir.
    pub fn open_default() -> Result<Self> {
        Self::open(&default_cache_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.blobs_dir().join("sha256"),
            self.index_dir(),
            self.tmp_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create cache dir {}", dir.display()))?;
        }
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn kind_dir(&self, kind: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        Ok(self.index_dir().join(kind))
    }

    fn index_path(&self, kind: &str, fingerprint: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(fingerprint)?;
        Ok(self
            .index_dir()
            .join(kind)
            .join(format!("{}.json", fingerprint)))
    }

    fn lock_path(&self, kind: &str, fingerprint: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        validate_key(fingerprint)?;
        Ok(self
            .locks_dir()
            .join(kind)
            .join(format!("{}.lock", fingerprint)))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        validate_sha256(sha256)?;
        let prefix = &sha256[0..2];
        Ok(self.blobs_dir().join("sha256").join(prefix).join(sha256))
    }

    /// Get an entry from the index if present. The blob is not verified.
    pub fn get(&self, kind: &str, fingerprint: &Fingerprint) -> Result<Option<CachedArtifact>> {
        let index_path = self.index_path(kind, fingerprint.as_str())?;
        if !index_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&index_path)
            .with_context(|| format!("Failed to read index {}", index_path.display()))?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse index {}", index_path.display()))?;

        let blob_path = self.blob_path(&entry.blob_sha256)?;
        Ok(Some(CachedArtifact { entry, blob_path }))
    }

    /// Index lookup that also checks the blob is present and uncorrupted.
    fn lookup_valid(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        format: ArtifactFormat,
    ) -> Result<Option<CachedArtifact>> {
        let stored = match self.get(kind, fingerprint) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(kind, fingerprint = fingerprint.short(), "unreadable index entry: {err:#}");
                return Ok(None);
            }
        };

        if stored.entry.format != format || !stored.blob_path.is_file() {
            return Ok(None);
        }

        let (actual_sha, _sz) = sha256_file(&stored.blob_path)?;
        if actual_sha != stored.entry.blob_sha256 {
            warn!(
                kind,
                fingerprint = fingerprint.short(),
                expected = %stored.entry.blob_sha256,
                actual = %actual_sha,
                "cached blob is corrupt; rebuilding"
            );
            return Ok(None);
        }

        Ok(Some(stored))
    }

    /// Return the output for `fingerprint`, running `producer` only on a miss.
    ///
    /// The producer receives a scratch path to write its single output file
    /// to. Concurrent callers with the same fingerprint block until the first
    /// one finishes and then reuse its output; different fingerprints proceed
    /// in parallel. A failing producer publishes nothing.
    pub fn cached<F>(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        meta: BTreeMap<String, serde_json::Value>,
        producer: F,
    ) -> Result<CacheResult>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if let Some(hit) = self.lookup_valid(kind, fingerprint, ArtifactFormat::File)? {
            debug!(kind, fingerprint = fingerprint.short(), "cache hit");
            return Ok(hit_result(hit));
        }

        self.with_key_lock(kind, fingerprint, || {
            let _lock = self.acquire_lock(kind, fingerprint.as_str())?;

            // Someone else may have produced it while we waited.
            if let Some(hit) = self.lookup_valid(kind, fingerprint, ArtifactFormat::File)? {
                debug!(kind, fingerprint = fingerprint.short(), "cache hit after wait");
                return Ok(hit_result(hit));
            }

            info!(kind, fingerprint = fingerprint.short(), "cache miss; producing");
            let tmp = self
                .tmp_dir()
                .join(tmp_name(&format!("produce-{}", fingerprint.short())));
            if let Err(err) = producer(&tmp) {
                remove_tmp(&tmp);
                return Err(err);
            }
            if !tmp.is_file() {
                remove_tmp(&tmp);
                return Err(RuntimeError::missing(format!(
                    "producer for {}:{} finished without writing an output file",
                    kind,
                    fingerprint.short()
                ))
                .into());
            }

            let (sha256, size_bytes) = sha256_file(&tmp)?;
            let blob_path = self.publish_blob(&tmp, &sha256)?;
            self.write_index(
                kind,
                fingerprint.as_str(),
                &CacheEntry {
                    kind: kind.to_string(),
                    fingerprint: fingerprint.as_str().to_string(),
                    blob_sha256: sha256.clone(),
                    format: ArtifactFormat::File,
                    size_bytes,
                    stored_at_unix: now_unix(),
                    meta,
                },
            )?;

            Ok(CacheResult {
                path: blob_path,
                blob_sha256: sha256,
                outcome: CacheOutcome::Miss,
            })
        })
    }

    /// Directory flavour of [`cached`](Self::cached): the producer fills a
    /// scratch directory, which is stored as `tar.zst` and unpacked to `dest`.
    pub fn cached_dir<F>(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        meta: BTreeMap<String, serde_json::Value>,
        dest: &Path,
        producer: F,
    ) -> Result<CacheResult>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        self.with_key_lock(kind, fingerprint, || {
            if let Some(hit) = self.lookup_valid(kind, fingerprint, ArtifactFormat::TarZst)? {
                debug!(kind, fingerprint = fingerprint.short(), "cache hit (dir)");
                materialize_tar_zst_dir(&hit.blob_path, dest)?;
                return Ok(CacheResult {
                    path: dest.to_path_buf(),
                    blob_sha256: hit.entry.blob_sha256,
                    outcome: CacheOutcome::Hit,
                });
            }

            let _lock = self.acquire_lock(kind, fingerprint.as_str())?;
            if let Some(hit) = self.lookup_valid(kind, fingerprint, ArtifactFormat::TarZst)? {
                materialize_tar_zst_dir(&hit.blob_path, dest)?;
                return Ok(CacheResult {
                    path: dest.to_path_buf(),
                    blob_sha256: hit.entry.blob_sha256,
                    outcome: CacheOutcome::Hit,
                });
            }

            info!(kind, fingerprint = fingerprint.short(), "cache miss; producing directory");
            let scratch = self
                .tmp_dir()
                .join(tmp_name(&format!("produce-dir-{}", fingerprint.short())));
            fs::create_dir_all(&scratch)?;
            if let Err(err) = producer(&scratch) {
                let _ = fs::remove_dir_all(&scratch);
                return Err(err);
            }

            let tmp_tar = self.tmp_dir().join(tmp_name("artifact.tar.zst"));
            let packed = create_tar_zst(&scratch, &tmp_tar);
            let _ = fs::remove_dir_all(&scratch);
            if let Err(err) = packed {
                remove_tmp(&tmp_tar);
                return Err(err);
            }

            let (sha256, size_bytes) = sha256_file(&tmp_tar)?;
            let blob_path = self.publish_blob(&tmp_tar, &sha256)?;
            self.write_index(
                kind,
                fingerprint.as_str(),
                &CacheEntry {
                    kind: kind.to_string(),
                    fingerprint: fingerprint.as_str().to_string(),
                    blob_sha256: sha256.clone(),
                    format: ArtifactFormat::TarZst,
                    size_bytes,
                    stored_at_unix: now_unix(),
                    meta,
                },
            )?;

            materialize_tar_zst_dir(&blob_path, dest)?;
            Ok(CacheResult {
                path: dest.to_path_buf(),
                blob_sha256: sha256,
                outcome: CacheOutcome::Miss,
            })
        })
    }

    /// Store an existing file under `fingerprint`.
    pub fn put_file(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        src_file: &Path,
        mut meta: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        if !src_file.is_file() {
            return Err(RuntimeError::missing(format!(
                "source file not found: {}",
                src_file.display()
            ))
            .into());
        }

        meta.insert(
            "source_path".to_string(),
            serde_json::Value::String(src_file.display().to_string()),
        );
        let stored = self.cached(kind, fingerprint, meta, |tmp| {
            fs::copy(src_file, tmp).with_context(|| {
                format!("Failed to copy {} to {}", src_file.display(), tmp.display())
            })?;
            Ok(())
        })?;
        Ok(stored.blob_sha256)
    }

    /// Materialize a stored artifact at `dest` (a file or a directory,
    /// depending on its format).
    pub fn materialize_to(&self, kind: &str, fingerprint: &Fingerprint, dest: &Path) -> Result<()> {
        let stored = self.get(kind, fingerprint)?.ok_or_else(|| {
            RuntimeError::missing(format!("no cached artifact for {kind}:{fingerprint}"))
        })?;

        if !stored.blob_path.exists() {
            bail!(RuntimeError::missing(format!(
                "blob missing for index entry {}:{} (expected {})",
                kind,
                fingerprint,
                stored.blob_path.display()
            )));
        }

        // Verify blob hash on read (corruption detection).
        let (actual_sha, _sz) = sha256_file(&stored.blob_path)?;
        if actual_sha != stored.entry.blob_sha256 {
            bail!(RuntimeError::format(format!(
                "blob hash mismatch for {}:{}\n  expected: {}\n  actual:   {}",
                kind, fingerprint, stored.entry.blob_sha256, actual_sha
            )));
        }

        match stored.entry.format {
            ArtifactFormat::File => copy_into_place(&stored.blob_path, dest),
            ArtifactFormat::TarZst => materialize_tar_zst_dir(&stored.blob_path, dest),
        }
    }

    /// List index entries for a kind, newest first.
    pub fn list_kind(&self, kind: &str) -> Result<Vec<CacheEntry>> {
        let dir = self.kind_dir(kind)?;
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut out = vec![];
        for ent in
            fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let ent = ent?;
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let entry: CacheEntry = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse index {}", path.display()))?;
            out.push(entry);
        }

        out.sort_by(|a, b| {
            b.stored_at_unix
                .cmp(&a.stored_at_unix)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(out)
    }

    /// Remove blobs not referenced by any index entry, plus stale scratch files.
    pub fn gc(&self) -> Result<usize> {
        let referenced = self.collect_referenced_blobs()?;

        let blobs_root = self.blobs_dir().join("sha256");
        let mut removed = 0usize;
        for ent in WalkDir::new(&blobs_root).into_iter().filter_map(Result::ok) {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).with_context(|| {
                format!(
                    "Failed to remove unreferenced blob {}",
                    ent.path().display()
                )
            })?;
            removed += 1;
        }

        removed += self.sweep_tmp()?;
        Ok(removed)
    }

    /// Prune index entries, keeping only the newest `keep_last` per kind.
    pub fn prune_keep_last(&self, keep_last: usize) -> Result<usize> {
        if keep_last == 0 {
            bail!(RuntimeError::configuration("keep_last must be >= 1"));
        }

        let mut removed = 0usize;
        for kind in self.list_kinds()? {
            let entries = self.list_kind(&kind)?;
            for e in entries.iter().skip(keep_last) {
                let path = self.index_path(&kind, &e.fingerprint)?;
                if path.exists() {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let referenced = self.collect_referenced_blobs()?;
        let mut referenced_bytes = 0u64;
        let mut referenced_blobs = 0u64;
        for sha in &referenced {
            let p = self.blob_path(sha)?;
            if let Ok(md) = fs::metadata(&p) {
                referenced_blobs += 1;
                referenced_bytes += md.len();
            }
        }

        let index_entries = WalkDir::new(self.index_dir())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|ent| {
                ent.file_type().is_file()
                    && ent.path().extension().and_then(|s| s.to_str()) == Some("json")
            })
            .count() as u64;

        Ok(CacheStatus {
            root: self.root.clone(),
            index_entries,
            referenced_blobs,
            referenced_bytes,
        })
    }

    fn publish_blob(&self, tmp: &Path, sha256: &str) -> Result<PathBuf> {
        let blob_path = self.blob_path(sha256)?;
        let intact = blob_path.is_file()
            && sha256_file(&blob_path).map(|(actual, _)| actual == sha256).unwrap_or(false);
        if intact {
            // Identical bytes already published by another fingerprint.
            remove_tmp(tmp);
        } else {
            atomic_rename(tmp, &blob_path)?;
        }
        Ok(blob_path)
    }

    fn write_index(&self, kind: &str, fingerprint: &str, entry: &CacheEntry) -> Result<()> {
        let dir = self.kind_dir(kind)?;
        fs::create_dir_all(&dir)?;
        let path = self.index_path(kind, fingerprint)?;

        let bytes = serde_json::to_vec_pretty(entry)?;
        let tmp = self.tmp_dir().join(tmp_name("index.json"));
        fs::write(&tmp, bytes)?;
        atomic_rename(&tmp, &path)?;
        Ok(())
    }

    fn collect_referenced_blobs(&self) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for ent in WalkDir::new(self.index_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if !ent.file_type().is_file()
                || ent.path().extension().and_then(|s| s.to_str()) != Some("json")
            {
                continue;
            }
            let Ok(bytes) = fs::read(ent.path()) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                continue;
            };
            if is_hex_64(&entry.blob_sha256) {
                out.insert(entry.blob_sha256);
            }
        }
        Ok(out)
    }

    fn list_kinds(&self) -> Result<Vec<String>> {
        let idx = self.index_dir();
        if !idx.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for ent in fs::read_dir(&idx)? {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                if let Some(s) = ent.file_name().to_str() {
                    out.push(s.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Scratch files older than a day belong to producers that died mid-write.
    fn sweep_tmp(&self) -> Result<usize> {
        const STALE_AFTER_SECS: u64 = 24 * 60 * 60;
        let now = now_unix();
        let mut removed = 0usize;
        for ent in fs::read_dir(self.tmp_dir())? {
            let ent = ent?;
            let modified = ent
                .metadata()
                .and_then(|md| md.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(now);
            if now.saturating_sub(modified) < STALE_AFTER_SECS {
                continue;
            }
            let path = ent.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if result.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run `f` holding the in-process lock for one key. The map entry is
    /// dropped again once no other thread holds or waits on it.
    fn with_key_lock<T>(
        &self,
        kind: &str,
        fingerprint: &Fingerprint,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let key = format!("{kind}/{fingerprint}");
        let key_lock = Arc::clone(
            self.key_locks
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let result = {
            let _held = key_lock.lock();
            f()
        };

        let mut locks = self.key_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&key_lock) == 2 {
            locks.remove(&key);
        }
        result
    }

    fn acquire_lock(&self, kind: &str, fingerprint: &str) -> Result<CacheLock> {
        let lock_path = self.lock_path(kind, fingerprint)?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Lock files are never unlinked. Unlinking a still-locked file would
        // let a second process create a fresh file at the same path and take
        // a separate exclusive lock.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            info!(
                kind,
                lock = %lock_path.display(),
                "waiting for another process producing the same fingerprint"
            );
            lock_file
                .lock_exclusive()
                .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        }

        Ok(CacheLock { file: lock_file })
    }
}

/// Platform default cache root, honouring [`CACHE_DIR_ENV`].
pub fn default_cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(DEFAULT_CACHE_DIR_NAME)
}

/// RAII guard: releases the file lock on drop.
#[derive(Debug)]
struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn hit_result(hit: CachedArtifact) -> CacheResult {
    CacheResult {
        path: hit.blob_path,
        blob_sha256: hit.entry.blob_sha256,
        outcome: CacheOutcome::Hit,
    }
}

fn remove_tmp(path: &Path) {
    if path.is_dir() {
        let _ = fs::remove_dir_all(path);
    } else if path.exists() {
        let _ = fs::remove_file(path);
    }
}

fn validate_kind(kind: &str) -> Result<()> {
    if kind.is_empty() {
        bail!(RuntimeError::configuration("artifact kind must not be empty"));
    }
    if kind.contains('/') || kind.contains('\\') || kind.contains("..") {
        bail!(RuntimeError::configuration(format!(
            "artifact kind must be a safe filename segment: {kind}"
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!(RuntimeError::configuration("cache key must not be empty"));
    }
    if key.contains('/') || key.contains('\\') || key.contains("..") {
        bail!(RuntimeError::configuration(
            "cache key must be a safe filename segment"
        ));
    }
    Ok(())
}

fn validate_sha256(sha256: &str) -> Result<()> {
    if !is_hex_64(sha256) {
        bail!(RuntimeError::format(format!("invalid sha256: {sha256}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::builder(name).context("test").build()
    }

    #[test]
    fn cached_runs_producer_once() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let key = fp("extractClient");
        let calls = AtomicUsize::new(0);

        let produce = |out: &Path| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::write(out, b"client-jar")?;
            Ok(())
        };

        let first = cache.cached("step", &key, BTreeMap::new(), produce).unwrap();
        let second = cache.cached("step", &key, BTreeMap::new(), produce).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.outcome, CacheOutcome::Miss);
        assert_eq!(second.outcome, CacheOutcome::Hit);
        assert_eq!(first.path, second.path);
        assert_eq!(fs::read(&second.path).unwrap(), b"client-jar");
    }

    #[test]
    fn failed_producer_leaves_no_entry_and_retries() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let key = fp("decompile");

        let err = cache
            .cached("step", &key, BTreeMap::new(), |out| {
                fs::write(out, b"partial")?;
                bail!("decompiler crashed")
            })
            .unwrap_err();
        assert!(err.to_string().contains("decompiler crashed"));
        assert!(cache.get("step", &key).unwrap().is_none());
        assert_eq!(fs::read_dir(cache.tmp_dir()).unwrap().count(), 0);

        let ok = cache
            .cached("step", &key, BTreeMap::new(), |out| {
                fs::write(out, b"sources")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(ok.outcome, CacheOutcome::Miss);
    }

    #[test]
    fn producer_without_output_is_missing_resource() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let key = fp("noop");
        let err = cache
            .cached("step", &key, BTreeMap::new(), |_out| Ok(()))
            .unwrap_err();
        assert_eq!(
            RuntimeError::classify(&err),
            Some(ErrorKind::MissingResource)
        );
        assert!(cache.get("step", &key).unwrap().is_none());
    }

    #[test]
    fn put_file_missing_source_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(&tmp.path().join("cache")).unwrap();
        let key = fp("downloadManifest");
        let err = cache
            .put_file("step", &key, &tmp.path().join("missing.json"), BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            RuntimeError::classify(&err),
            Some(ErrorKind::MissingResource)
        );
        assert!(cache.get("step", &key).unwrap().is_none());
    }

    #[test]
    fn corrupt_blob_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let key = fp("merge");

        let first = cache
            .cached("step", &key, BTreeMap::new(), |out| {
                fs::write(out, b"good")?;
                Ok(())
            })
            .unwrap();
        fs::write(&first.path, b"tampered").unwrap();

        let second = cache
            .cached("step", &key, BTreeMap::new(), |out| {
                fs::write(out, b"good")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(second.outcome, CacheOutcome::Miss);
        assert_eq!(fs::read(&second.path).unwrap(), b"good");

        let third = cache
            .cached("step", &key, BTreeMap::new(), |_| {
                panic!("repaired entry must be a hit")
            })
            .unwrap();
        assert_eq!(third.outcome, CacheOutcome::Hit);
        assert_eq!(fs::read(&third.path).unwrap(), b"good");
    }

    #[test]
    fn key_locks_are_released_after_use() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        for name in ["a", "b", "c"] {
            cache
                .cached("step", &fp(name), BTreeMap::new(), |out| {
                    fs::write(out, name)?;
                    Ok(())
                })
                .unwrap();
        }
        let err = cache
            .cached("step", &fp("broken"), BTreeMap::new(), |_| {
                Err(RuntimeError::format("bad input").into())
            })
            .unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Format));
        assert!(cache.key_locks.lock().is_empty());
    }

    #[test]
    fn concurrent_same_fingerprint_runs_once() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let key = fp("generateExtraJar");
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    barrier.wait();
                    let res = cache
                        .cached("step", &key, BTreeMap::new(), |out| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(50));
                            fs::write(out, b"extra")?;
                            Ok(())
                        })
                        .unwrap();
                    assert_eq!(fs::read(&res.path).unwrap(), b"extra");
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_fingerprints_run_in_parallel() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let barrier = Barrier::new(2);

        // Each producer waits for the other; serialised producers would deadlock.
        std::thread::scope(|scope| {
            for name in ["extractClient", "extractServer"] {
                let cache = &cache;
                let barrier = &barrier;
                scope.spawn(move || {
                    cache
                        .cached("step", &fp(name), BTreeMap::new(), |out| {
                            barrier.wait();
                            fs::write(out, name.as_bytes())?;
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });
    }

    #[test]
    fn cached_dir_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(&tmp.path().join("cache")).unwrap();
        let key = fp("unpackSources");
        let dest = tmp.path().join("sources");

        let first = cache
            .cached_dir("step", &key, BTreeMap::new(), &dest, |dir| {
                fs::create_dir_all(dir.join("net/minecraft"))?;
                fs::write(dir.join("net/minecraft/Main.java"), b"class Main {}")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(first.outcome, CacheOutcome::Miss);

        fs::remove_dir_all(&dest).unwrap();
        let second = cache
            .cached_dir("step", &key, BTreeMap::new(), &dest, |_dir| {
                bail!("must not run on a hit")
            })
            .unwrap();
        assert_eq!(second.outcome, CacheOutcome::Hit);
        assert_eq!(
            fs::read(dest.join("net/minecraft/Main.java")).unwrap(),
            b"class Main {}"
        );
    }

    #[test]
    fn materialize_prune_and_gc() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(&tmp.path().join("cache")).unwrap();

        for (i, body) in [b"one".as_slice(), b"two".as_slice()].iter().enumerate() {
            let key = fp(&format!("step{i}"));
            cache
                .cached("jar", &key, BTreeMap::new(), |out| {
                    fs::write(out, body)?;
                    Ok(())
                })
                .unwrap();
        }

        let dest = tmp.path().join("out/step0.jar");
        cache.materialize_to("jar", &fp("step0"), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"one");

        assert_eq!(cache.status().unwrap().index_entries, 2);
        assert_eq!(cache.prune_keep_last(1).unwrap(), 1);
        assert_eq!(cache.list_kind("jar").unwrap().len(), 1);
        assert_eq!(cache.gc().unwrap(), 1);
        assert_eq!(cache.status().unwrap().referenced_blobs, 1);
    }

    #[test]
    fn rejects_path_like_kinds() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentAddressedCache::open(tmp.path()).unwrap();
        let err = cache.get("../escape", &fp("x")).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
    }
}
