//! Archive indexing with one level of bundle indirection.
//!
//! Bundled server jars ship the real jar under `META-INF/versions/` and point
//! at it from `META-INF/versions.list` (`<sha>\t<id>\t<path>` per row). The
//! embedded jar is extracted to a scratch file and indexed in place of the
//! outer archive.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::result::ZipError;
use zip::ZipArchive;

use super::entry::{JarEntryRecord, VERSIONS_DIR, VERSIONS_LIST_PATH};
use crate::cache::io::tmp_name;
use crate::error::RuntimeError;

/// An indexed archive. Holds on to any embedded jar it had to extract and
/// removes it on drop.
#[derive(Debug)]
pub struct IndexedArchive {
    source: PathBuf,
    entries: Vec<JarEntryRecord>,
    extracted: Vec<PathBuf>,
}

impl IndexedArchive {
    /// Index `path`, unpacking a bundled jar into `scratch_dir` if needed.
    pub fn open(path: &Path, scratch_dir: &Path) -> Result<Self> {
        let mut archive = open_zip(path)?;

        let Some(embedded) = read_bundle_target(&mut archive, path)? else {
            return Ok(Self {
                source: path.to_path_buf(),
                entries: list_entries(&mut archive, path)?,
                extracted: Vec::new(),
            });
        };

        info!(jar = %path.display(), embedded = %embedded, "unpacking bundled jar");
        fs::create_dir_all(scratch_dir)
            .with_context(|| format!("Failed to create scratch dir '{}'", scratch_dir.display()))?;
        let extracted = scratch_dir.join(tmp_name("bundled")).with_extension("jar");
        if let Err(err) = extract_entry(&mut archive, path, &embedded, &extracted) {
            let _ = fs::remove_file(&extracted);
            return Err(err);
        }

        let mut inner = match IndexedArchive::open(&extracted, scratch_dir) {
            Ok(inner) => inner,
            Err(err) => {
                let _ = fs::remove_file(&extracted);
                return Err(err);
            }
        };
        let mut owned = std::mem::take(&mut inner.extracted);
        owned.push(extracted);
        Ok(Self {
            source: inner.source.clone(),
            entries: std::mem::take(&mut inner.entries),
            extracted: owned,
        })
    }

    /// The archive entries were read from (the embedded jar for bundles).
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// All entries in archive order.
    pub fn entries(&self) -> &[JarEntryRecord] {
        &self.entries
    }

    /// File entry paths, directories excluded.
    pub fn file_paths(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|e| !e.is_directory)
            .map(|e| e.path.clone())
            .collect()
    }

    pub fn is_bundle(&self) -> bool {
        !self.extracted.is_empty()
    }

    /// Copy the effective archive to `dest`.
    pub fn copy_source_to(&self, dest: &Path) -> Result<()> {
        fs::copy(&self.source, dest).with_context(|| {
            format!(
                "copying '{}' to '{}'",
                self.source.display(),
                dest.display()
            )
        })?;
        Ok(())
    }
}

impl Drop for IndexedArchive {
    fn drop(&mut self) {
        for path in &self.extracted {
            let _ = fs::remove_file(path);
        }
    }
}

/// File entry paths of `path`, looking through a bundle listing if present.
pub fn index_archive(path: &Path, scratch_dir: &Path) -> Result<BTreeSet<String>> {
    Ok(IndexedArchive::open(path, scratch_dir)?.file_paths())
}

/// Parse a `versions.list` body. `None` means no usable rows.
pub fn parse_versions_list(text: &str) -> Result<Option<String>> {
    let mut targets = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            return Err(RuntimeError::format(format!(
                "{VERSIONS_LIST_PATH} line {}: expected 3 tab-separated fields, found {}",
                idx + 1,
                fields.len()
            ))
            .into());
        }
        targets.push(fields[2].trim().to_string());
    }

    match targets.len() {
        0 => Ok(None),
        1 => Ok(Some(format!("{VERSIONS_DIR}{}", targets[0]))),
        n => Err(RuntimeError::format(format!(
            "{VERSIONS_LIST_PATH} lists {n} embedded jars; only single-entry bundles are supported"
        ))
        .into()),
    }
}

pub(crate) fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    if !path.is_file() {
        return Err(RuntimeError::missing(format!("archive not found: {}", path.display())).into());
    }
    let file = File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| {
        RuntimeError::format(format!("unreadable archive '{}': {e}", path.display())).into()
    })
}

pub(crate) fn list_entries<R: Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    path: &Path,
) -> Result<Vec<JarEntryRecord>> {
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| {
            RuntimeError::format(format!("Failed to read entry {i} of '{}': {e}", path.display()))
        })?;
        entries.push(JarEntryRecord::new(entry.name(), entry.is_dir()));
    }
    Ok(entries)
}

fn read_bundle_target<R: Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    path: &Path,
) -> Result<Option<String>> {
    let text = match archive.by_name(VERSIONS_LIST_PATH) {
        Ok(mut listing) => {
            let mut text = String::new();
            listing.read_to_string(&mut text).with_context(|| {
                format!("Failed to read {VERSIONS_LIST_PATH} from '{}'", path.display())
            })?;
            text
        }
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(RuntimeError::format(format!(
                "reading {VERSIONS_LIST_PATH} from '{}': {e}",
                path.display()
            ))
            .into())
        }
    };
    parse_versions_list(&text)
        .with_context(|| format!("Failed to parse bundle listing of '{}'", path.display()))
}

fn extract_entry<R: Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    path: &Path,
    entry_name: &str,
    dest: &Path,
) -> Result<()> {
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(RuntimeError::missing(format!(
                "bundle '{}' references missing entry '{entry_name}'",
                path.display()
            ))
            .into())
        }
        Err(e) => {
            return Err(RuntimeError::format(format!(
                "reading '{entry_name}' from '{}': {e}",
                path.display()
            ))
            .into())
        }
    };
    let mut out =
        File::create(dest).with_context(|| format!("Failed to create '{}'", dest.display()))?;
    let bytes = io::copy(&mut entry, &mut out)
        .with_context(|| format!("Failed to extract '{entry_name}' to '{}'", dest.display()))?;
    debug!(entry = entry_name, bytes, "extracted embedded jar");
    Ok(())
}
