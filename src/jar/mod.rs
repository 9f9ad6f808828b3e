//! Jar handling: entry classification, manifests, bundle-aware indexing and
//! extra-jar generation.

pub mod entry;
pub mod index;
pub mod manifest;
pub mod merge;

pub use entry::JarEntryRecord;
pub use index::{index_archive, IndexedArchive};
pub use manifest::Manifest;
pub use merge::{generate_extra_jar, Dist, DistJar, MergeSummary};

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tracing::info;
use zip::result::ZipError;

use crate::error::RuntimeError;

/// Read the manifest of `jar`, if it has one.
pub fn read_manifest(jar: &Path) -> Result<Option<Manifest>> {
    let mut archive = index::open_zip(jar)?;
    let mut entry = match archive.by_name(entry::MANIFEST_PATH) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(RuntimeError::format(format!(
                "reading manifest of '{}': {e}",
                jar.display()
            ))
            .into())
        }
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read manifest of '{}'", jar.display()))?;
    Manifest::parse(&bytes)
        .with_context(|| format!("Failed to parse manifest of '{}'", jar.display()))
        .map(Some)
}

/// Whether `jar` carries the obfuscation marker in its manifest.
pub fn is_deobfuscatable(jar: &Path) -> Result<bool> {
    Ok(read_manifest(jar)?.is_some_and(|m| m.is_obfuscated()))
}

/// Write the real jar behind `jar` to `dest`: the embedded jar for bundles,
/// otherwise a plain copy.
pub fn unbundle(jar: &Path, dest: &Path, scratch_dir: &Path) -> Result<bool> {
    let indexed = IndexedArchive::open(jar, scratch_dir)?;
    indexed.copy_source_to(dest)?;
    if indexed.is_bundle() {
        info!(jar = %jar.display(), "extracted bundled server jar");
    }
    Ok(indexed.is_bundle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::index::tests::write_jar;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_obfuscation_marker() {
        let tmp = TempDir::new().unwrap();
        let marked = tmp.path().join("marked.jar");
        let plain = tmp.path().join("plain.jar");
        let bare = tmp.path().join("bare.jar");
        write_jar(
            &marked,
            &[(
                "META-INF/MANIFEST.MF",
                b"Manifest-Version: 1.0\r\nObfuscated: true\r\nObfuscated-By: NeoGradle\r\n\r\n",
            )],
        );
        write_jar(
            &plain,
            &[("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n\r\n")],
        );
        write_jar(&bare, &[("a/B.class", b"b")]);

        assert!(is_deobfuscatable(&marked).unwrap());
        assert!(!is_deobfuscatable(&plain).unwrap());
        assert!(!is_deobfuscatable(&bare).unwrap());
    }

    #[test]
    fn unbundle_plain_jar_copies() {
        let tmp = TempDir::new().unwrap();
        let jar = tmp.path().join("server.jar");
        write_jar(&jar, &[("a/B.class", b"b")]);
        let dest = tmp.path().join("out.jar");
        assert!(!unbundle(&jar, &dest, tmp.path()).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&jar).unwrap());
    }
}
