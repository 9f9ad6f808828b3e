//! Extra-jar generation.
//!
//! Compares the entry sets of two distributions of the same game version and
//! writes a jar holding:
//!
//! - a manifest with `Minecraft-Dists: server client` plus one named section
//!   per distribution-exclusive file, tagged `Minecraft-Dist: <dist>`
//!   (class paths remapped through the mapping table);
//! - every resource entry of the primary jar, in archive order.
//!
//! Timestamps and permissions are fixed so identical inputs give identical
//! bytes.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::entry::{class_name_of, class_path_of, MANIFEST_PATH};
use super::index::{open_zip, IndexedArchive};
use super::manifest::Manifest;
use crate::error::RuntimeError;
use crate::mapping::MappingTable;

pub const DISTS_ATTRIBUTE: &str = "Minecraft-Dists";
pub const DIST_ATTRIBUTE: &str = "Minecraft-Dist";

/// Which published distribution a jar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dist {
    Client,
    Server,
}

impl Dist {
    pub fn as_str(self) -> &'static str {
        match self {
            Dist::Client => "client",
            Dist::Server => "server",
        }
    }

    pub fn other(self) -> Dist {
        match self {
            Dist::Client => Dist::Server,
            Dist::Server => Dist::Client,
        }
    }
}

impl fmt::Display for Dist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a merge.
#[derive(Debug, Clone, Copy)]
pub struct DistJar<'a> {
    pub path: &'a Path,
    pub dist: Dist,
}

/// What a merge produced, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub primary_only: usize,
    pub secondary_only: usize,
    pub shared: usize,
    pub resources: Vec<String>,
}

/// Build the distribution manifest for two entry sets.
pub fn distribution_manifest(
    primary: (&BTreeSet<String>, Dist),
    secondary: (&BTreeSet<String>, Dist),
    mappings: Option<&MappingTable>,
) -> Manifest {
    let mut manifest = Manifest::new();
    manifest.set_main_attribute(DISTS_ATTRIBUTE, "server client");

    for ((own, dist), (other, _)) in [(primary, secondary), (secondary, primary)] {
        for path in own.difference(other) {
            manifest.set_entry_attribute(
                remap_entry_path(path, mappings),
                DIST_ATTRIBUTE,
                dist.as_str(),
            );
        }
    }
    manifest
}

/// Remap a class-file path through `mappings`; other paths pass through.
pub fn remap_entry_path(path: &str, mappings: Option<&MappingTable>) -> String {
    match (mappings, class_name_of(path)) {
        (Some(table), Some(class_name)) => {
            class_path_of(&table.remap_class_name(class_name))
        }
        _ => path.to_string(),
    }
}

/// Write the extra jar for `primary` and `secondary` to `output`.
///
/// Bundled jars are unpacked into `scratch_dir` for the duration of the call.
pub fn generate_extra_jar(
    primary: DistJar<'_>,
    secondary: DistJar<'_>,
    mappings: Option<&MappingTable>,
    output: &Path,
    scratch_dir: &Path,
) -> Result<MergeSummary> {
    if primary.dist == secondary.dist {
        return Err(RuntimeError::configuration(format!(
            "extra jar needs one client and one server jar, got two '{}' jars",
            primary.dist
        ))
        .into());
    }

    let primary_index = IndexedArchive::open(primary.path, scratch_dir)
        .with_context(|| format!("Failed to index {} jar '{}'", primary.dist, primary.path.display()))?;
    let secondary_index = IndexedArchive::open(secondary.path, scratch_dir).with_context(|| {
        format!(
            "indexing {} jar '{}'",
            secondary.dist,
            secondary.path.display()
        )
    })?;

    let mut primary_paths = primary_index.file_paths();
    let mut secondary_paths = secondary_index.file_paths();
    primary_paths.remove(MANIFEST_PATH);
    secondary_paths.remove(MANIFEST_PATH);

    let manifest = distribution_manifest(
        (&primary_paths, primary.dist),
        (&secondary_paths, secondary.dist),
        mappings,
    );

    let mut summary = MergeSummary {
        primary_only: primary_paths.difference(&secondary_paths).count(),
        secondary_only: secondary_paths.difference(&primary_paths).count(),
        shared: primary_paths.intersection(&secondary_paths).count(),
        resources: Vec::new(),
    };

    let out = File::create(output).with_context(|| format!("Failed to create '{}'", output.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options = stable_options();

    zip.start_file(MANIFEST_PATH, options)
        .with_context(|| format!("Failed to write manifest to '{}'", output.display()))?;
    zip.write_all(&manifest.to_bytes()?)?;

    let mut source = open_zip(primary_index.source())?;
    for record in primary_index.entries() {
        if !record.is_resource() {
            continue;
        }
        let mut entry = source.by_name(&record.path).map_err(|e| {
            RuntimeError::format(format!(
                "reading '{}' from '{}': {e}",
                record.path,
                primary_index.source().display()
            ))
        })?;
        zip.start_file(record.path.as_str(), options)
            .with_context(|| format!("Failed to write '{}' to '{}'", record.path, output.display()))?;
        io::copy(&mut entry, &mut zip)
            .with_context(|| format!("Failed to copy '{}'", record.path))?;
        summary.resources.push(record.path.clone());
    }

    let writer = zip
        .finish()
        .with_context(|| format!("Failed to finalize '{}'", output.display()))?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush '{}'", output.display()))?
        .sync_all()?;

    debug!(
        primary_only = summary.primary_only,
        secondary_only = summary.secondary_only,
        shared = summary.shared,
        "distribution split"
    );
    info!(
        output = %output.display(),
        resources = summary.resources.len(),
        tagged = manifest.entry_count(),
        "wrote extra jar"
    );
    Ok(summary)
}

fn stable_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::io::sha256_file;
    use crate::error::ErrorKind;
    use crate::jar::index::tests::write_jar;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn read_output(path: &Path) -> (Manifest, Vec<String>) {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        let mut bytes = Vec::new();
        zip.by_name(MANIFEST_PATH)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        (Manifest::parse(&bytes).unwrap(), names)
    }

    fn fixture(tmp: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let client = tmp.path().join("client.jar");
        let server = tmp.path().join("server.jar");
        write_jar(
            &client,
            &[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n\r\n"),
                ("A.class", b"a"),
                ("res/icon.png", b"png"),
            ],
        );
        write_jar(
            &server,
            &[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n\r\n"),
                ("A.class", b"a"),
                ("B.class", b"b"),
            ],
        );
        (client, server)
    }

    #[test]
    fn client_and_server_split() {
        let tmp = TempDir::new().unwrap();
        let (client, server) = fixture(&tmp);
        let out = tmp.path().join("extra.jar");

        let summary = generate_extra_jar(
            DistJar { path: &client, dist: Dist::Client },
            DistJar { path: &server, dist: Dist::Server },
            None,
            &out,
            tmp.path(),
        )
        .unwrap();

        let (manifest, names) = read_output(&out);
        assert_eq!(manifest.main_attributes().get(DISTS_ATTRIBUTE), Some("server client"));
        assert_eq!(manifest.main_attributes().get("Manifest-Version"), Some("1.0"));
        assert_eq!(manifest.entry_count(), 2);
        assert_eq!(manifest.entry("B.class").unwrap().get(DIST_ATTRIBUTE), Some("server"));
        assert_eq!(
            manifest.entry("res/icon.png").unwrap().get(DIST_ATTRIBUTE),
            Some("client")
        );
        assert!(manifest.entry("A.class").is_none());

        assert_eq!(names, vec![MANIFEST_PATH.to_string(), "res/icon.png".to_string()]);
        assert_eq!(summary.shared, 1);
        assert_eq!(summary.resources, vec!["res/icon.png".to_string()]);
    }

    #[test]
    fn server_exclusive_class_is_remapped() {
        let tmp = TempDir::new().unwrap();
        let client = tmp.path().join("client.jar");
        let server = tmp.path().join("server.jar");
        write_jar(&client, &[("c/Shared.class", b"s")]);
        write_jar(&server, &[("c/Shared.class", b"s"), ("a/B.class", b"b")]);
        let table = MappingTable::from_pairs([("a/B", "x/Y")]);
        let out = tmp.path().join("extra.jar");

        generate_extra_jar(
            DistJar { path: &client, dist: Dist::Client },
            DistJar { path: &server, dist: Dist::Server },
            Some(&table),
            &out,
            tmp.path(),
        )
        .unwrap();

        let (manifest, _) = read_output(&out);
        assert_eq!(manifest.entry("x/Y.class").unwrap().get(DIST_ATTRIBUTE), Some("server"));
        assert!(manifest.entry("a/B.class").is_none());
    }

    #[test]
    fn non_resources_are_never_copied() {
        let tmp = TempDir::new().unwrap();
        let client = tmp.path().join("client.jar");
        let server = tmp.path().join("server.jar");
        write_jar(
            &client,
            &[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\n\r\n"),
                ("META-INF/MOJANGCS.SF", b"sig"),
                ("META-INF/MOJANGCS.RSA", b"sig"),
                ("assets/", b""),
                ("assets/lang/en_us.json", b"{}"),
                ("net/Main.class", b"m"),
                ("pack.mcmeta", b"{}"),
            ],
        );
        write_jar(&server, &[("net/Main.class", b"m")]);
        let out = tmp.path().join("extra.jar");

        generate_extra_jar(
            DistJar { path: &client, dist: Dist::Client },
            DistJar { path: &server, dist: Dist::Server },
            None,
            &out,
            tmp.path(),
        )
        .unwrap();

        let (_, names) = read_output(&out);
        assert_eq!(
            names,
            vec![
                MANIFEST_PATH.to_string(),
                "assets/lang/en_us.json".to_string(),
                "pack.mcmeta".to_string(),
            ]
        );
    }

    #[test]
    fn output_is_byte_reproducible() {
        let tmp = TempDir::new().unwrap();
        let (client, server) = fixture(&tmp);
        let a = tmp.path().join("a.jar");
        let b = tmp.path().join("b.jar");
        for out in [&a, &b] {
            generate_extra_jar(
                DistJar { path: &client, dist: Dist::Client },
                DistJar { path: &server, dist: Dist::Server },
                None,
                out,
                tmp.path(),
            )
            .unwrap();
        }
        assert_eq!(sha256_file(&a).unwrap().0, sha256_file(&b).unwrap().0);
    }

    #[test]
    fn server_primary_copies_server_resources() {
        let tmp = TempDir::new().unwrap();
        let client = tmp.path().join("client.jar");
        let server = tmp.path().join("server.jar");
        write_jar(&client, &[("assets/icon.png", b"png")]);
        write_jar(&server, &[("data/loot.json", b"{}"), ("B.class", b"b")]);
        let out = tmp.path().join("extra.jar");

        generate_extra_jar(
            DistJar { path: &server, dist: Dist::Server },
            DistJar { path: &client, dist: Dist::Client },
            None,
            &out,
            tmp.path(),
        )
        .unwrap();

        let (manifest, names) = read_output(&out);
        assert_eq!(names, vec![MANIFEST_PATH.to_string(), "data/loot.json".to_string()]);
        assert_eq!(
            manifest.entry("assets/icon.png").unwrap().get(DIST_ATTRIBUTE),
            Some("client")
        );
    }

    #[test]
    fn same_dist_twice_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let (client, _) = fixture(&tmp);
        let err = generate_extra_jar(
            DistJar { path: &client, dist: Dist::Client },
            DistJar { path: &client, dist: Dist::Client },
            None,
            &tmp.path().join("out.jar"),
            tmp.path(),
        )
        .unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
        assert!(!tmp.path().join("out.jar").exists());
    }

    #[test]
    fn missing_input_is_missing_resource() {
        let tmp = TempDir::new().unwrap();
        let (client, _) = fixture(&tmp);
        let err = generate_extra_jar(
            DistJar { path: &client, dist: Dist::Client },
            DistJar { path: &tmp.path().join("nope.jar"), dist: Dist::Server },
            None,
            &tmp.path().join("out.jar"),
            tmp.path(),
        )
        .unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::MissingResource));
        let _ = fs::remove_file(tmp.path().join("out.jar"));
    }
}
