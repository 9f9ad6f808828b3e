//! Deterministic `tar.zst` packing for directory-shaped outputs.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use super::io::tmp_name;

pub(crate) fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    // Collect paths deterministically.
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let p = ent.path();
        if p == src_dir {
            continue;
        }
        entries.push(p.to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
        // Symlinks never appear in tool outputs; they are skipped.
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

pub(crate) fn materialize_tar_zst_dir(blob: &Path, dest_dir: &Path) -> Result<()> {
    let parent = dest_dir.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(tmp_name(".extract"));
    fs::create_dir_all(&tmp)?;

    let f = File::open(blob)?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut archive = tar::Archive::new(decoder);
    if let Err(err) = archive.unpack(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err).with_context(|| format!("Failed to unpack {}", blob.display()));
    }

    // tmp and dest share a parent, so the swap is a plain rename.
    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir)
            .with_context(|| format!("Failed to remove {}", dest_dir.display()))?;
    }
    fs::rename(&tmp, dest_dir).with_context(|| {
        format!(
            "Failed to move extracted dir {} to {}",
            tmp.display(),
            dest_dir.display()
        )
    })?;

    Ok(())
}
