//! Class-name mapping tables.
//!
//! Reads class lines from ProGuard (`a.b.C -> x:`), TSRG (`a/B x/Y`) and SRG
//! (`CL: a/B x/Y`) files. Member lines are ignored. Names are stored in
//! internal form (`a/B`).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    classes: HashMap<String, String>,
}

impl MappingTable {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            classes: pairs
                .into_iter()
                .map(|(from, to)| (internal_name(from), internal_name(to)))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(
                RuntimeError::missing(format!("mapping file not found: {}", path.display())).into(),
            );
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read mapping file '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse mapping file '{}'", path.display()))
    }

    /// Load and flip direction in one go. Official mappings are stored
    /// named -> obfuscated.
    pub fn load_reversed(path: &Path) -> Result<Self> {
        Ok(Self::load(path)?.reverse())
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut classes = HashMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = strip_comment(raw);
            if line.trim().is_empty() || line.starts_with(char::is_whitespace) {
                continue;
            }
            if idx == 0 && line.starts_with("tsrg2 ") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("CL:") {
                let (from, to) = two_columns(rest).ok_or_else(|| malformed(idx, raw))?;
                classes.insert(internal_name(from), internal_name(to));
                continue;
            }
            if ["FD:", "MD:", "PK:"].iter().any(|p| line.starts_with(p)) {
                continue;
            }
            if let Some(head) = line.trim_end().strip_suffix(':') {
                let (from, to) = head.split_once(" -> ").ok_or_else(|| malformed(idx, raw))?;
                classes.insert(internal_name(from.trim()), internal_name(to.trim()));
                continue;
            }
            let (from, to) = two_columns(line).ok_or_else(|| malformed(idx, raw))?;
            classes.insert(internal_name(from), internal_name(to));
        }
        Ok(Self { classes })
    }

    pub fn reverse(&self) -> Self {
        Self {
            classes: self
                .classes
                .iter()
                .map(|(from, to)| (to.clone(), from.clone()))
                .collect(),
        }
    }

    pub fn get(&self, class_name: &str) -> Option<&str> {
        self.classes.get(class_name).map(String::as_str)
    }

    /// Remap an internal class name. Inner classes without their own mapping
    /// inherit the outer class's new name; unknown names pass through.
    pub fn remap_class_name(&self, class_name: &str) -> String {
        if let Some(mapped) = self.classes.get(class_name) {
            return mapped.clone();
        }
        match class_name.rsplit_once('$') {
            Some((outer, inner)) => {
                let outer = self.remap_class_name(outer);
                format!("{outer}${inner}")
            }
            None => class_name.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn two_columns(line: &str) -> Option<(&str, &str)> {
    let mut cols = line.split_whitespace();
    Some((cols.next()?, cols.next()?))
}

fn malformed(idx: usize, raw: &str) -> RuntimeError {
    RuntimeError::format(format!("line {}: unrecognised mapping '{}'", idx + 1, raw.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    const PROGUARD: &str = "\
# {\"id\":\"sourceFile\"}
net.minecraft.client.Minecraft -> fgo:
    int fps -> a
    1:4:void tick() -> b
net.minecraft.client.Minecraft$Inner -> fgo$a:
com.mojang.blaze3d.Blaze3D -> dkm:
";

    #[test]
    fn parses_proguard_class_lines() {
        let table = MappingTable::parse(PROGUARD).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("net/minecraft/client/Minecraft"), Some("fgo"));
        assert_eq!(table.get("net/minecraft/client/Minecraft$Inner"), Some("fgo$a"));
    }

    #[test]
    fn reversed_official_mappings_name_obfuscated_classes() {
        let table = MappingTable::parse(PROGUARD).unwrap().reverse();
        assert_eq!(table.remap_class_name("fgo"), "net/minecraft/client/Minecraft");
        assert_eq!(table.remap_class_name("dkm"), "com/mojang/blaze3d/Blaze3D");
    }

    #[test]
    fn parses_tsrg_and_srg() {
        let tsrg = MappingTable::parse("tsrg2 obf srg\na/B x/Y\n\tfield f_1\nc d\n").unwrap();
        assert_eq!(tsrg.get("a/B"), Some("x/Y"));
        assert_eq!(tsrg.get("c"), Some("d"));
        assert_eq!(tsrg.len(), 2);

        let srg =
            MappingTable::parse("PK: . net/minecraft\nCL: a/B x/Y\nFD: a/B/c x/Y/field\n").unwrap();
        assert_eq!(srg.len(), 1);
        assert_eq!(srg.get("a/B"), Some("x/Y"));
    }

    #[test]
    fn inner_classes_follow_their_outer_class() {
        let table = MappingTable::from_pairs([("a/B", "x/Y")]);
        assert_eq!(table.remap_class_name("a/B"), "x/Y");
        assert_eq!(table.remap_class_name("a/B$1"), "x/Y$1");
        assert_eq!(table.remap_class_name("a/B$C$D"), "x/Y$C$D");
        assert_eq!(table.remap_class_name("q/Unknown"), "q/Unknown");
    }

    #[test]
    fn rejects_garbage_lines() {
        let err = MappingTable::parse("onlyonecolumn\n").unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Format));
    }

    #[test]
    fn missing_file_is_missing_resource() {
        let tmp = TempDir::new().unwrap();
        let err = MappingTable::load(&tmp.path().join("client.txt")).unwrap_err();
        assert_eq!(
            RuntimeError::classify(&err),
            Some(ErrorKind::MissingResource)
        );
    }
}
