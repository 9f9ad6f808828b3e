//! JAR manifest model.
//!
//! Written with CRLF line endings and 72-byte lines; longer values continue on
//! the next line after a single space. The main section comes first, each
//! named section follows a blank line.

use anyhow::Result;
use std::collections::BTreeMap;
use std::io::Write;

use crate::error::RuntimeError;

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const OBFUSCATED: &str = "Obfuscated";
pub const OBFUSCATED_BY: &str = "Obfuscated-By";

const MAX_LINE_BYTES: usize = 72;
const NAME: &str = "Name";

/// Ordered attribute list; names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, String)>,
}

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces an existing value in place, keeping its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Attributes,
    sections: BTreeMap<String, Attributes>,
}

impl Manifest {
    /// A manifest carrying only `Manifest-Version: 1.0`.
    pub fn new() -> Self {
        let mut manifest = Self::default();
        manifest.main.insert(MANIFEST_VERSION, "1.0");
        manifest
    }

    pub fn main_attributes(&self) -> &Attributes {
        &self.main
    }

    pub fn set_main_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.main.insert(name, value);
    }

    pub fn set_entry_attribute(
        &mut self,
        entry: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.sections
            .entry(entry.into())
            .or_default()
            .insert(name, value);
    }

    pub fn entry(&self, entry: &str) -> Option<&Attributes> {
        self.sections.get(entry)
    }

    /// Named sections in path order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Attributes)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn entry_count(&self) -> usize {
        self.sections.len()
    }

    /// Jars published with an obfuscation marker can be deobfuscated.
    pub fn is_obfuscated(&self) -> bool {
        self.main
            .get(OBFUSCATED)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
            && self.main.get(OBFUSCATED_BY).is_some()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        // Manifest-Version must lead the main section.
        if let Some(version) = self.main.get(MANIFEST_VERSION) {
            write_header(out, MANIFEST_VERSION, version)?;
        }
        for (name, value) in self.main.iter() {
            if !name.eq_ignore_ascii_case(MANIFEST_VERSION) {
                write_header(out, name, value)?;
            }
        }
        out.write_all(b"\r\n")?;

        for (entry, attrs) in &self.sections {
            write_header(out, NAME, entry)?;
            for (name, value) in attrs.iter() {
                write_header(out, name, value)?;
            }
            out.write_all(b"\r\n")?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RuntimeError::format(format!("manifest is not UTF-8: {e}")))?;

        let mut manifest = Manifest::default();
        let mut section: Option<String> = None;
        let mut in_main = true;

        for (line_no, line) in logical_lines(text) {
            if line.is_empty() {
                in_main = false;
                section = None;
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                RuntimeError::format(format!("manifest line {line_no} has no ':' separator"))
            })?;
            let value = value.strip_prefix(' ').unwrap_or(value);

            if in_main {
                manifest.main.insert(name, value);
                continue;
            }
            match &section {
                Some(entry) => manifest.set_entry_attribute(entry.clone(), name, value),
                None if name.eq_ignore_ascii_case(NAME) => {
                    manifest.sections.entry(value.to_string()).or_default();
                    section = Some(value.to_string());
                }
                None => {
                    return Err(RuntimeError::format(format!(
                        "manifest line {line_no}: section must start with 'Name:', found '{name}'"
                    ))
                    .into())
                }
            }
        }

        Ok(manifest)
    }
}

fn write_header<W: Write>(out: &mut W, name: &str, value: &str) -> Result<()> {
    let line = format!("{name}: {value}");
    let mut rest = line.as_str();
    let mut limit = MAX_LINE_BYTES;
    loop {
        if rest.len() <= limit {
            out.write_all(rest.as_bytes())?;
            out.write_all(b"\r\n")?;
            return Ok(());
        }
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.write_all(rest[..cut].as_bytes())?;
        out.write_all(b"\r\n ")?;
        rest = &rest[cut..];
        // Continuation lines spend one byte on the leading space.
        limit = MAX_LINE_BYTES - 1;
    }
}

/// Physical lines joined across continuations, tagged with the first line number.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in text.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(cont) = line.strip_prefix(' ') {
            if let Some((_, last)) = out.last_mut() {
                if !last.is_empty() {
                    last.push_str(cont);
                    continue;
                }
            }
        }
        out.push((idx + 1, line.to_string()));
    }
    // Trailing blank lines carry no information.
    while out.last().is_some_and(|(_, l)| l.is_empty()) {
        out.pop();
    }
    out
}
