//! Naming channels and the resolver registry that turns a channel plus its
//! version data into a concrete mapping file.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::table::MappingTable;
use crate::coordinate::Coordinate;
use crate::error::RuntimeError;

/// User-supplied key/value data selecting a mapping version.
pub type VersionData = BTreeMap<String, String>;

/// Prefix of synthetic coordinates for deobfuscated dependencies.
pub const DEOBF_GROUP_PREFIX: &str = "fg.deobf";

const DEFAULT_VERSION_KEY: &str = "version";

/// A named mapping convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingChannel {
    pub name: String,
    /// Overrides the channel name inside deobfuscated coordinates.
    pub deobfuscation_group: Option<String>,
    /// Version-data key holding the game version.
    pub version_key: String,
}

impl NamingChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deobfuscation_group: None,
            version_key: DEFAULT_VERSION_KEY.to_string(),
        }
    }

    pub fn with_deobfuscation_group(mut self, group: &str) -> Self {
        self.deobfuscation_group = Some(group.to_string());
        self
    }

    pub fn with_version_key(mut self, key: &str) -> Self {
        self.version_key = key.to_string();
        self
    }

    pub fn minecraft_version<'a>(&self, data: &'a VersionData) -> Result<&'a str> {
        data.get(&self.version_key).map(String::as_str).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "naming channel '{}' needs version data key '{}'",
                self.name, self.version_key
            ))
            .into()
        })
    }

    /// `fg.deobf.<group-or-channel>.<group>:<name>:<version>...`
    pub fn deobfuscated_coordinate(&self, original: &Coordinate) -> Coordinate {
        let namespace = self
            .deobfuscation_group
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(&self.name);
        original
            .clone()
            .with_group(format!("{DEOBF_GROUP_PREFIX}.{namespace}.{}", original.group))
    }
}

/// Produces the mapping file for one channel.
pub trait MappingSource: Send + Sync {
    fn mapping_file(&self, channel: &NamingChannel, data: &VersionData) -> Result<PathBuf>;

    /// Whether the file is stored named -> obfuscated and must be flipped.
    fn stored_reversed(&self) -> bool {
        false
    }
}

/// Mapping file located by a path template. `{version}` expands to the
/// channel's game version, any other `{key}` to that version-data entry.
#[derive(Debug, Clone)]
pub struct TemplateMappingSource {
    template: String,
    reversed: bool,
}

impl TemplateMappingSource {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            reversed: false,
        }
    }

    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }
}

impl MappingSource for TemplateMappingSource {
    fn mapping_file(&self, channel: &NamingChannel, data: &VersionData) -> Result<PathBuf> {
        let mut values = data.clone();
        values.insert(
            "version".to_string(),
            channel.minecraft_version(data)?.to_string(),
        );
        let rendered = crate::tool::render_template(&self.template, &values)?;
        let path = PathBuf::from(rendered);
        if !path.is_file() {
            return Err(RuntimeError::missing(format!(
                "mapping file for channel '{}' not found: {}",
                channel.name,
                path.display()
            ))
            .into());
        }
        Ok(path)
    }

    fn stored_reversed(&self) -> bool {
        self.reversed
    }
}

/// Channel-name keyed registry of mapping sources.
#[derive(Default, Clone)]
pub struct MappingResolver {
    channels: BTreeMap<String, (NamingChannel, Arc<dyn MappingSource>)>,
}

impl fmt::Debug for MappingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingResolver")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MappingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: NamingChannel, source: Arc<dyn MappingSource>) {
        self.channels.insert(channel.name.clone(), (channel, source));
    }

    pub fn channel(&self, name: &str) -> Result<&NamingChannel> {
        self.entry(name).map(|(channel, _)| channel)
    }

    pub fn mapping_file(&self, name: &str, data: &VersionData) -> Result<PathBuf> {
        let (channel, source) = self.entry(name)?;
        let path = source
            .mapping_file(channel, data)
            .with_context(|| format!("Failed to resolve mappings for channel '{name}'"))?;
        debug!(channel = name, path = %path.display(), "resolved mapping file");
        Ok(path)
    }

    /// Whether the channel's files must be flipped after loading.
    pub fn stored_reversed(&self, name: &str) -> Result<bool> {
        self.entry(name).map(|(_, source)| source.stored_reversed())
    }

    /// Load the table oriented obfuscated -> named.
    pub fn load_table(&self, name: &str, data: &VersionData) -> Result<MappingTable> {
        let (_, source) = self.entry(name)?;
        let path = self.mapping_file(name, data)?;
        let table = MappingTable::load(&path)?;
        Ok(if source.stored_reversed() {
            table.reverse()
        } else {
            table
        })
    }

    fn entry(&self, name: &str) -> Result<&(NamingChannel, Arc<dyn MappingSource>)> {
        self.channels.get(name).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "unknown naming channel '{name}' (known: {})",
                self.channels.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn data(version: &str) -> VersionData {
        BTreeMap::from([("version".to_string(), version.to_string())])
    }

    #[test]
    fn deobf_coordinate_uses_group_override_or_channel() {
        let original: Coordinate = "com.example:lib:1.0".parse().unwrap();

        let official = NamingChannel::new("official");
        assert_eq!(
            official.deobfuscated_coordinate(&original).to_string(),
            "fg.deobf.official.com.example:lib:1.0@jar"
        );

        let grouped = NamingChannel::new("official").with_deobfuscation_group("mojmap");
        assert_eq!(
            grouped.deobfuscated_coordinate(&original).group,
            "fg.deobf.mojmap.com.example"
        );

        let blank = NamingChannel::new("official").with_deobfuscation_group("");
        assert_eq!(
            blank.deobfuscated_coordinate(&original).group,
            "fg.deobf.official.com.example"
        );
    }

    #[test]
    fn version_extractor_honours_key() {
        let channel = NamingChannel::new("parchment").with_version_key("minecraft");
        let mut d = data("2024.01.01");
        d.insert("minecraft".into(), "1.20.4".into());
        assert_eq!(channel.minecraft_version(&d).unwrap(), "1.20.4");

        let err = NamingChannel::new("x").minecraft_version(&VersionData::new()).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
    }

    #[test]
    fn resolver_loads_reversed_official_mappings() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("1.20.4");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("client.txt"), "net.minecraft.Main -> a:\n").unwrap();

        let mut resolver = MappingResolver::new();
        let template = format!("{}/{{version}}/client.txt", tmp.path().display());
        resolver.register(
            NamingChannel::new("official"),
            Arc::new(TemplateMappingSource::new(template).reversed(true)),
        );

        let table = resolver.load_table("official", &data("1.20.4")).unwrap();
        assert_eq!(table.remap_class_name("a"), "net/minecraft/Main");

        let err = resolver.load_table("official", &data("1.19")).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::MissingResource));

        let err = resolver.load_table("yarn", &data("1.20.4")).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
    }
}
