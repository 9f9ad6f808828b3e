//! `runtime.toml` loading.
//!
//! ```toml
//! [runtime]
//! artifact = "client"            # optional, default "client"
//! minecraft_version = "1.20.4"   # "+" for the latest release
//! side = "client"                # client | server | joined
//!
//! [paths]
//! cache_dir = "cache"            # optional, default $MC_RUNTIME_CACHE or the platform cache dir
//! workspace_dir = "build"
//! version_cache = "versions"
//! repositories = ["libs"]
//!
//! [mappings]
//! channel = "official"
//! file = "mappings/{version}/client.txt"
//! reversed = true
//! deobfuscation_group = "mojmap"
//! version = { version = "1.20.4" }
//!
//! [tools.renamer]
//! coordinate = "net.neoforged:AutoRenamingTool:2.0.3:all"
//!
//! [tools.decompiler]
//! coordinate = "org.vineflower:vineflower:1.10.1"
//! dependencies = []
//! jvm_args = ["-Xmx4g"]
//!
//! [[customize]]
//! step = "decompile"
//! jvm_args = ["-Xss4M"]
//! ```
//!
//! Relative paths resolve against the directory holding the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::default_cache_root;
use crate::coordinate::Coordinate;
use crate::error::RuntimeError;
use crate::mapping::{MappingResolver, NamingChannel, TemplateMappingSource, VersionData};
use crate::resolve::LocalRepositoryResolver;
use crate::runtime::step::StepConfig;
use crate::runtime::{
    Deferred, DistributionType, RuntimeSpecification, ToolSetup, VanillaOptions,
};
use crate::tool::{LibraryManager, ToolExecutor};

pub const DEFAULT_CONFIG_FILE: &str = "runtime.toml";
const DEFAULT_WORKSPACE_DIR: &str = "build";
const DEFAULT_VERSION_CACHE_DIR: &str = "versions";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    runtime: RuntimeSectionToml,
    #[serde(default)]
    paths: PathsToml,
    mappings: Option<MappingsToml>,
    #[serde(default)]
    tools: ToolsToml,
    #[serde(default)]
    customize: Vec<CustomizeToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSectionToml {
    artifact: Option<String>,
    minecraft_version: String,
    side: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    cache_dir: Option<PathBuf>,
    workspace_dir: Option<PathBuf>,
    version_cache: Option<PathBuf>,
    #[serde(default)]
    repositories: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingsToml {
    channel: String,
    file: String,
    #[serde(default)]
    reversed: bool,
    deobfuscation_group: Option<String>,
    version_key: Option<String>,
    #[serde(default)]
    version: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolsToml {
    renamer: Option<ToolToml>,
    decompiler: Option<ToolToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolToml {
    coordinate: Coordinate,
    #[serde(default)]
    dependencies: Vec<Coordinate>,
    jvm_args: Option<Vec<String>>,
    program_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomizeToml {
    step: String,
    #[serde(default)]
    jvm_args: Vec<String>,
    #[serde(default)]
    program_args: Vec<String>,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingsConfig {
    pub channel: NamingChannel,
    /// Absolute path template, see [`TemplateMappingSource`].
    pub file_template: String,
    pub reversed: bool,
    pub version_data: VersionData,
}

/// An external tool. Unset argument lists keep the tool's defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub coordinate: Coordinate,
    pub dependencies: Vec<Coordinate>,
    pub jvm_args: Option<Vec<String>>,
    pub program_args: Option<Vec<String>>,
}

impl From<ToolToml> for ToolConfig {
    fn from(t: ToolToml) -> Self {
        Self {
            coordinate: t.coordinate,
            dependencies: t.dependencies,
            jvm_args: t.jvm_args,
            program_args: t.program_args,
        }
    }
}

/// Extra arguments appended to one step's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customization {
    pub step: String,
    pub jvm_args: Vec<String>,
    pub program_args: Vec<String>,
    pub params: BTreeMap<String, String>,
}

impl Customization {
    fn apply(&self, config: &mut StepConfig) {
        config.jvm_args.extend(self.jvm_args.iter().cloned());
        config.program_args.extend(self.program_args.iter().cloned());
        for (k, v) in &self.params {
            config.params.insert(k.clone(), v.clone());
        }
    }
}

/// A loaded runtime file with every path made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub source: PathBuf,
    pub artifact: Option<String>,
    pub minecraft_version: String,
    pub side: DistributionType,
    pub cache_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub version_cache: PathBuf,
    pub repositories: Vec<PathBuf>,
    pub mappings: Option<MappingsConfig>,
    pub renamer: Option<ToolConfig>,
    pub decompiler: Option<ToolConfig>,
    pub customizations: Vec<Customization>,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(RuntimeError::missing(format!(
                "runtime config '{}' not found",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read runtime config '{}'", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, path, &base)
    }

    fn parse(text: &str, source: &Path, base: &Path) -> Result<Self> {
        let parsed: RuntimeToml = toml::from_str(text).map_err(|e| {
            RuntimeError::configuration(format!(
                "invalid runtime config '{}': {e}",
                source.display()
            ))
        })?;

        let side = match parsed.runtime.side.as_deref() {
            Some(raw) => raw
                .parse::<DistributionType>()
                .with_context(|| format!("invalid runtime config '{}'", source.display()))?,
            None => DistributionType::default(),
        };

        let paths = parsed.paths;
        let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

        let mappings = match parsed.mappings {
            Some(m) => {
                if m.channel.trim().is_empty() {
                    bail!(RuntimeError::configuration(format!(
                        "invalid runtime config '{}': mappings.channel must not be empty",
                        source.display()
                    )));
                }
                let mut channel = NamingChannel::new(m.channel.trim());
                if let Some(group) = m.deobfuscation_group.as_deref() {
                    channel = channel.with_deobfuscation_group(group);
                }
                if let Some(key) = m.version_key.as_deref() {
                    channel = channel.with_version_key(key);
                }
                let mut version_data = m.version;
                if !version_data.contains_key(&channel.version_key) {
                    version_data.insert(
                        channel.version_key.clone(),
                        parsed.runtime.minecraft_version.clone(),
                    );
                }
                Some(MappingsConfig {
                    channel,
                    file_template: resolve(PathBuf::from(m.file)).display().to_string(),
                    reversed: m.reversed,
                    version_data,
                })
            }
            None => None,
        };

        let mut customizations = Vec::with_capacity(parsed.customize.len());
        for c in parsed.customize {
            if c.step.trim().is_empty() {
                bail!(RuntimeError::configuration(format!(
                    "invalid runtime config '{}': customize.step must not be empty",
                    source.display()
                )));
            }
            customizations.push(Customization {
                step: c.step.trim().to_string(),
                jvm_args: c.jvm_args,
                program_args: c.program_args,
                params: c.params,
            });
        }

        Ok(Self {
            source: source.to_path_buf(),
            artifact: parsed.runtime.artifact,
            minecraft_version: parsed.runtime.minecraft_version,
            side,
            cache_dir: paths
                .cache_dir
                .map(resolve)
                .unwrap_or_else(default_cache_root),
            workspace_dir: resolve(
                paths
                    .workspace_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR)),
            ),
            version_cache: resolve(
                paths
                    .version_cache
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_VERSION_CACHE_DIR)),
            ),
            repositories: paths.repositories.into_iter().map(resolve).collect(),
            mappings,
            renamer: parsed.tools.renamer.map(ToolConfig::from),
            decompiler: parsed.tools.decompiler.map(ToolConfig::from),
            customizations,
        })
    }

    pub fn specification(&self) -> Result<RuntimeSpecification> {
        let mut builder = RuntimeSpecification::builder()
            .minecraft_version(self.minecraft_version.clone())
            .side(self.side);
        if let Some(artifact) = &self.artifact {
            builder = builder.minecraft_artifact(artifact.clone());
        }
        for customization in &self.customizations {
            let c = customization.clone();
            builder = builder.customizer(
                customization.step.clone(),
                move |config: &mut StepConfig| c.apply(config),
            );
        }
        builder
            .build()
            .with_context(|| format!("Failed to build runtime from '{}'", self.source.display()))
    }

    pub fn mapping_resolver(&self) -> Option<MappingResolver> {
        let mappings = self.mappings.as_ref()?;
        let mut resolver = MappingResolver::new();
        resolver.register(
            mappings.channel.clone(),
            Arc::new(
                TemplateMappingSource::new(mappings.file_template.clone())
                    .reversed(mappings.reversed),
            ),
        );
        Some(resolver)
    }

    pub fn needs_tools(&self) -> bool {
        self.renamer.is_some() || self.decompiler.is_some()
    }

    /// Wire mappings and tools. Nothing is resolved until the pipeline runs.
    pub fn vanilla_options(
        &self,
        libraries: Arc<LibraryManager>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<VanillaOptions> {
        let mut options = VanillaOptions::new(self.version_cache.clone());

        if let (Some(mappings), Some(resolver)) = (&self.mappings, self.mapping_resolver()) {
            let name = mappings.channel.name.clone();
            let data = mappings.version_data.clone();
            options.mappings_reversed = resolver.stored_reversed(&name)?;
            options.mappings = Some(Arc::new(Deferred::new(
                format!("{name} mappings"),
                move || resolver.mapping_file(&name, &data),
            )));
        }

        if let Some(renamer) = &self.renamer {
            let setup = ToolSetup::renamer(
                renamer.coordinate.to_string(),
                Arc::new(self.tool_jar(renamer, &libraries)),
                Arc::clone(&executor),
            );
            options.renamer = Some(self.tool_setup(renamer, setup, &libraries)?);
        }
        if let Some(decompiler) = &self.decompiler {
            let setup = ToolSetup::decompiler(
                decompiler.coordinate.to_string(),
                Arc::new(self.tool_jar(decompiler, &libraries)),
                Arc::clone(&executor),
            );
            options.decompiler = Some(self.tool_setup(decompiler, setup, &libraries)?);
        }
        Ok(options)
    }

    fn tool_jar(&self, config: &ToolConfig, libraries: &Arc<LibraryManager>) -> Deferred<PathBuf> {
        let (libraries, tool, deps) = (
            Arc::clone(libraries),
            config.coordinate.clone(),
            config.dependencies.clone(),
        );
        let resolver = LocalRepositoryResolver::new(self.repositories.clone());
        Deferred::new(format!("tool {tool}"), move || {
            let libs = libraries.libraries_of(&tool, &deps, &resolver)?;
            libs.first().map(|l| l.path.clone()).ok_or_else(|| {
                RuntimeError::missing(format!("tool {tool} resolved to nothing")).into()
            })
        })
    }

    /// Attach the deferred classpath and any argument overrides.
    fn tool_setup(
        &self,
        config: &ToolConfig,
        mut setup: ToolSetup,
        libraries: &Arc<LibraryManager>,
    ) -> Result<ToolSetup> {
        let (tool, deps) = (config.coordinate.clone(), config.dependencies.clone());
        setup.classpath_ids = libraries
            .classpath_of(&tool, &deps)?
            .iter()
            .cloned()
            .collect();

        let libraries = Arc::clone(libraries);
        let resolver = LocalRepositoryResolver::new(self.repositories.clone());
        setup.classpath = Some(Arc::new(Deferred::new(
            format!("classpath of {tool}"),
            move || {
                let libs = libraries.libraries_of(&tool, &deps, &resolver)?;
                Ok(libs
                    .iter()
                    .skip(1)
                    .map(|l| l.path.clone())
                    .collect::<Vec<PathBuf>>())
            },
        )));
        if let Some(args) = &config.jvm_args {
            setup.jvm_args = args.clone();
        }
        if let Some(args) = &config.program_args {
            setup.program_args = args.clone();
        }
        Ok(setup)
    }
}
