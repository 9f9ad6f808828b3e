//! The vanilla runtime: anchor steps that go from a version cache to an
//! extra jar and, when tools are configured, a renamed jar and a sources jar.
//!
//! Version cache layout:
//!
//! ```text
//! launcher_metadata.json          version list, `latest.release` used for "+"
//! versions/<version>.json         per-version manifest
//! versions/<version>/client.jar
//! versions/<version>/server.jar   may be a bundle
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::deferred::Deferred;
use super::pipeline::StepPipeline;
use super::spec::RuntimeSpecification;
use super::step::{
    ArtifactRef, RuntimeStep, StepConfig, StepContext, StepOperation, PRIMARY_INPUT,
};
use crate::error::RuntimeError;
use crate::jar::{self, generate_extra_jar, Dist, DistJar};
use crate::mapping::MappingTable;
use crate::tool::{render_arguments, ToolExecutor, ToolInvocation};

pub const DOWNLOAD_MANIFEST: &str = "downloadManifest";
pub const EXTRACT_CLIENT: &str = "extractClient";
pub const EXTRACT_SERVER: &str = "extractServer";
pub const GENERATE_EXTRA_JAR: &str = "generateExtraJar";
pub const RENAME: &str = "rename";
pub const DECOMPILE: &str = "decompile";

pub const LAUNCHER_METADATA_FILE: &str = "launcher_metadata.json";

pub const DEFAULT_DECOMPILER_JVM_ARGS: &[&str] = &["-Xmx4g"];
pub const DEFAULT_DECOMPILER_PROGRAM_ARGS: &[&str] = &[
    "--decompile-generics",
    "--remove-bridge=true",
    "--remove-synthetic=true",
    "--log-level=warn",
    "{input}",
    "{output}",
];

pub const DEFAULT_RENAMER_PROGRAM_ARGS: &[&str] = &[
    "--input",
    "{input}",
    "--output",
    "{output}",
    "--names",
    "{mappings}",
    "--ann-fix",
    "--ids-fix",
    "--src-fix",
    "--record-fix",
];

/// An external jar tool run as one pipeline step.
///
/// Arguments may use `{output}` and `{<slot>}` for every input slot of the
/// step (`{input}`, `{tool}`, and `{mappings}` for the renamer).
#[derive(Clone)]
pub struct ToolSetup {
    pub label: String,
    pub tool_jar: Arc<Deferred<PathBuf>>,
    /// Extra classpath entries, resolved when the step runs.
    pub classpath: Option<Arc<Deferred<Vec<PathBuf>>>>,
    /// Stable identifiers of the classpath, folded into the fingerprint.
    pub classpath_ids: Vec<String>,
    pub executor: Arc<dyn ToolExecutor>,
    pub jvm_args: Vec<String>,
    pub program_args: Vec<String>,
}

impl ToolSetup {
    pub fn new(
        label: impl Into<String>,
        tool_jar: Arc<Deferred<PathBuf>>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            label: label.into(),
            tool_jar,
            classpath: None,
            classpath_ids: Vec::new(),
            executor,
            jvm_args: Vec::new(),
            program_args: Vec::new(),
        }
    }

    /// Decompiler with the default arguments.
    pub fn decompiler(
        label: impl Into<String>,
        tool_jar: Arc<Deferred<PathBuf>>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let mut setup = Self::new(label, tool_jar, executor);
        setup.jvm_args = to_strings(DEFAULT_DECOMPILER_JVM_ARGS);
        setup.program_args = to_strings(DEFAULT_DECOMPILER_PROGRAM_ARGS);
        setup
    }

    /// Renamer with the default arguments.
    pub fn renamer(
        label: impl Into<String>,
        tool_jar: Arc<Deferred<PathBuf>>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let mut setup = Self::new(label, tool_jar, executor);
        setup.program_args = to_strings(DEFAULT_RENAMER_PROGRAM_ARGS);
        setup
    }

    fn step(&self, name: &str, output_name: &str, input: ArtifactRef) -> RuntimeStep {
        RuntimeStep::new(
            name,
            output_name,
            RunTool {
                label: self.label.clone(),
                classpath: self.classpath.clone(),
                classpath_ids: self.classpath_ids.clone(),
                executor: Arc::clone(&self.executor),
            },
        )
        .with_input(PRIMARY_INPUT, input)
        .with_input("tool", ArtifactRef::Deferred(Arc::clone(&self.tool_jar)))
        .with_config(StepConfig {
            jvm_args: self.jvm_args.clone(),
            program_args: self.program_args.clone(),
            params: BTreeMap::new(),
        })
    }
}

fn to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone)]
pub struct VanillaOptions {
    pub version_cache: PathBuf,
    /// Mapping file used by the extra jar and the renamer.
    pub mappings: Option<Arc<Deferred<PathBuf>>>,
    /// The mapping file is stored named -> obfuscated.
    pub mappings_reversed: bool,
    /// Renames the primary jar before it is decompiled. Needs `mappings`.
    pub renamer: Option<ToolSetup>,
    pub decompiler: Option<ToolSetup>,
}

impl VanillaOptions {
    pub fn new(version_cache: impl Into<PathBuf>) -> Self {
        Self {
            version_cache: version_cache.into(),
            mappings: None,
            mappings_reversed: true,
            renamer: None,
            decompiler: None,
        }
    }
}

/// Assemble the vanilla pipeline for `spec`.
pub fn vanilla_pipeline(spec: RuntimeSpecification, options: &VanillaOptions) -> Result<StepPipeline> {
    let anchors = anchor_steps(&spec, options)?;
    StepPipeline::assemble(spec, anchors)
}

/// The anchor steps, in order.
pub fn anchor_steps(
    spec: &RuntimeSpecification,
    options: &VanillaOptions,
) -> Result<Vec<RuntimeStep>> {
    let cache = options.version_cache.as_path();
    let manifest_source = if spec.version().is_empty() {
        cache.join(LAUNCHER_METADATA_FILE)
    } else {
        cache.join("versions").join(format!("{}.json", spec.version()))
    };

    let mut steps = vec![
        RuntimeStep::new(DOWNLOAD_MANIFEST, "manifest.json", CopyManifest)
            .with_input("source", ArtifactRef::External(manifest_source)),
        RuntimeStep::new(EXTRACT_CLIENT, "client.jar", ExtractJar { dist: Dist::Client })
            .with_input("manifest", ArtifactRef::Previous)
            .with_input("jar", game_jar(cache, spec.version(), Dist::Client)),
        RuntimeStep::new(EXTRACT_SERVER, "server.jar", ExtractJar { dist: Dist::Server })
            .with_input("manifest", ArtifactRef::Step(DOWNLOAD_MANIFEST.into()))
            .with_input("jar", game_jar(cache, spec.version(), Dist::Server)),
    ];

    let primary = spec.side().primary_dist();
    let mut extra = RuntimeStep::new(
        GENERATE_EXTRA_JAR,
        "extra.jar",
        ExtraJar {
            primary,
            reversed: options.mappings_reversed,
        },
    )
    .with_input("client", ArtifactRef::Step(EXTRACT_CLIENT.into()))
    .with_input("server", ArtifactRef::Step(EXTRACT_SERVER.into()));
    if let Some(mappings) = &options.mappings {
        extra = extra.with_input("mappings", ArtifactRef::Deferred(Arc::clone(mappings)));
    }
    steps.push(extra);

    let mut game = match primary {
        Dist::Client => EXTRACT_CLIENT,
        Dist::Server => EXTRACT_SERVER,
    };

    if let Some(renamer) = &options.renamer {
        let Some(mappings) = &options.mappings else {
            return Err(RuntimeError::configuration(format!(
                "renamer '{}' needs a mapping file",
                renamer.label
            ))
            .into());
        };
        steps.push(
            renamer
                .step(RENAME, "renamed.jar", ArtifactRef::Step(game.into()))
                .with_input("mappings", ArtifactRef::Deferred(Arc::clone(mappings))),
        );
        game = RENAME;
    }

    if let Some(decompiler) = &options.decompiler {
        steps.push(decompiler.step(DECOMPILE, "sources.jar", ArtifactRef::Step(game.into())));
    }
    Ok(steps)
}

/// The jar of `dist`. Without a version the latest release is looked up in
/// the launcher metadata when the pipeline runs.
fn game_jar(cache: &Path, version: &str, dist: Dist) -> ArtifactRef {
    let file = format!("{dist}.jar");
    if !version.is_empty() {
        return ArtifactRef::External(cache.join("versions").join(version).join(file));
    }
    let cache = cache.to_path_buf();
    ArtifactRef::Deferred(Arc::new(Deferred::new(
        format!("latest release {dist} jar"),
        move || {
            let release = latest_release(&cache)?;
            Ok(cache.join("versions").join(release).join(&file))
        },
    )))
}

/// `latest.release` from the launcher metadata in `version_cache`.
pub fn latest_release(version_cache: &Path) -> Result<String> {
    let path = version_cache.join(LAUNCHER_METADATA_FILE);
    let value = read_json(&path)?;
    value
        .pointer("/latest/release")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            RuntimeError::format(format!(
                "launcher metadata '{}' has no latest.release",
                path.display()
            ))
            .into()
        })
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    if !path.is_file() {
        return Err(RuntimeError::missing(format!("{} not found", path.display())).into());
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        RuntimeError::format(format!("'{}' is not valid JSON: {e}", path.display())).into()
    })
}

struct CopyManifest;

impl StepOperation for CopyManifest {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        let source = ctx.input("source")?;
        read_json(source)?;
        fs::copy(source, ctx.output)
            .with_context(|| format!("Failed to copy version manifest '{}'", source.display()))?;
        Ok(())
    }
}

struct ExtractJar {
    dist: Dist,
}

impl StepOperation for ExtractJar {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        read_json(ctx.input("manifest")?)?;
        let jar = ctx.input("jar")?;
        let bundled = jar::unbundle(jar, ctx.output, ctx.scratch_dir)
            .with_context(|| format!("Failed to extract {} jar '{}'", self.dist, jar.display()))?;
        info!(dist = %self.dist, bundled, "extracted game jar");
        Ok(())
    }

    fn fingerprint_params(&self) -> Vec<(String, String)> {
        vec![("dist".to_string(), self.dist.to_string())]
    }
}

struct ExtraJar {
    primary: Dist,
    reversed: bool,
}

impl StepOperation for ExtraJar {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        let mappings = match ctx.optional_input("mappings") {
            Some(path) if self.reversed => Some(MappingTable::load_reversed(path)?),
            Some(path) => Some(MappingTable::load(path)?),
            None => None,
        };
        let summary = generate_extra_jar(
            dist_jar(ctx, self.primary)?,
            dist_jar(ctx, self.primary.other())?,
            mappings.as_ref(),
            ctx.output,
            ctx.scratch_dir,
        )?;
        info!(
            primary = %self.primary,
            resources = summary.resources.len(),
            shared = summary.shared,
            "generated extra jar"
        );
        Ok(())
    }

    fn fingerprint_params(&self) -> Vec<(String, String)> {
        vec![
            ("primary".to_string(), self.primary.to_string()),
            ("mappings_reversed".to_string(), self.reversed.to_string()),
        ]
    }
}

fn dist_jar<'a>(ctx: &'a StepContext<'_>, dist: Dist) -> Result<DistJar<'a>> {
    Ok(DistJar {
        path: ctx.input(dist.as_str())?,
        dist,
    })
}

struct RunTool {
    label: String,
    classpath: Option<Arc<Deferred<Vec<PathBuf>>>>,
    classpath_ids: Vec<String>,
    executor: Arc<dyn ToolExecutor>,
}

impl StepOperation for RunTool {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        let mut placeholders = ctx.inputs.clone();
        placeholders.insert("output".to_string(), ctx.output.to_path_buf());
        let program_args = render_arguments(&ctx.config.program_args, &placeholders)?;
        let jvm_args = render_arguments(&ctx.config.jvm_args, &placeholders)?;
        let classpath = match &self.classpath {
            Some(deferred) => deferred
                .get()
                .with_context(|| format!("Failed to resolve '{}'", deferred.label()))?
                .clone(),
            None => Vec::new(),
        };

        self.executor.execute(&ToolInvocation {
            tool: self.label.clone(),
            jar: ctx.input("tool")?.to_path_buf(),
            classpath,
            jvm_args,
            program_args,
            working_dir: ctx.scratch_dir.to_path_buf(),
        })
    }

    fn fingerprint_params(&self) -> Vec<(String, String)> {
        vec![
            ("tool".to_string(), self.label.clone()),
            ("classpath".to_string(), self.classpath_ids.join(";")),
        ]
    }
}
