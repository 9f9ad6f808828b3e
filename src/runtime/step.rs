//! Runtime steps: a named operation with declared inputs and one output file.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::deferred::Deferred;
use super::spec::RuntimeSpecification;

/// Slot name of a step's main input.
pub const PRIMARY_INPUT: &str = "input";

/// Where a step input comes from.
#[derive(Clone)]
pub enum ArtifactRef {
    /// Output of the step immediately before this one.
    Previous,
    /// Output of a named step. Naming an anchor step picks up the output of
    /// its last post-adapter, if any.
    Step(String),
    /// A file that already exists.
    External(PathBuf),
    /// A file located when the pipeline runs.
    Deferred(Arc<Deferred<PathBuf>>),
}

impl fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Previous => write!(f, "Previous"),
            ArtifactRef::Step(name) => write!(f, "Step({name})"),
            ArtifactRef::External(path) => write!(f, "External({})", path.display()),
            ArtifactRef::Deferred(d) => write!(f, "Deferred({})", d.label()),
        }
    }
}

/// Tunables that customizers may change without touching pipeline shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepConfig {
    pub jvm_args: Vec<String>,
    pub program_args: Vec<String>,
    pub params: BTreeMap<String, String>,
}

impl StepConfig {
    /// Flattened key/value view, folded into the step fingerprint.
    pub fn fingerprint_params(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.params.len() + 2);
        out.push(("config.jvm_args".to_string(), self.jvm_args.join("\u{1f}")));
        out.push((
            "config.program_args".to_string(),
            self.program_args.join("\u{1f}"),
        ));
        for (k, v) in &self.params {
            out.push((format!("config.param.{k}"), v.clone()));
        }
        out
    }
}

/// Everything an operation sees while running.
pub struct StepContext<'a> {
    pub step_name: &'a str,
    pub spec: &'a RuntimeSpecification,
    pub inputs: &'a BTreeMap<String, PathBuf>,
    pub config: &'a StepConfig,
    /// Where the operation must write its output file.
    pub output: &'a Path,
    /// Private scratch directory, removed after the step.
    pub scratch_dir: &'a Path,
}

impl StepContext<'_> {
    pub fn input(&self, slot: &str) -> Result<&Path> {
        self.inputs.get(slot).map(PathBuf::as_path).ok_or_else(|| {
            crate::error::RuntimeError::configuration(format!(
                "step '{}' has no input named '{slot}'",
                self.step_name
            ))
            .into()
        })
    }

    pub fn optional_input(&self, slot: &str) -> Option<&Path> {
        self.inputs.get(slot).map(PathBuf::as_path)
    }
}

/// The work a step performs.
pub trait StepOperation: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()>;

    /// Extra key material identifying this operation's behaviour.
    fn fingerprint_params(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

impl<F> StepOperation for F
where
    F: Fn(&StepContext<'_>) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        self(ctx)
    }
}

#[derive(Clone)]
pub struct RuntimeStep {
    name: String,
    output_name: String,
    inputs: Vec<(String, ArtifactRef)>,
    config: StepConfig,
    operation: Arc<dyn StepOperation>,
}

impl fmt::Debug for RuntimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeStep")
            .field("name", &self.name)
            .field("output_name", &self.output_name)
            .field("inputs", &self.inputs)
            .field("config", &self.config)
            .finish()
    }
}

impl RuntimeStep {
    pub fn new(
        name: impl Into<String>,
        output_name: impl Into<String>,
        operation: impl StepOperation + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            output_name: output_name.into(),
            inputs: Vec::new(),
            config: StepConfig::default(),
            operation: Arc::new(operation),
        }
    }

    /// Step backed by a plain function.
    pub fn from_fn<F>(name: impl Into<String>, output_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, output_name, f)
    }

    /// Declare an input slot. A step with no declared inputs reads the
    /// previous step's output as `input`.
    pub fn with_input(mut self, slot: impl Into<String>, source: ArtifactRef) -> Self {
        self.inputs.push((slot.into(), source));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn inputs(&self) -> &[(String, ArtifactRef)] {
        &self.inputs
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut Vec<(String, ArtifactRef)> {
        &mut self.inputs
    }

    /// Index of the slot pre-adapters feed: `input` if declared, otherwise
    /// the first declared slot.
    pub(crate) fn primary_input_slot(&self) -> Option<usize> {
        self.inputs
            .iter()
            .position(|(slot, _)| slot == PRIMARY_INPUT)
            .or_else(|| (!self.inputs.is_empty()).then_some(0))
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut StepConfig {
        &mut self.config
    }

    pub fn operation(&self) -> &dyn StepOperation {
        self.operation.as_ref()
    }
}

/// Builds an extra step spliced next to an anchor.
pub trait StepAdapter: Send + Sync {
    fn adapt(&self, spec: &RuntimeSpecification, anchor: &str) -> Result<RuntimeStep>;
}

impl<F> StepAdapter for F
where
    F: Fn(&RuntimeSpecification, &str) -> Result<RuntimeStep> + Send + Sync,
{
    fn adapt(&self, spec: &RuntimeSpecification, anchor: &str) -> Result<RuntimeStep> {
        self(spec, anchor)
    }
}

/// Mutates one step's configuration.
pub trait StepCustomizer: Send + Sync {
    fn customize(&self, config: &mut StepConfig);
}

impl<F> StepCustomizer for F
where
    F: Fn(&mut StepConfig) + Send + Sync,
{
    fn customize(&self, config: &mut StepConfig) {
        self(config)
    }
}
