//! Pipeline assembly and execution.
//!
//! Assembly turns a list of anchor steps plus the adapters and customizers
//! registered on a [`RuntimeSpecification`] into a validated step order with
//! every input reference bound to a concrete source. All configuration
//! mistakes surface here, before anything runs.
//!
//! Execution groups steps into waves by dependency depth and runs each wave
//! on the rayon pool. Every step goes through [`ContentAddressedCache::cached`],
//! so repeated runs with unchanged inputs only copy outputs back out.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::deferred::Deferred;
use super::run_record::{
    allocate_run_dir, now_utc_compact, write_run_record, RunRecord, StepOutcome, StepRecord,
    STATUS_FAILED, STATUS_RUNNING, STATUS_SUCCESS,
};
use super::spec::RuntimeSpecification;
use super::step::{ArtifactRef, RuntimeStep, StepContext, PRIMARY_INPUT};
use crate::cache::io::{copy_into_place, tmp_name};
use crate::cache::{CacheOutcome, ContentAddressedCache, Fingerprint};
use crate::error::RuntimeError;

/// Cache kind under which step outputs are stored.
pub const STEP_OUTPUT_KIND: &str = "step-output";

/// Ordered list of steps with named insertion points.
#[derive(Debug, Default)]
pub struct StepList {
    steps: Vec<RuntimeStep>,
}

impl StepList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: RuntimeStep) -> Result<()> {
        self.ensure_unique(step.name())?;
        self.steps.push(step);
        Ok(())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    pub fn insert_before(&mut self, target: &str, step: RuntimeStep) -> Result<()> {
        self.ensure_unique(step.name())?;
        let at = self.require(target)?;
        self.steps.insert(at, step);
        Ok(())
    }

    pub fn insert_after(&mut self, target: &str, step: RuntimeStep) -> Result<()> {
        self.ensure_unique(step.name())?;
        let at = self.require(target)?;
        self.steps.insert(at + 1, step);
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut RuntimeStep> {
        self.steps.iter_mut().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(RuntimeStep::name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<RuntimeStep> {
        self.steps
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.position(name).ok_or_else(|| {
            RuntimeError::configuration(format!("no step named '{name}' in pipeline")).into()
        })
    }

    fn ensure_unique(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(RuntimeError::configuration("step name must not be empty").into());
        }
        if self.position(name).is_some() {
            return Err(RuntimeError::configuration(format!(
                "duplicate step name '{name}' in pipeline"
            ))
            .into());
        }
        Ok(())
    }
}

/// A step input after assembly.
#[derive(Debug, Clone)]
enum BoundInput {
    Step(usize),
    External(PathBuf),
    Deferred(Arc<Deferred<PathBuf>>),
}

/// Where pipelines keep their working state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cache: ContentAddressedCache,
    /// Root for per-runtime step outputs and run records.
    pub workspace: PathBuf,
}

impl ExecutionContext {
    pub fn new(cache: ContentAddressedCache, workspace: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            workspace: workspace.into(),
        }
    }
}

/// Outputs of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub record: RunRecord,
    pub run_dir: PathBuf,
    outputs: Vec<(String, PathBuf)>,
}

impl PipelineRun {
    pub fn output(&self, step: &str) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, path)| path.as_path())
    }

    /// Output of the last step in pipeline order.
    pub fn final_output(&self) -> Option<&Path> {
        self.outputs.last().map(|(_, path)| path.as_path())
    }

    pub fn cache_hits(&self) -> usize {
        self.record
            .steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Hit)
            .count()
    }
}

/// An assembled, validated step sequence for one runtime.
pub struct StepPipeline {
    spec: RuntimeSpecification,
    steps: Vec<RuntimeStep>,
    bindings: Vec<Vec<(String, BoundInput)>>,
}

impl std::fmt::Debug for StepPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepPipeline")
            .field("runtime", &self.spec.identifier())
            .field("steps", &self.step_names())
            .finish()
    }
}

impl StepPipeline {
    /// Splice adapters around `anchors`, apply customizers and bind inputs.
    pub fn assemble(spec: RuntimeSpecification, anchors: Vec<RuntimeStep>) -> Result<Self> {
        let mut list = StepList::new();
        let mut anchor_names = Vec::with_capacity(anchors.len());
        for step in anchors {
            anchor_names.push(step.name().to_string());
            list.push(step)?;
        }

        for (anchor, _) in spec.pre_adapters().iter().chain(spec.post_adapters()) {
            if !anchor_names.iter().any(|a| a == anchor) {
                return Err(RuntimeError::configuration(format!(
                    "adapter targets unknown anchor step '{anchor}' (known: {})",
                    anchor_names.join(", ")
                ))
                .into());
            }
        }

        let mut pre_chains: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (anchor, adapter) in spec.pre_adapters() {
            let step = adapter
                .adapt(&spec, anchor)
                .with_context(|| format!("Failed to build pre-adapter for '{anchor}'"))?;
            pre_chains
                .entry(anchor.clone())
                .or_default()
                .push(step.name().to_string());
            list.insert_before(anchor, step)?;
        }
        for (anchor, chain) in &pre_chains {
            route_through_pre_adapters(&mut list, anchor, chain);
        }

        // Post-adapters chain: each goes after the previous one on the same anchor.
        let mut tails: HashMap<String, String> = HashMap::new();
        for (anchor, adapter) in spec.post_adapters() {
            let step = adapter
                .adapt(&spec, anchor)
                .with_context(|| format!("Failed to build post-adapter for '{anchor}'"))?;
            let after = tails.get(anchor).cloned().unwrap_or_else(|| anchor.clone());
            let name = step.name().to_string();
            list.insert_after(&after, step)?;
            tails.insert(anchor.clone(), name);
        }

        for (target, customizer) in spec.customizers() {
            let Some(step) = list.get_mut(target) else {
                return Err(RuntimeError::configuration(format!(
                    "customizer targets unknown step '{target}'"
                ))
                .into());
            };
            customizer.customize(step.config_mut());
        }

        let steps = list.into_steps();
        let bindings = bind_inputs(&steps, &tails)?;
        debug!(
            runtime = %spec.identifier(),
            steps = ?steps.iter().map(RuntimeStep::name).collect::<Vec<_>>(),
            "pipeline assembled"
        );
        Ok(Self {
            spec,
            steps,
            bindings,
        })
    }

    pub fn spec(&self) -> &RuntimeSpecification {
        &self.spec
    }

    pub fn steps(&self) -> &[RuntimeStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(RuntimeStep::name).collect()
    }

    /// Names of the steps a given step reads from, in slot order.
    pub fn dependencies_of(&self, step: &str) -> Vec<&str> {
        let Some(index) = self.steps.iter().position(|s| s.name() == step) else {
            return Vec::new();
        };
        self.bindings[index]
            .iter()
            .filter_map(|(_, input)| match input {
                BoundInput::Step(dep) => Some(self.steps[*dep].name()),
                _ => None,
            })
            .collect()
    }

    /// `<workspace>/<runtime-id>`
    pub fn runtime_dir(&self, ctx: &ExecutionContext) -> PathBuf {
        ctx.workspace.join(self.spec.identifier())
    }

    /// Run every step. Steps whose inputs are ready run in parallel; a
    /// failure stops everything that depends on it, and the first failure
    /// is returned after the run record is written.
    pub fn execute(&self, ctx: &ExecutionContext) -> Result<PipelineRun> {
        let runtime_dir = self.runtime_dir(ctx);
        let (run_id, run_dir) = allocate_run_dir(&runtime_dir.join("runs"))?;
        let mut record = RunRecord {
            run_id: run_id.clone(),
            runtime_id: self.spec.identifier(),
            status: STATUS_RUNNING.to_string(),
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            steps: Vec::new(),
        };
        write_run_record(&run_dir, &record)?;
        info!(runtime = %record.runtime_id, run_id = %run_id, steps = self.steps.len(), "pipeline started");

        let mut states: Vec<StepState> = vec![StepState::Pending; self.steps.len()];
        let mut first_error: Option<anyhow::Error> = None;

        for wave in self.waves() {
            let runnable: Vec<usize> = wave
                .into_iter()
                .filter(|&i| {
                    let blocked = self.bindings[i].iter().any(|(_, input)| {
                        matches!(input, BoundInput::Step(dep) if !states[*dep].is_done())
                    });
                    if blocked {
                        states[i] = StepState::Skipped;
                    }
                    !blocked
                })
                .collect();

            let results: Vec<(usize, Result<StepDone>)> = runnable
                .par_iter()
                .map(|&i| (i, self.run_step(i, &states, ctx, &runtime_dir)))
                .collect();

            for (i, result) in results {
                match result {
                    Ok(done) => states[i] = StepState::Done(done),
                    Err(err) => {
                        let err = err.context(format!("step '{}' failed", self.steps[i].name()));
                        warn!(step = self.steps[i].name(), error = %format!("{err:#}"), "step failed");
                        states[i] = StepState::Failed(format!("{err:#}"));
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        }

        record.steps = self
            .steps
            .iter()
            .zip(&states)
            .map(|(step, state)| state.to_record(step.name()))
            .collect();
        record.finished_at_utc = Some(now_utc_compact());
        record.status = if first_error.is_some() {
            STATUS_FAILED
        } else {
            STATUS_SUCCESS
        }
        .to_string();
        let written = write_run_record(&run_dir, &record);

        if let Some(err) = first_error {
            if let Err(record_err) = written {
                warn!(error = %format!("{record_err:#}"), "could not write run record");
            }
            return Err(err);
        }
        written?;

        let outputs = self
            .steps
            .iter()
            .zip(states)
            .filter_map(|(step, state)| match state {
                StepState::Done(done) => Some((step.name().to_string(), done.output)),
                _ => None,
            })
            .collect();
        info!(
            runtime = %record.runtime_id,
            run_id = %run_id,
            hits = record.steps.iter().filter(|s| s.outcome == StepOutcome::Hit).count(),
            "pipeline finished"
        );
        Ok(PipelineRun {
            record,
            run_dir,
            outputs,
        })
    }

    /// Step indices grouped by dependency depth, each wave in pipeline order.
    fn waves(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.steps.len()];
        for i in 0..self.steps.len() {
            depth[i] = self.bindings[i]
                .iter()
                .filter_map(|(_, input)| match input {
                    BoundInput::Step(dep) => Some(depth[*dep] + 1),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
        }
        let levels = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut waves = vec![Vec::new(); levels];
        for (i, d) in depth.into_iter().enumerate() {
            waves[d].push(i);
        }
        waves
    }

    fn run_step(
        &self,
        index: usize,
        states: &[StepState],
        ctx: &ExecutionContext,
        runtime_dir: &Path,
    ) -> Result<StepDone> {
        let step = &self.steps[index];
        let mut inputs = BTreeMap::new();
        for (slot, input) in &self.bindings[index] {
            let path = match input {
                BoundInput::Step(dep) => match &states[*dep] {
                    StepState::Done(done) => done.output.clone(),
                    _ => {
                        return Err(RuntimeError::missing(format!(
                            "input '{slot}' of step '{}' was not produced",
                            step.name()
                        ))
                        .into())
                    }
                },
                BoundInput::External(path) => path.clone(),
                BoundInput::Deferred(deferred) => deferred
                    .get()
                    .with_context(|| format!("Failed to resolve '{}'", deferred.label()))?
                    .clone(),
            };
            inputs.insert(slot.clone(), path);
        }

        let mut fp = Fingerprint::builder(step.name())
            .context(self.spec.fingerprint_context())
            .param("output_name", step.output_name());
        for (k, v) in step
            .config()
            .fingerprint_params()
            .into_iter()
            .chain(step.operation().fingerprint_params())
        {
            fp = fp.param(k, v);
        }
        for (slot, path) in &inputs {
            fp = fp.input_file(slot.as_str(), path)?;
        }
        let fingerprint = fp.build();

        let meta = BTreeMap::from([
            (
                "step".to_string(),
                serde_json::Value::String(step.name().to_string()),
            ),
            (
                "runtime".to_string(),
                serde_json::Value::String(self.spec.identifier()),
            ),
        ]);

        let scratch_root = runtime_dir.join("scratch");
        let stored = ctx
            .cache
            .cached(STEP_OUTPUT_KIND, &fingerprint, meta, |output| {
                let scratch_dir = scratch_root.join(tmp_name(step.name()));
                fs::create_dir_all(&scratch_dir).with_context(|| {
                    format!("Failed to create scratch directory '{}'", scratch_dir.display())
                })?;
                info!(step = step.name(), fingerprint = fingerprint.short(), "running step");
                let result = step.operation().execute(&StepContext {
                    step_name: step.name(),
                    spec: &self.spec,
                    inputs: &inputs,
                    config: step.config(),
                    output,
                    scratch_dir: &scratch_dir,
                });
                if let Err(err) = fs::remove_dir_all(&scratch_dir) {
                    debug!(error = %err, dir = %scratch_dir.display(), "scratch cleanup failed");
                }
                result
            })?;

        let dest = runtime_dir
            .join("steps")
            .join(step.name())
            .join(step.output_name());
        copy_into_place(&stored.path, &dest)
            .with_context(|| format!("Failed to place output of step '{}'", step.name()))?;
        debug!(step = step.name(), outcome = ?stored.outcome, output = %dest.display(), "step done");

        Ok(StepDone {
            fingerprint,
            outcome: stored.outcome,
            output: dest,
        })
    }
}

#[derive(Debug, Clone)]
struct StepDone {
    fingerprint: Fingerprint,
    outcome: CacheOutcome,
    output: PathBuf,
}

#[derive(Debug, Clone)]
enum StepState {
    Pending,
    Done(StepDone),
    Failed(String),
    Skipped,
}

impl StepState {
    fn is_done(&self) -> bool {
        matches!(self, StepState::Done(_))
    }

    fn to_record(&self, name: &str) -> StepRecord {
        let mut record = StepRecord {
            name: name.to_string(),
            outcome: StepOutcome::Skipped,
            fingerprint: None,
            output: None,
            error: None,
        };
        match self {
            StepState::Done(done) => {
                record.outcome = match done.outcome {
                    CacheOutcome::Hit => StepOutcome::Hit,
                    CacheOutcome::Miss => StepOutcome::Miss,
                };
                record.fingerprint = Some(done.fingerprint.as_str().to_string());
                record.output = Some(done.output.display().to_string());
            }
            StepState::Failed(err) => {
                record.outcome = StepOutcome::Failed;
                record.error = Some(err.clone());
            }
            StepState::Pending | StepState::Skipped => {}
        }
        record
    }
}

/// Feed an anchor's primary input through its pre-adapters. The first
/// adapter, unless it declares its own inputs, reads what the anchor
/// declared; the anchor then reads the last adapter.
fn route_through_pre_adapters(list: &mut StepList, anchor: &str, chain: &[String]) {
    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        return;
    };
    let Some(anchor_step) = list.get_mut(anchor) else {
        return;
    };
    let Some(slot) = anchor_step.primary_input_slot() else {
        // Implicit `Previous` already reads the last adapter.
        return;
    };
    let original = std::mem::replace(
        &mut anchor_step.inputs_mut()[slot].1,
        ArtifactRef::Step(last.clone()),
    );
    if let Some(head) = list.get_mut(first) {
        if head.inputs().is_empty() {
            head.inputs_mut().push((PRIMARY_INPUT.to_string(), original));
        }
    }
}

/// Resolve every declared input to a step index or a file source.
///
/// `Step(anchor)` means the anchor's last post-adapter when one exists and
/// sits before the reader; otherwise the named step itself. References must
/// point backwards.
fn bind_inputs(
    steps: &[RuntimeStep],
    post_tails: &HashMap<String, String>,
) -> Result<Vec<Vec<(String, BoundInput)>>> {
    let position = |name: &str| steps.iter().position(|s| s.name() == name);
    let mut bindings = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
        let declared: Vec<(String, ArtifactRef)> = if step.inputs().is_empty() && index > 0 {
            vec![(PRIMARY_INPUT.to_string(), ArtifactRef::Previous)]
        } else {
            step.inputs().to_vec()
        };

        let mut bound = Vec::with_capacity(declared.len());
        for (slot, source) in declared {
            if bound.iter().any(|(s, _): &(String, BoundInput)| *s == slot) {
                return Err(RuntimeError::configuration(format!(
                    "step '{}' declares input '{slot}' twice",
                    step.name()
                ))
                .into());
            }
            let input = match source {
                ArtifactRef::Previous => {
                    if index == 0 {
                        return Err(RuntimeError::configuration(format!(
                            "first step '{}' has no previous step to read '{slot}' from",
                            step.name()
                        ))
                        .into());
                    }
                    BoundInput::Step(index - 1)
                }
                ArtifactRef::Step(name) => {
                    let aliased = post_tails
                        .get(&name)
                        .and_then(|tail| position(tail))
                        .filter(|&p| p < index);
                    let target = aliased.or_else(|| position(&name)).ok_or_else(|| {
                        RuntimeError::configuration(format!(
                            "step '{}' reads '{slot}' from unknown step '{name}'",
                            step.name()
                        ))
                    })?;
                    if target >= index {
                        return Err(RuntimeError::configuration(format!(
                            "step '{}' reads '{slot}' from '{name}', which does not run before it",
                            step.name()
                        ))
                        .into());
                    }
                    BoundInput::Step(target)
                }
                ArtifactRef::External(path) => BoundInput::External(path),
                ArtifactRef::Deferred(deferred) => BoundInput::Deferred(deferred),
            };
            bound.push((slot, input));
        }
        bindings.push(bound);
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::step::StepConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn spec() -> crate::runtime::spec::RuntimeSpecificationBuilder {
        RuntimeSpecification::builder().minecraft_version("1.20.4")
    }

    fn context(tmp: &TempDir) -> ExecutionContext {
        let cache = ContentAddressedCache::open(&tmp.path().join("cache")).unwrap();
        ExecutionContext::new(cache, tmp.path().join("work"))
    }

    /// Writes `text` to its output.
    fn source(name: &str, text: &'static str, calls: Arc<AtomicUsize>) -> RuntimeStep {
        RuntimeStep::from_fn(name, "out.txt", move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::write(ctx.output, text)?;
            Ok(())
        })
    }

    /// Concatenates all inputs (in slot order) plus its own tag.
    fn concat(name: &str, tag: &'static str, calls: Arc<AtomicUsize>) -> RuntimeStep {
        RuntimeStep::from_fn(name, "out.txt", move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut text = String::new();
            for path in ctx.inputs.values() {
                text.push_str(&fs::read_to_string(path)?);
            }
            text.push_str(tag);
            fs::write(ctx.output, text)?;
            Ok(())
        })
    }

    fn adapter(
        name: &'static str,
        tag: &'static str,
    ) -> impl Fn(&RuntimeSpecification, &str) -> Result<RuntimeStep> + Send + Sync {
        move |_spec: &RuntimeSpecification, _anchor: &str| {
            Ok(concat(name, tag, Arc::new(AtomicUsize::new(0))))
        }
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn adapters_splice_in_registration_order() {
        let spec = spec()
            .pre_adapter("b", adapter("pre1", "<pre1>"))
            .pre_adapter("b", adapter("pre2", "<pre2>"))
            .post_adapter("b", adapter("post1", "<post1>"))
            .post_adapter("b", adapter("post2", "<post2>"))
            .build()
            .unwrap();
        let anchors = vec![
            source("a", "A", counter()),
            concat("b", "B", counter()),
            concat("c", "C", counter()),
        ];
        let pipeline = StepPipeline::assemble(spec, anchors).unwrap();
        assert_eq!(
            pipeline.step_names(),
            vec!["a", "pre1", "pre2", "b", "post1", "post2", "c"]
        );

        let tmp = TempDir::new().unwrap();
        let run = pipeline.execute(&context(&tmp)).unwrap();
        let text = fs::read_to_string(run.final_output().unwrap()).unwrap();
        assert_eq!(text, "A<pre1><pre2>B<post1><post2>C");
    }

    #[test]
    fn named_anchor_reference_follows_post_adapters() {
        let spec = spec()
            .post_adapter("a", adapter("patch", "+patched"))
            .build()
            .unwrap();
        let anchors = vec![
            source("a", "A", counter()),
            source("other", "O", counter()),
            concat("merge", "!", counter())
                .with_input("left", ArtifactRef::Step("a".into()))
                .with_input("right", ArtifactRef::Step("other".into())),
        ];
        let pipeline = StepPipeline::assemble(spec, anchors).unwrap();
        assert_eq!(pipeline.dependencies_of("merge"), vec!["patch", "other"]);

        let tmp = TempDir::new().unwrap();
        let run = pipeline.execute(&context(&tmp)).unwrap();
        let text = fs::read_to_string(run.output("merge").unwrap()).unwrap();
        assert_eq!(text, "A+patchedO!");
    }

    #[test]
    fn pre_adapter_takes_over_an_explicit_primary_input() {
        let spec = spec()
            .pre_adapter("dec", adapter("patch", "+patched"))
            .build()
            .unwrap();
        let anchors = vec![
            source("extract", "J", counter()),
            source("extra", "X", counter()),
            concat("dec", "!", counter())
                .with_input("input", ArtifactRef::Step("extract".into())),
        ];
        let pipeline = StepPipeline::assemble(spec, anchors).unwrap();
        assert_eq!(pipeline.step_names(), vec!["extract", "extra", "patch", "dec"]);
        assert_eq!(pipeline.dependencies_of("patch"), vec!["extract"]);
        assert_eq!(pipeline.dependencies_of("dec"), vec!["patch"]);

        let tmp = TempDir::new().unwrap();
        let run = pipeline.execute(&context(&tmp)).unwrap();
        let text = fs::read_to_string(run.output("dec").unwrap()).unwrap();
        assert_eq!(text, "J+patched!");
    }

    #[test]
    fn editing_a_step_output_does_not_touch_the_cache() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let calls = counter();
        let build = || {
            let steps = vec![source("a", "A", Arc::clone(&calls))];
            StepPipeline::assemble(spec().build().unwrap(), steps).unwrap()
        };

        let first = build().execute(&ctx).unwrap();
        fs::write(first.output("a").unwrap(), "EDITED").unwrap();

        for _ in 0..2 {
            let run = build().execute(&ctx).unwrap();
            assert_eq!(run.cache_hits(), 1);
            assert_eq!(fs::read_to_string(run.output("a").unwrap()).unwrap(), "A");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_adapter_target_fails_before_execution() {
        let calls = counter();
        let spec = spec()
            .pre_adapter("nope", adapter("x", "x"))
            .build()
            .unwrap();
        let err = StepPipeline::assemble(spec, vec![source("a", "A", Arc::clone(&calls))])
            .unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_references_are_configuration_errors() {
        let forward = vec![
            concat("a", "A", counter()).with_input("x", ArtifactRef::Step("b".into())),
            source("b", "B", counter()),
        ];
        let err = StepPipeline::assemble(spec().build().unwrap(), forward).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));

        let unknown = vec![
            source("a", "A", counter()),
            concat("b", "B", counter()).with_input("x", ArtifactRef::Step("zzz".into())),
        ];
        let err = StepPipeline::assemble(spec().build().unwrap(), unknown).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));

        let duplicate = vec![source("a", "A", counter()), source("a", "B", counter())];
        let err = StepPipeline::assemble(spec().build().unwrap(), duplicate).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));

        let first_previous =
            vec![concat("a", "A", counter()).with_input("input", ArtifactRef::Previous)];
        let err = StepPipeline::assemble(spec().build().unwrap(), first_previous).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));

        let spec = spec()
            .customizer("missing", |_: &mut StepConfig| {})
            .build()
            .unwrap();
        let err = StepPipeline::assemble(spec, vec![source("a", "A", counter())]).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Configuration));
    }

    #[test]
    fn customizers_change_config_and_fingerprint() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let make_step = move || {
            let sink = Arc::clone(&sink);
            RuntimeStep::from_fn("decompile", "out.txt", move |ctx| {
                sink.lock().push(ctx.config.jvm_args.clone());
                fs::write(ctx.output, "x")?;
                Ok(())
            })
        };

        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);

        let plain = StepPipeline::assemble(spec().build().unwrap(), vec![make_step()]).unwrap();
        plain.execute(&ctx).unwrap();

        let customized = spec()
            .customizer("decompile", |c: &mut StepConfig| c.jvm_args.push("-Xmx4G".into()))
            .build()
            .unwrap();
        let pipeline = StepPipeline::assemble(customized, vec![make_step()]).unwrap();
        assert_eq!(pipeline.steps()[0].config().jvm_args, vec!["-Xmx4G"]);
        let run = pipeline.execute(&ctx).unwrap();

        assert_eq!(run.cache_hits(), 0);
        assert_eq!(*seen.lock(), vec![Vec::<String>::new(), vec!["-Xmx4G".to_string()]]);
    }

    #[test]
    fn second_run_is_all_cache_hits() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let (a_calls, b_calls) = (counter(), counter());
        let build = || {
            StepPipeline::assemble(
                spec().build().unwrap(),
                vec![
                    source("a", "A", Arc::clone(&a_calls)),
                    concat("b", "B", Arc::clone(&b_calls)),
                ],
            )
            .unwrap()
        };

        let first = build().execute(&ctx).unwrap();
        let second = build().execute(&ctx).unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.cache_hits(), 2);
        assert_ne!(first.record.run_id, second.record.run_id);
        assert_eq!(fs::read_to_string(second.final_output().unwrap()).unwrap(), "AB");

        let runs_dir = build().runtime_dir(&ctx).join("runs");
        assert_eq!(
            crate::runtime::run_record::latest_successful_run_id(&runs_dir)
                .unwrap()
                .as_deref(),
            Some(second.record.run_id.as_str())
        );
    }

    #[test]
    fn failure_halts_dependents_and_keeps_earlier_steps_cached() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let broken = Arc::new(AtomicBool::new(true));
        let (a_calls, c_calls, side_calls) = (counter(), counter(), counter());

        let build = || {
            let flag = Arc::clone(&broken);
            let b = RuntimeStep::from_fn("b", "out.txt", move |ctx| {
                if flag.load(Ordering::SeqCst) {
                    return Err(RuntimeError::format("corrupt jar").into());
                }
                fs::copy(ctx.input("input")?, ctx.output)?;
                Ok(())
            });
            StepPipeline::assemble(
                spec().build().unwrap(),
                vec![
                    source("a", "A", Arc::clone(&a_calls)),
                    b,
                    concat("c", "C", Arc::clone(&c_calls)),
                    source("side", "S", Arc::clone(&side_calls))
                        .with_input("seed", ArtifactRef::Step("a".into())),
                ],
            )
            .unwrap()
        };

        let err = build().execute(&ctx).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::Format));
        assert!(format!("{err:#}").contains("step 'b' failed"));
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(side_calls.load(Ordering::SeqCst), 1);

        let runs = crate::runtime::run_record::load_run_records(
            &build().runtime_dir(&ctx).join("runs"),
        )
        .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, STATUS_FAILED);
        assert_eq!(runs[0].step("b").unwrap().outcome, StepOutcome::Failed);
        assert_eq!(runs[0].step("c").unwrap().outcome, StepOutcome::Skipped);

        broken.store(false, Ordering::SeqCst);
        let run = build().execute(&ctx).unwrap();
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.record.step("a").unwrap().outcome, StepOutcome::Hit);
        assert_eq!(run.record.step("b").unwrap().outcome, StepOutcome::Miss);
        assert_eq!(fs::read_to_string(run.output("c").unwrap()).unwrap(), "AC");
    }

    #[test]
    fn deferred_inputs_resolve_at_execution() {
        let tmp = TempDir::new().unwrap();
        let late = tmp.path().join("late.txt");
        let resolved = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&resolved);
        let target = late.clone();
        let deferred = Arc::new(Deferred::new("late file", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(target.clone())
        }));

        let pipeline = StepPipeline::assemble(
            spec().build().unwrap(),
            vec![concat("use", "!", counter())
                .with_input("late", ArtifactRef::Deferred(Arc::clone(&deferred)))],
        )
        .unwrap();
        assert!(!resolved.load(Ordering::SeqCst));

        fs::write(&late, "L").unwrap();
        let run = pipeline.execute(&context(&tmp)).unwrap();
        assert!(resolved.load(Ordering::SeqCst));
        assert_eq!(fs::read_to_string(run.final_output().unwrap()).unwrap(), "L!");
    }

    #[test]
    fn missing_external_input_is_missing_resource() {
        let tmp = TempDir::new().unwrap();
        let pipeline = StepPipeline::assemble(
            spec().build().unwrap(),
            vec![concat("use", "!", counter())
                .with_input("jar", ArtifactRef::External(tmp.path().join("absent.jar")))],
        )
        .unwrap();
        let err = pipeline.execute(&context(&tmp)).unwrap_err();
        assert_eq!(RuntimeError::classify(&err), Some(ErrorKind::MissingResource));
    }
}
