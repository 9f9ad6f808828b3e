//! Runtime specifications, steps and the pipelines that run them.

pub mod deferred;
pub mod pipeline;
pub mod run_record;
pub mod spec;
pub mod step;
pub mod vanilla;

pub use deferred::Deferred;
pub use pipeline::{ExecutionContext, PipelineRun, StepList, StepPipeline};
pub use run_record::{RunRecord, StepOutcome, StepRecord};
pub use spec::{DistributionType, RuntimeSpecification, RuntimeSpecificationBuilder};
pub use step::{
    ArtifactRef, RuntimeStep, StepAdapter, StepConfig, StepContext, StepCustomizer, StepOperation,
};
pub use vanilla::{vanilla_pipeline, ToolSetup, VanillaOptions};
