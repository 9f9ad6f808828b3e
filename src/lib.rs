//! Cached, reproducible preparation of Minecraft game runtimes.
//!
//! A runtime is described by a [`RuntimeSpecification`] (artifact, game
//! version, distribution side, plus adapters and customizers) and realized
//! by a [`StepPipeline`]: an ordered list of steps whose outputs are stored
//! in a fingerprint-keyed [`ContentAddressedCache`]. Re-running an unchanged
//! pipeline only copies cached outputs back into the workspace.
//!
//! - **Cache** - Content-addressed blobs, fingerprint index, per-key locking
//! - **Jars** - Indexing, manifest handling and client/server extra-jar split
//! - **Mappings** - Official mapping tables and naming channels
//! - **Runtime** - Specifications, steps, pipeline assembly and execution
//! - **Tools** - External JVM tools with resolved classpaths
//! - **Preflight checks** - Host tool validation before a run
//!
//! # Architecture
//!
//! ```text
//! runtime.toml ──> config::RuntimeConfig
//!     │
//!     ├── specification() ──> RuntimeSpecification
//!     └── vanilla_options() ─> mappings + renamer + decompiler (deferred)
//!
//! runtime::vanilla_pipeline
//!     │
//!     ├── downloadManifest ─> extractClient / extractServer
//!     ├── generateExtraJar  (jar::merge, mapping::MappingTable)
//!     ├── rename            (tool::ToolExecutor, official mappings)
//!     └── decompile         (tool::ToolExecutor, reads rename output)
//!
//! StepPipeline::execute
//!     │
//!     ├── Fingerprint per step (cache::fingerprint)
//!     ├── ContentAddressedCache::cached  (hit: copy, miss: produce)
//!     └── RunRecord under <workspace>/<runtime>/runs/<run_id>
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mc_runtime::cache::ContentAddressedCache;
//! use mc_runtime::runtime::{vanilla_pipeline, ExecutionContext, VanillaOptions};
//! use mc_runtime::RuntimeSpecification;
//!
//! let spec = RuntimeSpecification::builder()
//!     .minecraft_version("1.20.4")
//!     .build()?;
//! let pipeline = vanilla_pipeline(spec, &VanillaOptions::new("versions".into()))?;
//! let ctx = ExecutionContext::new(ContentAddressedCache::open_default()?, "build".into());
//! let run = pipeline.execute(&ctx)?;
//! println!("extra jar: {:?}", run.output("generateExtraJar"));
//! ```

pub mod cache;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod jar;
pub mod mapping;
pub mod preflight;
pub mod resolve;
pub mod runtime;
pub mod tool;

pub use cache::{ContentAddressedCache, Fingerprint};
pub use coordinate::Coordinate;
pub use error::{ErrorKind, RuntimeError};
pub use runtime::{DistributionType, RuntimeSpecification, StepPipeline};
