//! Immutable description of a runtime: which game version and side to build,
//! plus the adapters and customizers that reshape its pipeline.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use super::step::{StepAdapter, StepCustomizer};
use crate::error::RuntimeError;
use crate::jar::Dist;

/// Version token meaning "no particular version".
pub const UNSPECIFIED_VERSION: &str = "+";

const DEFAULT_ARTIFACT: &str = "client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionType {
    #[default]
    Client,
    Server,
    Joined,
}

impl DistributionType {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributionType::Client => "client",
            DistributionType::Server => "server",
            DistributionType::Joined => "joined",
        }
    }

    /// The jar whose resources and bytecode drive this side's outputs.
    pub fn primary_dist(self) -> Dist {
        match self {
            DistributionType::Server => Dist::Server,
            DistributionType::Client | DistributionType::Joined => Dist::Client,
        }
    }
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionType {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(DistributionType::Client),
            "server" => Ok(DistributionType::Server),
            "joined" => Ok(DistributionType::Joined),
            other => Err(RuntimeError::configuration(format!(
                "unsupported side '{other}' (expected 'client', 'server' or 'joined')"
            ))
            .into()),
        }
    }
}

/// What to build. Two specifications are equal when they would build the
/// same artifacts; adapters and customizers do not take part.
#[derive(Clone)]
pub struct RuntimeSpecification {
    name: String,
    version: String,
    side: DistributionType,
    minecraft_version: String,
    pre_adapters: Vec<(String, Arc<dyn StepAdapter>)>,
    post_adapters: Vec<(String, Arc<dyn StepAdapter>)>,
    customizers: Vec<(String, Arc<dyn StepCustomizer>)>,
}

impl RuntimeSpecification {
    pub fn builder() -> RuntimeSpecificationBuilder {
        RuntimeSpecificationBuilder::default()
    }

    /// The published artifact this runtime is built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalised version; empty when unspecified.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn side(&self) -> DistributionType {
        self.side
    }

    /// The version exactly as requested.
    pub fn minecraft_version(&self) -> &str {
        &self.minecraft_version
    }

    pub fn pre_adapters(&self) -> &[(String, Arc<dyn StepAdapter>)] {
        &self.pre_adapters
    }

    pub fn post_adapters(&self) -> &[(String, Arc<dyn StepAdapter>)] {
        &self.post_adapters
    }

    pub fn customizers(&self) -> &[(String, Arc<dyn StepCustomizer>)] {
        &self.customizers
    }

    /// Filesystem-safe identifier, used for the workspace directory.
    pub fn identifier(&self) -> String {
        let version = if self.version.is_empty() {
            "unspecified"
        } else {
            &self.version
        };
        format!("{}-{}-{}", self.name, version, self.side)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Identity text folded into every step fingerprint.
    pub fn fingerprint_context(&self) -> String {
        format!(
            "runtime={};version={};side={};minecraft={}",
            self.name, self.version, self.side, self.minecraft_version
        )
    }
}

impl PartialEq for RuntimeSpecification {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.side == other.side
            && self.minecraft_version == other.minecraft_version
    }
}

impl Eq for RuntimeSpecification {}

impl Hash for RuntimeSpecification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
        self.side.hash(state);
        self.minecraft_version.hash(state);
    }
}

impl fmt::Debug for RuntimeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeSpecification")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("side", &self.side)
            .field("minecraft_version", &self.minecraft_version)
            .field("pre_adapters", &anchors(&self.pre_adapters))
            .field("post_adapters", &anchors(&self.post_adapters))
            .field("customizers", &anchors(&self.customizers))
            .finish()
    }
}

fn anchors<T>(items: &[(String, T)]) -> Vec<&str> {
    items.iter().map(|(name, _)| name.as_str()).collect()
}

pub struct RuntimeSpecificationBuilder {
    artifact: Option<String>,
    minecraft_version: Option<String>,
    side: DistributionType,
    pre_adapters: Vec<(String, Arc<dyn StepAdapter>)>,
    post_adapters: Vec<(String, Arc<dyn StepAdapter>)>,
    customizers: Vec<(String, Arc<dyn StepCustomizer>)>,
}

impl Default for RuntimeSpecificationBuilder {
    fn default() -> Self {
        Self {
            artifact: Some(DEFAULT_ARTIFACT.to_string()),
            minecraft_version: None,
            side: DistributionType::Client,
            pre_adapters: Vec::new(),
            post_adapters: Vec::new(),
            customizers: Vec::new(),
        }
    }
}

impl RuntimeSpecificationBuilder {
    pub fn minecraft_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn minecraft_version(mut self, version: impl Into<String>) -> Self {
        self.minecraft_version = Some(version.into());
        self
    }

    pub fn side(mut self, side: DistributionType) -> Self {
        self.side = side;
        self
    }

    /// Insert a step before `anchor`. Several adapters on one anchor keep
    /// their registration order.
    pub fn pre_adapter(
        mut self,
        anchor: impl Into<String>,
        adapter: impl StepAdapter + 'static,
    ) -> Self {
        self.pre_adapters.push((anchor.into(), Arc::new(adapter)));
        self
    }

    pub fn post_adapter(
        mut self,
        anchor: impl Into<String>,
        adapter: impl StepAdapter + 'static,
    ) -> Self {
        self.post_adapters.push((anchor.into(), Arc::new(adapter)));
        self
    }

    pub fn customizer(
        mut self,
        step: impl Into<String>,
        customizer: impl StepCustomizer + 'static,
    ) -> Self {
        self.customizers.push((step.into(), Arc::new(customizer)));
        self
    }

    pub fn build(self) -> Result<RuntimeSpecification> {
        let name = self
            .artifact
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| RuntimeError::configuration("runtime needs a minecraft artifact"))?;
        let minecraft_version = self
            .minecraft_version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| RuntimeError::configuration("runtime needs a minecraft version"))?;
        let version = if minecraft_version == UNSPECIFIED_VERSION {
            String::new()
        } else {
            minecraft_version.clone()
        };

        Ok(RuntimeSpecification {
            name,
            version,
            side: self.side,
            minecraft_version,
            pre_adapters: self.pre_adapters,
            post_adapters: self.post_adapters,
            customizers: self.customizers,
        })
    }
}
