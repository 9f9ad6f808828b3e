//! Deterministic cache keys derived from a step's declared inputs.
//!
//! Input files contribute their content hash only, never their path, so the
//! same jar downloaded into two workspaces yields the same key.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::io::sha256_file;
use crate::error::RuntimeError;

/// Bumped whenever the key layout below changes.
const FINGERPRINT_DOMAIN: &str = "mc-runtime/fingerprint/v1";

/// A hex sha256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn builder(step_name: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(step_name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines and temp names.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulates everything that identifies one execution of a step.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    step_name: String,
    context: Vec<String>,
    params: BTreeMap<String, String>,
    inputs: Vec<(String, String)>,
}

impl FingerprintBuilder {
    fn new(step_name: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            context: Vec::new(),
            params: BTreeMap::new(),
            inputs: Vec::new(),
        }
    }

    /// Free-form key text, e.g. the runtime identity.
    pub fn context(mut self, text: impl Into<String>) -> Self {
        self.context.push(text.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params<'a>(mut self, values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (k, v) in values {
            self.params.insert(k.to_string(), v.to_string());
        }
        self
    }

    /// Hash an input file under a slot name. Missing files are a hard failure.
    pub fn input_file(mut self, slot: impl Into<String>, path: &Path) -> Result<Self> {
        let slot = slot.into();
        if !path.is_file() {
            return Err(RuntimeError::missing(format!(
                "input '{}' for step '{}' not found at {}",
                slot,
                self.step_name,
                path.display()
            ))
            .into());
        }
        let (sha, _size) = sha256_file(path)?;
        self.inputs.push((slot, sha));
        Ok(self)
    }

    /// Record an input whose content hash is already known.
    pub fn input_hash(mut self, slot: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.inputs.push((slot.into(), sha256.into()));
        self
    }

    pub fn build(self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let mut field = |tag: &str, value: &str| {
            // Length-prefixed so that adjacent fields cannot alias.
            hasher.update(tag.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        };

        field("domain", FINGERPRINT_DOMAIN);
        field("step", &self.step_name);
        for ctx in &self.context {
            field("context", ctx);
        }
        for (k, v) in &self.params {
            field("param-key", k);
            field("param-value", v);
        }
        for (slot, sha) in &self.inputs {
            field("input-slot", slot);
            field("input-sha256", sha);
        }

        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}
