//! Coordinate to file resolution.

use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::coordinate::Coordinate;
use crate::error::RuntimeError;

pub trait ArtifactResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, coordinate: &Coordinate) -> Result<PathBuf>;
}

/// Looks coordinates up in local maven-layout repositories, first hit wins.
#[derive(Debug, Clone, Default)]
pub struct LocalRepositoryResolver {
    roots: Vec<PathBuf>,
}

impl LocalRepositoryResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl ArtifactResolver for LocalRepositoryResolver {
    fn resolve(&self, coordinate: &Coordinate) -> Result<PathBuf> {
        let relative = coordinate.repository_path();
        for root in &self.roots {
            let candidate = root.join(&relative);
            if candidate.is_file() {
                debug!(%coordinate, path = %candidate.display(), "resolved artifact");
                return Ok(candidate);
            }
        }
        let searched = self
            .roots
            .iter()
            .map(|r| format!("  {}", r.join(&relative).display()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(RuntimeError::missing(format!(
            "artifact {coordinate} not found; searched:\n{searched}"
        ))
        .into())
    }
}
