//! Per-tool classpath memo.
//!
//! Resolving a tool's libraries walks the local repositories once per tool
//! coordinate; later lookups (from any thread) reuse the result. Lookups for
//! different tools do not block each other.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::coordinate::Coordinate;
use crate::resolve::ArtifactResolver;

/// A resolved library on a tool's classpath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub coordinate: Coordinate,
    pub path: PathBuf,
}

type Slot<T> = Arc<OnceCell<Arc<T>>>;

#[derive(Debug, Default)]
pub struct LibraryManager {
    classpaths: Mutex<HashMap<String, Slot<BTreeSet<String>>>>,
    libraries: Mutex<HashMap<String, Slot<Vec<Library>>>>,
}

impl LibraryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinate strings (`group:name:version[:classifier]@ext`) of the
    /// tool and its dependencies.
    pub fn classpath_of(
        &self,
        tool: &Coordinate,
        dependencies: &[Coordinate],
    ) -> Result<Arc<BTreeSet<String>>> {
        let slot = slot_for(&self.classpaths, tool);
        let ids = slot.get_or_try_init(|| -> Result<_> {
            let ids = std::iter::once(tool)
                .chain(dependencies)
                .map(Coordinate::to_string)
                .collect::<BTreeSet<_>>();
            Ok(Arc::new(ids))
        })?;
        Ok(Arc::clone(ids))
    }

    /// Files of the tool and its dependencies, in declaration order.
    pub fn libraries_of(
        &self,
        tool: &Coordinate,
        dependencies: &[Coordinate],
        resolver: &dyn ArtifactResolver,
    ) -> Result<Arc<Vec<Library>>> {
        let slot = slot_for(&self.libraries, tool);
        let libs = slot.get_or_try_init(|| -> Result<_> {
            debug!(%tool, dependencies = dependencies.len(), "resolving tool libraries");
            let mut out = Vec::with_capacity(dependencies.len() + 1);
            for coordinate in std::iter::once(tool).chain(dependencies) {
                let path = resolver
                    .resolve(coordinate)
                    .with_context(|| format!("Failed to resolve classpath of tool {tool}"))?;
                out.push(Library {
                    coordinate: coordinate.clone(),
                    path,
                });
            }
            Ok(Arc::new(out))
        })?;
        Ok(Arc::clone(libs))
    }

    pub fn cached_tools(&self) -> usize {
        self.libraries.lock().len()
    }
}

/// Map lock is held only long enough to fetch or insert the slot.
fn slot_for<T>(map: &Mutex<HashMap<String, Slot<T>>>, tool: &Coordinate) -> Slot<T> {
    map.lock().entry(tool.to_string()).or_default().clone()
}
