//! Preflight checks for runtime pipelines.
//!
//! Validates that the host has the tools a pipeline shells out to before any
//! step runs, so a missing JVM is reported up front instead of halfway
//! through a decompile.
//!
//! # Example
//!
//! ```rust
//! use mc_runtime::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("java") {
//!     println!("no JVM on PATH");
//! }
//!
//! let tools = &[("java", "a JDK, 17 or newer")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::env;
use std::path::Path;

use crate::error::RuntimeError;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed by pipelines with tool steps.
///
/// Each tuple is (command_name, what to install).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("java", "a JDK, 17 or newer")];

/// Check that specific tools are available.
///
/// Returns a configuration error listing every missing tool.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(RuntimeError::configuration(format!(
            "Missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}

/// Check that a JVM is reachable, honouring `JAVA_HOME` first.
pub fn check_host_tools() -> Result<()> {
    if let Ok(home) = env::var("JAVA_HOME") {
        if Path::new(&home).join("bin").join("java").is_file() {
            return Ok(());
        }
    }
    check_required_tools(REQUIRED_TOOLS)
}
