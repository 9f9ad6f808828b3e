//! External tool execution.
//!
//! Tools are executable jars run by a JVM. The java binary is resolved in
//! this order:
//! 1. `JAVA_HOME` env var (`$JAVA_HOME/bin/java`)
//! 2. System PATH (`which java`)

pub mod libraries;

pub use libraries::LibraryManager;

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::RuntimeError;

const STDERR_TAIL_LINES: usize = 20;

/// One run of an external tool.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Label used in logs and errors.
    pub tool: String,
    pub jar: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub jvm_args: Vec<String>,
    pub program_args: Vec<String>,
    pub working_dir: PathBuf,
}

pub trait ToolExecutor: Send + Sync + fmt::Debug {
    fn execute(&self, invocation: &ToolInvocation) -> Result<()>;
}

/// Runs tools with a local JVM.
#[derive(Debug, Clone)]
pub struct JavaToolExecutor {
    java: PathBuf,
}

impl JavaToolExecutor {
    pub fn with_binary(java: PathBuf) -> Self {
        Self { java }
    }

    pub fn java(&self) -> &Path {
        &self.java
    }

    /// Find a java binary using the resolution order.
    pub fn locate() -> Result<Self> {
        if let Ok(home) = env::var("JAVA_HOME") {
            let candidate = Path::new(&home).join("bin").join("java");
            if candidate.is_file() {
                return Ok(Self::with_binary(candidate));
            }
            bail!(RuntimeError::configuration(format!(
                "JAVA_HOME points to '{}' but {} does not exist",
                home,
                candidate.display()
            )));
        }

        if let Ok(path) = which::which("java") {
            return Ok(Self::with_binary(path));
        }

        bail!(RuntimeError::configuration(
            "Could not find a java binary.\n\n\
             Resolution order tried:\n\
             1. JAVA_HOME env var - not set\n\
             2. System PATH - not found\n\n\
             Set JAVA_HOME or install a JDK to PATH"
        ))
    }

    fn command(&self, invocation: &ToolInvocation) -> Command {
        let mut cmd = Command::new(&self.java);
        cmd.args(&invocation.jvm_args);
        if invocation.classpath.is_empty() {
            cmd.arg("-jar").arg(&invocation.jar);
        } else {
            let mut entries = vec![invocation.jar.clone()];
            entries.extend(invocation.classpath.iter().cloned());
            let joined = env::join_paths(entries).unwrap_or_default();
            cmd.arg("-cp").arg(joined);
        }
        cmd.args(&invocation.program_args)
            .current_dir(&invocation.working_dir);
        cmd
    }
}

impl ToolExecutor for JavaToolExecutor {
    fn execute(&self, invocation: &ToolInvocation) -> Result<()> {
        std::fs::create_dir_all(&invocation.working_dir).with_context(|| {
            format!(
                "creating tool working dir '{}'",
                invocation.working_dir.display()
            )
        })?;

        info!(tool = %invocation.tool, jar = %invocation.jar.display(), "running tool");
        debug!(jvm_args = ?invocation.jvm_args, program_args = ?invocation.program_args);

        let output = self
            .command(invocation)
            .output()
            .with_context(|| format!("Failed to execute {}", self.java.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(RuntimeError::ToolExecution {
                tool: invocation.tool.clone(),
                code: output.status.code(),
                detail: tail,
            }
            .into());
        }

        debug!(
            tool = %invocation.tool,
            stdout_bytes = output.stdout.len(),
            "tool finished"
        );
        Ok(())
    }
}

/// Expand `{name}` placeholders. An unknown placeholder is a configuration
/// error; `{{` and `}}` are literal braces.
pub fn render_template(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            bail!(RuntimeError::configuration(format!(
                "unbalanced '}}' in argument '{template}'"
            )));
        }
        let Some(end) = tail.find('}') else {
            bail!(RuntimeError::configuration(format!(
                "unterminated placeholder in argument '{template}'"
            )));
        };
        let key = &tail[1..end];
        let value = values.get(key).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "unknown placeholder '{{{key}}}' in argument '{template}'"
            ))
        })?;
        out.push_str(value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render every argument against path-valued placeholders.
pub fn render_arguments(
    templates: &[String],
    paths: &BTreeMap<String, PathBuf>,
) -> Result<Vec<String>> {
    let values: BTreeMap<String, String> = paths
        .iter()
        .map(|(k, v)| (k.clone(), v.display().to_string()))
        .collect();
    templates
        .iter()
        .map(|t| render_template(t, &values))
        .collect()
}
