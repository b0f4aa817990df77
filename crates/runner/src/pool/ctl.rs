#![forbid(unsafe_code)]

use super::{WorkerHost, WorkerPool, WorkerStatus};
use crate::error::{OrchestratorError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

const STDERR_SNIPPET_CHARS: usize = 400;

/// Remote pool driven through an external control executable.
///
/// `<ctl> workers` prints `[[host, running, total], ...]`, `<ctl> status` prints
/// `[[host, status], ...]`; `start`, `stop` and `kill` only report through their exit code.
#[derive(Clone, Debug)]
pub struct CtlPool {
    program: PathBuf,
}

impl CtlPool {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    fn run(&self, subcommand: &str) -> Result<String> {
        debug!(program = %self.program.display(), subcommand, "pool control");
        let output = Command::new(&self.program)
            .arg(subcommand)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                OrchestratorError::Pool(format!(
                    "failed to run {} {subcommand}: {e}",
                    self.program.display()
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet = stderr.trim().chars().take(STDERR_SNIPPET_CHARS).collect::<String>();
            return Err(OrchestratorError::Pool(format!(
                "{subcommand} failed ({}): {snippet}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_workers(raw: &str) -> Result<Vec<WorkerHost>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(String, usize, usize)> = serde_json::from_str(raw)
        .map_err(|e| OrchestratorError::Pool(format!("parse workers json failed: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|(host, running, total)| WorkerHost {
            host,
            running,
            total,
        })
        .collect())
}

fn parse_status(raw: &str) -> Result<Vec<WorkerStatus>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(String, String)> = serde_json::from_str(raw)
        .map_err(|e| OrchestratorError::Pool(format!("parse status json failed: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|(host, status)| WorkerStatus { host, status })
        .collect())
}

impl WorkerPool for CtlPool {
    fn list_live_workers(&self) -> Result<Vec<WorkerHost>> {
        parse_workers(&self.run("workers")?)
    }

    fn start_pool(&self) -> Result<()> {
        self.run("start").map(|_| ())
    }

    fn stop_pool(&self) -> Result<()> {
        self.run("stop").map(|_| ())
    }

    fn kill_pool(&self) -> Result<()> {
        self.run("kill").map(|_| ())
    }

    fn pool_status(&self) -> Result<Vec<WorkerStatus>> {
        parse_status(&self.run("status")?)
    }
}
