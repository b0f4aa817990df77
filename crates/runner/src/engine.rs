#![forbid(unsafe_code)]

use crate::cancellation::CancelToken;
use crate::negotiator::ConcurrencyBudget;
use calc_core::model::{Job, OutputRecord, WorkerPoolState};
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// What a successful computation produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Artifact {
    pub outputs: Vec<OutputRecord>,
    pub datastore_size_mb: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success(Artifact),
    Failure(String),
}

pub struct EngineContext<'a> {
    pub pool: WorkerPoolState,
    pub budget: &'a ConcurrencyBudget,
    pub cancel: &'a CancelToken,
}

/// Runs one job to completion. Called exactly once per executing job.
pub trait ComputationEngine: Send + Sync {
    fn run(&self, job: &Job, ctx: &EngineContext<'_>) -> Outcome;
}

/// Runs the command named by the job's `"command"` parameter.
///
/// The child sees `CALC_ID`, `CALC_CONCURRENT_TASKS` and `CALC_OUTPUT_DIR`; every file it
/// leaves in the output directory becomes an output of the job.
pub struct CommandEngine {
    output_root: PathBuf,
    poll: Duration,
}

impl CommandEngine {
    pub fn new(output_root: impl AsRef<Path>) -> Self {
        Self {
            output_root: output_root.as_ref().to_path_buf(),
            poll: Duration::from_millis(250),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.output_root.join(format!("calc_{}", job.calc_id))
    }

    fn spawn(&self, job: &Job, argv: &[String], ctx: &EngineContext<'_>) -> Result<Child, String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "job command is empty".to_string())?;
        let output_dir = self.output_dir(job);
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| format!("failed to create output dir: {e}"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("CALC_ID", job.calc_id.to_string())
            .env("CALC_CONCURRENT_TASKS", ctx.budget.get().to_string())
            .env("CALC_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null());
        match job.log_file.as_deref().filter(|p| !p.is_empty()) {
            Some(log_file) => {
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_file)
                    .map_err(|e| format!("failed to open log file {log_file}: {e}"))?;
                let log_err = log
                    .try_clone()
                    .map_err(|e| format!("failed to open log file {log_file}: {e}"))?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::inherit());
            }
        }
        command
            .spawn()
            .map_err(|e| format!("failed to spawn {program}: {e}"))
    }

    /// Polls the child until it exits; kills it if the batch is cancelled meanwhile.
    fn wait(&self, child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus, String> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(format!("wait failed: {e}")),
            }
            if cancel.sleep(self.poll).is_err() {
                let _ = child.kill();
                let _ = child.wait();
                return Err("cancelled".to_string());
            }
        }
    }
}

fn command_argv(params_json: &str) -> Result<Vec<String>, String> {
    let params: Value =
        serde_json::from_str(params_json).map_err(|e| format!("job params are not json: {e}"))?;
    match params.get("command") {
        Some(Value::String(program)) => Ok(vec![program.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Ok(other.to_string()),
            })
            .collect(),
        Some(_) => Err("job command must be a string or a list".to_string()),
        None => Err("job params have no command".to_string()),
    }
}

fn collect_outputs(dir: &Path) -> std::io::Result<Artifact> {
    let mut outputs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        outputs.push(OutputRecord {
            key: entry.file_name().to_string_lossy().into_owned(),
            size_mb: meta.len() as f64 / BYTES_PER_MB,
        });
    }
    outputs.sort_by(|a, b| a.key.cmp(&b.key));
    let datastore_size_mb = outputs.iter().map(|o| o.size_mb).sum();
    Ok(Artifact {
        outputs,
        datastore_size_mb,
    })
}

impl ComputationEngine for CommandEngine {
    fn run(&self, job: &Job, ctx: &EngineContext<'_>) -> Outcome {
        let argv = match command_argv(&job.params_json) {
            Ok(argv) => argv,
            Err(reason) => return Outcome::Failure(reason),
        };
        debug!(calc_id = %job.calc_id, ?argv, "running job command");
        let mut child = match self.spawn(job, &argv, ctx) {
            Ok(child) => child,
            Err(reason) => return Outcome::Failure(reason),
        };
        let status = match self.wait(&mut child, ctx.cancel) {
            Ok(status) => status,
            Err(reason) => return Outcome::Failure(reason),
        };
        if !status.success() {
            return Outcome::Failure(match status.code() {
                Some(code) => format!("command exited with code {code}"),
                None => "command was killed by a signal".to_string(),
            });
        }
        match collect_outputs(&self.output_dir(job)) {
            Ok(artifact) => Outcome::Success(artifact),
            Err(e) => {
                warn!(calc_id = %job.calc_id, "could not list outputs: {e}");
                Outcome::Success(Artifact::default())
            }
        }
    }
}
