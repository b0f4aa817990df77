#![forbid(unsafe_code)]

use crate::error::{OrchestratorError, Result};
use crate::lifecycle::JobLifecycle;
use crate::pool::{PoolLifecycle, Teardown};
use calc_core::RegistryError;
use calc_core::ids::CalcId;
use calc_core::model::{DistributionMode, JobStatus, TerminalStatus};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(100);

/// A job running outside the launcher's own control flow.
pub trait JobTask: Send {
    fn calc_id(&self) -> CalcId;
    /// `Some(true)` once the task exited cleanly, `Some(false)` if it failed.
    fn try_wait(&mut self) -> Result<Option<bool>>;
    /// Asks the task to stop; it still has to be joined.
    fn terminate(&mut self);
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, calc_id: CalcId) -> Result<Box<dyn JobTask>>;
}

/// Starts each array member as `<program> exec-job CALC_ID`.
pub struct ProcessSpawner {
    program: PathBuf,
    env: Vec<(&'static str, String)>,
}

impl ProcessSpawner {
    pub fn new(program: impl AsRef<Path>, env: Vec<(&'static str, String)>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            env,
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe(env: Vec<(&'static str, String)>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, env))
    }
}

struct ProcessTask {
    calc_id: CalcId,
    child: Child,
}

impl JobTask for ProcessTask {
    fn calc_id(&self) -> CalcId {
        self.calc_id
    }

    fn try_wait(&mut self) -> Result<Option<bool>> {
        Ok(self.child.try_wait()?.map(|status| status.success()))
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            warn!(calc_id = %self.calc_id, "failed to signal job process: {err}");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.kill();
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, calc_id: CalcId) -> Result<Box<dyn JobTask>> {
        let child = Command::new(&self.program)
            .arg("exec-job")
            .arg(calc_id.to_string())
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                OrchestratorError::Spawn(format!(
                    "{} exec-job {calc_id}: {e}",
                    self.program.display()
                ))
            })?;
        Ok(Box::new(ProcessTask { calc_id, child }))
    }
}

/// Terminal status of every job of a batch, in submission order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub jobs: Vec<(CalcId, JobStatus)>,
}

impl BatchReport {
    pub fn status(&self, calc_id: CalcId) -> Option<JobStatus> {
        self.jobs
            .iter()
            .find(|(id, _)| *id == calc_id)
            .map(|(_, status)| *status)
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|(_, status)| *status != JobStatus::Complete)
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 { 0 } else { 1 }
    }
}

/// Runs a batch either as an array of job processes or as a sequential chain.
pub struct Launcher {
    lifecycle: Arc<JobLifecycle>,
    pool: Arc<PoolLifecycle>,
    spawner: Arc<dyn Spawner>,
    stagger: Duration,
    join_poll: Duration,
}

impl Launcher {
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        pool: Arc<PoolLifecycle>,
        spawner: Arc<dyn Spawner>,
        stagger: Duration,
    ) -> Self {
        Self {
            lifecycle,
            pool,
            spawner,
            stagger,
            join_poll: JOIN_POLL,
        }
    }

    pub fn with_join_poll(mut self, join_poll: Duration) -> Self {
        self.join_poll = join_poll;
        self
    }

    /// Runs every job of the batch to a terminal status.
    ///
    /// Normal completion stops the worker pool; an error or cancellation kills it before
    /// the error is returned.
    pub fn run_jobs(&self, calc_ids: &[CalcId], array: bool) -> Result<BatchReport> {
        if calc_ids.is_empty() {
            return Ok(BatchReport::default());
        }
        if array && calc_ids.len() > 1 && self.pool.mode() != DistributionMode::None {
            self.run_array(calc_ids)
        } else {
            self.run_sequential(calc_ids)
        }
    }

    fn abort_all(&self, calc_ids: &[CalcId]) {
        for &calc_id in calc_ids {
            self.lifecycle.finish_quietly(calc_id, TerminalStatus::Aborted);
        }
    }

    fn fail_batch(&self, err: OrchestratorError) -> Result<BatchReport> {
        self.pool.teardown(Teardown::Kill);
        Err(err)
    }

    fn report(&self, calc_ids: &[CalcId]) -> Result<BatchReport> {
        let registry = self.lifecycle.registry();
        let mut jobs = Vec::with_capacity(calc_ids.len());
        for &calc_id in calc_ids {
            let job = registry
                .get(calc_id)?
                .ok_or(RegistryError::UnknownJob(calc_id))?;
            jobs.push((calc_id, job.status));
        }
        Ok(BatchReport { jobs })
    }

    fn run_sequential(&self, calc_ids: &[CalcId]) -> Result<BatchReport> {
        // The whole chain holds its place in the queue while earlier links run.
        if let Err(err) = self.lifecycle.claim(calc_ids) {
            self.abort_all(calc_ids);
            return self.fail_batch(err);
        }
        let mut pool_checked = false;
        for (i, &calc_id) in calc_ids.iter().enumerate() {
            if let Err(err) = self.lifecycle.admit(&[calc_id]) {
                self.lifecycle.finish_quietly(calc_id, TerminalStatus::Aborted);
                if err.cancellation().is_some() {
                    self.abort_all(&calc_ids[i + 1..]);
                    return self.fail_batch(err);
                }
                warn!(calc_id = %calc_id, "admission failed, job aborted: {err}");
                continue;
            }
            if !pool_checked {
                if let Err(err) = self.pool.ensure_started() {
                    self.abort_all(&calc_ids[i..]);
                    return self.fail_batch(err);
                }
                pool_checked = true;
            }
            if let Err(err) = self.lifecycle.run_calc(calc_id) {
                // Finishing is a no-op for a job that already reached a terminal status.
                self.abort_all(&calc_ids[i..]);
                return self.fail_batch(err);
            }
        }

        let report = self.report(calc_ids)?;
        self.pool.teardown(Teardown::Stop);
        Ok(report)
    }

    fn run_array(&self, calc_ids: &[CalcId]) -> Result<BatchReport> {
        let cancel = self.lifecycle.cancel().clone();

        // Members share one admission slot, decided by the first id.
        if let Err(err) = self.lifecycle.admit(calc_ids) {
            self.abort_all(calc_ids);
            if err.cancellation().is_some() {
                return self.fail_batch(err);
            }
            warn!(calc_id = %calc_ids[0], "admission failed, job array aborted: {err}");
            return self.report(calc_ids);
        }
        if let Err(err) = self.pool.ensure_started() {
            self.abort_all(calc_ids);
            return self.fail_batch(err);
        }

        let mut tasks = Vec::with_capacity(calc_ids.len());
        let mut spawn_failed = false;
        for (i, &calc_id) in calc_ids.iter().enumerate() {
            // Stagger starts so the members do not hit the registry all at once.
            if i > 0 && cancel.sleep(self.stagger).is_err() {
                break;
            }
            match self.spawner.spawn(calc_id) {
                Ok(task) => {
                    info!(calc_id = %calc_id, "started job process");
                    tasks.push(task);
                }
                Err(err) => {
                    error!(calc_id = %calc_id, "could not start job process: {err}");
                    self.lifecycle.finish_quietly(calc_id, TerminalStatus::Failed);
                    spawn_failed = true;
                }
            }
        }

        self.join(tasks);
        self.reconcile(calc_ids);

        let report = self.report(calc_ids)?;
        if let Some(signal) = cancel.signal() {
            return self.fail_batch(OrchestratorError::Cancelled(signal));
        }
        let teardown = if spawn_failed || report.failed() > 0 {
            Teardown::Kill
        } else {
            Teardown::Stop
        };
        self.pool.teardown(teardown);
        Ok(report)
    }

    /// Waits for every task; forwards a cancellation to the ones still running.
    fn join(&self, mut tasks: Vec<Box<dyn JobTask>>) {
        let cancel = self.lifecycle.cancel();
        let mut forwarded = false;
        while !tasks.is_empty() {
            if !forwarded && cancel.is_cancelled() {
                for task in tasks.iter_mut() {
                    task.terminate();
                }
                forwarded = true;
            }
            tasks.retain_mut(|task| match task.try_wait() {
                Ok(Some(true)) => false,
                Ok(Some(false)) => {
                    warn!(calc_id = %task.calc_id(), "job process exited with an error");
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    warn!(calc_id = %task.calc_id(), "lost track of job process: {err}");
                    task.terminate();
                    false
                }
            });
            if !tasks.is_empty() {
                std::thread::sleep(self.join_poll);
            }
        }
    }

    /// Members whose process died without recording a terminal status.
    fn reconcile(&self, calc_ids: &[CalcId]) {
        let cancelled = self.lifecycle.cancel().is_cancelled();
        for &calc_id in calc_ids {
            let status = match self.lifecycle.registry().get(calc_id) {
                Ok(Some(job)) => job.status,
                Ok(None) => continue,
                Err(err) => {
                    warn!(calc_id = %calc_id, "could not check job status: {err}");
                    continue;
                }
            };
            if status.is_terminal() {
                continue;
            }
            let outcome = if cancelled && status != JobStatus::Executing {
                TerminalStatus::Aborted
            } else {
                TerminalStatus::Failed
            };
            warn!(calc_id = %calc_id, %status, "job did not finish, marking it {:?}", outcome);
            self.lifecycle.finish_quietly(calc_id, outcome);
        }
    }
}
