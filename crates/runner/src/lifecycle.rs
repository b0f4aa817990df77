#![forbid(unsafe_code)]

use crate::admission::AdmissionController;
use crate::cancellation::CancelToken;
use crate::engine::{Artifact, ComputationEngine, EngineContext, Outcome};
use crate::error::{OrchestratorError, Result};
use crate::negotiator::Negotiator;
use crate::resource_guard::ResourceGuard;
use calc_core::ids::CalcId;
use calc_core::model::{Job, JobStatus, JobUpdate, NewJob, TerminalStatus, WorkerPoolState};
use calc_core::{JobRegistry, RegistryError};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

const SENSITIVITY_KEY: &str = "sensitivity_analysis";

/// One submitted calculation, as read from a job file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct JobDescriptor {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub parent_id: Option<CalcId>,
    pub array: bool,
    pub log_file: Option<String>,
}

fn value_as_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expands a `sensitivity_analysis` block into one descriptor per combination of values.
pub fn expand_sensitivity(descriptor: JobDescriptor) -> Vec<JobDescriptor> {
    let Some(Value::Object(axes)) = descriptor.params.get(SENSITIVITY_KEY).cloned() else {
        return vec![descriptor];
    };
    let mut base = descriptor;
    base.params.remove(SENSITIVITY_KEY);

    let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
    for (name, values) in &axes {
        let values = match values {
            Value::Array(items) => items.clone(),
            single => vec![single.clone()],
        };
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in &values {
                let mut extended = combo.clone();
                extended.push((name.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }

    combos
        .into_iter()
        .map(|combo| {
            let mut job = base.clone();
            let suffix = combo
                .iter()
                .map(|(name, value)| format!("{name}={}", value_as_param(value)))
                .collect::<Vec<_>>()
                .join(", ");
            for (name, value) in combo {
                job.params.insert(name, Value::String(value_as_param(&value)));
            }
            job.description = format!("{} ({suffix})", base.description.trim());
            job
        })
        .collect()
}

/// Creates one registry record per (expanded) descriptor, in submission order.
///
/// Without an explicit parent, the first job of a sequential batch of several descriptors
/// becomes the parent of the others.
pub fn create_jobs(
    registry: &dyn JobRegistry,
    descriptors: Vec<JobDescriptor>,
    options: &CreateOptions,
) -> Result<Vec<CalcId>> {
    let chain_to_first = options.parent_id.is_none() && !options.array && descriptors.len() > 1;
    let expanded = descriptors
        .into_iter()
        .flat_map(expand_sensitivity)
        .collect::<Vec<_>>();

    let mut ids = Vec::with_capacity(expanded.len());
    let mut parent_id = options.parent_id;
    for descriptor in expanded {
        let params_json = serde_json::to_string(&descriptor.params)
            .map_err(|e| RegistryError::InvalidInput(format!("job params: {e}")))?;
        let calc_id = registry.create(NewJob {
            description: descriptor.description,
            params_json,
            parent_id,
            is_array_member: options.array,
            log_file: options.log_file.clone(),
        })?;
        if chain_to_first && parent_id.is_none() {
            parent_id = Some(calc_id);
        }
        ids.push(calc_id);
    }
    Ok(ids)
}

/// What a completed job left behind.
#[derive(Clone, Debug, PartialEq)]
pub struct CalcReport {
    pub calc_id: CalcId,
    pub pool: WorkerPoolState,
    pub outputs: Vec<String>,
}

/// Drives one admitted job through guard, negotiation and execution to a terminal status.
pub struct JobLifecycle {
    registry: Arc<dyn JobRegistry>,
    admission: AdmissionController,
    guard: ResourceGuard,
    negotiator: Negotiator,
    engine: Arc<dyn ComputationEngine>,
    cancel: CancelToken,
    pid: u32,
}

impl JobLifecycle {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        admission: AdmissionController,
        guard: ResourceGuard,
        negotiator: Negotiator,
        engine: Arc<dyn ComputationEngine>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            registry,
            admission,
            guard,
            negotiator,
            engine,
            cancel,
            pid: std::process::id(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn admit(&self, calc_ids: &[CalcId]) -> Result<()> {
        self.admission.admit(calc_ids, &self.cancel)
    }

    pub fn claim(&self, calc_ids: &[CalcId]) -> Result<()> {
        self.admission.claim(calc_ids)
    }

    /// Terminal bookkeeping that must not mask the error being reported.
    pub fn finish_quietly(&self, calc_id: CalcId, outcome: TerminalStatus) {
        if let Err(err) = self.registry.finish(calc_id, outcome) {
            warn!(calc_id = %calc_id, ?outcome, "could not record terminal status: {err}");
        }
    }

    fn load(&self, calc_id: CalcId) -> Result<Job> {
        let job = self
            .registry
            .get(calc_id)?
            .ok_or(RegistryError::UnknownJob(calc_id))?;
        if job.status.is_terminal() || job.status == JobStatus::Executing {
            return Err(RegistryError::InvalidTransition {
                calc_id,
                from: job.status,
                to: JobStatus::Executing,
            }
            .into());
        }
        Ok(job)
    }

    /// Runs an already admitted job in this process.
    pub fn run_calc(&self, calc_id: CalcId) -> Result<CalcReport> {
        let job = self.load(calc_id)?;

        let ready = self
            .cancel
            .check()
            .and_then(|_| self.guard.wait_for_memory(calc_id, &self.cancel));
        if let Err(err) = ready {
            self.finish_quietly(calc_id, TerminalStatus::Aborted);
            return Err(err);
        }

        let pool = match self.negotiator.negotiate(calc_id, &*self.registry) {
            Ok(pool) => pool,
            Err(err @ OrchestratorError::NoCapacity { .. }) => return Err(err),
            Err(err) => {
                self.finish_quietly(calc_id, TerminalStatus::Aborted);
                return Err(err);
            }
        };

        if let Err(err) = self
            .registry
            .update(calc_id, JobUpdate::status(JobStatus::Executing, self.pid))
        {
            self.finish_quietly(calc_id, TerminalStatus::Aborted);
            return Err(err.into());
        }
        info!(calc_id = %calc_id, pid = self.pid, "Starting calculation: {}", job.description);

        let ctx = EngineContext {
            pool,
            budget: self.negotiator.budget(),
            cancel: &self.cancel,
        };
        match self.engine.run(&job, &ctx) {
            Outcome::Success(artifact) => match self.complete(&job, &artifact) {
                Ok(outputs) => Ok(CalcReport {
                    calc_id,
                    pool,
                    outputs,
                }),
                Err(err) => {
                    self.finish_quietly(calc_id, TerminalStatus::Failed);
                    Err(err)
                }
            },
            Outcome::Failure(reason) => {
                self.finish_quietly(calc_id, TerminalStatus::Failed);
                if let Some(signal) = self.cancel.signal() {
                    return Err(OrchestratorError::Cancelled(signal));
                }
                error!(calc_id = %calc_id, "Calculation failed: {reason}");
                Err(OrchestratorError::ComputationFailure { calc_id, reason })
            }
        }
    }

    fn complete(&self, job: &Job, artifact: &Artifact) -> Result<Vec<String>> {
        let calc_id = job.calc_id;
        self.registry
            .create_outputs(calc_id, &artifact.outputs, artifact.datastore_size_mb)?;
        self.registry.finish(calc_id, TerminalStatus::Complete)?;

        let outputs = self.registry.list_outputs(calc_id)?;
        for line in &outputs {
            info!(calc_id = %calc_id, "{line}");
        }
        if let Some(log_file) = job.log_file.as_deref()
            && std::fs::metadata(log_file).is_ok_and(|meta| meta.len() == 0)
        {
            warn!(calc_id = %calc_id, "The log file {log_file} is empty!?");
        }
        Ok(outputs)
    }
}
