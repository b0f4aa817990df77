#![forbid(unsafe_code)]

use crate::ids::CalcId;
use crate::model::{Job, JobFilter, JobStatus, JobUpdate, NewJob, OutputRecord, TerminalStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// The backing store could not be reached or the call failed mid-flight.
    Unavailable(String),
    UnknownJob(CalcId),
    InvalidTransition {
        calc_id: CalcId,
        from: JobStatus,
        to: JobStatus,
    },
    InvalidInput(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "registry unavailable: {message}"),
            Self::UnknownJob(calc_id) => write!(f, "unknown job {calc_id}"),
            Self::InvalidTransition { calc_id, from, to } => {
                write!(f, "job {calc_id}: invalid transition {from} -> {to}")
            }
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Shared job ledger. Every call is a single atomic operation; implementations never retry.
pub trait JobRegistry: Send + Sync {
    fn create(&self, job: NewJob) -> Result<CalcId, RegistryError>;

    /// Partial update. A status change must be a forward move of the job state machine.
    fn update(&self, calc_id: CalcId, update: JobUpdate) -> Result<(), RegistryError>;

    fn get(&self, calc_id: CalcId) -> Result<Option<Job>, RegistryError>;

    /// Matching jobs in ascending id order.
    fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError>;

    /// Sets a terminal status. Finishing an already-terminal job is a no-op.
    fn finish(&self, calc_id: CalcId, outcome: TerminalStatus) -> Result<(), RegistryError>;

    fn create_outputs(
        &self,
        calc_id: CalcId,
        outputs: &[OutputRecord],
        datastore_size_mb: f64,
    ) -> Result<(), RegistryError>;

    /// Human-readable output listing, one line per output.
    fn list_outputs(&self, calc_id: CalcId) -> Result<Vec<String>, RegistryError>;
}

/// Formats one output line the way `list_outputs` reports it.
pub fn format_output_line(calc_id: CalcId, output: &OutputRecord) -> String {
    if output.size_mb < 0.0 {
        return format!("{calc_id} | {} | size unknown", output.key);
    }
    format!("{calc_id} | {} | {:.2} MB", output.key, output.size_mb)
}
