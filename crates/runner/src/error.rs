#![forbid(unsafe_code)]

use calc_core::RegistryError;
use calc_core::ids::CalcId;
use calc_core::model::CancellationSignal;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("job registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("no live compute nodes, aborting calculation {calc_id}")]
    NoCapacity { calc_id: CalcId },

    #[error("{}", cancelled_message(.0))]
    Cancelled(CancellationSignal),

    #[error("calculation {calc_id} failed: {reason}")]
    ComputationFailure { calc_id: CalcId, reason: String },

    #[error("calculation {calc_id} gave up waiting for free memory after {}s", .waited.as_secs())]
    ResourceTimeout { calc_id: CalcId, waited: Duration },

    #[error("worker pool: {0}")]
    Pool(String),

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("spawn failed: {0}")]
    Spawn(String),
}

fn cancelled_message(signal: &CancellationSignal) -> &'static str {
    match signal {
        CancellationSignal::Interrupted => "the master process was killed manually",
        CancellationSignal::Terminated => "the master process was terminated",
        CancellationSignal::ControllingTerminalLost => {
            "the master process lost its controlling terminal"
        }
    }
}

impl OrchestratorError {
    pub fn cancellation(&self) -> Option<CancellationSignal> {
        match self {
            Self::Cancelled(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Process exit code for a batch that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoCapacity { .. } | Self::ComputationFailure { .. } => 1,
            Self::Cancelled(signal) => signal.exit_code(),
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
