#![forbid(unsafe_code)]

use crate::error::{OrchestratorError, Result};
use crate::pool::WorkerPool;
use calc_core::JobRegistry;
use calc_core::ids::CalcId;
use calc_core::model::{DistributionMode, TerminalStatus, WorkerPoolState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

/// Tasks kept in flight per available core.
pub const TASKS_PER_CORE: usize = 2;

/// Concurrency target shared with the computation engine.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyBudget(Arc<AtomicUsize>);

impl ConcurrencyBudget {
    pub fn new(initial: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(initial)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, target: usize) {
        self.0.store(target, Ordering::SeqCst);
    }
}

/// Sizes a job's concurrency from the worker fleet right before it executes.
pub struct Negotiator {
    mode: DistributionMode,
    pool: Arc<dyn WorkerPool>,
    local_cores: usize,
    budget: ConcurrencyBudget,
}

impl Negotiator {
    pub fn new(
        mode: DistributionMode,
        pool: Arc<dyn WorkerPool>,
        local_cores: usize,
        budget: ConcurrencyBudget,
    ) -> Self {
        Self {
            mode,
            pool,
            local_cores: local_cores.max(1),
            budget,
        }
    }

    pub fn budget(&self) -> &ConcurrencyBudget {
        &self.budget
    }

    /// Queries capacity and publishes the concurrency target. With no capacity at all the
    /// job is finished as failed and `NoCapacity` is returned.
    pub fn negotiate(&self, calc_id: CalcId, registry: &dyn JobRegistry) -> Result<WorkerPoolState> {
        let local_target = self.local_cores * TASKS_PER_CORE;
        let state = match self.mode {
            DistributionMode::None => WorkerPoolState {
                num_workers: 0,
                concurrency_target: local_target,
                distribution_mode: self.mode,
            },
            DistributionMode::LocalPool => WorkerPoolState {
                num_workers: self.local_cores,
                concurrency_target: local_target,
                distribution_mode: self.mode,
            },
            DistributionMode::RemotePool => {
                let hosts = self.pool.list_live_workers()?;
                let num_workers = hosts.iter().map(|h| h.total).sum::<usize>();
                if num_workers == 0 {
                    error!(calc_id = %calc_id, "No live compute nodes, aborting calculation");
                    registry.finish(calc_id, TerminalStatus::Failed)?;
                    return Err(OrchestratorError::NoCapacity { calc_id });
                }
                WorkerPoolState {
                    num_workers,
                    concurrency_target: num_workers * TASKS_PER_CORE,
                    distribution_mode: self.mode,
                }
            }
        };
        info!(
            calc_id = %calc_id,
            mode = %state.distribution_mode,
            "Using {} cores, {} concurrent tasks",
            state.num_workers,
            state.concurrency_target
        );
        self.budget.set(state.concurrency_target);
        Ok(state)
    }
}
