#![forbid(unsafe_code)]

mod ctl;
mod local;

pub use ctl::CtlPool;
pub use local::LocalPool;

use crate::error::Result;
use calc_core::model::DistributionMode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// One compute node as reported by the pool backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerHost {
    pub host: String,
    pub running: usize,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerStatus {
    pub host: String,
    pub status: String,
}

/// Control surface of a worker pool backend.
pub trait WorkerPool: Send + Sync {
    fn list_live_workers(&self) -> Result<Vec<WorkerHost>>;
    fn start_pool(&self) -> Result<()>;
    /// Graceful shutdown: workers finish what they hold.
    fn stop_pool(&self) -> Result<()>;
    /// Forceful shutdown.
    fn kill_pool(&self) -> Result<()>;
    fn pool_status(&self) -> Result<Vec<WorkerStatus>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    Stop,
    Kill,
}

/// Start/stop bookkeeping for the pool a batch runs on.
///
/// Teardown is issued at most once per batch, whichever of the launcher and the
/// cancellation handler gets there first.
pub struct PoolLifecycle {
    pool: Arc<dyn WorkerPool>,
    mode: DistributionMode,
    serialize_jobs: i64,
    owner: bool,
    torn_down: AtomicBool,
}

impl PoolLifecycle {
    pub fn new(pool: Arc<dyn WorkerPool>, mode: DistributionMode, serialize_jobs: i64) -> Self {
        Self {
            pool,
            mode,
            serialize_jobs,
            owner: true,
            torn_down: AtomicBool::new(false),
        }
    }

    /// A lifecycle that never tears the pool down, for job processes started by a launcher
    /// that owns the pool.
    pub fn borrowed(pool: Arc<dyn WorkerPool>, mode: DistributionMode) -> Self {
        Self {
            owner: false,
            ..Self::new(pool, mode, 0)
        }
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    pub fn mode(&self) -> DistributionMode {
        self.mode
    }

    /// Batches running concurrently share the remote pool; only a serialized batch may
    /// shut it down.
    fn manages_teardown(&self) -> bool {
        self.owner && self.mode == DistributionMode::RemotePool && self.serialize_jobs <= 1
    }

    /// Starts the remote pool when it reports no workers at all. Returns whether a start
    /// was requested.
    pub fn ensure_started(&self) -> Result<bool> {
        if self.mode != DistributionMode::RemotePool || !self.owner {
            return Ok(false);
        }
        if !self.pool.pool_status()?.is_empty() {
            return Ok(false);
        }
        info!("starting the worker pool");
        self.pool.start_pool()?;
        Ok(true)
    }

    /// Returns true only for the call that actually issued the teardown.
    pub fn teardown(&self, kind: Teardown) -> bool {
        if !self.manages_teardown() {
            return false;
        }
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        let result = match kind {
            Teardown::Stop => self.pool.stop_pool(),
            Teardown::Kill => self.pool.kill_pool(),
        };
        if let Err(err) = result {
            warn!(?kind, "worker pool teardown failed: {err}");
        }
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}
