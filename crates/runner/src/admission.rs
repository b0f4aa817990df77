#![forbid(unsafe_code)]

use crate::cancellation::CancelToken;
use crate::error::Result;
use calc_core::JobRegistry;
use calc_core::ids::CalcId;
use calc_core::model::{JobFilter, JobStatus, JobUpdate};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Limits how many batches run at once by polling the registry.
///
/// A job waits while any job with an owning process is `submitted` or `executing` and has
/// an id below `calc_id - offset`.
pub struct AdmissionController {
    registry: Arc<dyn JobRegistry>,
    offset: i64,
    poll_interval: Duration,
    pid: u32,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        offset: i64,
        poll_interval: Duration,
        pid: u32,
    ) -> Self {
        Self {
            registry,
            offset,
            poll_interval,
            pid,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Records this process as the owner of every still-`created` job, which makes them
    /// count as in flight for later batches. Jobs claimed earlier keep their record as is.
    pub fn claim(&self, calc_ids: &[CalcId]) -> Result<()> {
        for &calc_id in calc_ids {
            let created = self
                .registry
                .get(calc_id)?
                .is_some_and(|job| job.status == JobStatus::Created);
            if created {
                self.registry
                    .update(calc_id, JobUpdate::status(JobStatus::Submitted, self.pid))?;
            }
        }
        Ok(())
    }

    /// Blocks until the batch headed by `calc_ids[0]` may run.
    ///
    /// Every id in `calc_ids` shares the slot. The batch is claimed before the queue is
    /// read, so it keeps the slot from here until its jobs reach a terminal status.
    pub fn admit(&self, calc_ids: &[CalcId], cancel: &CancelToken) -> Result<()> {
        let Some(&leader) = calc_ids.first() else {
            return Ok(());
        };
        cancel.check()?;
        self.claim(calc_ids)?;
        if self.offset < 0 {
            return Ok(());
        }
        let filter = JobFilter::in_flight_below(leader.window_floor(self.offset));
        let mut first_wait = true;
        loop {
            cancel.check()?;
            let blocking = self.registry.query(&filter)?;
            if blocking.is_empty() {
                return Ok(());
            }
            if first_wait {
                let ids = blocking
                    .iter()
                    .map(|job| job.calc_id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(calc_id = %leader, "Waiting for jobs [{ids}]");
                first_wait = false;
            }
            cancel.sleep(self.poll_interval)?;
        }
    }
}
