#![forbid(unsafe_code)]

use super::{WorkerHost, WorkerPool, WorkerStatus};
use crate::error::Result;

const LOCAL_HOST: &str = "localhost";

/// In-process pool of the local cores. Nothing to start or stop.
#[derive(Clone, Copy, Debug)]
pub struct LocalPool {
    cores: usize,
}

impl LocalPool {
    pub fn new(cores: usize) -> Self {
        Self { cores }
    }
}

impl WorkerPool for LocalPool {
    fn list_live_workers(&self) -> Result<Vec<WorkerHost>> {
        Ok(vec![WorkerHost {
            host: LOCAL_HOST.to_string(),
            running: 0,
            total: self.cores,
        }])
    }

    fn start_pool(&self) -> Result<()> {
        Ok(())
    }

    fn stop_pool(&self) -> Result<()> {
        Ok(())
    }

    fn kill_pool(&self) -> Result<()> {
        Ok(())
    }

    fn pool_status(&self) -> Result<Vec<WorkerStatus>> {
        Ok(vec![WorkerStatus {
            host: LOCAL_HOST.to_string(),
            status: "running".to_string(),
        }])
    }
}
