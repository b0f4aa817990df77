#![forbid(unsafe_code)]

use crate::cancellation::CancelToken;
use crate::error::{OrchestratorError, Result};
use calc_core::ids::CalcId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Host memory utilization in percent.
pub trait MemoryProbe: Send + Sync {
    fn used_percent(&self) -> f64;
}

/// Reads `/proc/meminfo`. Reports 0% where the file is unavailable.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeminfoProbe;

impl MemoryProbe for MeminfoProbe {
    fn used_percent(&self) -> f64 {
        std::fs::read_to_string(MEMINFO_PATH)
            .ok()
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or(0.0)
    }
}

fn meminfo_kib(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

pub fn parse_meminfo(text: &str) -> Option<f64> {
    let total = meminfo_kib(text, "MemTotal")?;
    let available = meminfo_kib(text, "MemAvailable")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 * 100.0 / total as f64)
}

/// Holds a job back while host memory is above the threshold.
pub struct ResourceGuard {
    probe: Arc<dyn MemoryProbe>,
    threshold_percent: f64,
    poll_interval: Duration,
    wait_limit: Option<Duration>,
}

impl ResourceGuard {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        threshold_percent: f64,
        poll_interval: Duration,
        wait_limit: Option<Duration>,
    ) -> Self {
        Self {
            probe,
            threshold_percent,
            poll_interval,
            wait_limit,
        }
    }

    /// Returns once utilization is below the threshold.
    pub fn wait_for_memory(&self, calc_id: CalcId, cancel: &CancelToken) -> Result<()> {
        let started = Instant::now();
        loop {
            cancel.check()?;
            let used = self.probe.used_percent();
            if used < self.threshold_percent {
                return Ok(());
            }
            let waited = started.elapsed();
            if let Some(limit) = self.wait_limit
                && waited >= limit
            {
                return Err(OrchestratorError::ResourceTimeout { calc_id, waited });
            }
            info!(calc_id = %calc_id, "Using over {used:.0}% of the memory, waiting");
            cancel.sleep(self.poll_interval)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SAMPLE: &str = "MemTotal:       16000000 kB\n\
                          MemFree:         1000000 kB\n\
                          MemAvailable:    4000000 kB\n\
                          Buffers:          200000 kB\n";

    struct FixedProbe(Mutex<Vec<f64>>);

    impl MemoryProbe for FixedProbe {
        fn used_percent(&self) -> f64 {
            let mut readings = self.0.lock().unwrap_or_else(|p| p.into_inner());
            if readings.len() > 1 {
                readings.remove(0)
            } else {
                readings.first().copied().unwrap_or(0.0)
            }
        }
    }

    #[test]
    fn meminfo_utilization_uses_available_memory() {
        let used = parse_meminfo(SAMPLE).expect("parse");
        assert!((used - 75.0).abs() < 1e-9);
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn guard_gives_up_after_wait_limit() {
        let guard = ResourceGuard::new(
            Arc::new(FixedProbe(Mutex::new(vec![95.0]))),
            80.0,
            Duration::from_millis(5),
            Some(Duration::from_millis(20)),
        );
        let err = guard
            .wait_for_memory(CalcId::from(1), &CancelToken::new())
            .expect_err("timeout");
        assert!(matches!(err, OrchestratorError::ResourceTimeout { .. }));
    }

    #[test]
    fn guard_passes_when_memory_drops() {
        let guard = ResourceGuard::new(
            Arc::new(FixedProbe(Mutex::new(vec![90.0, 85.0, 40.0]))),
            80.0,
            Duration::from_millis(1),
            None,
        );
        guard
            .wait_for_memory(CalcId::from(1), &CancelToken::new())
            .expect("admitted");
    }
}
