#![forbid(unsafe_code)]

use crate::error::{OrchestratorError, Result};
use calc_core::model::DistributionMode;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STORE_DIRNAME: &str = "calcdata";

const ENV_STORAGE_DIR: &str = "CALC_STORAGE_DIR";
const ENV_SERIALIZE_JOBS: &str = "CALC_SERIALIZE_JOBS";
const ENV_DISTRIBUTION: &str = "CALC_DISTRIBUTION";
const ENV_POLL_INTERVAL: &str = "CALC_POLL_INTERVAL_S";
const ENV_MEMORY_POLL: &str = "CALC_MEMORY_POLL_S";
const ENV_MEMORY_THRESHOLD: &str = "CALC_MEMORY_THRESHOLD";
const ENV_MEMORY_WAIT_LIMIT: &str = "CALC_MEMORY_WAIT_LIMIT_S";
const ENV_ARRAY_STAGGER: &str = "CALC_ARRAY_STAGGER_S";
const ENV_POOL_CTL: &str = "CALC_POOL_CTL";
const ENV_NUM_CORES: &str = "CALC_NUM_CORES";
const ENV_LOG_DIR: &str = "CALC_LOG_DIR";

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub storage_dir: PathBuf,
    /// Maximum number of batches in flight; 0 or less means unlimited.
    pub serialize_jobs: i64,
    pub distribution_mode: DistributionMode,
    pub poll_interval: Duration,
    pub memory_poll_interval: Duration,
    pub memory_threshold_percent: f64,
    /// None waits for memory forever.
    pub memory_wait_limit: Option<Duration>,
    pub array_stagger: Duration,
    pub pool_ctl: Option<PathBuf>,
    pub num_cores: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            serialize_jobs: 0,
            distribution_mode: DistributionMode::None,
            poll_interval: Duration::from_secs(15),
            memory_poll_interval: Duration::from_secs(5),
            memory_threshold_percent: 80.0,
            memory_wait_limit: None,
            array_stagger: Duration::from_secs(2),
            pool_ctl: None,
            num_cores: default_num_cores(),
            log_dir: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_storage_dir() -> PathBuf {
    match env_var("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_STORE_DIRNAME),
        None => PathBuf::from(format!(".{DEFAULT_STORE_DIRNAME}")),
    }
}

fn default_num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_seconds(name: &str, raw: &str) -> Result<Duration> {
    let secs = raw
        .parse::<f64>()
        .map_err(|_| OrchestratorError::Config(format!("{name}: not a number: {raw}")))?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        OrchestratorError::Config(format!(
            "{name}: must be a non-negative number of seconds (got {raw})"
        ))
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| OrchestratorError::Config(format!("{name}: not a number: {raw}")))
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_var)
    }

    /// Builds the configuration from `CALC_*` variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_STORAGE_DIR) {
            cfg.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_SERIALIZE_JOBS) {
            cfg.serialize_jobs = parse_number(ENV_SERIALIZE_JOBS, &v)?;
        }
        if let Some(v) = lookup(ENV_DISTRIBUTION) {
            cfg.distribution_mode = DistributionMode::parse(&v).ok_or_else(|| {
                OrchestratorError::Config(format!("{ENV_DISTRIBUTION}: unknown mode: {v}"))
            })?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL) {
            cfg.poll_interval = parse_seconds(ENV_POLL_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_POLL) {
            cfg.memory_poll_interval = parse_seconds(ENV_MEMORY_POLL, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_THRESHOLD) {
            cfg.memory_threshold_percent = parse_number(ENV_MEMORY_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_WAIT_LIMIT) {
            cfg.memory_wait_limit = Some(parse_seconds(ENV_MEMORY_WAIT_LIMIT, &v)?);
        }
        if let Some(v) = lookup(ENV_ARRAY_STAGGER) {
            cfg.array_stagger = parse_seconds(ENV_ARRAY_STAGGER, &v)?;
        }
        if let Some(v) = lookup(ENV_POOL_CTL) {
            cfg.pool_ctl = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(ENV_NUM_CORES) {
            cfg.num_cores = parse_number(ENV_NUM_CORES, &v)?;
        }
        if let Some(v) = lookup(ENV_LOG_DIR) {
            cfg.log_dir = Some(PathBuf::from(v));
        }
        Ok(cfg)
    }

    /// The same configuration as environment pairs, for job processes spawned by this one.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (ENV_STORAGE_DIR, self.storage_dir.display().to_string()),
            (ENV_SERIALIZE_JOBS, self.serialize_jobs.to_string()),
            (ENV_DISTRIBUTION, self.distribution_mode.as_str().to_string()),
            (ENV_POLL_INTERVAL, self.poll_interval.as_secs_f64().to_string()),
            (
                ENV_MEMORY_POLL,
                self.memory_poll_interval.as_secs_f64().to_string(),
            ),
            (ENV_MEMORY_THRESHOLD, self.memory_threshold_percent.to_string()),
            (ENV_ARRAY_STAGGER, self.array_stagger.as_secs_f64().to_string()),
            (ENV_NUM_CORES, self.num_cores.to_string()),
        ];
        if let Some(limit) = self.memory_wait_limit {
            pairs.push((ENV_MEMORY_WAIT_LIMIT, limit.as_secs_f64().to_string()));
        }
        if let Some(ctl) = &self.pool_ctl {
            pairs.push((ENV_POOL_CTL, ctl.display().to_string()));
        }
        if let Some(dir) = &self.log_dir {
            pairs.push((ENV_LOG_DIR, dir.display().to_string()));
        }
        pairs
    }

    /// Admission offset; negative disables admission control entirely.
    pub fn admission_offset(&self) -> i64 {
        self.serialize_jobs.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.memory_threshold_percent;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
            return Err(OrchestratorError::Config(format!(
                "memory threshold must be in (0, 100] (got {threshold})"
            )));
        }
        if self.num_cores == 0 {
            return Err(OrchestratorError::Config(
                "num_cores must be at least 1".to_string(),
            ));
        }
        if self.distribution_mode == DistributionMode::RemotePool && self.pool_ctl.is_none() {
            return Err(OrchestratorError::Config(
                "remote distribution needs a pool control command (CALC_POOL_CTL)".to_string(),
            ));
        }
        Ok(())
    }
}
