#![forbid(unsafe_code)]

use calc_core::ids::CalcId;
use calc_core::model::DistributionMode;
use calc_core::{JobRegistry, RegistryError};
use calc_runner::admission::AdmissionController;
use calc_runner::cancellation::CancellationSubsystem;
use calc_runner::config::OrchestratorConfig;
use calc_runner::engine::CommandEngine;
use calc_runner::launcher::{Launcher, ProcessSpawner};
use calc_runner::lifecycle::{CreateOptions, JobDescriptor, JobLifecycle, create_jobs};
use calc_runner::negotiator::{ConcurrencyBudget, Negotiator, TASKS_PER_CORE};
use calc_runner::pool::{CtlPool, LocalPool, PoolLifecycle, WorkerPool};
use calc_runner::resource_guard::{MeminfoProbe, ResourceGuard};
use calc_runner::{OrchestratorError, Result, logging};
use calc_storage::SqliteStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Runs calculation jobs with admission control over a shared job registry.
#[derive(Parser, Debug)]
#[command(name = "calc_runner", version)]
struct Cli {
    /// Registry directory (CALC_STORAGE_DIR).
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,
    /// Batches allowed in flight; 0 means unlimited (CALC_SERIALIZE_JOBS).
    #[arg(long, global = true, allow_negative_numbers = true)]
    serialize_jobs: Option<i64>,
    /// none | local | remote (CALC_DISTRIBUTION).
    #[arg(long, global = true, value_parser = parse_mode)]
    distribution: Option<DistributionMode>,
    /// Admission poll interval in seconds (CALC_POLL_INTERVAL_S).
    #[arg(long, global = true)]
    poll_interval: Option<f64>,
    /// Memory utilization percent that holds jobs back (CALC_MEMORY_THRESHOLD).
    #[arg(long, global = true)]
    memory_threshold: Option<f64>,
    /// Give up waiting for memory after this many seconds (CALC_MEMORY_WAIT_LIMIT_S).
    #[arg(long, global = true)]
    memory_wait_limit: Option<f64>,
    /// Remote pool control executable (CALC_POOL_CTL).
    #[arg(long, global = true)]
    pool_ctl: Option<PathBuf>,
    #[arg(long, global = true)]
    num_cores: Option<usize>,
    /// Also write logs to DIR/calc_runner.log (CALC_LOG_DIR).
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create jobs from JSON descriptors and run them as one batch.
    Run {
        /// Run the jobs in parallel as independent processes sharing one admission slot.
        #[arg(long)]
        array: bool,
        #[arg(long, value_parser = parse_calc_id)]
        parent: Option<CalcId>,
        /// Log file recorded on every job of the batch.
        #[arg(long)]
        log_file: Option<String>,
        #[arg(required = true)]
        jobs: Vec<PathBuf>,
    },
    /// Run one already created job in this process.
    #[command(hide = true)]
    ExecJob {
        #[arg(value_parser = parse_calc_id)]
        calc_id: CalcId,
    },
    /// List recent jobs.
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn parse_mode(raw: &str) -> std::result::Result<DistributionMode, String> {
    DistributionMode::parse(raw).ok_or_else(|| format!("unknown distribution mode: {raw}"))
}

fn parse_calc_id(raw: &str) -> std::result::Result<CalcId, String> {
    CalcId::parse(raw).map_err(|e| e.to_string())
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| OrchestratorError::Config(format!("--{flag}: invalid duration {value}")))
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut cfg = OrchestratorConfig::from_env()?;
    if let Some(v) = &cli.storage_dir {
        cfg.storage_dir = v.clone();
    }
    if let Some(v) = cli.serialize_jobs {
        cfg.serialize_jobs = v;
    }
    if let Some(v) = cli.distribution {
        cfg.distribution_mode = v;
    }
    if let Some(v) = cli.poll_interval {
        cfg.poll_interval = seconds("poll-interval", v)?;
    }
    if let Some(v) = cli.memory_threshold {
        cfg.memory_threshold_percent = v;
    }
    if let Some(v) = cli.memory_wait_limit {
        cfg.memory_wait_limit = Some(seconds("memory-wait-limit", v)?);
    }
    if let Some(v) = &cli.pool_ctl {
        cfg.pool_ctl = Some(v.clone());
    }
    if let Some(v) = cli.num_cores {
        cfg.num_cores = v;
    }
    if let Some(v) = &cli.log_dir {
        cfg.log_dir = Some(v.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn open_registry(cfg: &OrchestratorConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&cfg.storage_dir).map_err(RegistryError::from)?;
    Ok(Arc::new(store))
}

struct Runtime {
    lifecycle: Arc<JobLifecycle>,
    pool: Arc<PoolLifecycle>,
    signals: Arc<CancellationSubsystem>,
}

/// Wires the orchestrator. `owns_pool` is false for job processes started by a launcher.
fn build_runtime(cfg: &OrchestratorConfig, owns_pool: bool) -> Result<Runtime> {
    let registry: Arc<dyn JobRegistry> = open_registry(cfg)?;
    let mode = cfg.distribution_mode;

    let pool: Arc<dyn WorkerPool> = match mode {
        DistributionMode::RemotePool => {
            let ctl = cfg.pool_ctl.as_ref().ok_or_else(|| {
                OrchestratorError::Config("remote distribution needs --pool-ctl".to_string())
            })?;
            Arc::new(CtlPool::new(ctl))
        }
        DistributionMode::None | DistributionMode::LocalPool => {
            Arc::new(LocalPool::new(cfg.num_cores))
        }
    };
    let pool_lifecycle = Arc::new(if owns_pool {
        PoolLifecycle::new(Arc::clone(&pool), mode, cfg.serialize_jobs)
    } else {
        PoolLifecycle::borrowed(Arc::clone(&pool), mode)
    });

    let signals = CancellationSubsystem::new(Arc::clone(&pool_lifecycle));
    signals.install()?;
    let cancel = signals.token();

    let pid = std::process::id();
    let admission = AdmissionController::new(
        Arc::clone(&registry),
        cfg.admission_offset(),
        cfg.poll_interval,
        pid,
    );
    let guard = ResourceGuard::new(
        Arc::new(MeminfoProbe),
        cfg.memory_threshold_percent,
        cfg.memory_poll_interval,
        cfg.memory_wait_limit,
    );
    let negotiator = Negotiator::new(
        mode,
        pool,
        cfg.num_cores,
        ConcurrencyBudget::new(cfg.num_cores * TASKS_PER_CORE),
    );
    let engine = Arc::new(CommandEngine::new(cfg.storage_dir.join("outputs")));

    let lifecycle = JobLifecycle::new(registry, admission, guard, negotiator, engine, cancel);
    Ok(Runtime {
        lifecycle: Arc::new(lifecycle.with_pid(pid)),
        pool: pool_lifecycle,
        signals,
    })
}

fn read_descriptors(paths: &[PathBuf]) -> Result<Vec<JobDescriptor>> {
    paths
        .iter()
        .map(|path| {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| {
                OrchestratorError::Config(format!("{}: invalid job file: {e}", path.display()))
            })
        })
        .collect()
}

fn run(cli: Cli, cfg: OrchestratorConfig) -> Result<i32> {
    match cli.command {
        Cmd::Status { limit } => {
            let store = open_registry(&cfg)?;
            let jobs = store.jobs_recent(limit).map_err(RegistryError::from)?;
            for job in jobs {
                println!("{} | {} | {}", job.calc_id, job.status, job.description);
            }
            Ok(0)
        }
        Cmd::ExecJob { calc_id } => {
            let rt = build_runtime(&cfg, false)?;
            let result = rt.lifecycle.run_calc(calc_id);
            rt.signals.teardown();
            result.map(|_| 0)
        }
        Cmd::Run {
            array,
            parent,
            log_file,
            jobs,
        } => {
            let descriptors = read_descriptors(&jobs)?;
            let rt = build_runtime(&cfg, true)?;
            let options = CreateOptions {
                parent_id: parent,
                array,
                log_file,
            };
            let calc_ids = create_jobs(&**rt.lifecycle.registry(), descriptors, &options)?;
            let spawner = Arc::new(ProcessSpawner::current_exe(cfg.env_pairs())?);
            let launcher = Launcher::new(
                Arc::clone(&rt.lifecycle),
                Arc::clone(&rt.pool),
                spawner,
                cfg.array_stagger,
            );

            let result = launcher.run_jobs(&calc_ids, array);
            rt.signals.teardown();
            let report = result?;
            for (calc_id, status) in &report.jobs {
                println!("{calc_id} | {status}");
            }
            Ok(report.exit_code())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let _logging = match logging::init_logging(cfg.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("logging: {err}");
            return ExitCode::from(2);
        }
    };

    let code = match run(cli, cfg) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}
