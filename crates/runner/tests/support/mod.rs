#![forbid(unsafe_code)]
#![allow(dead_code)]

use calc_core::ids::CalcId;
use calc_core::model::{
    DistributionMode, Job, JobFilter, JobStatus, JobUpdate, NewJob, OutputRecord, TerminalStatus,
};
use calc_core::registry::format_output_line;
use calc_core::{JobRegistry, RegistryError};
use calc_runner::admission::AdmissionController;
use calc_runner::cancellation::CancellationSubsystem;
use calc_runner::engine::{Artifact, ComputationEngine, EngineContext, Outcome};
use calc_runner::launcher::{JobTask, Launcher, Spawner};
use calc_runner::lifecycle::JobLifecycle;
use calc_runner::negotiator::{ConcurrencyBudget, Negotiator};
use calc_runner::pool::{PoolLifecycle, WorkerHost, WorkerPool, WorkerStatus};
use calc_runner::resource_guard::{MemoryProbe, ResourceGuard};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) const TEST_PID: u32 = 4242;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) calc_id: CalcId,
    pub(crate) status: JobStatus,
    pub(crate) at: Instant,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    jobs: BTreeMap<CalcId, Job>,
    outputs: BTreeMap<CalcId, Vec<OutputRecord>>,
    transitions: Vec<Transition>,
    unavailable_for: HashSet<JobStatus>,
}

/// In-memory registry that records every status transition in order.
pub(crate) struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                next_id: first_id,
                ..RegistryState::default()
            }),
        })
    }

    /// Writes moving any job to `status` fail as if the store went away.
    pub(crate) fn refuse_updates_to(&self, status: JobStatus) {
        lock(&self.state).unavailable_for.insert(status);
    }

    pub(crate) fn add(&self, description: &str) -> CalcId {
        self.create(NewJob {
            description: description.to_string(),
            params_json: "{}".to_string(),
            ..NewJob::default()
        })
        .expect("create job")
    }

    /// Moves a job straight to `status`, as another process would have done.
    pub(crate) fn force(&self, calc_id: CalcId, status: JobStatus, pid: u32) {
        if status.is_terminal() {
            let outcome = match status {
                JobStatus::Complete => TerminalStatus::Complete,
                JobStatus::Failed => TerminalStatus::Failed,
                _ => TerminalStatus::Aborted,
            };
            self.finish(calc_id, outcome).expect("finish");
        } else {
            self.update(calc_id, JobUpdate::status(status, pid))
                .expect("update");
        }
    }

    pub(crate) fn status(&self, calc_id: CalcId) -> JobStatus {
        lock(&self.state)
            .jobs
            .get(&calc_id)
            .map(|job| job.status)
            .expect("known job")
    }

    pub(crate) fn job(&self, calc_id: CalcId) -> Job {
        lock(&self.state)
            .jobs
            .get(&calc_id)
            .cloned()
            .expect("known job")
    }

    pub(crate) fn transitions(&self) -> Vec<Transition> {
        lock(&self.state).transitions.clone()
    }

    pub(crate) fn transition_to(&self, calc_id: CalcId, status: JobStatus) -> Option<Transition> {
        self.transitions()
            .into_iter()
            .find(|t| t.calc_id == calc_id && t.status == status)
    }

    pub(crate) fn ever_executing(&self) -> bool {
        self.transitions()
            .iter()
            .any(|t| t.status == JobStatus::Executing)
    }

    /// Highest number of jobs that were `executing` at the same time.
    pub(crate) fn max_concurrent_executing(&self) -> usize {
        let mut running = HashSet::new();
        let mut max = 0;
        for t in self.transitions() {
            if t.status == JobStatus::Executing {
                running.insert(t.calc_id);
            } else if t.status.is_terminal() {
                running.remove(&t.calc_id);
            }
            max = max.max(running.len());
        }
        max
    }

    fn set_status(state: &mut RegistryState, calc_id: CalcId, status: JobStatus) {
        if let Some(job) = state.jobs.get_mut(&calc_id) {
            job.status = status;
        }
        state.transitions.push(Transition {
            calc_id,
            status,
            at: Instant::now(),
        });
    }
}

impl JobRegistry for MemoryRegistry {
    fn create(&self, job: NewJob) -> Result<CalcId, RegistryError> {
        let mut state = lock(&self.state);
        if let Some(parent) = job.parent_id
            && !state.jobs.contains_key(&parent)
        {
            return Err(RegistryError::UnknownJob(parent));
        }
        let calc_id = CalcId::from(state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            calc_id,
            Job {
                calc_id,
                status: JobStatus::Created,
                pid: 0,
                parent_id: job.parent_id,
                is_array_member: job.is_array_member,
                description: job.description,
                params_json: job.params_json,
                log_file: job.log_file,
                created_at_ms: 0,
                updated_at_ms: 0,
                completed_at_ms: None,
            },
        );
        Ok(calc_id)
    }

    fn update(&self, calc_id: CalcId, update: JobUpdate) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        let current = state
            .jobs
            .get(&calc_id)
            .map(|job| job.status)
            .ok_or(RegistryError::UnknownJob(calc_id))?;
        if let Some(next) = update.status {
            if state.unavailable_for.contains(&next) {
                return Err(RegistryError::Unavailable("store offline".to_string()));
            }
            if !current.can_advance_to(next) {
                return Err(RegistryError::InvalidTransition {
                    calc_id,
                    from: current,
                    to: next,
                });
            }
            Self::set_status(&mut state, calc_id, next);
        }
        if let Some(pid) = update.pid
            && let Some(job) = state.jobs.get_mut(&calc_id)
        {
            job.pid = pid;
        }
        Ok(())
    }

    fn get(&self, calc_id: CalcId) -> Result<Option<Job>, RegistryError> {
        Ok(lock(&self.state).jobs.get(&calc_id).cloned())
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError> {
        let state = lock(&self.state);
        let mut jobs = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect::<Vec<_>>();
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn finish(&self, calc_id: CalcId, outcome: TerminalStatus) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        let current = state
            .jobs
            .get(&calc_id)
            .map(|job| job.status)
            .ok_or(RegistryError::UnknownJob(calc_id))?;
        if current.is_terminal() {
            return Ok(());
        }
        let next = outcome.status();
        if !current.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                calc_id,
                from: current,
                to: next,
            });
        }
        Self::set_status(&mut state, calc_id, next);
        Ok(())
    }

    fn create_outputs(
        &self,
        calc_id: CalcId,
        outputs: &[OutputRecord],
        _datastore_size_mb: f64,
    ) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if !state.jobs.contains_key(&calc_id) {
            return Err(RegistryError::UnknownJob(calc_id));
        }
        let kept = outputs
            .iter()
            .filter(|o| o.size_mb != 0.0)
            .cloned()
            .collect();
        state.outputs.insert(calc_id, kept);
        Ok(())
    }

    fn list_outputs(&self, calc_id: CalcId) -> Result<Vec<String>, RegistryError> {
        let state = lock(&self.state);
        let mut outputs = state.outputs.get(&calc_id).cloned().unwrap_or_default();
        outputs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(outputs
            .iter()
            .map(|output| format_output_line(calc_id, output))
            .collect())
    }
}

/// Worker pool that counts control calls.
#[derive(Default)]
pub(crate) struct FakePool {
    pub(crate) workers: Mutex<Vec<WorkerHost>>,
    pub(crate) status: Mutex<Vec<WorkerStatus>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    kills: AtomicUsize,
}

impl FakePool {
    pub(crate) fn with_capacity(total: usize) -> Arc<Self> {
        let pool = Self::default();
        if total > 0 {
            *lock(&pool.workers) = vec![WorkerHost {
                host: "node1".to_string(),
                running: 0,
                total,
            }];
            *lock(&pool.status) = vec![WorkerStatus {
                host: "node1".to_string(),
                status: "running".to_string(),
            }];
        }
        Arc::new(pool)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl WorkerPool for FakePool {
    fn list_live_workers(&self) -> calc_runner::Result<Vec<WorkerHost>> {
        Ok(lock(&self.workers).clone())
    }

    fn start_pool(&self) -> calc_runner::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_pool(&self) -> calc_runner::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill_pool(&self) -> calc_runner::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pool_status(&self) -> calc_runner::Result<Vec<WorkerStatus>> {
        Ok(lock(&self.status).clone())
    }
}

/// Memory probe replaying fixed readings; the last one repeats forever.
pub(crate) struct ScriptedProbe {
    readings: Mutex<VecDeque<f64>>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedProbe {
    pub(crate) fn new(readings: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(readings.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Instant> {
        lock(&self.calls).clone()
    }
}

impl MemoryProbe for ScriptedProbe {
    fn used_percent(&self) -> f64 {
        lock(&self.calls).push(Instant::now());
        let mut readings = lock(&self.readings);
        if readings.len() > 1 {
            readings.pop_front().unwrap_or(0.0)
        } else {
            readings.front().copied().unwrap_or(0.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Script {
    Succeed,
    Fail,
    /// Runs until the batch is cancelled.
    BlockUntilCancelled,
}

/// Computation engine following a per-job script.
pub(crate) struct ScriptedEngine {
    scripts: Mutex<HashMap<CalcId, Script>>,
    runs: Mutex<Vec<(CalcId, JobStatus, Instant)>>,
    work: Duration,
    registry: Arc<MemoryRegistry>,
}

impl ScriptedEngine {
    pub(crate) fn new(registry: Arc<MemoryRegistry>, work: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
            work,
            registry,
        })
    }

    pub(crate) fn script(&self, calc_id: CalcId, script: Script) {
        lock(&self.scripts).insert(calc_id, script);
    }

    /// `(calc_id, status seen when invoked, when)` for every run.
    pub(crate) fn runs(&self) -> Vec<(CalcId, JobStatus, Instant)> {
        lock(&self.runs).clone()
    }

    pub(crate) fn run_count(&self, calc_id: CalcId) -> usize {
        self.runs()
            .iter()
            .filter(|(id, _, _)| *id == calc_id)
            .count()
    }
}

impl ComputationEngine for ScriptedEngine {
    fn run(&self, job: &Job, ctx: &EngineContext<'_>) -> Outcome {
        let seen = self.registry.status(job.calc_id);
        lock(&self.runs).push((job.calc_id, seen, Instant::now()));
        let script = lock(&self.scripts)
            .get(&job.calc_id)
            .copied()
            .unwrap_or(Script::Succeed);
        match script {
            Script::Succeed => {
                std::thread::sleep(self.work);
                Outcome::Success(Artifact {
                    outputs: vec![OutputRecord {
                        key: "hcurves".to_string(),
                        size_mb: 0.25,
                    }],
                    datastore_size_mb: 0.25,
                })
            }
            Script::Fail => {
                std::thread::sleep(self.work);
                Outcome::Failure(format!("job {} blew up", job.calc_id))
            }
            Script::BlockUntilCancelled => {
                while ctx.cancel.sleep(Duration::from_millis(5)).is_ok() {}
                Outcome::Failure("cancelled".to_string())
            }
        }
    }
}

struct ThreadTask {
    calc_id: CalcId,
    handle: Option<JoinHandle<bool>>,
}

impl JobTask for ThreadTask {
    fn calc_id(&self) -> CalcId {
        self.calc_id
    }

    fn try_wait(&mut self) -> calc_runner::Result<Option<bool>> {
        let finished = self.handle.as_ref().is_none_or(|h| h.is_finished());
        if !finished {
            return Ok(None);
        }
        Ok(Some(match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(false),
            None => false,
        }))
    }

    fn terminate(&mut self) {}
}

/// Runs array members on threads of the test process.
pub(crate) struct ThreadSpawner {
    pub(crate) lifecycle: Arc<JobLifecycle>,
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, calc_id: CalcId) -> calc_runner::Result<Box<dyn JobTask>> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let handle = std::thread::spawn(move || lifecycle.run_calc(calc_id).is_ok());
        Ok(Box::new(ThreadTask {
            calc_id,
            handle: Some(handle),
        }))
    }
}

pub(crate) struct HarnessOptions {
    pub(crate) mode: DistributionMode,
    pub(crate) serialize_jobs: i64,
    pub(crate) capacity: usize,
    pub(crate) first_id: u64,
    pub(crate) memory: Vec<f64>,
    pub(crate) memory_poll: Duration,
    pub(crate) memory_wait_limit: Option<Duration>,
    pub(crate) work: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            mode: DistributionMode::RemotePool,
            serialize_jobs: 0,
            capacity: 4,
            first_id: 1,
            memory: vec![10.0],
            memory_poll: Duration::from_millis(5),
            memory_wait_limit: None,
            work: Duration::from_millis(5),
        }
    }
}

pub(crate) const POLL: Duration = Duration::from_millis(5);

/// Everything a batch needs, wired with fakes.
pub(crate) struct Harness {
    pub(crate) registry: Arc<MemoryRegistry>,
    pub(crate) pool: Arc<FakePool>,
    pub(crate) pool_lifecycle: Arc<PoolLifecycle>,
    pub(crate) signals: Arc<CancellationSubsystem>,
    pub(crate) probe: Arc<ScriptedProbe>,
    pub(crate) engine: Arc<ScriptedEngine>,
    pub(crate) lifecycle: Arc<JobLifecycle>,
}

impl Harness {
    pub(crate) fn new(options: HarnessOptions) -> Self {
        let registry = MemoryRegistry::starting_at(options.first_id);
        let pool = FakePool::with_capacity(options.capacity);
        let pool_lifecycle = Arc::new(PoolLifecycle::new(
            pool.clone(),
            options.mode,
            options.serialize_jobs,
        ));
        let signals = CancellationSubsystem::new(Arc::clone(&pool_lifecycle));
        let probe = ScriptedProbe::new(&options.memory);
        let engine = ScriptedEngine::new(Arc::clone(&registry), options.work);

        let admission = AdmissionController::new(
            registry.clone(),
            options.serialize_jobs - 1,
            POLL,
            TEST_PID,
        );
        let guard = ResourceGuard::new(
            probe.clone(),
            80.0,
            options.memory_poll,
            options.memory_wait_limit,
        );
        let negotiator = Negotiator::new(options.mode, pool.clone(), 2, ConcurrencyBudget::new(4));
        let lifecycle = JobLifecycle::new(
            registry.clone(),
            admission,
            guard,
            negotiator,
            engine.clone(),
            signals.token(),
        )
        .with_pid(TEST_PID);

        Self {
            registry,
            pool,
            pool_lifecycle,
            signals,
            probe,
            engine,
            lifecycle: Arc::new(lifecycle),
        }
    }

    pub(crate) fn launcher(&self) -> Launcher {
        self.launcher_with(Arc::new(ThreadSpawner {
            lifecycle: Arc::clone(&self.lifecycle),
        }))
    }

    pub(crate) fn launcher_with(&self, spawner: Arc<dyn Spawner>) -> Launcher {
        Launcher::new(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.pool_lifecycle),
            spawner,
            Duration::from_millis(2),
        )
        .with_join_poll(Duration::from_millis(2))
    }

    pub(crate) fn jobs(&self, count: usize) -> Vec<CalcId> {
        (0..count)
            .map(|i| self.registry.add(&format!("job {i}")))
            .collect()
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
