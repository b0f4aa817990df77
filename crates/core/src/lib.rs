#![forbid(unsafe_code)]

pub mod registry;

pub use registry::{JobRegistry, RegistryError};

pub mod ids {
    /// Identity of a calculation, assigned by the registry in increasing order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CalcId(u64);

    impl CalcId {
        pub fn get(self) -> u64 {
            self.0
        }

        pub fn try_new(value: i64) -> Result<Self, CalcIdError> {
            if value <= 0 {
                return Err(CalcIdError::NotPositive(value));
            }
            Ok(Self(value as u64))
        }

        pub fn parse(raw: &str) -> Result<Self, CalcIdError> {
            let raw = raw.trim();
            let value = raw
                .parse::<i64>()
                .map_err(|_| CalcIdError::NotANumber(raw.to_string()))?;
            Self::try_new(value)
        }

        /// Admission threshold: jobs with an id strictly below this value are in the window.
        /// Saturates at zero, which excludes every job.
        pub fn window_floor(self, offset: i64) -> u64 {
            if offset <= 0 {
                return self.0;
            }
            self.0.saturating_sub(offset as u64)
        }

        pub fn as_i64(self) -> i64 {
            self.0.min(i64::MAX as u64) as i64
        }
    }

    impl From<u64> for CalcId {
        fn from(value: u64) -> Self {
            Self(value)
        }
    }

    impl std::fmt::Display for CalcId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum CalcIdError {
        NotPositive(i64),
        NotANumber(String),
    }

    impl std::fmt::Display for CalcIdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::NotPositive(value) => write!(f, "calc id must be positive (got {value})"),
                Self::NotANumber(raw) => write!(f, "calc id is not a number: {raw}"),
            }
        }
    }

    impl std::error::Error for CalcIdError {}
}

pub mod model {
    use crate::ids::CalcId;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum JobStatus {
        Created,
        Submitted,
        Executing,
        Complete,
        Failed,
        Aborted,
    }

    impl JobStatus {
        pub const ACTIVE: [JobStatus; 2] = [JobStatus::Executing, JobStatus::Submitted];

        pub fn as_str(self) -> &'static str {
            match self {
                JobStatus::Created => "created",
                JobStatus::Submitted => "submitted",
                JobStatus::Executing => "executing",
                JobStatus::Complete => "complete",
                JobStatus::Failed => "failed",
                JobStatus::Aborted => "aborted",
            }
        }

        pub fn parse(raw: &str) -> Option<Self> {
            match raw.trim().to_ascii_lowercase().as_str() {
                "created" => Some(JobStatus::Created),
                "submitted" => Some(JobStatus::Submitted),
                "executing" => Some(JobStatus::Executing),
                "complete" => Some(JobStatus::Complete),
                "failed" => Some(JobStatus::Failed),
                "aborted" => Some(JobStatus::Aborted),
                _ => None,
            }
        }

        pub fn is_terminal(self) -> bool {
            matches!(
                self,
                JobStatus::Complete | JobStatus::Failed | JobStatus::Aborted
            )
        }

        pub fn is_active(self) -> bool {
            matches!(self, JobStatus::Submitted | JobStatus::Executing)
        }

        fn rank(self) -> u8 {
            match self {
                JobStatus::Created => 0,
                JobStatus::Submitted => 1,
                JobStatus::Executing => 2,
                JobStatus::Complete | JobStatus::Failed | JobStatus::Aborted => 3,
            }
        }

        /// One-way state machine: a status may only move strictly forward.
        /// `aborted` is reachable only from states that never executed.
        pub fn can_advance_to(self, next: JobStatus) -> bool {
            if self.is_terminal() {
                return false;
            }
            if next == JobStatus::Aborted {
                return matches!(self, JobStatus::Created | JobStatus::Submitted);
            }
            next.rank() > self.rank()
        }
    }

    impl std::fmt::Display for JobStatus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TerminalStatus {
        Complete,
        Failed,
        Aborted,
    }

    impl TerminalStatus {
        pub fn status(self) -> JobStatus {
            match self {
                TerminalStatus::Complete => JobStatus::Complete,
                TerminalStatus::Failed => JobStatus::Failed,
                TerminalStatus::Aborted => JobStatus::Aborted,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct Job {
        pub calc_id: CalcId,
        pub status: JobStatus,
        /// Owning OS process; 0 until the job is submitted or executing.
        pub pid: u32,
        pub parent_id: Option<CalcId>,
        pub is_array_member: bool,
        pub description: String,
        /// Raw parameter set, opaque to the orchestrator.
        pub params_json: String,
        pub log_file: Option<String>,
        pub created_at_ms: i64,
        pub updated_at_ms: i64,
        pub completed_at_ms: Option<i64>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct NewJob {
        pub description: String,
        pub params_json: String,
        pub parent_id: Option<CalcId>,
        pub is_array_member: bool,
        pub log_file: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct JobUpdate {
        pub status: Option<JobStatus>,
        pub pid: Option<u32>,
    }

    impl JobUpdate {
        pub fn status(status: JobStatus, pid: u32) -> Self {
            Self {
                status: Some(status),
                pid: Some(pid),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.status.is_none() && self.pid.is_none()
        }
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct JobFilter {
        /// Empty means any status.
        pub statuses: Vec<JobStatus>,
        /// Only jobs whose id is strictly below this value.
        pub id_below: Option<u64>,
        /// Only jobs owned by a process (`pid > 0`).
        pub require_pid: bool,
        pub limit: Option<usize>,
    }

    impl JobFilter {
        /// Jobs occupying an admission slot below `floor`.
        pub fn in_flight_below(floor: u64) -> Self {
            Self {
                statuses: JobStatus::ACTIVE.to_vec(),
                id_below: Some(floor),
                require_pid: true,
                limit: None,
            }
        }

        pub fn matches(&self, job: &Job) -> bool {
            if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
                return false;
            }
            if let Some(floor) = self.id_below
                && job.calc_id.get() >= floor
            {
                return false;
            }
            if self.require_pid && job.pid == 0 {
                return false;
            }
            true
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct OutputRecord {
        pub key: String,
        pub size_mb: f64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum DistributionMode {
        None,
        LocalPool,
        RemotePool,
    }

    impl DistributionMode {
        pub fn as_str(self) -> &'static str {
            match self {
                DistributionMode::None => "none",
                DistributionMode::LocalPool => "local",
                DistributionMode::RemotePool => "remote",
            }
        }

        pub fn parse(raw: &str) -> Option<Self> {
            match raw.trim().to_ascii_lowercase().as_str() {
                "none" | "no" => Some(DistributionMode::None),
                "local" | "processpool" => Some(DistributionMode::LocalPool),
                "remote" | "zmq" => Some(DistributionMode::RemotePool),
                _ => None,
            }
        }

        pub fn is_trivial(self) -> bool {
            !matches!(self, DistributionMode::RemotePool)
        }
    }

    impl std::fmt::Display for DistributionMode {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Observed capacity of the worker fleet. Never persisted.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WorkerPoolState {
        pub num_workers: usize,
        pub concurrency_target: usize,
        pub distribution_mode: DistributionMode,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum CancellationSignal {
        Interrupted,
        Terminated,
        ControllingTerminalLost,
    }

    impl CancellationSignal {
        pub fn as_str(self) -> &'static str {
            match self {
                CancellationSignal::Interrupted => "interrupted",
                CancellationSignal::Terminated => "terminated",
                CancellationSignal::ControllingTerminalLost => "controlling terminal lost",
            }
        }

        /// "Killed manually" as opposed to a termination request.
        pub fn is_manual_kill(self) -> bool {
            !matches!(self, CancellationSignal::Terminated)
        }

        pub fn exit_code(self) -> i32 {
            match self {
                CancellationSignal::Interrupted => 130,
                CancellationSignal::Terminated => 143,
                CancellationSignal::ControllingTerminalLost => 129,
            }
        }
    }

    impl std::fmt::Display for CancellationSignal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }
}
