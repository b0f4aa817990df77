#![forbid(unsafe_code)]

use crate::error::{OrchestratorError, Result};
use crate::pool::{PoolLifecycle, Teardown};
use calc_core::model::CancellationSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Default)]
struct CancelState {
    signal: Mutex<Option<CancellationSignal>>,
    wake: Condvar,
}

/// Cooperative cancellation flag shared by everything working on one batch.
///
/// Waits go through [`CancelToken::sleep`] so a cancellation interrupts them immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancellationSignal>> {
        self.state
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `signal` and wakes every waiter. Returns false if the token was already
    /// cancelled; the first signal is kept, waiters are woken again regardless.
    pub fn cancel(&self, signal: CancellationSignal) -> bool {
        let mut current = self.lock();
        let first = current.is_none();
        if first {
            *current = Some(signal);
        }
        self.state.wake.notify_all();
        first
    }

    pub fn signal(&self) -> Option<CancellationSignal> {
        *self.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.signal() {
            Some(signal) => Err(OrchestratorError::Cancelled(signal)),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration` unless cancelled first. A duration past the end of the clock
    /// sleeps until cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(duration);
        let mut current = self.lock();
        loop {
            if let Some(signal) = *current {
                return Err(OrchestratorError::Cancelled(signal));
            }
            current = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    self.state
                        .wake
                        .wait_timeout(current, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .state
                    .wake
                    .wait(current)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }
}

#[cfg(unix)]
struct Listener {
    handle: signal_hook::iterator::Handle,
    thread: std::thread::JoinHandle<()>,
}

/// Turns process signals into a cancellation of the running batch.
///
/// The first signal kills the worker pool and then cancels the token. Later signals are
/// absorbed so the teardown can finish.
pub struct CancellationSubsystem {
    token: CancelToken,
    pool: Arc<PoolLifecycle>,
    startup_ppid: u32,
    triggered: AtomicBool,
    #[cfg(unix)]
    listener: Mutex<Option<Listener>>,
}

#[cfg(unix)]
fn current_ppid() -> u32 {
    nix::unistd::getppid().as_raw() as u32
}

#[cfg(not(unix))]
fn current_ppid() -> u32 {
    0
}

#[cfg(unix)]
fn signal_from_raw(raw: i32) -> Option<CancellationSignal> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    match raw {
        SIGINT => Some(CancellationSignal::Interrupted),
        SIGTERM => Some(CancellationSignal::Terminated),
        SIGHUP => Some(CancellationSignal::ControllingTerminalLost),
        _ => None,
    }
}

impl CancellationSubsystem {
    pub fn new(pool: Arc<PoolLifecycle>) -> Arc<Self> {
        Self::with_token(pool, CancelToken::new())
    }

    pub fn with_token(pool: Arc<PoolLifecycle>, token: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            token,
            pool,
            startup_ppid: current_ppid(),
            triggered: AtomicBool::new(false),
            #[cfg(unix)]
            listener: Mutex::new(None),
        })
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Starts listening for SIGINT, SIGTERM and SIGHUP. Idempotent.
    #[cfg(unix)]
    pub fn install(self: &Arc<Self>) -> Result<()> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listener.is_some() {
            return Ok(());
        }
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let handle = signals.handle();
        let this = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("calc-signals".to_string())
            .spawn(move || {
                for raw in signals.forever() {
                    if let Some(signal) = signal_from_raw(raw) {
                        this.raise(signal);
                    }
                }
            })?;
        *listener = Some(Listener { handle, thread });
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install(self: &Arc<Self>) -> Result<()> {
        warn!("signal handling is not supported on this platform");
        Ok(())
    }

    /// Stops listening. Signals arriving afterwards get their default disposition back
    /// only when the process exits.
    pub fn teardown(&self) {
        #[cfg(unix)]
        {
            let listener = self
                .listener
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(listener) = listener {
                listener.handle.close();
                if listener.thread.join().is_err() {
                    error!("signal listener thread panicked");
                }
            }
        }
    }

    /// Handles one delivered signal. Public so callers can cancel without a real signal.
    pub fn raise(&self, signal: CancellationSignal) {
        if signal == CancellationSignal::ControllingTerminalLost && !self.parent_changed() {
            // Still attached to the process that started us (e.g. under nohup).
            debug!("SIGHUP ignored: parent process unchanged");
            return;
        }
        if self.triggered.swap(true, Ordering::SeqCst) {
            if signal == CancellationSignal::Interrupted {
                warn!("Killing job, please wait");
            }
            self.token.cancel(signal);
            return;
        }

        if signal.is_manual_kill() {
            error!(%signal, "the master process was killed manually");
        } else {
            error!(%signal, "the master process was terminated");
        }
        self.pool.teardown(Teardown::Kill);
        self.token.cancel(signal);
    }

    fn parent_changed(&self) -> bool {
        current_ppid() != self.startup_ppid
    }
}
