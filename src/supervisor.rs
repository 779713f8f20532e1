//! Foreground supervision of a single daemon process.
//!
//! The supervisor launches the daemon as its direct child, relays termination
//! requests to it and reports how it ended. It never restarts the daemon.
use std::{
    env, fmt, fs,
    mem::MaybeUninit,
    os::unix::{
        fs::PermissionsExt,
        process::{CommandExt, ExitStatusExt},
        thread::JoinHandleExt,
    },
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        pthread::{Pthread, pthread_kill},
        signal::{self, SigHandler, SigSet, SigmaskHow, Signal},
    },
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{
        EXIT_SIGNALED, FORWARDED_SIGNALS, GROUP_POLL_INTERVAL, SIGNAL_THREAD_NAME,
        STRAGGLER_GRACE, TERMINATION_SIGNALS,
    },
    env::EnvMap,
    error::SupervisorError,
};

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Program name (looked up on `PATH`) or path to the executable.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory for the daemon. Inherited when unset.
    pub working_dir: Option<PathBuf>,
    /// Complete environment for the daemon. Inherited when unset.
    pub env: Option<EnvMap>,
    /// Grace period after a forwarded termination signal before SIGKILL.
    pub kill_after: Option<Duration>,
}

/// Lifecycle of a supervised launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Launching,
    Running { pid: u32 },
    Exited(i32),
    Signaled(i32),
    LaunchFailed,
}

/// How the daemon ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Terminated normally with the given code.
    Exited(i32),
    /// Killed by the given signal number.
    Signaled(i32),
}

impl ExitOutcome {
    /// Builds an outcome from a reaped child's status.
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            // Stopped/continued statuses are never returned by `wait`.
            (None, None) => ExitOutcome::Signaled(0),
        }
    }

    /// Exit code the supervisor should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Signaled(_) => EXIT_SIGNALED,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with code {code}"),
            ExitOutcome::Signaled(signal) => match Signal::try_from(*signal) {
                Ok(sig) => write!(f, "killed by {}", sig.as_str()),
                Err(_) => write!(f, "killed by signal {signal}"),
            },
        }
    }
}

/// Launches a daemon and blocks until it exits.
pub struct Supervisor {
    spec: LaunchSpec,
    state: SupervisorState,
}

impl Supervisor {
    /// Creates a supervisor in the `NotStarted` state.
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            state: SupervisorState::NotStarted,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Launches the daemon, forwards signals to it while it runs and returns
    /// once it has exited.
    pub fn run(&mut self) -> Result<ExitOutcome, SupervisorError> {
        if self.state != SupervisorState::NotStarted {
            warn!("Supervisor already used ({:?}); launching again", self.state);
        }
        self.state = SupervisorState::Launching;

        let launched = self.prepare().and_then(|executable| {
            let forwarder = SignalForwarder::install(self.spec.kill_after)?;
            let child = self.spawn(&executable)?;
            Ok((forwarder, child))
        });

        let (forwarder, mut child) = match launched {
            Ok(launched) => launched,
            Err(err) => {
                error!("Failed to launch '{}': {err}", self.spec.program);
                self.state = SupervisorState::LaunchFailed;
                return Err(err);
            }
        };

        let pid = child.id();
        self.state = SupervisorState::Running { pid };
        info!("Started '{}' with PID {pid}", self.spec.program);
        forwarder.attach(Pid::from_raw(pid as i32));

        let status = child.wait();
        forwarder.detach();
        drop(forwarder);
        terminate_stragglers(
            Pid::from_raw(pid as i32),
            self.spec.kill_after.unwrap_or(STRAGGLER_GRACE),
        );

        let status = status.map_err(|source| SupervisorError::Wait { pid, source })?;
        let outcome = ExitOutcome::from_status(status);
        self.state = match outcome {
            ExitOutcome::Exited(code) => SupervisorState::Exited(code),
            ExitOutcome::Signaled(signal) => SupervisorState::Signaled(signal),
        };

        match outcome {
            ExitOutcome::Exited(0) => info!("'{}' (PID {pid}) {outcome}", self.spec.program),
            _ => warn!("'{}' (PID {pid}) {outcome}", self.spec.program),
        }

        Ok(outcome)
    }

    /// Validates the executable and working directory.
    fn prepare(&self) -> Result<PathBuf, SupervisorError> {
        if let Some(dir) = &self.spec.working_dir
            && !dir.is_dir()
        {
            return Err(SupervisorError::InvalidWorkingDir { path: dir.clone() });
        }

        let search_path = self
            .spec
            .env
            .as_ref()
            .and_then(|env| env.get("PATH").map(str::to_string))
            .or_else(|| env::var("PATH").ok());

        let executable = resolve_program(&self.spec.program, search_path.as_deref())?;
        debug!("Resolved '{}' to {}", self.spec.program, executable.display());
        Ok(executable)
    }

    fn spawn(&self, executable: &Path) -> Result<std::process::Child, SupervisorError> {
        let mut cmd = Command::new(executable);
        cmd.args(&self.spec.args);

        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        if let Some(env) = &self.spec.env {
            cmd.env_clear();
            cmd.envs(env.iter());
        }

        // Own process group: terminal-generated signals reach the daemon once,
        // through the forwarder, instead of twice.
        cmd.process_group(0);

        unsafe {
            cmd.pre_exec(|| {
                // The supervisor blocks the forwarded signals; the daemon must not inherit that.
                let mut empty: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut empty);
                if libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        debug!("Executing command: {cmd:?}");
        cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.spec.program.clone(),
            source,
        })
    }
}

/// Finds the executable for `program`.
///
/// A program containing `/` is used as a path. Anything else is searched for
/// in the colon-separated `search_path`.
pub fn resolve_program(
    program: &str,
    search_path: Option<&str>,
) -> Result<PathBuf, SupervisorError> {
    let not_found = || SupervisorError::ExecutableNotFound {
        program: program.to_string(),
    };

    if program.is_empty() {
        return Err(not_found());
    }

    if program.contains('/') {
        let path = PathBuf::from(program);
        return match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => Ok(path),
            Ok(_) => Err(SupervisorError::PermissionDenied { path }),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(SupervisorError::PermissionDenied { path })
            }
            Err(_) => Err(not_found()),
        };
    }

    let mut not_executable = None;
    for dir in search_path.unwrap_or_default().split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = Path::new(dir).join(program);
        let Ok(meta) = fs::metadata(&candidate) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if meta.permissions().mode() & 0o111 != 0 {
            return Ok(candidate);
        }
        not_executable.get_or_insert(candidate);
    }

    match not_executable {
        Some(path) => Err(SupervisorError::PermissionDenied { path }),
        None => Err(not_found()),
    }
}

/// Terminates the current process with `signal`, the way the daemon ended.
///
/// Returns only if the signal did not terminate the process.
pub fn reraise(signal: i32) {
    let Ok(sig) = Signal::try_from(signal) else {
        return;
    };

    unsafe {
        if let Err(err) = signal::signal(sig, SigHandler::SigDfl) {
            warn!("Could not reset handler for {}: {err}", sig.as_str());
            return;
        }
    }

    let mut set = SigSet::empty();
    set.add(sig);
    if let Err(err) = set.thread_unblock() {
        warn!("Could not unblock {}: {err}", sig.as_str());
        return;
    }

    debug!("Re-raising {}", sig.as_str());
    if let Err(err) = signal::raise(sig) {
        warn!("Could not raise {}: {err}", sig.as_str());
    }
}

#[derive(Debug, Default)]
struct ForwardTarget {
    pid: Option<Pid>,
    pending: Vec<Signal>,
    stopping: bool,
    kill_armed: bool,
}

fn lock_target(shared: &Mutex<ForwardTarget>) -> MutexGuard<'_, ForwardTarget> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blocks the forwarded signals on the calling thread and relays them to the
/// daemon from a dedicated thread.
///
/// Signals received before the daemon is attached are queued and delivered on
/// attach. Dropping the forwarder stops the thread, discards forwarded signals
/// that arrived after the daemon was reaped and restores the previous mask.
struct SignalForwarder {
    shared: Arc<Mutex<ForwardTarget>>,
    kill_after: Option<Duration>,
    previous_mask: SigSet,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalForwarder {
    fn install(kill_after: Option<Duration>) -> Result<Self, SupervisorError> {
        let mut set = SigSet::empty();
        for sig in FORWARDED_SIGNALS {
            set.add(*sig);
        }

        let previous_mask = set.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        let shared = Arc::new(Mutex::new(ForwardTarget::default()));

        let thread_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(SIGNAL_THREAD_NAME.to_string())
            .spawn(move || forward_loop(set, thread_shared, kill_after));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(restore) = previous_mask.thread_set_mask() {
                    warn!("Failed to restore signal mask: {restore}");
                }
                return Err(SupervisorError::SignalThread(err));
            }
        };

        Ok(Self {
            shared,
            kill_after,
            previous_mask,
            thread: Some(handle),
        })
    }

    /// Starts relaying to `pid`, delivering anything queued so far.
    fn attach(&self, pid: Pid) {
        let mut target = lock_target(&self.shared);
        target.pid = Some(pid);
        for sig in std::mem::take(&mut target.pending) {
            relay(&self.shared, &mut target, sig, self.kill_after);
        }
    }

    /// Stops relaying. Called once the daemon has been reaped.
    fn detach(&self) {
        let mut target = lock_target(&self.shared);
        target.pid = None;
        target.stopping = true;
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.detach();

        if let Some(handle) = self.thread.take() {
            let thread: Pthread = handle.as_pthread_t() as Pthread;
            // Wake the sigwait so the thread sees `stopping`.
            match pthread_kill(thread, Signal::SIGUSR2) {
                Ok(()) => {
                    if handle.join().is_err() {
                        warn!("Signal forwarding thread panicked");
                    }
                }
                Err(err) => debug!("Signal forwarding thread already gone: {err}"),
            }
        }

        discard_pending();

        if let Err(err) = self.previous_mask.thread_set_mask() {
            warn!("Failed to restore signal mask: {err}");
        }
    }
}

/// Consumes forwarded signals still pending on this thread or the process so
/// unblocking them does not run their default action.
fn discard_pending() {
    while let Some(sig) = pending_forwarded() {
        let mut only = SigSet::empty();
        only.add(sig);
        match only.wait() {
            Ok(sig) => debug!("Discarding {} received after the daemon exited", sig.as_str()),
            Err(err) => {
                warn!("Failed to discard pending {}: {err}", sig.as_str());
                return;
            }
        }
    }
}

/// First forwarded signal pending for the calling thread, if any.
fn pending_forwarded() -> Option<Signal> {
    let mut pending = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigpending fully initializes the set when it returns 0.
    let pending = unsafe {
        if libc::sigpending(pending.as_mut_ptr()) != 0 {
            return None;
        }
        pending.assume_init()
    };

    FORWARDED_SIGNALS.iter().copied().find(|sig| {
        // SAFETY: `pending` is an initialized set and `sig` a valid signal number.
        unsafe { libc::sigismember(&pending, *sig as libc::c_int) == 1 }
    })
}

fn forward_loop(set: SigSet, shared: Arc<Mutex<ForwardTarget>>, kill_after: Option<Duration>) {
    loop {
        let sig = match set.wait() {
            Ok(sig) => sig,
            Err(err) => {
                error!("Waiting for signals failed: {err}");
                return;
            }
        };

        let mut target = lock_target(&shared);
        if target.stopping {
            return;
        }

        if target.pid.is_some() {
            relay(&shared, &mut target, sig, kill_after);
        } else {
            debug!("Queueing {} until the daemon is running", sig.as_str());
            target.pending.push(sig);
        }
    }
}

/// Sends `sig` to the attached daemon's process group and arms the SIGKILL
/// timer for termination requests.
fn relay(
    shared: &Arc<Mutex<ForwardTarget>>,
    target: &mut ForwardTarget,
    sig: Signal,
    kill_after: Option<Duration>,
) {
    let Some(pid) = target.pid else {
        return;
    };

    info!("Forwarding {} to process group {pid}", sig.as_str());
    match signal::killpg(pid, sig) {
        Ok(()) => {}
        Err(Errno::ESRCH) => debug!("Process group {pid} already exited"),
        Err(err) => {
            warn!(
                "Failed to signal process group {pid}: {err}; sending {} to PID {pid} directly",
                sig.as_str()
            );
            match signal::kill(pid, sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!("Failed to forward {} to PID {pid}: {err}", sig.as_str()),
            }
        }
    }

    if let Some(grace) = kill_after
        && TERMINATION_SIGNALS.contains(&sig)
        && !target.kill_armed
    {
        target.kill_armed = true;
        let shared = Arc::clone(shared);
        let timer = thread::Builder::new()
            .name(format!("{SIGNAL_THREAD_NAME}-kill"))
            .spawn(move || {
                thread::sleep(grace);
                let target = lock_target(&shared);
                if target.stopping || target.pid != Some(pid) {
                    return;
                }
                warn!(
                    "PID {pid} still running {}s after {}; sending SIGKILL",
                    grace.as_secs_f32(),
                    sig.as_str()
                );
                kill_group(pid);
            });
        if let Err(err) = timer {
            warn!("Failed to arm SIGKILL timer for PID {pid}: {err}");
        }
    }
}

/// Stops processes left in the daemon's process group after the daemon itself
/// was reaped: SIGTERM, then SIGKILL once `grace` has passed.
fn terminate_stragglers(pgid: Pid, grace: Duration) {
    match signal::killpg(pgid, None) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return,
        Err(err) => {
            debug!("Cannot inspect process group {pgid}: {err}");
            return;
        }
    }

    warn!("Processes in group {pgid} outlived the daemon; sending SIGTERM");
    if let Err(err) = signal::killpg(pgid, Signal::SIGTERM)
        && err != Errno::ESRCH
    {
        warn!("Failed to terminate process group {pgid}: {err}");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        thread::sleep(GROUP_POLL_INTERVAL);
        if matches!(signal::killpg(pgid, None), Err(Errno::ESRCH)) {
            return;
        }
    }

    warn!("Process group {pgid} still alive after {}s; sending SIGKILL", grace.as_secs_f32());
    kill_group(pgid);
}

/// Sends SIGKILL to the daemon's process group, falling back to the pid.
fn kill_group(pid: Pid) {
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!("Failed to kill process group {pid}: {err}; signalling PID directly");
            if let Err(err) = signal::kill(pid, Signal::SIGKILL)
                && err != Errno::ESRCH
            {
                error!("Failed to kill PID {pid}: {err}");
            }
        }
    }
}
