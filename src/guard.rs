use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GuardError;

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESTART_AFTER: Duration = Duration::from_secs(5);

/// Snapshot of a guard's lifecycle position.
///
/// A pid is present iff the state is `RunningStarted`; once the guard moves
/// away from a pid that pid is never observed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// The event loop has exited (terminal).
    NotRunning,
    /// The event loop is alive but no child exists.
    RunningStopped,
    /// A child with the given pid exists.
    RunningStarted { pid: i32 },
}

impl GuardState {
    pub fn is_started(&self) -> bool {
        matches!(self, GuardState::RunningStarted { .. })
    }

    pub fn pid(&self) -> i32 {
        match self {
            GuardState::RunningStarted { pid } => *pid,
            _ => -1,
        }
    }
}

/// Where a child's stdout/stderr goes. stdin is always inherited.
#[derive(Debug, Clone, Default)]
pub enum Sink {
    #[default]
    Inherit,
    Null,
    /// Append to the given file, creating it if missing.
    File(PathBuf),
}

impl Sink {
    fn open(&self) -> std::io::Result<Stdio> {
        match self {
            Sink::Inherit => Ok(Stdio::inherit()),
            Sink::Null => Ok(Stdio::null()),
            Sink::File(path) => {
                let f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(f.into())
            }
        }
    }
}

/// Guard configuration. Immutable while a child is running; replaced
/// atomically through [`Guard::update_opts`].
#[derive(Debug, Clone)]
pub struct GuardOpts {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// "KEY=VALUE" pairs appended to the inherited environment.
    pub env: Vec<String>,
    pub wd: PathBuf,
    pub stdout: Sink,
    pub stderr: Sink,
    pub kill_timeout: Duration,
    pub restart_after: Duration,
}

impl GuardOpts {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            wd: PathBuf::from("."),
            stdout: Sink::Inherit,
            stderr: Sink::Inherit,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            restart_after: DEFAULT_RESTART_AFTER,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_wd(mut self, wd: impl Into<PathBuf>) -> Self {
        self.wd = wd.into();
        self
    }

    pub fn with_stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn with_kill_timeout(mut self, d: Duration) -> Self {
        self.kill_timeout = d;
        self
    }

    pub fn with_restart_after(mut self, d: Duration) -> Self {
        self.restart_after = d;
        self
    }
}

enum Action {
    Start {
        reply: oneshot::Sender<Result<i32, GuardError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), GuardError>>,
    },
}

type OnChange = Arc<dyn Fn(GuardState) + Send + Sync>;

/// Single-process supervisor. Owns the child process handle exclusively; all
/// interaction goes through the action channel into the event loop, state is
/// published through the status record and the `on_change` callback.
pub struct Guard {
    action_tx: mpsc::UnboundedSender<Action>,
    action_rx: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    opts: Mutex<GuardOpts>,
    status: RwLock<GuardState>,
    on_change: RwLock<Option<OnChange>>,
}

impl Guard {
    pub fn new(opts: GuardOpts) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        Self {
            action_tx,
            action_rx: Mutex::new(Some(action_rx)),
            opts: Mutex::new(opts),
            status: RwLock::new(GuardState::NotRunning),
            on_change: RwLock::new(None),
        }
    }

    /// Registers the transition callback. It is invoked synchronously from the
    /// event loop and must not block.
    pub fn set_on_change(&self, f: impl Fn(GuardState) + Send + Sync + 'static) {
        *self
            .on_change
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(f));
    }

    /// Blocks until the event loop has attempted to spawn a child.
    pub async fn start(&self) -> Result<i32, GuardError> {
        let (tx, rx) = oneshot::channel();
        self.action_tx
            .send(Action::Start { reply: tx })
            .map_err(|_| GuardError::LoopGone)?;
        rx.await.map_err(|_| GuardError::LoopGone)?
    }

    /// Blocks until the child has exited or the kill timeout elapsed.
    pub async fn stop(&self) -> Result<(), GuardError> {
        let (tx, rx) = oneshot::channel();
        self.action_tx
            .send(Action::Stop { reply: tx })
            .map_err(|_| GuardError::LoopGone)?;
        rx.await.map_err(|_| GuardError::LoopGone)?
    }

    /// Atomically replaces the configuration. The caller must stop a running
    /// child first.
    pub fn update_opts(&self, opts: GuardOpts) -> Result<(), GuardError> {
        let status = self.status();
        if status.is_started() {
            return Err(GuardError::AlreadyRunning(status.pid()));
        }
        *self.opts.lock().unwrap_or_else(|p| p.into_inner()) = opts;
        Ok(())
    }

    pub fn status(&self) -> GuardState {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.status().is_started()
    }

    pub fn pid(&self) -> i32 {
        self.status().pid()
    }

    fn opts_snapshot(&self) -> GuardOpts {
        self.opts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn change_status(&self, next: GuardState) {
        let changed = {
            let mut st = self.status.write().unwrap_or_else(|p| p.into_inner());
            if *st == next {
                false
            } else {
                *st = next;
                true
            }
        };
        if changed {
            let cb = self
                .on_change
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            if let Some(cb) = cb {
                cb(next);
            }
        }
    }

    fn spawn_child(&self, exit_tx: &mpsc::UnboundedSender<()>) -> Result<i32, GuardError> {
        let opts = self.opts_snapshot();
        let program = opts.program.display().to_string();
        let spawn_failed = |source: std::io::Error| GuardError::SpawnFailed {
            program: program.clone(),
            source,
        };

        let mut cmd = Command::new(&opts.program);
        cmd.args(&opts.args);
        for pair in &opts.env {
            if let Some((k, v)) = pair.split_once('=') {
                cmd.env(k, v);
            }
        }
        cmd.current_dir(&opts.wd);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(opts.stdout.open().map_err(spawn_failed)?);
        cmd.stderr(opts.stderr.open().map_err(spawn_failed)?);

        // Own process group, so signals aimed at the supervisor's terminal
        // never reach the child directly.
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                // Children must not outlive the supervisor.
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(spawn_failed)?;
        let pid = child
            .id()
            .map(|p| p as i32)
            .ok_or_else(|| spawn_failed(std::io::Error::other("spawned child has no pid")))?;

        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "child exited"),
                Err(e) => warn!(pid, "wait for child: {e}"),
            }
            let _ = exit_tx.send(());
        });

        self.change_status(GuardState::RunningStarted { pid });
        Ok(pid)
    }

    async fn kill_child(
        &self,
        pid: &mut i32,
        exit_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<(), GuardError> {
        if *pid < 0 {
            return Err(GuardError::NotRunning);
        }
        let target = *pid;
        signal::kill(Pid::from_raw(target), Signal::SIGINT)
            .map_err(|source| GuardError::KillFailed { pid: target, source })?;

        *pid = -1;
        self.change_status(GuardState::RunningStopped);

        let kill_timeout = self.opts_snapshot().kill_timeout;
        match time::timeout(kill_timeout, exit_rx.recv()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(GuardError::KillTimeout(target)),
        }
    }

    /// Drives the event loop until `cancel` fires, then best-effort kills the
    /// child and returns. Multiplexes over the action channel, child exits,
    /// the restart timer and cancellation.
    pub async fn run_ctx(&self, cancel: CancellationToken) {
        let mut action_rx = match self
            .action_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            Some(rx) => rx,
            None => {
                warn!("guard event loop started twice");
                return;
            }
        };

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<()>();
        let mut pid: i32 = -1;
        let mut restart_at: Option<Instant> = None;

        self.change_status(GuardState::RunningStopped);
        debug!(program = %self.opts_snapshot().program.display(), "guard loop");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if pid > -1 {
                        if let Err(e) = self.kill_child(&mut pid, &mut exit_rx).await {
                            warn!("kill on cancel: {e}");
                        }
                    }
                    break;
                }
                Some(()) = exit_rx.recv() => {
                    pid = -1;
                    self.change_status(GuardState::RunningStopped);
                    restart_at = Some(Instant::now() + self.opts_snapshot().restart_after);
                }
                _ = time::sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    restart_at = None;
                    // A manual start may have raced the deadline; never spawn
                    // over an existing child.
                    if pid < 0 {
                        match self.spawn_child(&exit_tx) {
                            Ok(new_pid) => pid = new_pid,
                            Err(e) => warn!("restart: {e}"),
                        }
                    }
                }
                action = action_rx.recv() => {
                    match action {
                        Some(Action::Start { reply }) => {
                            let res = if pid > -1 {
                                Err(GuardError::AlreadyRunning(pid))
                            } else {
                                match self.spawn_child(&exit_tx) {
                                    Ok(new_pid) => {
                                        pid = new_pid;
                                        Ok(new_pid)
                                    }
                                    Err(e) => Err(e),
                                }
                            };
                            let _ = reply.send(res);
                        }
                        Some(Action::Stop { reply }) => {
                            let res = self.kill_child(&mut pid, &mut exit_rx).await;
                            let _ = reply.send(res);
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(program = %self.opts_snapshot().program.display(), "guard loop done");
        self.change_status(GuardState::NotRunning);
    }
}
