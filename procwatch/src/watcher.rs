//! Game server process supervision
//!
//! The [`Watcher`] starts the server executable, forwards its output line by
//! line and starts it again whenever it exits. Restarts are paced by a
//! [`RetryPolicy`]; a run that lasted at least [`STABLE_RUN`] resets the
//! backoff so a server that crashes once a day is not penalised forever.

use crate::error::WatchError;
use crate::wait_for_shutdown;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use shared::RetryPolicy;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// A run at least this long resets the restart backoff
pub const STABLE_RUN: Duration = Duration::from_secs(60);

/// Buffered output lines per stream before new lines are dropped
pub const OUTPUT_CAPACITY: usize = 1024;

fn default_restart() -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_secs(5))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    /// Server executable; also determines the working directory
    #[serde(alias = "path")]
    pub executable: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_restart")]
    pub restart: RetryPolicy,
}

impl WatcherConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            params: Vec::new(),
            restart: default_restart(),
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_restart(mut self, policy: RetryPolicy) -> Self {
        self.restart = policy;
        self
    }
}

/// Output line streams of the supervised process
///
/// The channels stay open across restarts.
pub struct WatcherOutput {
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
}

/// Requests a restart of the supervised process from anywhere
#[derive(Clone)]
pub struct RestartHandle {
    notify: Arc<Notify>,
    /// Bumped by every request; a run only reacts to requests made after it started
    requests: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl RestartHandle {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            requests: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kills the running process; the supervisor starts it again right away.
    pub fn restart(&self) -> Result<(), WatchError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(WatchError::NotRunning);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Resolves once a restart is requested after generation `seen`.
    async fn requested_since(&self, seen: u64) {
        loop {
            let notified = self.notify.notified();
            if self.generation() != seen {
                return;
            }
            notified.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Watcher {
    config: WatcherConfig,
    restart: RestartHandle,
    shutdown: watch::Sender<bool>,
    runs: Arc<AtomicU64>,
    stdout: mpsc::Sender<String>,
    stderr: mpsc::Sender<String>,
    output: Mutex<Option<WatcherOutput>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(config: WatcherConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (stdout, stdout_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (stderr, stderr_rx) = mpsc::channel(OUTPUT_CAPACITY);

        Self {
            config,
            restart: RestartHandle::new(),
            shutdown,
            runs: Arc::new(AtomicU64::new(0)),
            stdout,
            stderr,
            output: Mutex::new(Some(WatcherOutput {
                stdout: stdout_rx,
                stderr: stderr_rx,
            })),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Starts the process and the supervisor task.
    ///
    /// The first start happens inline so a missing executable is reported
    /// to the caller instead of being retried in the background.
    pub fn start(&self) -> Result<(), WatchError> {
        if *self.shutdown.borrow() {
            return Err(WatchError::NotRunning);
        }
        let mut supervisor = lock(&self.supervisor);
        if supervisor.as_ref().map_or(false, |handle| !handle.is_finished()) {
            debug!("Watcher already running");
            return Ok(());
        }

        let child = spawn_child(&self.config)?;
        let task = Supervisor {
            config: self.config.clone(),
            restart: self.restart.clone(),
            shutdown: self.shutdown.subscribe(),
            runs: Arc::clone(&self.runs),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        };
        *supervisor = Some(tokio::spawn(task.run(child)));
        Ok(())
    }

    /// Hands out the output streams; only the first call gets them.
    pub fn take_output(&self) -> Option<WatcherOutput> {
        lock(&self.output).take()
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub fn restart(&self) -> Result<(), WatchError> {
        self.restart.restart()
    }

    pub fn is_running(&self) -> bool {
        self.restart.is_running()
    }

    /// How many times the process has been started.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Kills the process and stops supervising it.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = lock(&self.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Watcher supervisor panicked: {}", e);
            }
        }
        info!("Watcher for {} stopped", self.config.executable.display());
    }
}

enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    Requested,
    Shutdown,
}

struct Supervisor {
    config: WatcherConfig,
    restart: RestartHandle,
    shutdown: watch::Receiver<bool>,
    runs: Arc<AtomicU64>,
    stdout: mpsc::Sender<String>,
    stderr: mpsc::Sender<String>,
}

impl Supervisor {
    async fn run(mut self, first: Child) {
        let mut pending = Some(first);
        let mut attempt = 0u32;

        loop {
            let mut child = match pending.take() {
                Some(child) => child,
                None => match spawn_child(&self.config) {
                    Ok(child) => child,
                    Err(e) => {
                        error!("{}", e);
                        if !self.backoff(&mut attempt).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            self.runs.fetch_add(1, Ordering::SeqCst);
            let seen = self.restart.generation();
            self.restart.running.store(true, Ordering::SeqCst);
            self.forward(&mut child);
            let started = Instant::now();

            let exit = {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    status = child.wait() => Exit::Exited(status),
                    _ = self.restart.requested_since(seen) => Exit::Requested,
                    _ = wait_for_shutdown(&mut shutdown) => Exit::Shutdown,
                }
            };

            if !matches!(exit, Exit::Exited(_)) {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.config.executable.display(), e);
                }
            }
            self.restart.running.store(false, Ordering::SeqCst);

            if started.elapsed() >= STABLE_RUN {
                attempt = 0;
            }

            match exit {
                Exit::Shutdown => break,
                Exit::Requested => {
                    info!("Restarting {} on request", self.config.executable.display());
                    continue;
                }
                Exit::Exited(Ok(status)) => {
                    warn!(
                        "{} exited with {} after {:?}",
                        self.config.executable.display(),
                        status,
                        started.elapsed()
                    );
                }
                Exit::Exited(Err(e)) => {
                    error!(
                        "Lost track of {}: {}",
                        self.config.executable.display(),
                        e
                    );
                }
            }

            if !self.backoff(&mut attempt).await {
                break;
            }
        }

        self.restart.running.store(false, Ordering::SeqCst);
    }

    /// Waits before the next start. Returns false when supervision should end.
    async fn backoff(&mut self, attempt: &mut u32) -> bool {
        let policy = &self.config.restart;
        if !policy.allows(*attempt) {
            error!(
                "Giving up on {} after {} restarts",
                self.config.executable.display(),
                attempt
            );
            return false;
        }

        let delay = policy.delay(*attempt);
        *attempt += 1;
        info!(
            "Restarting {} in {:?}",
            self.config.executable.display(),
            delay
        );

        tokio::select! {
            _ = sleep(delay) => true,
            _ = wait_for_shutdown(&mut self.shutdown) => false,
        }
    }

    fn forward(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, self.stdout.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, self.stderr.clone(), "stderr");
        }
    }
}

/// Copies lines from a pipe into a channel without ever blocking the pipe.
fn pump<R>(reader: R, lines_out: mpsc::Sender<String>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match lines_out.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(line)) => {
                        trace!("Output buffer full, dropping {} line: {}", stream, line);
                    }
                    Err(TrySendError::Closed(_)) => {}
                },
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped reading {}: {}", stream, e);
                    break;
                }
            }
        }
    });
}

fn spawn_child(config: &WatcherConfig) -> Result<Child, WatchError> {
    let spawn_error = |source| WatchError::Spawn {
        executable: config.executable.clone(),
        source,
    };

    let mut command = match working_dir(&config.executable) {
        Some(dir) => {
            let program = std::fs::canonicalize(&config.executable).map_err(spawn_error)?;
            let mut command = Command::new(program);
            command.current_dir(dir);
            command
        }
        None => Command::new(&config.executable),
    };

    command
        .args(&config.params)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(spawn_error)?;
    info!(
        "Started {} {:?} (pid {:?})",
        config.executable.display(),
        config.params,
        child.id()
    );
    Ok(child)
}

fn working_dir(executable: &Path) -> Option<&Path> {
    executable
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn shell(script: &str) -> WatcherConfig {
        WatcherConfig::new("/bin/sh")
            .with_params(["-c", script])
            .with_restart(RetryPolicy::fixed(Duration::from_millis(50)))
    }

    async fn next_line(lines: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("no output in time")
            .expect("output closed")
    }

    #[test]
    fn test_working_dir() {
        assert_eq!(working_dir(Path::new("/opt/arma3/server")), Some(Path::new("/opt/arma3")));
        assert_eq!(working_dir(Path::new("server")), None);
    }

    #[test]
    fn test_config_from_json() {
        let config: WatcherConfig = serde_json::from_str(
            r#"{ "path": "/opt/arma3/arma3server", "params": ["-port=2302", "-world=empty"] }"#,
        )
        .unwrap();

        assert_eq!(config.executable, PathBuf::from("/opt/arma3/arma3server"));
        assert_eq!(config.params.len(), 2);
        assert_eq!(config.restart.delay(0), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_forwards_output() {
        let watcher = Watcher::new(shell("echo hello; echo oops >&2; sleep 5"));
        watcher.start().unwrap();
        let mut output = watcher.take_output().unwrap();
        assert!(watcher.take_output().is_none());

        assert_eq!(next_line(&mut output.stdout).await, "hello");
        assert_eq!(next_line(&mut output.stderr).await, "oops");
        assert!(watcher.is_running());

        watcher.shutdown().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_restart_on_request() {
        let watcher = Watcher::new(shell("echo started; sleep 30"));
        watcher.start().unwrap();
        let mut output = watcher.take_output().unwrap();

        assert_eq!(next_line(&mut output.stdout).await, "started");
        watcher.restart().unwrap();
        assert_eq!(next_line(&mut output.stdout).await, "started");
        assert_eq!(watcher.runs(), 2);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let watcher = Watcher::new(shell("echo tick"));
        watcher.start().unwrap();
        let mut output = watcher.take_output().unwrap();

        assert_eq!(next_line(&mut output.stdout).await, "tick");
        assert_eq!(next_line(&mut output.stdout).await, "tick");
        assert!(watcher.runs() >= 2);

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let watcher = Watcher::new(WatcherConfig::new("/nonexistent/dir/arma3server"));
        assert!(matches!(watcher.start(), Err(WatchError::Spawn { .. })));
        assert_eq!(watcher.runs(), 0);
    }

    #[tokio::test]
    async fn test_unserved_request_does_not_carry_over() {
        let handle = RestartHandle::new();
        handle.running.store(true, Ordering::SeqCst);

        // Lost to a process that exited on its own
        handle.restart().unwrap();

        let seen = handle.generation();
        assert!(timeout(Duration::from_millis(100), handle.requested_since(seen))
            .await
            .is_err());

        handle.restart().unwrap();
        timeout(Duration::from_secs(1), handle.requested_since(seen))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_requires_process() {
        let watcher = Watcher::new(shell("true"));
        assert!(matches!(watcher.restart(), Err(WatchError::NotRunning)));
    }
}
