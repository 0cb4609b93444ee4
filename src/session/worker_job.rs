//! Worker Job Supervision
//!
//! Owns the OS process for one conversation's authentication worker: spawn
//! with the control channel address injected into the environment, then
//! supervise until exactly one exit or death event has been delivered.
//!
//! The job knows nothing about conversations; it reports plain process
//! lifecycle events on whatever channel the owner hands to [`WorkerJob::start`].

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::protocol::{CHANNEL_ADDRESS_ENV, FOR_REAUTH_ENV};
use crate::error::SpawnError;

/// Process lifecycle events, delivered asynchronously from the watch task.
///
/// For every spawned process, `Started` is followed by at most one of
/// `Exited` or `Died`; the exit notification is suppressed when a stop call
/// reaped the process first, since the stopper already observed termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The worker process is running
    Started,
    /// The worker exited on its own with the given status
    Exited(i32),
    /// The worker was killed by the given signal
    Died(i32),
}

/// How an explicit stop tears the process down
#[derive(Debug, Clone, Copy)]
enum StopMode {
    /// SIGTERM, bounded wait, SIGKILL fallback
    Graceful,
    /// SIGKILL immediately
    Immediate,
}

struct StopRequest {
    mode: StopMode,
    done: oneshot::Sender<()>,
}

/// Spawns and supervises one privilege-dropped authentication worker.
pub struct WorkerJob {
    command: String,
    server_address: Option<String>,
    environment: Option<HashMap<String, String>>,
    for_reauth: bool,
    stop_timeout: Duration,
    pid: Option<i32>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
    watch: Option<JoinHandle<()>>,
}

impl WorkerJob {
    /// Create an idle job for the given worker command line
    pub fn new(command: impl Into<String>, stop_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            server_address: None,
            environment: None,
            for_reauth: false,
            stop_timeout,
            pid: None,
            stop_tx: None,
            watch: None,
        }
    }

    /// Control channel address injected into the worker environment
    pub fn set_server_address(&mut self, address: impl Into<String>) {
        self.server_address = Some(address.into());
    }

    /// Replace the worker's inherited environment entirely
    pub fn set_environment(&mut self, environment: HashMap<String, String>) {
        self.environment = Some(environment);
    }

    /// Mark the worker as spawned for reauthentication
    pub fn set_for_reauth(&mut self, for_reauth: bool) {
        self.for_reauth = for_reauth;
    }

    /// Pid of the spawned process, kept until a stop call normalizes it
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Whether a spawned process is still under supervision
    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
            && self
                .watch
                .as_ref()
                .map(|watch| !watch.is_finished())
                .unwrap_or(false)
    }

    /// Spawn the worker and begin supervision.
    ///
    /// `job_name` becomes the child's argv[0] so process listings identify
    /// which conversation a worker belongs to. Events are delivered on
    /// `events` from the watch task, never synchronously from this call.
    pub fn start(
        &mut self,
        job_name: &str,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Result<(), SpawnError> {
        if self.is_running() {
            return Err(SpawnError::AlreadyRunning(self.pid.unwrap_or(-1)));
        }

        let mut argv = self.command.split_whitespace();
        let program = argv
            .next()
            .ok_or_else(|| SpawnError::BadCommand(self.command.clone()))?;

        debug!("Starting worker job: {} ({})", job_name, self.command);

        let mut command = std::process::Command::new(program);
        command.arg0(job_name);
        command.args(argv);
        command.stdin(Stdio::null());

        if let Some(environment) = &self.environment {
            command.env_clear();
            command.envs(environment);
        }
        if let Some(address) = &self.server_address {
            command.env(CHANNEL_ADDRESS_ENV, address);
        }
        if self.for_reauth {
            command.env(FOR_REAUTH_ENV, "1");
        }

        let child = tokio::process::Command::from(command).spawn()?;

        let pid = child.id().map(|pid| pid as i32);
        debug!("Worker job {} running as pid {:?}", job_name, pid);

        let (stop_tx, stop_rx) = oneshot::channel();
        let watch = tokio::spawn(watch_child(child, events, stop_rx, self.stop_timeout));

        self.pid = pid;
        self.stop_tx = Some(stop_tx);
        self.watch = Some(watch);

        Ok(())
    }

    /// Ask the running worker to terminate without waiting for it.
    ///
    /// The watch stays installed, so the exit is still reported as a normal
    /// `Exited`/`Died` event. No-op when the process is not running.
    pub fn request_stop(&self) {
        if !self.is_running() {
            return;
        }
        let Some(pid) = self.pid else { return };

        debug!("Signaling worker job pid {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("Unable to signal worker process {}: {}", pid, e);
        }
    }

    /// Stop the worker and wait until it has been reaped.
    ///
    /// Two-phase: the watch is cancelled first so the exit cannot be
    /// double-delivered, then the process is signaled and reaped with a
    /// bounded wait (SIGKILL after the configured timeout). No-op returning
    /// immediately when the process already exited.
    pub async fn stop(&mut self) {
        self.terminate(StopMode::Graceful).await;
    }

    /// Like [`stop`](Self::stop), but SIGKILL up front.
    ///
    /// For bulk cleanup of discarded conversations, where blocking beyond
    /// one OS wait is unacceptable.
    pub async fn stop_now(&mut self) {
        self.terminate(StopMode::Immediate).await;
    }

    async fn terminate(&mut self, mode: StopMode) {
        self.watch.take();

        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let request = StopRequest {
            mode,
            done: done_tx,
        };

        // A failed send means the watch already reaped the process and
        // delivered its event; nothing left to do.
        if stop_tx.send(request).is_ok() {
            let _ = done_rx.await;
        }

        self.pid = None;
    }
}

async fn watch_child(
    mut child: Child,
    events: mpsc::UnboundedSender<JobEvent>,
    stop_rx: oneshot::Receiver<StopRequest>,
    stop_timeout: Duration,
) {
    let _ = events.send(JobEvent::Started);

    let mut stop_rx = stop_rx;
    let mut stop_open = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        if let Some(code) = status.code() {
                            debug!("Worker job exited with status {}", code);
                            let _ = events.send(JobEvent::Exited(code));
                        } else if let Some(signal) = status.signal() {
                            debug!("Worker job died from signal {}", signal);
                            let _ = events.send(JobEvent::Died(signal));
                        } else {
                            warn!("Worker job ended with unrecognized status");
                        }
                    }
                    Err(e) => warn!("Failed to wait on worker job: {}", e),
                }
                return;
            }
            request = &mut stop_rx, if stop_open => {
                match request {
                    Ok(StopRequest { mode, done }) => {
                        terminate_child(&mut child, mode, stop_timeout).await;
                        let _ = done.send(());
                        return;
                    }
                    // Owner dropped without stopping; keep supervising so
                    // the exit event is still delivered.
                    Err(_) => stop_open = false,
                }
            }
        }
    }
}

async fn terminate_child(child: &mut Child, mode: StopMode, stop_timeout: Duration) {
    let Some(pid) = child.id() else {
        // Exited in between; just reap.
        let _ = child.wait().await;
        return;
    };

    match mode {
        StopMode::Graceful => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Unable to signal worker process {}: {}", pid, e);
            }

            match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Worker {} ignored SIGTERM, killing", pid);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        StopMode::Immediate => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
