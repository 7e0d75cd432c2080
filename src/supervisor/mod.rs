// src/supervisor/mod.rs - Build, launch and supervise the protocol stack process
pub mod command;
pub mod output;

use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::config::{StackOptions, StackSettings};
pub use command::{DeviceIdentity, NetworkParams};
use output::{LineClassifier, OutputState};

/// Time allowed for the process to die after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Time allowed for the output reader to drain once the process is gone.
const READER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Stack binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("Stack build failed: {0}")]
    BuildFailed(String),
    #[error("Stack exited during startup with code {code:?}")]
    ProcessExitedDuringStartup {
        code: Option<i32>,
        diagnostics: Vec<String>,
    },
    #[error("Stack already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("Failed to spawn stack: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotBuilt,
    Built,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// How a successful start was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A success marker appeared within the grace period.
    Confirmed,
    /// Still alive after the grace period but never reported readiness.
    Unconfirmed,
}

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub running: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub identity: Option<DeviceIdentity>,
    pub network: Option<NetworkParams>,
    pub interface: Option<String>,
    pub confirmed: bool,
}

struct Shared {
    state: ProcessState,
    alive: bool,
    pid: Option<u32>,
    exit_code: Option<i32>,
    identity: Option<DeviceIdentity>,
    network: Option<NetworkParams>,
    interface: Option<String>,
}

/// Cloneable read side of the supervisor; never waits on a start or stop.
#[derive(Clone)]
pub struct StatusHandle {
    shared: Arc<Mutex<Shared>>,
    output: Arc<OutputState>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> ProcessStatus {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        ProcessStatus {
            state: shared.state,
            running: shared.alive,
            pid: shared.pid,
            exit_code: shared.exit_code,
            identity: shared.identity.clone(),
            network: shared.network.clone(),
            interface: shared.interface.clone(),
            confirmed: self.output.is_confirmed(),
        }
    }

    /// Error lines captured from the current or last run.
    pub fn diagnostics(&self) -> Vec<String> {
        self.output.diagnostics()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

/// Requests handled by the monitor task, which alone owns and reaps the child.
#[derive(Debug, Clone, Copy)]
enum StopRequest {
    Terminate,
    Kill,
}

/// Everything tied to one live process. The child itself lives in the monitor task.
struct ProcessHandle {
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<StopRequest>,
    exit: watch::Receiver<Option<ExitInfo>>,
    reader: JoinHandle<()>,
}

impl ProcessHandle {
    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    async fn wait_exit(&mut self) -> Option<ExitInfo> {
        // The monitor only drops its sender after publishing, so a closed
        // channel still holds the final value.
        let _ = self.exit.wait_for(|e| e.is_some()).await;
        *self.exit.borrow()
    }

    fn request(&self, request: StopRequest) {
        // A closed channel means the monitor already reaped the child.
        let _ = self.requests.send(request);
    }

    async fn drain_reader(&mut self) {
        if timeout(READER_DRAIN, &mut self.reader).await.is_err() {
            tracing::debug!("Output reader still attached, aborting it");
            self.reader.abort();
        }
    }
}

/// Owns the stack's build artifacts and at most one running process.
pub struct ProcessSupervisor {
    settings: StackSettings,
    shared: Arc<Mutex<Shared>>,
    output: Arc<OutputState>,
    handle: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(settings: StackSettings) -> Self {
        let state = if settings.artifact_path().exists() {
            ProcessState::Built
        } else {
            ProcessState::NotBuilt
        };
        let output = Arc::new(OutputState::new(settings.diagnostic_capacity));
        Self {
            settings,
            shared: Arc::new(Mutex::new(Shared {
                state,
                alive: false,
                pid: None,
                exit_code: None,
                identity: None,
                network: None,
                interface: None,
            })),
            output,
            handle: None,
        }
    }

    pub fn settings(&self) -> &StackSettings {
        &self.settings
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            shared: self.shared.clone(),
            output: self.output.clone(),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status_handle().snapshot()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.output.diagnostics()
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut shared)
    }

    fn set_state(&self, state: ProcessState) {
        self.with_shared(|s| s.state = state);
    }

    fn binary_label(&self) -> String {
        self.settings.binary.clone()
    }

    /// Build the stack unless its artifact already exists.
    pub async fn build(&mut self) -> Result<PathBuf, SupervisorError> {
        let artifact = self.settings.artifact_path();
        if artifact.exists() {
            self.with_shared(|s| {
                if s.state == ProcessState::NotBuilt {
                    s.state = ProcessState::Built;
                }
            });
            return Ok(artifact);
        }

        match self.compile().await {
            Ok(()) if artifact.exists() => {
                command::check_architecture(&artifact).await;
                tracing::info!("{} built successfully", self.binary_label());
                self.set_state(ProcessState::Built);
                Ok(artifact)
            }
            Ok(()) => {
                self.set_state(ProcessState::Failed);
                Err(SupervisorError::BuildFailed(format!(
                    "build finished but {} was not produced",
                    artifact.display()
                )))
            }
            Err(e) => {
                tracing::error!("Failed to build {}: {}", self.binary_label(), e);
                self.set_state(ProcessState::Failed);
                Err(e)
            }
        }
    }

    /// Remove the artifact and build from a clean tree.
    pub async fn rebuild(&mut self) -> Result<PathBuf, SupervisorError> {
        if self.handle.is_some() {
            self.stop().await;
        }
        let artifact = self.settings.artifact_path();
        match tokio::fs::remove_file(&artifact).await {
            Ok(()) => tracing::info!("Removed existing binary {}", artifact.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SupervisorError::BuildFailed(format!(
                    "cannot remove {}: {}",
                    artifact.display(),
                    e
                )))
            }
        }
        self.set_state(ProcessState::NotBuilt);
        self.build().await
    }

    async fn compile(&self) -> Result<(), SupervisorError> {
        let dir = &self.settings.dir;
        if !dir.is_dir() {
            return Err(SupervisorError::BuildFailed(format!(
                "stack source directory {} not found",
                dir.display()
            )));
        }

        tracing::info!(
            "Compiling {} in {} for {}",
            self.settings.binary,
            dir.display(),
            std::env::consts::ARCH
        );

        if let Err(e) = self.toolchain(&self.settings.clean_command).await {
            tracing::debug!("Clean step failed, continuing: {}", e);
        }

        let limit = Duration::from_secs(self.settings.build_timeout_secs);
        let output = match timeout(limit, self.toolchain(&self.settings.build_command)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SupervisorError::BuildFailed(e.to_string())),
            Err(_) => {
                return Err(SupervisorError::BuildFailed(format!(
                    "build timed out after {}s",
                    self.settings.build_timeout_secs
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            tracing::debug!("Build output: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            tracing::warn!("Build errors: {}", stderr.trim());
        }

        if output.status.success() {
            Ok(())
        } else if stderr.trim().is_empty() {
            Err(SupervisorError::BuildFailed(format!("build exited with {}", output.status)))
        } else {
            Err(SupervisorError::BuildFailed(stderr.trim().to_string()))
        }
    }

    async fn toolchain(&self, argv: &[String]) -> std::io::Result<std::process::Output> {
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        };
        Command::new(program)
            .args(args)
            .current_dir(&self.settings.dir)
            .env("CC", &self.settings.cc)
            .env("CFLAGS", &self.settings.cflags)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("{}: {}", program, e)))
    }

    /// Start the stack and wait for it to come up.
    pub async fn start(
        &mut self,
        identity: &DeviceIdentity,
        network: &NetworkParams,
        options: &StackOptions,
    ) -> Result<StartOutcome, SupervisorError> {
        if let Some(handle) = &self.handle {
            if handle.exit_info().is_none() {
                return Err(SupervisorError::AlreadyRunning(handle.pid.unwrap_or_default()));
            }
        }
        if let Some(mut stale) = self.handle.take() {
            stale.drain_reader().await;
        }

        let artifact = self.settings.artifact_path();
        if !artifact.exists() {
            if !self.settings.build_on_demand {
                return Err(SupervisorError::BinaryMissing(artifact));
            }
            tracing::info!("{} not found, compiling", artifact.display());
            self.build().await?;
        }
        command::check_architecture(&artifact).await;

        let interface = command::resolve_interface(&network.interface).await;
        let args = command::command_args(identity, network.port, &interface, options);
        tracing::info!("Starting {} {}", artifact.display(), args.join(" "));

        self.output.reset();
        self.with_shared(|s| {
            s.state = ProcessState::Starting;
            s.exit_code = None;
            s.identity = Some(identity.clone());
            s.network = Some(network.clone());
            s.interface = Some(interface.clone());
        });

        let mut child = match Command::new(&artifact)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Error starting {}: {}", artifact.display(), e);
                self.set_state(ProcessState::Failed);
                return Err(SupervisorError::Spawn(e));
            }
        };

        let pid = child.id();
        self.with_shared(|s| {
            s.pid = pid;
            s.alive = true;
        });

        let classifier =
            LineClassifier::new(&self.settings.success_markers, &self.settings.error_markers);
        let reader = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => output::spawn_reader(
                self.binary_label(),
                stdout,
                stderr,
                classifier,
                self.output.clone(),
            ),
            _ => tokio::spawn(async {}),
        };

        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let shared = self.shared.clone();
        let label = self.binary_label();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    request = request_rx.recv() => match request {
                        Some(StopRequest::Terminate) => terminate(&mut child, &label),
                        // A dropped sender lands here too, so the child never outlives
                        // its supervisor.
                        Some(StopRequest::Kill) | None => {
                            if let Err(e) = child.start_kill() {
                                tracing::warn!("Failed to kill {}: {}", label, e);
                            }
                            break child.wait().await;
                        }
                    },
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Error waiting for {}: {}", label, e);
                    None
                }
            };
            {
                let mut s = shared.lock().unwrap_or_else(|e| e.into_inner());
                s.alive = false;
                s.pid = None;
                s.exit_code = code;
                if matches!(s.state, ProcessState::Starting | ProcessState::Running) {
                    tracing::warn!("{} exited with code {:?}", label, code);
                    s.state = ProcessState::Failed;
                }
            }
            let _ = exit_tx.send(Some(ExitInfo { code }));
        });

        self.handle = Some(ProcessHandle {
            pid,
            requests: request_tx,
            exit: exit_rx,
            reader,
        });

        self.await_startup(identity, network).await
    }

    async fn await_startup(
        &mut self,
        identity: &DeviceIdentity,
        network: &NetworkParams,
    ) -> Result<StartOutcome, SupervisorError> {
        let grace = Duration::from_secs(self.settings.startup_grace_secs);
        let mut confirmed = self.output.subscribe();
        let Some(handle) = self.handle.as_mut() else {
            return Err(SupervisorError::ProcessExitedDuringStartup {
                code: None,
                diagnostics: Vec::new(),
            });
        };
        let mut exit = handle.exit.clone();

        let _ = timeout(grace, async {
            tokio::select! {
                _ = confirmed.wait_for(|c| *c) => {}
                _ = exit.wait_for(|e| e.is_some()) => {}
            }
        })
        .await;

        if let Some(info) = handle.exit_info() {
            handle.drain_reader().await;
            self.handle = None;
            let diagnostics = self.output.diagnostics();
            tracing::error!("{} exited with code {:?}", self.binary_label(), info.code);
            for line in &diagnostics {
                tracing::error!("  {}", line);
            }
            self.set_state(ProcessState::Failed);
            return Err(SupervisorError::ProcessExitedDuringStartup {
                code: info.code,
                diagnostics,
            });
        }

        self.set_state(ProcessState::Running);
        let address = network.ip.as_deref().unwrap_or("0.0.0.0");
        if self.output.is_confirmed() {
            tracing::info!(
                "{} started: device {} using BACnet/IP at {}:{}",
                self.binary_label(),
                identity.device_id,
                address,
                network.port
            );
            Ok(StartOutcome::Confirmed)
        } else {
            tracing::warn!("{} running but no startup confirmation", self.binary_label());
            for line in self.output.diagnostics() {
                tracing::warn!("  {}", line);
            }
            Ok(StartOutcome::Unconfirmed)
        }
    }

    /// Terminate the process: SIGTERM, bounded wait, then SIGKILL.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            tracing::debug!("Stop requested but no stack process is running");
            return;
        };

        if handle.exit_info().is_none() {
            self.set_state(ProcessState::Stopping);
            handle.request(StopRequest::Terminate);

            let grace = Duration::from_secs(self.settings.stop_grace_secs);
            match timeout(grace, handle.wait_exit()).await {
                Ok(_) => tracing::info!("{} stopped", self.binary_label()),
                Err(_) => {
                    tracing::warn!(
                        "{} did not exit after {:?}, killing",
                        self.binary_label(),
                        grace
                    );
                    handle.request(StopRequest::Kill);
                    if timeout(KILL_WAIT, handle.wait_exit()).await.is_err() {
                        tracing::error!("{} did not exit after SIGKILL", self.binary_label());
                    } else {
                        tracing::info!("{} force stopped", self.binary_label());
                    }
                }
            }
            self.with_shared(|s| {
                s.state = ProcessState::Stopped;
                s.alive = false;
                s.pid = None;
            });
        }

        handle.drain_reader().await;
    }
}

/// Ask the child to exit. Only called by the task that reaps it, so the pid
/// cannot have been reused.
#[cfg(unix)]
fn terminate(child: &mut Child, label: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!("Cannot signal {} with pid {}", label, pid);
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!("SIGTERM to {} ({}) failed: {}", label, pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, label: &str) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill {}: {}", label, e);
    }
}
