//! Proxy Engine Supervisor
//!
//! Owns the lifecycle of the external proxy engine process.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──▶ Starting ──ready──▶ Running ──stop──▶ Stopped
//!                    │                   │
//!                    └──exit──▶ Error ◀──exit (crash)
//! ```
//!
//! The engine is considered ready when the [`ReadinessProbe`] matches an
//! output line, or when the readiness timeout elapses while the process is
//! still alive. A process that exits before that is a [`StartError`]; one
//! that exits after it is a crash, reported through [`ProcessWatch`].

use crate::readiness::{DiagnosticExtractor, FailureLineExtractor, MarkerProbe, ReadinessProbe};
use crate::transport::TransportConfig;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines of engine output kept for diagnostics
const OUTPUT_CAPACITY: usize = 200;

/// How long to wait for output readers after the engine exits
const READER_DRAIN: Duration = Duration::from_millis(500);

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing launched yet
    Idle,
    /// Spawned, waiting for readiness
    Starting,
    /// Accepting traffic
    Running,
    /// Stopped on request
    Stopped,
    /// Exited on its own
    Error,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProcessState::Error)
    }
}

/// How to invoke the engine binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    binary: PathBuf,
    /// Prepended to every invocation
    extra_args: Vec<String>,
}

impl EngineCommand {
    pub fn new<I, S>(binary: impl Into<PathBuf>, extra_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary: binary.into(),
            extra_args: extra_args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Fail fast when the binary is not where it should be
    pub fn ensure_present(&self) -> Result<(), StartError> {
        if self.binary.is_file() {
            Ok(())
        } else {
            Err(StartError::BinaryMissing(self.binary.clone()))
        }
    }

    /// A command with the binary and extra arguments filled in
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args);
        cmd
    }
}

/// Reference to a running engine, used to query its control endpoint
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub pid: Option<u32>,
    pub control: SocketAddr,
    pub engine: EngineCommand,
    pub config_path: PathBuf,
}

/// Why a running engine went away
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashReport {
    pub code: Option<i32>,
    pub diagnostic: Option<String>,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_exit(self.code, self.diagnostic.as_deref()))
    }
}

fn describe_exit(code: Option<i32>, diagnostic: Option<&str>) -> String {
    let mut text = match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if let Some(diagnostic) = diagnostic {
        text.push_str(": ");
        text.push_str(diagnostic);
    }
    text
}

/// Observes one supervised process
#[derive(Debug, Clone)]
pub struct ProcessWatch {
    state: watch::Receiver<ProcessState>,
    crash: Arc<Mutex<Option<CrashReport>>>,
}

impl ProcessWatch {
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Resolves with a report if the engine dies on its own, or `None`
    /// once it has been stopped.
    pub async fn crashed(&mut self) -> Option<CrashReport> {
        loop {
            match *self.state.borrow_and_update() {
                ProcessState::Error => {
                    let report = self
                        .crash
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    return Some(report.unwrap_or_default());
                }
                ProcessState::Stopped => return None,
                ProcessState::Idle | ProcessState::Starting | ProcessState::Running => {}
            }
            if self.state.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Bounded buffer of recent engine output, shared with whoever wants to read it
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl EngineOutput {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == OUTPUT_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn clear(&self) {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

struct RunningEngine {
    handle: EngineHandle,
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
    config_file: NamedTempFile,
}

/// Process supervisor for one engine at a time
pub struct Supervisor {
    engine: EngineCommand,
    readiness_timeout: Duration,
    stop_grace: Duration,
    probe: Arc<dyn ReadinessProbe>,
    extractor: Arc<dyn DiagnosticExtractor>,
    state_tx: watch::Sender<ProcessState>,
    crash: Arc<Mutex<Option<CrashReport>>>,
    output: EngineOutput,
    running: Option<RunningEngine>,
}

impl Supervisor {
    pub fn new(engine: EngineCommand) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Idle);

        Self {
            engine,
            readiness_timeout: Duration::from_secs(3),
            stop_grace: Duration::from_secs(3),
            probe: Arc::new(MarkerProbe::default()),
            extractor: Arc::new(FailureLineExtractor::default()),
            state_tx,
            crash: Arc::new(Mutex::new(None)),
            output: EngineOutput::default(),
            running: None,
        }
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DiagnosticExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    pub fn watch(&self) -> ProcessWatch {
        ProcessWatch {
            state: self.state_tx.subscribe(),
            crash: self.crash.clone(),
        }
    }

    pub fn handle(&self) -> Option<&EngineHandle> {
        self.running.as_ref().map(|r| &r.handle)
    }

    /// Most recent engine output, oldest first
    pub fn recent_output(&self) -> Vec<String> {
        self.output.lines()
    }

    /// Live view of the output buffer that outlives this supervisor
    pub fn output(&self) -> EngineOutput {
        self.output.clone()
    }

    /// Launch the engine with `config` and wait until it is ready.
    ///
    /// The caller must stop any previous engine first.
    pub async fn start(&mut self, config: &TransportConfig) -> Result<EngineHandle, StartError> {
        debug_assert!(self.running.is_none(), "engine already supervised");

        self.engine.ensure_present()?;
        let config_file = write_config(config)?;
        let control = config
            .inbound(crate::transport::CONTROL_TAG)
            .map(|inbound| SocketAddr::from(([127, 0, 0, 1], inbound.port)))
            .ok_or_else(|| StartError::Config("no control inbound".into()))?;

        self.output.clear();
        *self.crash.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.state_tx.send_replace(ProcessState::Starting);

        info!(
            "Starting proxy engine {} (config {})",
            self.engine.binary().display(),
            config_file.path().display()
        );

        let spawned = self
            .engine
            .command()
            .arg("run")
            .arg("-c")
            .arg(config_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.state_tx.send_replace(ProcessState::Error);
                return Err(StartError::Spawn(e.to_string()));
            }
        };

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, "stdout", line_tx.clone(), self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, "stderr", line_tx, self.output.clone()));
        }

        let deadline = tokio::time::sleep(self.readiness_timeout);
        tokio::pin!(deadline);
        let mut lines_open = true;

        loop {
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some(line) if self.probe.is_ready(&line) => {
                        debug!("Readiness marker seen: {}", line);
                        break;
                    }
                    Some(_) => {}
                    None => lines_open = false,
                },
                status = child.wait() => {
                    drain_readers(readers).await;
                    let diagnostic = self.extractor.extract(&self.output.lines());
                    self.state_tx.send_replace(ProcessState::Error);

                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            error!("Failed to wait for proxy engine: {}", e);
                            None
                        }
                    };
                    error!("Proxy engine exited during startup ({})", describe_exit(code, diagnostic.as_deref()));
                    return Err(StartError::Exited { code, diagnostic });
                }
                _ = &mut deadline => {
                    // TODO: probe the control port here instead of trusting the timeout
                    warn!(
                        "No readiness marker within {:?}, assuming the engine is up",
                        self.readiness_timeout
                    );
                    break;
                }
            }
        }

        let handle = EngineHandle {
            pid: child.id(),
            control,
            engine: self.engine.clone(),
            config_path: config_file.path().to_path_buf(),
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            child,
            readers,
            stop_rx,
            self.stop_grace,
            MonitorShared {
                state: self.state_tx.clone(),
                crash: self.crash.clone(),
                output: self.output.clone(),
                extractor: self.extractor.clone(),
            },
        ));

        self.state_tx.send_replace(ProcessState::Running);
        info!("Proxy engine running (pid {:?})", handle.pid);

        self.running = Some(RunningEngine {
            handle: handle.clone(),
            stop_tx,
            monitor,
            config_file,
        });

        Ok(handle)
    }

    /// Terminate the engine and delete its config file. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("Stopping proxy engine");

        // The monitor is already gone if the engine crashed
        let _ = running.stop_tx.send(());
        if let Err(e) = running.monitor.await {
            warn!("Engine monitor task failed: {}", e);
        }

        let path = running.config_file.path().to_path_buf();
        if let Err(e) = running.config_file.close() {
            warn!("Failed to remove engine config {}: {}", path.display(), e);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Let the monitor terminate the process if nobody called stop()
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
        }
    }
}

struct MonitorShared {
    state: watch::Sender<ProcessState>,
    crash: Arc<Mutex<Option<CrashReport>>>,
    output: EngineOutput,
    extractor: Arc<dyn DiagnosticExtractor>,
}

/// Owns the child after readiness until it exits or is told to stop
async fn monitor(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    shared: MonitorShared,
) {
    tokio::select! {
        status = child.wait() => {
            drain_readers(readers).await;
            let report = CrashReport {
                code: status.ok().and_then(|s| s.code()),
                diagnostic: shared.extractor.extract(&shared.output.lines()),
            };
            error!("Proxy engine exited unexpectedly ({})", report);

            *shared.crash.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
            shared.state.send_replace(ProcessState::Error);
        }
        _ = stop_rx => {
            terminate(&mut child, grace).await;
            drain_readers(readers).await;
            shared.state.send_replace(ProcessState::Stopped);
        }
    }
}

/// Graceful termination, then a hard kill after `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    if let Err(e) = signal_terminate(child) {
        debug!("Failed to signal proxy engine: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Proxy engine exited with {}", status),
        Ok(Err(e)) => warn!("Failed to wait for proxy engine: {}", e),
        Err(_) => {
            warn!("Proxy engine ignored termination for {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill proxy engine: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

fn spawn_reader<R>(
    stream: R,
    source: &'static str,
    lines_tx: mpsc::UnboundedSender<String>,
    output: EngineOutput,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    debug!("engine {}: {}", source, line);
                    output.push(line.clone());
                    // Nobody listens once the engine is ready
                    let _ = lines_tx.send(line);
                }
                Err(e) => {
                    debug!("Engine {} read failed: {}", source, e);
                    break;
                }
            }
        }
    })
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN, reader).await;
    }
}

fn write_config(config: &TransportConfig) -> Result<NamedTempFile, StartError> {
    let mut file = tempfile::Builder::new()
        .prefix("veil-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| StartError::Config(e.to_string()))?;

    serde_json::to_writer_pretty(&mut file, config).map_err(|e| StartError::Config(e.to_string()))?;
    file.flush().map_err(|e| StartError::Config(e.to_string()))?;

    Ok(file)
}

/// Engine start errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Proxy engine not found at {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("Failed to write engine config: {0}")]
    Config(String),

    #[error("Failed to spawn proxy engine: {0}")]
    Spawn(String),

    #[error("Proxy engine exited during startup ({})", describe_exit(*.code, .diagnostic.as_deref()))]
    Exited {
        code: Option<i32>,
        diagnostic: Option<String>,
    },
}
