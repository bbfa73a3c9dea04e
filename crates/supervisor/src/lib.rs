//! Supervises the `llama-server` GGUF-inference subprocess: port allocation,
//! health polling, bounded-restart crash recovery, and graceful shutdown.
//!
//! Pid tracking with `kill -0` liveness and `SIGTERM` teardown under a
//! bounded wait, as a supervised child of this process, using `nix` for
//! direct signal dispatch instead of shelling out to `kill`.

pub mod platform;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use orc_inference::InferenceClient;

const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RESTARTS: u32 = 3;
const GRACE_PERIOD: Duration = Duration::from_secs(5);
/// How often `wait_until_healthy` logs that it is still waiting.
const HEALTH_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Errors specific to bringing a subprocess up. Everything past startup
/// stays `anyhow::Result` — the supervisor's own runtime errors (spawn
/// failures mid-restart, signal dispatch) aren't part of this crate's
/// public contract the way these three are.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("inference binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("subprocess exited before reporting healthy (code {0:?})")]
    StartupExit(Option<i32>),
    #[error("subprocess did not become healthy within {0:?}")]
    HealthTimeout(Duration),
    #[error("startup cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    pub extra_args: Vec<String>,
    pub host: String,
    /// `None` means allocate an ephemeral port by binding to port 0 and
    /// releasing it before spawn (accepted TOCTOU: nothing else on this host
    /// is expected to race for it between release and exec).
    pub port: Option<u16>,
    pub health_poll_interval: Duration,
    pub startup_timeout: Duration,
    pub max_restart_attempts: u32,
    /// Prefixes forwarded stdout/stderr log lines.
    pub label: String,
    /// Discard stdout/stderr instead of line-scanning and forwarding them to
    /// the structured logger.
    pub quiet: bool,
}

impl SubprocessConfig {
    pub fn new(binary_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
            extra_args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: None,
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_restart_attempts: DEFAULT_MAX_RESTARTS,
            label: "inference".to_string(),
            quiet: false,
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// The environment variable name used on this platform to extend the
    /// dynamic linker's search path so the subprocess finds shared libraries
    /// (e.g. `libggml`) that ship alongside its binary.
    fn library_path_var() -> &'static str {
        if cfg!(target_os = "macos") {
            "DYLD_LIBRARY_PATH"
        } else if cfg!(target_os = "windows") {
            "PATH"
        } else {
            "LD_LIBRARY_PATH"
        }
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started { port: u16 },
    HealthRestored,
    Crashed { exit_code: Option<i32>, attempt: u32 },
    RestartExhausted,
    Stopped,
}

async fn allocate_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn build_command(config: &SubprocessConfig, port: u16) -> Command {
    let mut cmd = Command::new(&config.binary_path);
    cmd.arg("--model")
        .arg(&config.model_path)
        .arg("--host")
        .arg(&config.host)
        .arg("--port")
        .arg(port.to_string())
        .args(&config.extra_args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    if config.quiet {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    } else {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    if let Some(bin_dir) = config.binary_path.parent() {
        let var = SubprocessConfig::library_path_var();
        let existing = std::env::var_os(var);
        let joined = match existing {
            Some(existing) if !existing.is_empty() => {
                let mut paths = vec![bin_dir.to_path_buf()];
                paths.extend(std::env::split_paths(&existing));
                std::env::join_paths(paths).unwrap_or_else(|_| bin_dir.as_os_str().to_os_string())
            }
            _ => bin_dir.as_os_str().to_os_string(),
        };
        cmd.env(var, joined);
    }

    cmd
}

/// Spawns a background task that line-scans a child's stdout/stderr and
/// forwards each line to the structured logger prefixed by `label`.
fn forward_output(child: &mut Child, label: String) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    if let Some(stdout) = child.stdout.take() {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "subprocess", %label, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "subprocess", %label, "{line}");
            }
        });
    }
}

/// Supervises a single `llama-server` child process across its lifetime,
/// including crash-triggered restarts.
pub struct SubprocessHandle {
    config: SubprocessConfig,
    port: u16,
    client: InferenceClient,
    child: Arc<Mutex<Child>>,
    pid: Arc<AtomicU32>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    shutdown_tx: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,
    supervise_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for SubprocessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessHandle")
            .field("port", &self.port)
            .field("pid", &self.pid.load(Ordering::Relaxed))
            .finish()
    }
}

impl SubprocessHandle {
    /// Resolve the binary and allocate a port, without starting anything yet.
    /// Port allocation happens exactly once per handle lifetime even across
    /// crash-restarts, since `start` is only ever called once per handle and
    /// `supervise_loop` re-execs on the same port afterward.
    pub async fn configure(mut config: SubprocessConfig) -> Result<SubprocessConfig, StartError> {
        if !config.binary_path.exists() {
            return Err(StartError::BinaryMissing(config.binary_path));
        }
        if config.port.is_none() {
            config.port = Some(allocate_port().await.map_err(StartError::Other)?);
        }
        Ok(config)
    }

    /// Spawn the subprocess, wait for it to report healthy, and start the
    /// background supervision task that restarts it on unexpected exit.
    /// `cancel` only gates the bounded health wait; once healthy, the child's
    /// lifetime is independent of it.
    pub async fn start(config: SubprocessConfig, cancel: CancellationToken) -> Result<Self, StartError> {
        let config = Self::configure(config).await?;
        let port = config.port.expect("configure always fills in a port");

        let mut child = build_command(&config, port).spawn().map_err(anyhow::Error::from)?;
        if !config.quiet {
            forward_output(&mut child, config.label.clone());
        }
        let pid = child.id().unwrap_or(0);
        let client = InferenceClient::new(format!("http://{}:{}", config.host, port));

        let (events_tx, _) = broadcast::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pid = Arc::new(AtomicU32::new(pid));

        let handle = Self {
            config: config.clone(),
            port,
            client,
            child: Arc::new(Mutex::new(child)),
            pid,
            events_tx,
            shutdown_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(std::sync::Mutex::new(None)),
            supervise_task: Mutex::new(None),
        };

        if let Err(err) = handle
            .wait_until_ready(config.startup_timeout, &cancel)
            .await
        {
            let _ = handle.stop().await;
            return Err(err);
        }
        let _ = handle.events_tx.send(SupervisorEvent::Started { port });

        let task = tokio::spawn(supervise_loop(
            config,
            port,
            handle.child.clone(),
            handle.pid.clone(),
            handle.events_tx.clone(),
            shutdown_rx,
            handle.stopped.clone(),
            handle.exit_code.clone(),
        ));
        *handle.supervise_task.lock().await = Some(task);

        Ok(handle)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client(&self) -> &InferenceClient {
        &self.client
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_tx.subscribe()
    }

    pub async fn healthy(&self) -> bool {
        self.client.health().await
    }

    pub async fn wait_until_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        self.wait_until_ready(timeout, &CancellationToken::new())
            .await
            .map_err(anyhow::Error::from)
    }

    /// Polls `GET /health` every `health_poll_interval` until it succeeds,
    /// the child exits first, `cancel` fires, or `timeout` elapses, logging
    /// progress every 5 seconds.
    async fn wait_until_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), StartError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut last_progress_log = start;

        loop {
            if self.client.health().await {
                return Ok(());
            }

            if cancel.is_cancelled() {
                return Err(StartError::Cancelled);
            }

            {
                let mut child = self.child.lock().await;
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(StartError::StartupExit(status.code()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StartError::HealthTimeout(timeout));
            }
            if now.duration_since(last_progress_log) >= HEALTH_PROGRESS_LOG_INTERVAL {
                tracing::info!(
                    port = self.port,
                    elapsed_secs = start.elapsed().as_secs(),
                    "waiting for inference subprocess to report healthy"
                );
                last_progress_log = now;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.health_poll_interval) => {}
                _ = cancel.cancelled() => return Err(StartError::Cancelled),
            }
        }
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("exit_code mutex poisoned")
    }

    /// Graceful POSIX shutdown: SIGTERM, wait up to five seconds, then
    /// SIGKILL if still alive. On platforms without signal support, falls
    /// back to a hard kill immediately.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let pid = self.pid.load(Ordering::Relaxed);
        let mut child = self.child.lock().await;

        if platform::terminate(pid).is_err() {
            let _ = child.start_kill();
        } else {
            let deadline = Instant::now() + GRACE_PERIOD;
            loop {
                if let Ok(Some(status)) = child.try_wait() {
                    *self.exit_code.lock().expect("exit_code mutex poisoned") = status.code();
                    let _ = self.events_tx.send(SupervisorEvent::Stopped);
                    if let Some(task) = self.supervise_task.lock().await.take() {
                        task.abort();
                    }
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    let _ = platform::force_kill(pid);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let status = child.wait().await?;
        *self.exit_code.lock().expect("exit_code mutex poisoned") = status.code();
        let _ = self.events_tx.send(SupervisorEvent::Stopped);
        if let Some(task) = self.supervise_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise_loop(
    config: SubprocessConfig,
    port: u16,
    child: Arc<Mutex<Child>>,
    pid_cell: Arc<AtomicU32>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,
) {
    let mut attempt: u32 = 0;
    loop {
        let status = {
            let mut guard = child.lock().await;
            tokio::select! {
                status = guard.wait() => status,
                _ = shutdown_rx.changed() => return,
            }
        };

        if stopped.load(Ordering::SeqCst) {
            return;
        }

        let code = status.ok().and_then(|s| s.code());
        *exit_code.lock().expect("exit_code mutex poisoned") = code;
        attempt += 1;
        let _ = events_tx.send(SupervisorEvent::Crashed {
            exit_code: code,
            attempt,
        });

        if attempt > config.max_restart_attempts {
            let _ = events_tx.send(SupervisorEvent::RestartExhausted);
            return;
        }

        tracing::warn!(port, attempt, ?code, "inference subprocess crashed; restarting");

        match build_command(&config, port).spawn() {
            Ok(mut new_child) => {
                pid_cell.store(new_child.id().unwrap_or(0), Ordering::Relaxed);
                if !config.quiet {
                    forward_output(&mut new_child, config.label.clone());
                }
                *child.lock().await = new_child;

                let client = InferenceClient::new(format!("http://{}:{}", config.host, port));
                let deadline = Instant::now() + config.startup_timeout;
                while !client.health().await {
                    if Instant::now() >= deadline {
                        let _ = events_tx.send(SupervisorEvent::RestartExhausted);
                        return;
                    }
                    tokio::time::sleep(config.health_poll_interval).await;
                }
                let _ = events_tx.send(SupervisorEvent::HealthRestored);
            }
            Err(err) => {
                tracing::error!(?err, "failed to respawn inference subprocess");
                let _ = events_tx.send(SupervisorEvent::RestartExhausted);
                return;
            }
        }
    }
}

/// Owns the inference subprocess and, optionally, a separate embedding-model
/// subprocess, so callers manage one lifetime instead of two.
pub struct SupervisorSet {
    pub inference: SubprocessHandle,
    pub embedding: Option<SubprocessHandle>,
}

impl SupervisorSet {
    pub async fn start(
        inference_config: SubprocessConfig,
        embedding_config: Option<SubprocessConfig>,
    ) -> anyhow::Result<Self> {
        Self::start_with_cancel(inference_config, embedding_config, CancellationToken::new()).await
    }

    pub async fn start_with_cancel(
        inference_config: SubprocessConfig,
        embedding_config: Option<SubprocessConfig>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let inference = SubprocessHandle::start(inference_config, cancel.clone()).await?;
        let embedding = match embedding_config {
            Some(cfg) => Some(SubprocessHandle::start(cfg, cancel).await?),
            None => None,
        };
        Ok(Self { inference, embedding })
    }

    pub async fn stop_all(&self) -> anyhow::Result<()> {
        if let Some(embedding) = &self.embedding {
            embedding.stop().await?;
        }
        self.inference.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_port_returns_distinct_ports() {
        let a = allocate_port().await.unwrap();
        let b = allocate_port().await.unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn config_defaults_auto_allocate_port() {
        let config = SubprocessConfig::new("/usr/bin/llama-server", "/models/model.gguf");
        assert!(config.port.is_none());
        assert_eq!(config.max_restart_attempts, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn with_port_overrides_auto_allocation() {
        let config = SubprocessConfig::new("llama-server", "model.gguf").with_port(8090);
        assert_eq!(config.port, Some(8090));
    }

    #[tokio::test]
    async fn configure_fails_with_binary_missing_for_nonexistent_path() {
        let config = SubprocessConfig::new("/nonexistent/llama-server-binary", "/models/model.gguf");
        let err = SubprocessHandle::configure(config).await.unwrap_err();
        assert!(matches!(err, StartError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn configure_allocates_a_port_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("llama-server");
        tokio::fs::write(&binary, b"").await.unwrap();
        let config = SubprocessConfig::new(&binary, "/models/model.gguf");
        let configured = SubprocessHandle::configure(config).await.unwrap();
        assert!(configured.port.is_some());
    }

    #[test]
    fn library_path_var_is_platform_appropriate() {
        let var = SubprocessConfig::library_path_var();
        assert!(!var.is_empty());
    }
}
