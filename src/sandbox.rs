//! Lifecycle of the PHP sandbox process
//!
//! A single `php -S` server is started lazily on the first script request and
//! reused afterwards. Each call to [`SandboxManager::ensure_running`] checks the
//! process under one async mutex, so concurrent requests never race to spawn a
//! second server. A process that has exited or refuses connections is torn
//! down and replaced on a fresh port and root directory. A process that accepts
//! connections but is slow to answer is busy, not dead: `php -S` serves one
//! request at a time.

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::pool::{ConnectionPool, ProbeOutcome};
use crate::port::find_available_port;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Interval between readiness probes while a fresh process starts
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a running sandbox can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    pub port: u16,
    pub root: PathBuf,
    pub pid: Option<u32>,
}

struct SandboxServer {
    child: Child,
    port: u16,
    root: TempDir,
    last_verified: Option<Instant>,
}

impl SandboxServer {
    fn endpoint(&self) -> SandboxEndpoint {
        SandboxEndpoint {
            port: self.port,
            root: self.root.path().to_path_buf(),
            pid: self.child.id(),
        }
    }
}

pub struct SandboxManager {
    config: SandboxConfig,
    pool: Arc<ConnectionPool>,
    state: Mutex<Option<SandboxServer>>,
    spawn_count: AtomicU64,
    in_flight: AtomicUsize,
}

/// Marks one script execution as running until dropped
pub struct ExecutionGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, pool: Arc<ConnectionPool>) -> Self {
        Self {
            config,
            pool,
            state: Mutex::new(None),
            spawn_count: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Return a live sandbox, starting or replacing the process when needed
    pub async fn ensure_running(&self) -> Result<SandboxEndpoint, SandboxError> {
        let mut state = self.state.lock().await;

        if let Some(server) = state.as_mut() {
            if self.is_alive(server).await {
                return Ok(server.endpoint());
            }
        }

        if let Some(stale) = state.take() {
            self.stop_server(stale).await;
        }

        let server = self.spawn_server().await?;
        let endpoint = server.endpoint();
        *state = Some(server);
        Ok(endpoint)
    }

    /// The current sandbox, if one has been started and not torn down
    pub async fn current(&self) -> Option<SandboxEndpoint> {
        self.state.lock().await.as_ref().map(SandboxServer::endpoint)
    }

    /// Number of processes spawned since startup
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    /// Count a script execution as running; liveness probes are skipped while
    /// any execution holds a guard.
    pub fn begin_execution(&self) -> ExecutionGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ExecutionGuard {
            in_flight: &self.in_flight,
        }
    }

    /// Script executions currently running against the sandbox
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Record that the sandbox on `port` just answered a script request
    pub async fn mark_verified(&self, port: u16) {
        let mut state = self.state.lock().await;
        if let Some(server) = state.as_mut() {
            if server.port == port {
                server.last_verified = Some(Instant::now());
            }
        }
    }

    /// Forget the sandbox on `port` so the next request re-verifies it.
    /// Called after a loopback connection to that port was refused.
    pub async fn invalidate(&self, port: u16) {
        let mut state = self.state.lock().await;
        if let Some(server) = state.as_mut() {
            if server.port == port {
                debug!(port, "Sandbox invalidated after connection failure");
                server.last_verified = None;
            }
        }
    }

    /// Stop the sandbox process and remove its root directory
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(server) = state.take() {
            info!(port = server.port, "Shutting down sandbox");
            self.stop_server(server).await;
        }
    }

    async fn is_alive(&self, server: &mut SandboxServer) -> bool {
        match server.child.try_wait() {
            Ok(Some(status)) => {
                warn!(port = server.port, ?status, "Sandbox process exited");
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(port = server.port, error = %e, "Failed to query sandbox process status");
                return false;
            }
        }

        let interval = self.config.liveness_interval();
        if server.last_verified.is_some_and(|at| at.elapsed() < interval) {
            return true;
        }

        // A running execution occupies the single-threaded server; probing now
        // would only wait behind it
        if self.in_flight() > 0 {
            return true;
        }

        match self.pool.probe(server.port, self.config.health_timeout()).await {
            ProbeOutcome::Answered => {
                server.last_verified = Some(Instant::now());
                true
            }
            ProbeOutcome::NoAnswer => {
                debug!(port = server.port, "Sandbox busy, keeping it");
                true
            }
            ProbeOutcome::Refused => {
                warn!(port = server.port, "Sandbox refuses connections, restarting");
                false
            }
        }
    }

    async fn spawn_server(&self) -> Result<SandboxServer, SandboxError> {
        let root = tempfile::Builder::new()
            .prefix("php-server-")
            .tempdir()
            .map_err(SandboxError::RootDirectory)?;

        let port = find_available_port(self.config.start_port, self.config.max_port_attempts).await?;
        let args = self.config.render_args(port, root.path());

        info!(
            command = %self.config.command,
            port,
            root = %root.path().display(),
            "Starting sandbox"
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);
        cmd.current_dir(root.path());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
            command: self.config.command.clone(),
            source: e,
        })?;
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", port);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", port);
        }

        let started = Instant::now();
        if let Err(e) = self.wait_until_ready(&mut child, port, started).await {
            let _ = child.kill().await;
            error!(port, error = %e, "Sandbox failed to start");
            return Err(e);
        }

        info!(
            port,
            pid = child.id().unwrap_or(0),
            startup_ms = started.elapsed().as_millis() as u64,
            "Sandbox ready"
        );

        Ok(SandboxServer {
            child,
            port,
            root,
            last_verified: Some(Instant::now()),
        })
    }

    async fn wait_until_ready(
        &self,
        child: &mut Child,
        port: u16,
        started: Instant,
    ) -> Result<(), SandboxError> {
        let deadline = self.config.startup_timeout();

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(port, ?status, "Sandbox exited during startup");
                return Err(SandboxError::Startup {
                    port,
                    waited_ms: started.elapsed().as_millis(),
                });
            }

            if self.pool.probe(port, self.config.health_timeout()).await == ProbeOutcome::Answered {
                return Ok(());
            }

            if started.elapsed() >= deadline {
                return Err(SandboxError::Startup {
                    port,
                    waited_ms: started.elapsed().as_millis(),
                });
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn stop_server(&self, mut server: SandboxServer) {
        let port = server.port;
        let grace_period = self.config.shutdown_grace();

        if let Some(pid) = server.child.id() {
            debug!(port, pid, "Sending SIGTERM to sandbox");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = server.child.start_kill();
            }
        }

        match timeout(grace_period, server.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(port, ?status, "Sandbox process exited");
            }
            Ok(Err(e)) => {
                warn!(port, error = %e, "Error waiting for sandbox to exit");
            }
            Err(_) => {
                warn!(
                    port,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = server.child.kill().await;
            }
        }

        let root = server.root.path().to_path_buf();
        if let Err(e) = server.root.close() {
            warn!(root = %root.display(), error = %e, "Failed to remove sandbox root");
        }
    }
}

/// Relay one output stream of the sandbox into the log, line by line
fn forward_output<R>(reader: R, stream: &'static str, port: u16)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(port, stream, "{}", line);
        }
    });
}
