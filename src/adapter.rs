//! Per-app supervisor: owns the lifecycle state machine of one backend,
//! launches it, watches its output, probes it for readiness and proxies
//! requests to it.
//!
//! # Locking
//!
//! Two locks with separate concerns:
//!
//! - `lifecycle` (async mutex) is held for a whole transition, including
//!   the wait for process reaping during a stop. Every state change
//!   happens while holding it, so transitions never race.
//! - `info` (sync rwlock) holds the observable fields (state, port, pid,
//!   command, boot log). It is only written under `lifecycle`, and read
//!   without it so status queries never wait on a transition.
//!
//! The proxy cache has its own lock inside [`ProxyRouter`].

use crate::config::AdapterConfig;
use crate::error::{AdapterError, StopReason};
use crate::launcher::{self, OutputStream};
use crate::logbuf::LineBuffer;
use crate::probe::{self, ProbeOutcome};
use crate::router::{request_host, ProxyRouter, ServeError};
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    /// No backend process
    Stopped,
    /// Process launched, waiting for its port to open
    Starting,
    /// Backend accepts connections
    Running,
    /// Process is being killed and reaped
    Stopping,
    /// A failure was detected; always followed by Stopping then Stopped
    Error,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Stopped => "stopped",
            AdapterState::Starting => "starting",
            AdapterState::Running => "running",
            AdapterState::Stopping => "stopping",
            AdapterState::Error => "error",
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable fields of the current (or last) run
#[derive(Debug)]
struct RunInfo {
    state: AdapterState,
    port: Option<u16>,
    command: Option<String>,
    /// 0 when no process is running
    pid: u32,
    boot_log: Option<String>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    last_stop_reason: Option<StopReason>,
}

/// Handles owned by the lifecycle lock
#[derive(Default)]
struct Run {
    /// Bumped on every start so background tasks of an old run can tell
    /// they are stale
    id: u64,
    child: Option<Child>,
    /// Fired exactly once per run, when the run stops
    cancel: Option<CancellationToken>,
}

/// Serializable view of an adapter
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSnapshot {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_port_name: Option<String>,
    pub shell_command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restart_patterns: Vec<String>,
    pub port: Option<u16>,
    pub command: Option<String>,
    pub pid: u32,
    pub boot_log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub state: AdapterState,
    pub last_stop_reason: Option<StopReason>,
}

/// Status document served by the state endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub app: AdapterSnapshot,
    pub uptime: String,
    pub status: AdapterState,
}

/// Supervisor of one app backend.
///
/// Built once per configured app and shared behind an `Arc`; `start` and
/// `stop` may be called any number of times over its lifetime.
pub struct Adapter {
    config: AdapterConfig,
    lifecycle: tokio::sync::Mutex<Run>,
    info: RwLock<RunInfo>,
    log: LineBuffer,
    router: ProxyRouter,
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Arc<Self> {
        Arc::new(Self {
            log: LineBuffer::new(config.log_lines),
            router: ProxyRouter::new(&config.scheme),
            lifecycle: tokio::sync::Mutex::new(Run::default()),
            info: RwLock::new(RunInfo {
                state: AdapterState::Stopped,
                port: None,
                command: None,
                pid: 0,
                boot_log: None,
                started_at: None,
                started: None,
                last_stop_reason: None,
            }),
            config,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn status(&self) -> AdapterState {
        self.info.read().state
    }

    pub fn port(&self) -> Option<u16> {
        self.info.read().port
    }

    pub fn pid(&self) -> u32 {
        self.info.read().pid
    }

    /// The shell command of the current run after substitution
    pub fn command(&self) -> Option<String> {
        self.info.read().command.clone()
    }

    /// Output captured up to the moment the backend became ready
    pub fn boot_log(&self) -> Option<String> {
        self.info.read().boot_log.clone()
    }

    pub fn last_stop_reason(&self) -> Option<StopReason> {
        self.info.read().last_stop_reason.clone()
    }

    pub fn log(&self) -> &LineBuffer {
        &self.log
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    /// Copy the current output buffer into `w`
    pub fn write_log<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.log.write_to(w)
    }

    pub fn uptime(&self) -> Duration {
        self.info
            .read()
            .started
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> AdapterSnapshot {
        let info = self.info.read();
        AdapterSnapshot {
            name: self.config.name.clone(),
            scheme: self.config.scheme.clone(),
            host: self.config.host.clone(),
            dir: self.config.dir.clone(),
            env_port_name: self.config.env_port_name.clone(),
            shell_command: self.config.shell_command.clone(),
            restart_patterns: self
                .config
                .restart_patterns
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            port: info.port,
            command: info.command.clone(),
            pid: info.pid,
            boot_log: info.boot_log.clone(),
            started_at: info.started_at,
            state: info.state,
            last_stop_reason: info.last_stop_reason.clone(),
        }
    }

    pub fn status_document(&self) -> AppStatus {
        let app = self.snapshot();
        AppStatus {
            uptime: format_uptime(self.uptime()),
            status: app.state,
            app,
        }
    }

    /// Launch the backend and return once it is spawned.
    ///
    /// Readiness is detected in the background; the state moves to
    /// Running when the assigned port accepts connections. Calling this
    /// while Starting or Running does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), AdapterError> {
        let mut run = self.lifecycle.lock().await;
        match self.status() {
            AdapterState::Starting | AdapterState::Running => {
                debug!(host = %self.config.host, "Already starting or running");
                return Ok(());
            }
            _ => {}
        }

        info!(host = %self.config.host, "START");
        self.begin_run(&mut run).await
    }

    /// Kill the backend and wait for it to be reaped.
    ///
    /// Calling this while Stopping or Stopped does nothing.
    pub async fn stop(&self, reason: StopReason) -> Result<(), AdapterError> {
        let mut run = self.lifecycle.lock().await;
        match self.status() {
            AdapterState::Stopping | AdapterState::Stopped => return Ok(()),
            _ => {}
        }
        self.stop_locked(&mut run, reason).await
    }

    /// Stop the backend if it runs, then start it again
    pub async fn restart(self: &Arc<Self>) -> Result<(), AdapterError> {
        self.stop(StopReason::requested("restart requested")).await?;
        self.start().await
    }

    /// Proxy a request to the backend, reusing the cached target for the
    /// request's hostname.
    pub async fn serve<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ServeError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let port = self.port().ok_or(ServeError::NotRunning)?;
        let host = request_host(&req).unwrap_or_else(|| self.config.host.clone());

        let target = self.router.target_for(&host, port).map_err(|e| {
            error!(host = %self.config.host, error = %e, "Error trying to get proxy");
            e
        })?;

        debug!(host, uri = %req.uri(), target = %target.url(), "Proxying request");
        Ok(target.forward(req).await?)
    }

    async fn begin_run(self: &Arc<Self>, run: &mut Run) -> Result<(), AdapterError> {
        run.id += 1;
        let run_id = run.id;
        let cancel = CancellationToken::new();
        run.cancel = Some(cancel.clone());
        self.log.clear();

        {
            let mut info = self.info.write();
            info.state = AdapterState::Starting;
            info.port = None;
            info.command = None;
            info.pid = 0;
            info.boot_log = None;
            info.started_at = Some(Utc::now());
            info.started = Some(Instant::now());
            info.last_stop_reason = None;
        }

        let port = match launcher::find_available_port() {
            Ok(port) => port,
            Err(e) => {
                self.fail_locked(run, &e).await;
                return Err(e);
            }
        };
        self.info.write().port = Some(port);

        let launched = match launcher::launch(&self.config, port) {
            Ok(launched) => launched,
            Err(e) => {
                self.fail_locked(run, &e).await;
                return Err(e);
            }
        };

        {
            let mut info = self.info.write();
            info.pid = launched.pid;
            info.command = Some(launched.command);
        }
        run.child = Some(launched.child);

        tokio::spawn(Arc::clone(self).tail(launched.output, port, launched.pid, run_id));
        tokio::spawn(Arc::clone(self).probe(port, cancel, run_id));

        Ok(())
    }

    /// Error → Stopping → Stopped. Kill failures are logged and swallowed.
    async fn fail_locked(&self, run: &mut Run, err: &AdapterError) {
        match self.status() {
            AdapterState::Stopping | AdapterState::Stopped => return,
            _ => {}
        }
        self.info.write().state = AdapterState::Error;
        error!(host = %self.config.host, error = %err, "ERROR");

        let _ = self.stop_locked(run, StopReason::from(err)).await;
    }

    async fn stop_locked(&self, run: &mut Run, reason: StopReason) -> Result<(), AdapterError> {
        self.info.write().state = AdapterState::Stopping;
        info!(host = %self.config.host, reason = %reason, "STOP");

        let mut result = Ok(());
        let child = run.child.take();
        let pid = self.pid();

        // Kill before cancelling: closing the pipes is what ends the tail
        // watcher, the token only ends the probe.
        let child = match child {
            Some(mut child) => match kill_backend(&mut child, pid) {
                Ok(()) => Some(child),
                Err(source) => {
                    error!(host = %self.config.host, pid, error = %source, "Error trying to stop");
                    result = Err(AdapterError::ProcessKill { pid, source });
                    None
                }
            },
            None => None,
        };

        if let Some(cancel) = run.cancel.take() {
            cancel.cancel();
        }

        if let Some(mut child) = child {
            match child.wait().await {
                Ok(status) => debug!(host = %self.config.host, pid, ?status, "Backend exited"),
                Err(e) => warn!(host = %self.config.host, pid, error = %e, "Error waiting for backend"),
            }
        }

        {
            let mut info = self.info.write();
            info.state = AdapterState::Stopped;
            info.pid = 0;
            info.port = None;
            info.last_stop_reason = Some(reason);
        }
        info!(host = %self.config.host, "Shutdown and cleaned up");

        result
    }

    /// Stop requested by a background task of run `run_id`. Ignored when
    /// that run is already over.
    async fn stop_run(&self, run_id: u64, err: AdapterError, is_error: bool) {
        let mut run = self.lifecycle.lock().await;
        if run.id != run_id {
            return;
        }

        if is_error {
            self.fail_locked(&mut run, &err).await;
            return;
        }

        match self.status() {
            AdapterState::Stopping | AdapterState::Stopped => {}
            _ => {
                let _ = self.stop_locked(&mut run, StopReason::from(&err)).await;
            }
        }
    }

    /// Read backend output until it closes or matches a restart pattern
    async fn tail(self: Arc<Self>, mut output: OutputStream, port: u16, pid: u32, run_id: u64) {
        let host = self.config.host.clone();

        let reason = loop {
            match output.next_line().await {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    self.log.append(&line);
                    info!(target: "devgate::backend", host = %host, port, pid, "{}", line);

                    if let Some(pattern) = self
                        .config
                        .restart_patterns
                        .iter()
                        .find(|p| p.is_match(&line))
                    {
                        break AdapterError::RestartPatternMatched {
                            pattern: pattern.as_str().to_string(),
                        };
                    }
                }
                Some(Err(e)) => {
                    debug!(host = %host, error = %e, "Output read failed");
                    break AdapterError::StreamClosed;
                }
                None => break AdapterError::StreamClosed,
            }
        };

        drop(output);
        self.stop_run(run_id, reason, false).await;
    }

    /// Wait for the backend's port, then mark the run as Running
    async fn probe(self: Arc<Self>, port: u16, cancel: CancellationToken, run_id: u64) {
        let outcome = probe::wait_for_port(
            port,
            self.config.probe_interval,
            self.config.startup_timeout,
            &cancel,
        )
        .await;

        match outcome {
            ProbeOutcome::Ready => self.mark_running(run_id, port).await,
            ProbeOutcome::Cancelled => {
                debug!(host = %self.config.host, port, "Readiness probe cancelled");
            }
            ProbeOutcome::TimedOut => {
                warn!(host = %self.config.host, port, "Timeout waiting for port");
                let err = AdapterError::PortProbeTimeout {
                    port,
                    timeout: self.config.startup_timeout,
                };
                self.stop_run(run_id, err, true).await;
            }
        }
    }

    async fn mark_running(&self, run_id: u64, port: u16) {
        let run = self.lifecycle.lock().await;
        if run.id != run_id || self.status() != AdapterState::Starting {
            return;
        }

        let boot_log = self.log.snapshot();
        {
            let mut info = self.info.write();
            info.boot_log = Some(boot_log);
            info.state = AdapterState::Running;
        }
        info!(host = %self.config.host, port, "Port is available, backend running");
    }
}

/// Kill the backend's process group, falling back to the process itself
fn kill_backend(child: &mut Child, pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if pid > 0 && launcher::kill_process_group(pid).is_ok() {
            return Ok(());
        }
    }
    child.start_kill()
}

/// Format a duration as `1h2m3s`, `4m5s`, `6s` or `250ms`
pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }

    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
