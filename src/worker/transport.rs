use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::bundle::MountedBundle;
use super::process::{spawn_line_pump, terminate_child, LineReceiver};
use super::{TransportState, WorkerLaunch};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Bound on how long a closed transport waits for the last stderr lines.
const EXIT_DIAGNOSTICS_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker transport is not running (state: {state})")]
    NotRunning { state: &'static str },
    #[error("worker transport was closed and cannot be restarted")]
    AlreadyClosed,
    #[error(
        "worker did not respond within {}s (timeout){}",
        .timeout.as_secs_f64(),
        diagnostics_suffix(.diagnostics)
    )]
    Timeout {
        timeout: Duration,
        diagnostics: String,
    },
    #[error("worker closed its output before replying{}", diagnostics_suffix(.diagnostics))]
    TransportClosed { diagnostics: String },
    #[error("worker returned an error: {payload}")]
    Rpc { payload: Value },
    #[error("worker sent a malformed response line '{line}': {source}")]
    MalformedResponse {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("worker pipe failed: {0}")]
    Io(#[source] io::Error),
    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {diagnostics}")
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: LineReceiver,
    stderr: LineReceiver,
    pumps: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"));
        };
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    /// Never blocks: takes whatever the stderr pump has already queued.
    fn drain_diagnostics(&self) -> String {
        let mut lines = Vec::new();
        loop {
            match self.stderr.try_recv() {
                Ok(Ok(line)) => push_diagnostic(&mut lines, line),
                Ok(Err(_)) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        lines.join(" | ")
    }

    /// Once stdout hit EOF the worker is on its way out; give its stderr a
    /// short, bounded chance to flush before collecting.
    fn drain_diagnostics_after_exit(&self) -> String {
        let deadline = Instant::now() + EXIT_DIAGNOSTICS_SETTLE;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stderr.recv_timeout(remaining) {
                Ok(Ok(line)) => push_diagnostic(&mut lines, line),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        lines.join(" | ")
    }

    fn shutdown(mut self, grace: Duration) {
        let pid = self.child.id();
        let status = terminate_child(&mut self.child, grace, true);
        debug!(pid, ?status, "worker stopped");
        drop(self.stdin.take());
        let WorkerProcess {
            stdout,
            stderr,
            pumps,
            ..
        } = self;
        drop(stdout);
        drop(stderr);
        for pump in pumps {
            if pump.join().is_err() {
                debug!(pid, "worker stream pump panicked");
            }
        }
    }
}

fn push_diagnostic(lines: &mut Vec<String>, line: String) {
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

/// Line-delimited JSON-RPC over a child's stdin/stdout, one request in
/// flight at a time. The worker's stderr is kept as diagnostics and folded
/// into timeout and closed-pipe errors.
pub struct RpcTransport {
    command: Vec<String>,
    env: Option<HashMap<String, String>>,
    cwd: Option<PathBuf>,
    bundle: Option<MountedBundle>,
    response_timeout: Duration,
    shutdown_grace: Duration,
    state: TransportState,
    worker: Option<WorkerProcess>,
    next_id: u64,
    abandoned_ids: HashSet<u64>,
}

impl RpcTransport {
    pub fn new(launch: WorkerLaunch, response_timeout: Duration) -> Self {
        Self {
            command: launch.command,
            env: launch.env,
            cwd: launch.cwd,
            bundle: launch.bundle,
            response_timeout,
            shutdown_grace: WORKER_SHUTDOWN_GRACE,
            state: TransportState::Unstarted,
            worker: None,
            next_id: 0,
            abandoned_ids: HashSet::new(),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|worker| worker.child.id())
    }

    pub fn start(&mut self) -> Result<(), TransportError> {
        match self.state {
            TransportState::Running => return Ok(()),
            TransportState::Closed => return Err(TransportError::AlreadyClosed),
            TransportState::Unstarted => {}
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or(TransportError::EmptyCommand)?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = self.env.as_ref() {
            command.env_clear().envs(env);
        }
        if let Some(cwd) = self.cwd.as_ref() {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;
        let worker = match attach_pipes(&mut child) {
            Ok((stdin, stdout, stderr, pumps)) => WorkerProcess {
                child,
                stdin: Some(stdin),
                stdout,
                stderr,
                pumps,
            },
            Err(error) => {
                terminate_child(&mut child, self.shutdown_grace, true);
                return Err(TransportError::Io(error));
            }
        };

        info!(
            pid = worker.child.id(),
            command = %self.command.join(" "),
            augmented_env = self.env.is_some(),
            "worker started"
        );
        self.worker = Some(worker);
        self.state = TransportState::Running;
        Ok(())
    }

    /// Sends one request and waits for its reply. A timeout leaves the
    /// worker running; its late reply is recognised by id and discarded.
    pub fn request(&mut self, method: &str, params: Value) -> Result<Value, TransportError> {
        let state = self.state;
        let Some(worker) = self.worker.as_mut() else {
            return Err(TransportError::NotRunning {
                state: state.as_str(),
            });
        };

        self.next_id += 1;
        let id = self.next_id;
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: &params,
        })
        .map_err(TransportError::Serialize)?;
        debug!(target: "shutter::rpc", id, method, "tx {line}");

        if let Err(error) = worker.send_line(line.as_str()) {
            if error.kind() == io::ErrorKind::BrokenPipe {
                let diagnostics = worker.drain_diagnostics_after_exit();
                log_diagnostics(&diagnostics);
                return Err(TransportError::TransportClosed { diagnostics });
            }
            return Err(TransportError::Io(error));
        }

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match worker.stdout.recv_timeout(remaining) {
                Ok(Ok(raw)) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    debug!(target: "shutter::rpc", id, "rx {raw}");
                    let response: Value = serde_json::from_str(raw.as_str()).map_err(|source| {
                        TransportError::MalformedResponse {
                            line: raw.clone(),
                            source,
                        }
                    })?;
                    if let Some(stale) = response_id(&response).filter(|reply_id| {
                        *reply_id != id && self.abandoned_ids.contains(reply_id)
                    }) {
                        debug!(target: "shutter::rpc", stale, "discarding late reply to abandoned request");
                        self.abandoned_ids.remove(&stale);
                        continue;
                    }
                    return interpret_response(response);
                }
                Ok(Err(error)) => return Err(TransportError::Io(error)),
                Err(RecvTimeoutError::Timeout) => {
                    let diagnostics = worker.drain_diagnostics();
                    log_diagnostics(&diagnostics);
                    error!(id, method, timeout_s = self.response_timeout.as_secs_f64(), "worker request timed out");
                    self.abandoned_ids.insert(id);
                    return Err(TransportError::Timeout {
                        timeout: self.response_timeout,
                        diagnostics,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let diagnostics = worker.drain_diagnostics_after_exit();
                    log_diagnostics(&diagnostics);
                    error!(id, method, "worker closed its output");
                    return Err(TransportError::TransportClosed { diagnostics });
                }
            }
        }
    }

    /// Diagnostics the worker has written so far, without waiting.
    pub fn drain_diagnostics(&self) -> String {
        let diagnostics = self
            .worker
            .as_ref()
            .map(WorkerProcess::drain_diagnostics)
            .unwrap_or_default();
        log_diagnostics(&diagnostics);
        diagnostics
    }

    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(self.shutdown_grace);
        }
        if let Some(mut bundle) = self.bundle.take() {
            bundle.unmount();
        }
        if self.state.can_transition_to(TransportState::Closed) {
            debug!(from = self.state.as_str(), "worker transport closed");
            self.state = TransportState::Closed;
        }
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

type AttachedPipes = (ChildStdin, LineReceiver, LineReceiver, Vec<JoinHandle<()>>);

fn attach_pipes(child: &mut Child) -> io::Result<AttachedPipes> {
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(io::Error::other("worker pipes unavailable"));
    };
    let (stdout_rx, stdout_pump) = spawn_line_pump(stdout, "worker-stdout")?;
    let (stderr_rx, stderr_pump) = spawn_line_pump(stderr, "worker-stderr")?;
    Ok((stdin, stdout_rx, stderr_rx, vec![stdout_pump, stderr_pump]))
}

fn response_id(response: &Value) -> Option<u64> {
    match response.get("id")? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn interpret_response(response: Value) -> Result<Value, TransportError> {
    let Value::Object(mut fields) = response else {
        return Ok(Value::Null);
    };
    match fields.remove("error") {
        Some(Value::Null) | None => {}
        Some(payload) => return Err(TransportError::Rpc { payload }),
    }
    Ok(fields.remove("result").unwrap_or(Value::Null))
}

fn log_diagnostics(diagnostics: &str) {
    if !diagnostics.is_empty() {
        warn!(target: "shutter::rpc", stderr = %diagnostics, "worker diagnostics");
    }
}
