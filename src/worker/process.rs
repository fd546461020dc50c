use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// One-shot command execution, used for sandbox-runtime queries and
/// dependency probes. Long-lived workers go through the RPC transport.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Default, Clone)]
pub struct StdCommandRunner;

impl CommandRunner for StdCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(spec.program.as_str());
        command
            .args(spec.args.iter().map(String::as_str))
            .stdin(Stdio::null());
        if let Some(cwd) = spec.cwd.as_ref() {
            command.current_dir(cwd);
        }
        let output = command.output().map_err(|source| CommandError::Io {
            program: spec.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).to_string(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).to_string(),
        })
    }
}

pub(crate) type LineReceiver = Receiver<io::Result<String>>;

/// Moves every line of `stream` onto a channel from a dedicated thread so the
/// owner can wait with a deadline (`recv_timeout`) or poll (`try_recv`).
/// The thread ends at EOF, on a read error, or once the receiver is gone.
pub(crate) fn spawn_line_pump<R>(stream: R, label: &str) -> io::Result<(LineReceiver, JoinHandle<()>)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(format!("{label}-pump"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(buf.as_slice())
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        let _ = tx.send(Err(error));
                        break;
                    }
                }
            }
        })?;
    Ok((rx, handle))
}

/// Terminate → bounded wait → kill → reap. When `whole_group` is set the
/// child must lead its own process group and every member is signalled.
/// Errors are swallowed so callers can always finish their cleanup.
pub(crate) fn terminate_child(
    child: &mut Child,
    grace: Duration,
    whole_group: bool,
) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        if whole_group {
            signal_child(child, Signal::Kill, true);
        }
        return Some(status);
    }

    signal_child(child, Signal::Terminate, whole_group);
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if whole_group {
                    // Reap leftovers that still hold the pipes open.
                    signal_child(child, Signal::Kill, true);
                }
                return Some(status);
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => break,
            Err(error) => {
                debug!(pid = child.id(), %error, "try_wait failed while terminating child");
                break;
            }
        }
    }

    debug!(pid = child.id(), grace_ms = grace.as_millis() as u64, "child ignored terminate; killing");
    signal_child(child, Signal::Kill, whole_group);
    if let Err(error) = child.kill() {
        debug!(pid = child.id(), %error, "kill after grace period failed");
    }
    child.wait().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_child(child: &mut Child, signal: Signal, whole_group: bool) {
    use nix::sys::signal::{kill, killpg, Signal as UnixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Terminate => UnixSignal::SIGTERM,
        Signal::Kill => UnixSignal::SIGKILL,
    };
    let pid = Pid::from_raw(child.id() as i32);
    let result = if whole_group {
        killpg(pid, sig).or_else(|_| kill(pid, sig))
    } else {
        kill(pid, sig)
    };
    if let Err(errno) = result {
        debug!(pid = child.id(), ?signal, %errno, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_child(child: &mut Child, _signal: Signal, _whole_group: bool) {
    let _ = child.kill();
}
