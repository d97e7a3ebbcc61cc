//! Child process plumbing
//!
//! Commands run in their own process group so that a timeout or kill takes
//! out everything the shell started, not just the shell.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 4096;

/// How long output readers may lag behind process exit before they are
/// abandoned (a grandchild may still hold the pipe open).
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Interpreted by the platform shell
    Shell(String),
    /// Spawned directly, no shell involved
    Exec(Vec<String>),
}

impl CommandLine {
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(s) => s.clone(),
            CommandLine::Exec(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug)]
pub enum ProcessEvent {
    Started(u32),
    Output(String),
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    /// Spawn or wait failure
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// `OLIVETIN=1` plus one upper-cased variable per named argument.
pub fn build_env(args: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut env = vec![("OLIVETIN".to_string(), "1".to_string())];

    for (name, value) in args {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        env.push((name.to_uppercase(), value.clone()));
    }

    env
}

#[cfg(unix)]
fn base_command(line: &CommandLine) -> Option<Command> {
    let mut cmd = match line {
        CommandLine::Shell(script) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
        CommandLine::Exec(argv) => {
            let (program, rest) = argv.split_first()?;
            let mut cmd = Command::new(program);
            cmd.args(rest);
            cmd
        }
    };
    cmd.process_group(0);
    Some(cmd)
}

#[cfg(windows)]
fn base_command(line: &CommandLine) -> Option<Command> {
    match line {
        CommandLine::Shell(script) => {
            let mut cmd = Command::new("cmd");
            if std::env::var("OT_WIN_CODEPAGE").as_deref() == Ok("unicode_flag") {
                cmd.arg("/u");
            }
            cmd.arg("/C").arg(script);
            Some(cmd)
        }
        CommandLine::Exec(argv) => {
            let (program, rest) = argv.split_first()?;
            let mut cmd = Command::new(program);
            cmd.args(rest);
            Some(cmd)
        }
    }
}

fn prepare(line: &CommandLine, env: &[(String, String)]) -> Result<Command, String> {
    let mut cmd = base_command(line).ok_or_else(|| "exec command is empty".to_string())?;
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

fn exit_code_of(status: ExitStatus) -> i32 {
    // Killed by a signal has no code.
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = -(pid as i32);
    // SAFETY: kill(2) has no memory safety requirements.
    let rc = unsafe { libc::kill(pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {}", status)))
    }
}

fn spawn_reader<R>(mut reader: R, events: mpsc::UnboundedSender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_complete_utf8(&mut pending);
                    if !text.is_empty() && events.send(ProcessEvent::Output(text)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Output stream closed");
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let _ = events.send(ProcessEvent::Output(String::from_utf8_lossy(&pending).into_owned()));
        }
    })
}

/// Decodes as much of `pending` as possible, leaving a trailing partial
/// character (split across reads) for the next call.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let keep_from = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };

    let rest = pending.split_off(keep_from);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            warn!("Output reader still open after process exit, abandoning it");
            abort.abort();
        }
    }
}

/// Runs a command, forwarding its pid and every output chunk (stdout and
/// stderr interleaved as they arrive) to `events`. On timeout the whole
/// process group is killed.
pub async fn run_streaming(
    line: &CommandLine,
    env: &[(String, String)],
    timeout: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> ProcessOutcome {
    let mut cmd = match prepare(line, env) {
        Ok(cmd) => cmd,
        Err(e) => return ProcessOutcome { exit_code: -1, timed_out: false, error: Some(e) },
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessOutcome {
                exit_code: -1,
                timed_out: false,
                error: Some(e.to_string()),
            }
        }
    };

    let pid = child.id();
    if let Some(pid) = pid {
        let _ = events.send(ProcessEvent::Started(pid));
    }

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, events.clone()));
    }
    drop(events);

    let outcome = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => ProcessOutcome {
            exit_code: exit_code_of(status),
            timed_out: false,
            error: None,
        },
        Ok(Err(e)) => ProcessOutcome {
            exit_code: -1,
            timed_out: false,
            error: Some(e.to_string()),
        },
        Err(_) => {
            debug!(?pid, "Process timed out, killing process group");
            if let Some(pid) = pid {
                if let Err(e) = kill_process_group(pid) {
                    warn!(pid, error = %e, "Could not kill process group");
                }
            }
            let _ = child.start_kill();
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(_) => -1,
            };
            ProcessOutcome { exit_code, timed_out: true, error: None }
        }
    };

    drain_readers(readers).await;
    outcome
}

/// Runs a command to completion, keeping stdout and stderr apart.
pub async fn run_captured(line: &CommandLine, env: &[(String, String)], timeout: Duration) -> CapturedOutput {
    let mut cmd = match prepare(line, env) {
        Ok(cmd) => cmd,
        Err(e) => return CapturedOutput { exit_code: -1, error: Some(e), ..Default::default() },
    };

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CapturedOutput {
                exit_code: -1,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };

    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code_of(output.status),
            timed_out: false,
            error: None,
        },
        Ok(Err(e)) => CapturedOutput {
            exit_code: -1,
            error: Some(e.to_string()),
            ..Default::default()
        },
        Err(_) => {
            if let Some(pid) = pid {
                let _ = kill_process_group(pid);
            }
            CapturedOutput {
                exit_code: -1,
                timed_out: true,
                ..Default::default()
            }
        }
    }
}
