//! Shell process runner
//!
//! `start` spawns the command and races its exit against a timer. A command
//! that finishes in time returns its output inline; otherwise the caller gets
//! the task id and keeps talking to the still-running process through it.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reclaim::{ReclaimError, Reclaimable};
use crate::registry::{TaskKind, TaskRegistry, TaskStatus};

const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_STDIN_SETTLE: Duration = Duration::from_millis(300);
/// How long the waiter lets the readers flush after the child exits.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const READER_FLUSH: Duration = Duration::from_millis(250);
/// Above this many tracked processes, exited ones with nothing left to read
/// are dropped.
const DEFAULT_MAX_TRACKED: usize = 128;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("◆ SPAWN FAILED: {0}")]
    Spawn(String),

    #[error("◆ IO ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("◆ UNKNOWN SHELL TASK: {0}")]
    UnknownTask(Uuid),

    #[error("◆ STDIN UNAVAILABLE FOR {0}")]
    Stdin(Uuid),

    #[error("◆ PROCESS {0} HAS EXITED")]
    Exited(Uuid),

    #[error("◆ {signal} FAILED FOR {task_id}: {message}")]
    Signal {
        task_id: Uuid,
        signal: ShellSignal,
        message: String,
    },
}

/// Signals the model may send to a background shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ShellSignal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGKILL")]
    Kill,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGHUP")]
    Hup,
    #[serde(rename = "SIGUSR1")]
    Usr1,
    #[serde(rename = "SIGUSR2")]
    Usr2,
}

impl ShellSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellSignal::Term => "SIGTERM",
            ShellSignal::Kill => "SIGKILL",
            ShellSignal::Int => "SIGINT",
            ShellSignal::Hup => "SIGHUP",
            ShellSignal::Usr1 => "SIGUSR1",
            ShellSignal::Usr2 => "SIGUSR2",
        }
    }

    /// Whether sending this signal ends the task
    pub fn terminates(&self) -> bool {
        matches!(self, ShellSignal::Term | ShellSignal::Kill | ShellSignal::Int)
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            ShellSignal::Term => Signal::SIGTERM,
            ShellSignal::Kill => Signal::SIGKILL,
            ShellSignal::Int => Signal::SIGINT,
            ShellSignal::Hup => Signal::SIGHUP,
            ShellSignal::Usr1 => Signal::SIGUSR1,
            ShellSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

impl fmt::Display for ShellSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command to run
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    /// Zero means return a handle immediately
    pub timeout: Duration,
    pub stdin: Option<String>,
    /// Echo interactive input into the stdout buffer
    pub show_stdin: bool,
    /// Log output as it arrives
    pub show_stdout: bool,
    pub working_dir: Option<PathBuf>,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            stdin: None,
            show_stdin: false,
            show_stdout: false,
            working_dir: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Result of `start`: inline output, or a handle to a running process
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ShellOutcome {
    Sync {
        stdout: String,
        stderr: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Async {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        stdout: String,
        stderr: String,
    },
}

impl ShellOutcome {
    pub fn is_async(&self) -> bool {
        matches!(self, ShellOutcome::Async { .. })
    }
}

/// Output drained from a background process plus its current state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    pub task_id: Uuid,
    pub stdout: String,
    pub stderr: String,
    pub completed: bool,
    pub signaled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Default)]
struct ProcessState {
    command: String,
    stdout: String,
    stderr: String,
    completed: bool,
    signaled: bool,
    exit_code: Option<i32>,
    error: Option<String>,
    show_stdin: bool,
    show_stdout: bool,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct ManagedProcess {
    id: Uuid,
    pid: Option<u32>,
    state: Mutex<ProcessState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exited: watch::Receiver<bool>,
}

impl ManagedProcess {
    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, stream: Stream, text: &str) {
        let mut state = self.state();
        match stream {
            Stream::Stdout => {
                if state.show_stdout {
                    info!(task_id = %self.id, "◆ STDOUT: {}", text.trim_end());
                }
                state.stdout.push_str(text);
            }
            Stream::Stderr => {
                if state.show_stdout {
                    info!(task_id = %self.id, "◆ STDERR: {}", text.trim_end());
                }
                state.stderr.push_str(text);
            }
        }
    }

    fn drain(&self, status: Option<TaskStatus>) -> ProcessOutput {
        let mut state = self.state();
        ProcessOutput {
            task_id: self.id,
            stdout: std::mem::take(&mut state.stdout),
            stderr: std::mem::take(&mut state.stderr),
            completed: state.completed,
            signaled: state.signaled,
            exit_code: state.exit_code,
            status,
        }
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn is_drained(&self) -> bool {
        let state = self.state();
        state.stdout.is_empty() && state.stderr.is_empty()
    }

    async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        loop {
            let done = *exited.borrow_and_update();
            if done || exited.changed().await.is_err() {
                return;
            }
        }
    }

    fn mark_signaled(&self) {
        self.state().signaled = true;
    }

    fn signal(&self, signal: ShellSignal) -> Result<(), ProcessError> {
        let message = match self.pid {
            Some(pid) => match deliver(pid, signal) {
                Ok(()) => return Ok(()),
                Err(message) => message,
            },
            None => "process has no pid".to_string(),
        };
        Err(ProcessError::Signal {
            task_id: self.id,
            signal,
            message,
        })
    }
}

/// Children run in their own process group so a signal reaches everything
/// the shell started. A group that is already gone counts as delivered.
#[cfg(unix)]
fn deliver(pid: u32, signal: ShellSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| e.to_string())?;
    match killpg(Pid::from_raw(pid), signal.to_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn deliver(pid: u32, signal: ShellSignal) -> Result<(), String> {
    if !signal.terminates() {
        return Err(format!("{} is not supported on this platform", signal));
    }
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("taskkill exited with {}", status))
    }
}

/// Build the shell line, feeding initial stdin through a base64 decoder so
/// the content never has to be escaped for the shell.
pub fn command_line(command: &str, stdin: Option<&str>) -> String {
    let Some(input) = stdin else {
        return command.to_string();
    };
    let encoded = BASE64_STANDARD.encode(input);

    if cfg!(windows) {
        format!(
            "powershell -NoProfile -Command \"[Console]::Out.Write([System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{}')))\" | {}",
            encoded, command
        )
    } else {
        format!("printf '%s' '{}' | base64 -d | (\n{}\n)", encoded, command)
    }
}

fn shell_command(line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Spawns shell commands and tracks the ones that outlive their timeout
pub struct ProcessRunner {
    registry: TaskRegistry,
    processes: Mutex<HashMap<Uuid, Arc<ManagedProcess>>>,
    kill_grace: Duration,
    stdin_settle: Duration,
    max_tracked: usize,
}

impl ProcessRunner {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            processes: Mutex::new(HashMap::new()),
            kill_grace: DEFAULT_KILL_GRACE,
            stdin_settle: DEFAULT_STDIN_SETTLE,
            max_tracked: DEFAULT_MAX_TRACKED,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_stdin_settle(mut self, settle: Duration) -> Self {
        self.stdin_settle = settle;
        self
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ManagedProcess>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, id: Uuid) -> Result<Arc<ManagedProcess>, ProcessError> {
        self.processes()
            .get(&id)
            .cloned()
            .ok_or(ProcessError::UnknownTask(id))
    }

    /// Run a command, returning inline output if it exits before the timeout
    pub async fn start(&self, request: ShellRequest) -> ShellOutcome {
        let task_id = self.registry.register(
            TaskKind::Shell,
            json!({ "command": request.command, "pid": null }),
        );
        info!(%task_id, "◆ SHELL START: {}", request.command);

        let line = command_line(&request.command, request.stdin.as_deref());
        let mut cmd = shell_command(&line);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ProcessError::Spawn(e.to_string());
                warn!(%task_id, "{}", err);
                self.registry.update_status(
                    task_id,
                    TaskStatus::Error,
                    json!({ "error": err.to_string() }),
                );
                return ShellOutcome::Sync {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    error: Some(err.to_string()),
                };
            }
        };

        let pid = child.id();
        self.registry
            .update_status(task_id, TaskStatus::Running, json!({ "pid": pid }));

        let (exit_tx, exit_rx) = watch::channel(false);
        let process = Arc::new(ManagedProcess {
            id: task_id,
            pid,
            state: Mutex::new(ProcessState {
                command: request.command.clone(),
                show_stdin: request.show_stdin,
                show_stdout: request.show_stdout,
                ..Default::default()
            }),
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            exited: exit_rx,
        });

        self.adopt(&process);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, process.clone(), Stream::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, process.clone(), Stream::Stderr)));
        }

        let waiter_process = process.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            for reader in readers {
                let _ = tokio::time::timeout(READER_FLUSH, reader).await;
            }
            record_exit(&waiter_process, &registry, status);
            waiter_process.stdin.lock().await.take();
            let _ = exit_tx.send(true);
            registry.release(waiter_process.id);
        });

        if request.timeout.is_zero() {
            return self.detach(&process);
        }

        tokio::select! {
            _ = process.wait_exit() => {
                self.processes().remove(&task_id);
                let mut state = process.state();
                debug!(%task_id, "shell finished inline: {:?}", state.exit_code);
                ShellOutcome::Sync {
                    stdout: std::mem::take(&mut state.stdout),
                    stderr: std::mem::take(&mut state.stderr),
                    exit_code: state.exit_code,
                    error: state.error.take(),
                }
            }
            _ = tokio::time::sleep(request.timeout) => self.detach(&process),
        }
    }

    /// Make a freshly spawned process reachable by id and by cleanup. A task
    /// that cleanup already ended in the meantime gets its child killed.
    fn adopt(&self, process: &Arc<ManagedProcess>) {
        self.track(process.clone());
        let attached = self.registry.attach(
            process.id,
            Arc::new(ShellReclaimer {
                process: process.clone(),
                grace: self.kill_grace,
            }),
        );
        if !attached {
            warn!(task_id = %process.id, "◆ TASK ENDED DURING SPAWN, KILLING CHILD");
            process.mark_signaled();
            if let Err(e) = process.signal(ShellSignal::Kill) {
                warn!(task_id = %process.id, "{}", e);
            }
        }
    }

    fn track(&self, process: Arc<ManagedProcess>) {
        let mut processes = self.processes();
        if processes.len() >= self.max_tracked {
            let before = processes.len();
            processes.retain(|_, p| !(p.has_exited() && p.is_drained()));
            debug!("pruned {} exited processes", before - processes.len());
        }
        processes.insert(process.id, process);
    }

    fn detach(&self, process: &ManagedProcess) -> ShellOutcome {
        info!(task_id = %process.id, "◆ SHELL BACKGROUNDED: {}", process.state().command);
        let output = process.drain(None);
        ShellOutcome::Async {
            task_id: process.id,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Drain buffered output; each byte is delivered by exactly one read
    pub fn read_output(&self, id: Uuid) -> Result<ProcessOutput, ProcessError> {
        let process = self.process(id)?;
        let status = self.registry.get(id).map(|task| task.status);
        Ok(process.drain(status))
    }

    /// Write to the process's stdin, let it react, then drain its output
    pub async fn send_input(&self, id: Uuid, input: &str) -> Result<ProcessOutput, ProcessError> {
        let process = self.process(id)?;
        if process.has_exited() {
            return Err(ProcessError::Exited(id));
        }

        {
            let mut stdin = process.stdin.lock().await;
            let writer = stdin.as_mut().ok_or(ProcessError::Stdin(id))?;
            writer.write_all(input.as_bytes()).await?;
            writer.flush().await?;
        }

        if process.state().show_stdin {
            process.append(Stream::Stdout, input);
        }
        debug!(task_id = %id, "wrote {} bytes to stdin", input.len());

        tokio::time::sleep(self.stdin_settle).await;
        self.read_output(id)
    }

    /// Signal the process group. The task is marked signaled even when
    /// delivery fails, and terminating signals end the task. A process that
    /// survives the signal stays reclaimable until it actually exits.
    pub fn send_signal(&self, id: Uuid, signal: ShellSignal) -> Result<(), ProcessError> {
        let process = self.process(id)?;
        process.mark_signaled();
        info!(task_id = %id, "◆ SIGNAL: {}", signal);

        let delivered = process.signal(signal);
        if signal.terminates() {
            self.registry.update_status(
                id,
                TaskStatus::Terminated,
                json!({ "signal": signal.as_str() }),
            );
        }
        delivered
    }

    /// Ids of processes still reachable through this runner
    pub fn tracked(&self) -> Vec<Uuid> {
        self.processes().keys().copied().collect()
    }
}

fn record_exit(
    process: &ManagedProcess,
    registry: &TaskRegistry,
    status: std::io::Result<std::process::ExitStatus>,
) {
    let (task_status, patch) = {
        let mut state = process.state();
        state.completed = true;
        match status {
            Ok(exit) => {
                state.exit_code = exit.code();
                let signal = exit_signal(&exit);
                if signal.is_some() {
                    state.signaled = true;
                }
                let task_status = match (exit.code(), signal) {
                    (Some(0), _) => TaskStatus::Completed,
                    (_, Some(_)) => TaskStatus::Terminated,
                    _ => TaskStatus::Error,
                };
                (task_status, json!({ "exit_code": exit.code(), "signal": signal }))
            }
            Err(e) => {
                state.error = Some(e.to_string());
                (TaskStatus::Error, json!({ "error": e.to_string() }))
            }
        }
    };
    debug!(task_id = %process.id, "shell exited: {}", task_status);
    registry.update_status(process.id, task_status, patch);
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, process: Arc<ManagedProcess>, stream: Stream) {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() {
                    process.append(stream, &text);
                }
            }
            Err(e) => {
                debug!(task_id = %process.id, "output stream closed: {}", e);
                break;
            }
        }
    }
    if !pending.is_empty() {
        process.append(stream, &String::from_utf8_lossy(&pending));
    }
}

/// Take the decodable prefix of `pending`, leaving an incomplete trailing
/// UTF-8 sequence for the next chunk.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            return text;
        }
    };
    let tail = pending.split_off(valid);
    let head = std::mem::replace(pending, tail);
    String::from_utf8(head).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// SIGTERM, a grace window, then SIGKILL
struct ShellReclaimer {
    process: Arc<ManagedProcess>,
    grace: Duration,
}

#[async_trait]
impl Reclaimable for ShellReclaimer {
    async fn reclaim(&self) -> Result<(), ReclaimError> {
        if self.process.has_exited() {
            return Ok(());
        }
        self.process.mark_signaled();
        self.process
            .signal(ShellSignal::Term)
            .map_err(|e| ReclaimError::Signal(e.to_string()))?;

        if tokio::time::timeout(self.grace, self.process.wait_exit())
            .await
            .is_err()
        {
            debug!(task_id = %self.process.id, "grace window elapsed, sending SIGKILL");
            self.process
                .signal(ShellSignal::Kill)
                .map_err(|e| ReclaimError::Signal(e.to_string()))?;
        }
        Ok(())
    }

    fn force_kill(&self) {
        if !self.process.has_exited() {
            self.process.mark_signaled();
            let _ = self.process.signal(ShellSignal::Kill);
        }
    }

    fn is_alive(&self) -> bool {
        !self.process.has_exited()
    }
}
