//! Process layer - one external child per invocation
//!
//! Spawns the child with piped stdio, hands stdin/stdout to the duplex pump,
//! drains stderr in the background and reports the exit status. The child is
//! owned by the call: it is reaped on success and terminated on every other
//! exit path.

use crate::io::transport::{PumpOptions, TransportError, pump};
use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::{Level, debug, error, trace, warn};

/// Default time a child gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE_MILLIS: u64 = 500;

// ============================================================================
// Invocation
// ============================================================================

/// A program plus its argument vector
///
/// Arguments are passed to the OS as a list, never through a shell, so
/// addresses or key ids containing spaces or metacharacters stay intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Whether `arg` appears verbatim in the argument list
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Output
// ============================================================================

/// Error types for running external processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{program} {}: {stderr}", describe_exit(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

/// Everything a finished child produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Program that produced this output
    pub program: String,

    /// Complete stdout, in arrival order
    pub stdout: Vec<u8>,

    /// Non-empty stderr lines
    pub stderr: Vec<String>,

    /// Exit code; `None` when the child was killed by a signal
    pub code: Option<i32>,
}

impl ProcessOutput {
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    /// Turn a non-zero exit into [`ProcessError::Failed`]
    pub fn into_success(self) -> Result<Self, ProcessError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProcessError::Failed {
                stderr: self.stderr_text(),
                program: self.program,
                code: self.code,
            })
        }
    }
}

// ============================================================================
// Runner Trait
// ============================================================================

/// Runs one invocation to completion, feeding it `input`
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, input: &[u8])
    -> Result<ProcessOutput, ProcessError>;
}

/// Runs invocations as real child processes
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    options: PumpOptions,
    stop_grace: Option<Duration>,
}

impl SubprocessRunner {
    pub fn new(options: PumpOptions, stop_grace: Duration) -> Self {
        Self {
            options,
            stop_grace: Some(stop_grace),
        }
    }

    pub fn options(&self) -> &PumpOptions {
        &self.options
    }

    fn stop_grace(&self) -> Duration {
        self.stop_grace
            .unwrap_or(Duration::from_millis(DEFAULT_STOP_GRACE_MILLIS))
    }

    /// Wait for the child, honouring whatever is left of the deadline and the
    /// cancellation token
    async fn reap(
        &self,
        child: &mut Child,
        started: Instant,
        stalls: u32,
        bytes_written: usize,
    ) -> Result<Option<i32>, ProcessError> {
        let deadline = self.options.deadline;
        let remaining = deadline.map(|deadline| deadline.saturating_sub(started.elapsed()));

        let reaped = tokio::select! {
            biased;
            _ = self.options.cancel.cancelled() => Reaped::Cancelled,
            status = async {
                match remaining {
                    Some(remaining) => tokio::time::timeout(remaining, child.wait()).await.ok(),
                    None => Some(child.wait().await),
                }
            } => match status {
                Some(status) => Reaped::Exited(status),
                None => Reaped::TimedOut,
            },
        };

        match reaped {
            Reaped::Exited(status) => Ok(status?.code()),
            Reaped::TimedOut => {
                warn!("Child outlived its deadline after closing stdout");
                terminate(child, self.stop_grace()).await;
                Err(TransportError::Timeout {
                    deadline: deadline.unwrap_or_default(),
                    stalls,
                    bytes_written,
                }
                .into())
            }
            Reaped::Cancelled => {
                warn!("Cancelled while waiting for child to exit");
                terminate(child, self.stop_grace()).await;
                Err(TransportError::Cancelled { bytes_written }.into())
            }
        }
    }
}

enum Reaped {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        input: &[u8],
    ) -> Result<ProcessOutput, ProcessError> {
        debug!("Running: {}", invocation);
        let started = Instant::now();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        trace!("Child started with PID: {:?}", child.id());

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        // Always drain stderr so a chatty child never blocks on it
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let outcome = match pump(Some(stdin), stdout, input, &self.options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                terminate(&mut child, self.stop_grace()).await;
                stderr_task.abort();
                return Err(e.into());
            }
        };

        let code = match self
            .reap(&mut child, started, outcome.stalls, outcome.bytes_written)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                stderr_task.abort();
                return Err(e);
            }
        };

        let stderr = stderr_task.await.unwrap_or_else(|e| {
            error!("stderr drain task failed: {}", e);
            Vec::new()
        });

        crate::log_timing!(Level::DEBUG, invocation.program.as_str(), started.elapsed());
        debug!(
            "{} finished with {:?} ({} bytes in, {} bytes out, {} stalls)",
            invocation.program,
            code,
            outcome.bytes_written,
            outcome.output.len(),
            outcome.stalls
        );

        Ok(ProcessOutput {
            program: invocation.program.clone(),
            stdout: outcome.output,
            stderr,
            code,
        })
    }
}

/// Collect stderr lines until EOF
async fn drain_stderr(stderr: ChildStderr) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut lines = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    trace!("child stderr: {}", text);
                    lines.push(text);
                }
            }
            Err(e) => {
                error!("Failed to read from stderr: {}", e);
                break;
            }
        }
    }

    lines
}

/// Ask the child to exit, then kill it if it does not within `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: the pid belongs to a child we own and have not reaped yet
        unsafe {
            if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                debug!("Sent SIGTERM to process {}", pid);
            }
        }

        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!("Process {} exited after SIGTERM: {}", pid, status);
            return;
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {}", e);
    }
}

// ============================================================================
// Mock Runner (for testing)
// ============================================================================

/// Scripted runner for tests
///
/// Responses are keyed by a marker argument; the first rule whose marker is
/// present in the invocation answers. A rule with several queued responses
/// pops them in order and keeps repeating the last one.
#[cfg(test)]
#[derive(Default)]
pub struct MockRunner {
    rules: std::sync::Mutex<Vec<(String, std::collections::VecDeque<ProcessOutput>)>>,
    calls: std::sync::Mutex<Vec<(Invocation, Vec<u8>)>>,
}

#[cfg(test)]
impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response with `stdout` for invocations carrying `marker`
    pub fn on(self, marker: &str, stdout: impl AsRef<[u8]>) -> Self {
        self.respond(marker, Self::output(0, stdout.as_ref(), &[]))
    }

    /// Queue a failing response for invocations carrying `marker`
    pub fn fail(self, marker: &str, code: i32, stderr: &str) -> Self {
        self.respond(marker, Self::output(code, b"", &[stderr]))
    }

    pub fn respond(self, marker: &str, output: ProcessOutput) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(m, _)| m == marker) {
                Some((_, queue)) => queue.push_back(output),
                None => rules.push((marker.to_string(), [output].into())),
            }
        }
        self
    }

    pub fn output(code: i32, stdout: &[u8], stderr: &[&str]) -> ProcessOutput {
        ProcessOutput {
            program: "gpg".to_string(),
            stdout: stdout.to_vec(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            code: Some(code),
        }
    }

    /// Every invocation seen so far, with the input it was fed
    pub fn calls(&self) -> Vec<(Invocation, Vec<u8>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations carrying `marker`
    pub fn calls_with(&self, marker: &str) -> Vec<(Invocation, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter(|(invocation, _)| invocation.has_arg(marker))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        input: &[u8],
    ) -> Result<ProcessOutput, ProcessError> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.clone(), input.to_vec()));

        let mut rules = self.rules.lock().unwrap();
        let queue = rules
            .iter_mut()
            .find(|(marker, _)| invocation.has_arg(marker))
            .map(|(_, queue)| queue);

        match queue {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) => Ok(queue.front().cloned().unwrap()),
            None => Err(ProcessError::Spawn {
                program: invocation.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no scripted response"),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
