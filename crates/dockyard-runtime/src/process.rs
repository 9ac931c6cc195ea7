//! Subprocess execution with cancellation and deadlines.
//!
//! Every external process the engine spawns goes through [`run_command`].
//! Output is either buffered (surfaced on failure) or tee'd to stderr live
//! while still being captured, so failures can always be attributed.

use crate::RuntimeError;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
/// Captured output kept in error messages.
const OUTPUT_TAIL_LINES: usize = 40;

/// Caller-supplied cancellation signal plus an optional deadline.
///
/// Cloning shares the flag. [`CancelToken::child`] creates a token that is
/// cancelled together with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parents: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

/// Why a running process was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn child(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parents,
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parents.iter().any(|p| p.load(Ordering::SeqCst))
    }

    pub fn interruption(&self) -> Option<Interruption> {
        if self.is_cancelled() {
            Some(Interruption::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interruption::DeadlineExceeded)
        } else {
            None
        }
    }
}

/// Per-invocation process options.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Tee output to stderr as it arrives.
    pub stream: bool,
    pub cancel: CancelToken,
    /// Limit for each spawned process, counted from its own start.
    pub timeout: Option<Duration>,
}

impl ProcessOptions {
    pub fn new(stream: bool, cancel: CancelToken) -> Self {
        Self {
            stream,
            cancel,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same options with a child cancellation token.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            stream: self.stream,
            cancel: self.cancel.child(),
            timeout: self.timeout,
        }
    }

    /// Cancellation, the token's deadline, or this process's own timeout.
    fn interruption(&self, started: Instant) -> Option<Interruption> {
        self.cancel.interruption().or_else(|| {
            self.timeout
                .filter(|t| started.elapsed() >= *t)
                .map(|_| Interruption::DeadlineExceeded)
        })
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Human-readable command line for logs and errors.
pub fn describe_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run `cmd` to completion, honouring cancellation. A nonzero exit is not an
/// error here; see [`run_checked`].
pub fn run_command(mut cmd: Command, opts: &ProcessOptions) -> Result<CommandOutput, RuntimeError> {
    let command_line = describe_command(&cmd);
    let started = Instant::now();
    if let Some(reason) = opts.interruption(started) {
        return Err(interrupted(reason, command_line));
    }
    debug!("exec: {command_line}");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    })?;

    let stdout = child.stdout.take().map(|s| pump(s, opts.stream));
    let stderr = child.stderr.take().map(|s| pump(s, opts.stream));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(reason) = opts.interruption(started) {
            warn!("terminating `{command_line}`: {reason:?}");
            terminate(&mut child);
            // Grandchildren may still hold the pipes open; leave the readers detached.
            drop(stdout);
            drop(stderr);
            return Err(interrupted(reason, command_line));
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    }
    .with_status_note(status))
}

/// Like [`run_command`] but a nonzero exit becomes [`RuntimeError::CommandFailed`]
/// carrying the tail of the captured output.
pub fn run_checked(cmd: Command, opts: &ProcessOptions) -> Result<CommandOutput, RuntimeError> {
    let display = describe_command(&cmd);
    let output = run_command(cmd, opts)?;
    if output.success() {
        Ok(output)
    } else {
        Err(command_failed(display, &output))
    }
}

pub fn command_failed(command: String, output: &CommandOutput) -> RuntimeError {
    let status = match output.exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_owned(),
    };
    RuntimeError::CommandFailed {
        command,
        status,
        output: tail(&output.combined(), OUTPUT_TAIL_LINES),
    }
}

fn interrupted(reason: Interruption, display: String) -> RuntimeError {
    match reason {
        Interruption::Cancelled => RuntimeError::Cancelled(display),
        Interruption::DeadlineExceeded => RuntimeError::DeadlineExceeded(display),
    }
}

impl CommandOutput {
    fn with_status_note(mut self, status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::fmt::Write as _;
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                let _ = write!(self.stderr, "\nkilled by signal {sig}");
            }
        }
        #[cfg(not(unix))]
        let _ = status;
        self
    }
}

fn pump<R: Read + Send + 'static>(source: R, echo: bool) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut captured = String::new();
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if echo {
                eprintln!("{line}");
            }
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// SIGTERM, wait up to the grace period, then SIGKILL.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // SAFETY: kill() with a pid we spawned and a valid signal number.
            #[allow(unsafe_code)]
            let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
            if ret == 0 {
                let start = Instant::now();
                while start.elapsed() < TERMINATE_GRACE {
                    if let Ok(Some(_)) = child.try_wait() {
                        return;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                warn!("process {} did not exit after SIGTERM, sending SIGKILL", child.id());
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_command(sh("echo out; echo err >&2"), &ProcessOptions::default()).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn nonzero_exit_is_reported_by_run_checked() {
        let err = run_checked(sh("echo boom >&2; exit 3"), &ProcessOptions::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "got: {msg}");
        assert!(msg.contains("boom"), "got: {msg}");
    }

    #[test]
    fn pre_cancelled_token_never_spawns() {
        let token = CancelToken::new();
        token.cancel();
        let err = run_command(sh("true"), &ProcessOptions::new(false, token)).unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled(_)));
    }

    #[test]
    fn deadline_terminates_child() {
        let token = CancelToken::new().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = run_command(sh("sleep 30"), &ProcessOptions::new(false, token)).unwrap_err();
        assert!(matches!(err, RuntimeError::DeadlineExceeded(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_applies_to_each_command_separately() {
        let opts = ProcessOptions::default().with_timeout(Some(Duration::from_millis(1500)));
        for _ in 0..3 {
            let out = run_command(sh("sleep 0.7"), &opts).unwrap();
            assert!(out.success());
        }
    }

    #[test]
    fn timeout_still_stops_a_long_command() {
        let opts = ProcessOptions::default().with_timeout(Some(Duration::from_millis(200)));
        let err = run_command(sh("sleep 30"), &opts).unwrap_err();
        assert!(matches!(err, RuntimeError::DeadlineExceeded(_)));
    }

    #[test]
    fn child_options_keep_the_timeout() {
        let opts = ProcessOptions::default().with_timeout(Some(Duration::from_secs(5)));
        assert_eq!(opts.child().timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = run_command(
            Command::new("/nonexistent/dockyard-test-binary"),
            &ProcessOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
