//! CLI invocation capability.
//!
//! The smoke run drives two external tools: kubectl (port forwarding only)
//! and the overlay CLI (init, expose, token exchange, delete).
//! `ProcessRunner` is the seam between the lifecycle and those tools:
//!
//! - `run` blocks until the command finishes and fails on non-zero exit.
//! - `spawn` returns immediately with a `BackgroundProcess` that keeps
//!   running until it exits on its own, is stopped, or is dropped. Its
//!   stdout lines are published on the handle so callers can wait for a
//!   tool to announce that it is ready.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::CliError;

/// Stdout lines kept per background process. Later lines are only logged.
const MAX_OUTPUT_LINES: usize = 64;

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// True if `needle` appears as a contiguous run of arguments.
    pub fn has_args(&self, needle: &[&str]) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.args
            .windows(needle.len())
            .any(|window| window.iter().zip(needle).all(|(a, b)| a == b))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Observed state of a background process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(String),
}

/// Handle to a command running in the background.
///
/// The process is stopped when the handle is dropped.
#[derive(Debug)]
pub struct BackgroundProcess {
    command: String,
    state: watch::Receiver<ProcessState>,
    output: watch::Receiver<Vec<String>>,
    cancel: CancellationToken,
}

impl BackgroundProcess {
    /// Wrap a process whose state and stdout lines are published on `state`
    /// and `output`, and which stops when `cancel` fires.
    pub fn new(
        command: impl Into<String>,
        state: watch::Receiver<ProcessState>,
        output: watch::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            command: command.into(),
            state,
            output,
            cancel,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// True once the process has printed a stdout line containing `needle`.
    pub fn printed(&self, needle: &str) -> bool {
        self.output.borrow().iter().any(|line| line.contains(needle))
    }

    /// Why the process exited, or `None` while it is still running.
    pub fn exit_reason(&self) -> Option<String> {
        match &*self.state.borrow() {
            ProcessState::Running => None,
            ProcessState::Exited(reason) => Some(reason.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit_reason().is_none()
    }

    /// Ask the process to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs external commands.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion. Non-zero exit is an error.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CliError>;

    /// Start in the background and return immediately.
    fn spawn(&self, invocation: &Invocation) -> Result<BackgroundProcess, CliError>;
}

/// `ProcessRunner` backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    command_timeout: Duration,
}

impl SystemProcessRunner {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CliError> {
        let command = invocation.to_string();
        debug!(target: "smoke.process", command = %command, "Running command");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CliError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| CliError::Io {
                    command: command.clone(),
                    source,
                })?;
            // stdin is closed when dropped here
        }

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| CliError::TimedOut {
                command: command.clone(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| CliError::Io {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(CliError::Failed {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!(target: "smoke.process", command = %command, "Command finished");
        Ok(CommandOutput { stdout, stderr })
    }

    fn spawn(&self, invocation: &Invocation) -> Result<BackgroundProcess, CliError> {
        let command = invocation.to_string();
        debug!(target: "smoke.process", command = %command, "Spawning background command");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CliError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (output_tx, output_rx) = watch::channel(Vec::new());
        if let Some(stdout) = child.stdout.take() {
            let log_command = command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "smoke.process", command = %log_command, line = %line, "stdout");
                    output_tx.send_modify(|kept| {
                        if kept.len() < MAX_OUTPUT_LINES {
                            kept.push(line);
                        }
                    });
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let log_command = command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "smoke.process", command = %log_command, line = %line, "stderr");
                }
            });
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_command = command.clone();

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                () = task_cancel.cancelled() => None,
            };

            match exited {
                Some(status) => {
                    let reason = match status {
                        Ok(status) => status.to_string(),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    warn!(
                        target: "smoke.process",
                        command = %task_command,
                        reason = %reason,
                        "Background command exited"
                    );
                    state_tx.send_replace(ProcessState::Exited(reason));
                }
                None => {
                    if let Err(e) = child.kill().await {
                        warn!(target: "smoke.process", command = %task_command, error = %e, "Failed to stop background command");
                    }
                    state_tx.send_replace(ProcessState::Exited("stopped".to_string()));
                    debug!(target: "smoke.process", command = %task_command, "Background command stopped");
                }
            }
        });

        Ok(BackgroundProcess::new(command, state_rx, output_rx, cancel))
    }
}

/// Mock process runner module for testing.
///
/// Records every invocation in a shared `CallJournal` so tests can assert the
/// global order of operations across both environments.
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Ordered log of calls shared by mocks of both environments.
    #[derive(Debug, Clone, Default)]
    pub struct CallJournal {
        entries: Arc<Mutex<Vec<String>>>,
    }

    impl CallJournal {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record(&self, entry: impl Into<String>) {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry.into());
        }

        pub fn entries(&self) -> Vec<String> {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Index of the first entry containing `needle`.
        pub fn position(&self, needle: &str) -> Option<usize> {
            self.entries().iter().position(|e| e.contains(needle))
        }

        /// Number of entries containing `needle`.
        pub fn count(&self, needle: &str) -> usize {
            self.entries().iter().filter(|e| e.contains(needle)).count()
        }
    }

    type SpawnHook = Arc<dyn Fn(&Invocation) -> Result<BackgroundProcess, CliError> + Send + Sync>;

    /// Mock runner with argument-matched failures and canned output.
    pub struct MockProcessRunner {
        label: String,
        journal: CallJournal,
        invocations: Mutex<Vec<Invocation>>,
        failures: Mutex<Vec<(Vec<String>, String)>>,
        outputs: Mutex<Vec<(Vec<String>, String)>>,
        spawn_hook: Mutex<Option<SpawnHook>>,
    }

    impl MockProcessRunner {
        /// Create a runner whose journal entries are prefixed with `label`.
        pub fn new(label: impl Into<String>, journal: CallJournal) -> Self {
            Self {
                label: label.into(),
                journal,
                invocations: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                outputs: Mutex::new(Vec::new()),
                spawn_hook: Mutex::new(None),
            }
        }

        /// Fail any invocation containing `args` as a contiguous run.
        pub fn fail_on(&self, args: &[&str], stderr: impl Into<String>) {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((to_owned(args), stderr.into()));
        }

        /// Return `stdout` for any invocation containing `args`.
        pub fn respond_to(&self, args: &[&str], stdout: impl Into<String>) {
            self.outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((to_owned(args), stdout.into()));
        }

        /// Handle background invocations with `hook` instead of the default
        /// never-exiting process.
        pub fn on_spawn<F>(&self, hook: F)
        where
            F: Fn(&Invocation) -> Result<BackgroundProcess, CliError> + Send + Sync + 'static,
        {
            *self
                .spawn_hook
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.invocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn record(&self, invocation: &Invocation, mode: &str) {
            self.journal
                .record(format!("{}: {mode} {invocation}", self.label));
            self.invocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(invocation.clone());
        }

        fn injected_failure(&self, invocation: &Invocation) -> Option<CliError> {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .find(|(args, _)| matches(invocation, args))
                .map(|(_, stderr)| CliError::Failed {
                    command: invocation.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: stderr.clone(),
                })
        }
    }

    #[async_trait]
    impl ProcessRunner for MockProcessRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CliError> {
            self.record(invocation, "run");

            if let Some(err) = self.injected_failure(invocation) {
                return Err(err);
            }

            let stdout = self
                .outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .find(|(args, _)| matches(invocation, args))
                .map(|(_, stdout)| stdout.clone())
                .unwrap_or_default();

            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            })
        }

        fn spawn(&self, invocation: &Invocation) -> Result<BackgroundProcess, CliError> {
            self.record(invocation, "spawn");

            if let Some(err) = self.injected_failure(invocation) {
                return Err(err);
            }

            let hook = self
                .spawn_hook
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            match hook {
                Some(hook) => hook(invocation),
                None => Ok(running_process(invocation.to_string())),
            }
        }
    }

    /// Test-side control of a fake background process.
    #[derive(Debug)]
    pub struct ProcessControl {
        state: watch::Sender<ProcessState>,
        output: watch::Sender<Vec<String>>,
        cancel: CancellationToken,
    }

    impl ProcessControl {
        /// Publish a stdout line.
        pub fn print(&self, line: impl Into<String>) {
            let line = line.into();
            self.output.send_modify(|lines| lines.push(line));
        }

        /// Report the process as exited with `reason`.
        pub fn exit(&self, reason: impl Into<String>) {
            self.state.send_replace(ProcessState::Exited(reason.into()));
        }

        /// Fires when the handle is stopped or dropped.
        pub fn stop_token(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }

    /// A running fake process and the means to drive it.
    pub fn controlled_process(command: impl Into<String>) -> (BackgroundProcess, ProcessControl) {
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (output_tx, output_rx) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let process = BackgroundProcess::new(command, state_rx, output_rx, cancel.clone());
        let control = ProcessControl {
            state: state_tx,
            output: output_tx,
            cancel,
        };
        (process, control)
    }

    /// A background process that reports `Running` until stopped.
    pub fn running_process(command: impl Into<String>) -> BackgroundProcess {
        controlled_process(command).0
    }

    /// A background process that has already exited with `reason`.
    pub fn exited_process(command: impl Into<String>, reason: impl Into<String>) -> BackgroundProcess {
        let (process, control) = controlled_process(command);
        control.exit(reason);
        process
    }

    fn to_owned(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| (*a).to_string()).collect()
    }

    fn matches(invocation: &Invocation, args: &[String]) -> bool {
        let needle: Vec<&str> = args.iter().map(String::as_str).collect();
        invocation.has_args(&needle)
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let invocation = Invocation::new("skupper")
            .args(["expose", "--port", "9090"])
            .arg("deployment");
        assert_eq!(invocation.to_string(), "skupper expose --port 9090 deployment");
    }

    #[test]
    fn test_has_args_matches_contiguous_runs() {
        let invocation = Invocation::new("kubectl").args(["get", "service", "tcp-go-echo"]);
        assert!(invocation.has_args(&["service", "tcp-go-echo"]));
        assert!(invocation.has_args(&[]));
        assert!(!invocation.has_args(&["get", "tcp-go-echo"]));
    }

    #[tokio::test]
    async fn test_system_runner_reports_spawn_failure() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&Invocation::new("/nonexistent/overlay-smoke-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output_and_stdin() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let output = runner
            .run(&Invocation::new("cat").stdin("manifest"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "manifest");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_fails_on_nonzero_exit() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&Invocation::new("sh").args(["-c", "echo nope >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            CliError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemProcessRunner::new(Duration::from_millis(100));
        let err = runner
            .run(&Invocation::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::TimedOut { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_reports_early_exit() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let process = runner
            .spawn(&Invocation::new("sh").args(["-c", "exit 1"]))
            .unwrap();

        for _ in 0..50 {
            if !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process.exit_reason().unwrap().contains('1'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_publishes_stdout_lines() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let process = runner
            .spawn(&Invocation::new("sh").args(["-c", "echo 'Forwarding from 127.0.0.1:9090 -> 9090'; sleep 5"]))
            .unwrap();

        for _ in 0..50 {
            if process.printed("Forwarding from 127.0.0.1:9090") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process.printed("Forwarding from 127.0.0.1:9090 -> 9090"));
        assert!(process.is_running());
        assert_eq!(process.command(), "sh -c echo 'Forwarding from 127.0.0.1:9090 -> 9090'; sleep 5");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_stops_on_request() {
        let runner = SystemProcessRunner::new(Duration::from_secs(5));
        let process = runner
            .spawn(&Invocation::new("sleep").arg("30"))
            .unwrap();
        assert!(process.is_running());

        process.stop();
        for _ in 0..50 {
            if !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.exit_reason().as_deref(), Some("stopped"));
    }
}
