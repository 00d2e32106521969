//! Command invocations and their live output.
//!
//! An [`ExecRequest`] describes what to run; [`Sandbox::exec`](crate::Sandbox::exec)
//! turns it into an [`ExecHandle`]. A handle is either running, streaming
//! output line by line, or failed to start. Failed handles behave like a
//! process that printed nothing and exited with [`FAILED_EXIT_CODE`], so call
//! sites can treat both the same way or match on the variant.

use crate::runtime::{
    ContainerRuntime, ExecSession, ExecSpec, OutputChunk, OutputStream, StreamKind,
};
use futures::stream::{self, Stream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Exit code reported by handles whose command never started.
pub const FAILED_EXIT_CODE: i64 = 1;

/// Exit code reported when the runtime cannot tell how a command ended.
pub const UNKNOWN_EXIT_CODE: i64 = -1;

/// Delay between exit status queries after the output has closed.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Status queries before giving up on an exit code.
const STATUS_POLL_ATTEMPTS: u32 = 100;

/// A command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector.
    pub args: Vec<String>,
    /// Extra environment variables, applied in order.
    pub env: Vec<(String, String)>,
    /// Working directory override.
    pub cwd: Option<String>,
    /// Run the joined arguments through the sandbox shell.
    pub shell: bool,
    /// Interleave stderr lines with stdout (default: true).
    pub merge_stderr: bool,
}

impl ExecRequest {
    /// Run `args` directly.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: None,
            shell: false,
            merge_stderr: true,
        }
    }

    /// Run a command line through the shell.
    pub fn shell_command(command: impl Into<String>) -> Self {
        Self::new([command.into()]).shell(true)
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Toggle shell execution.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Toggle merging stderr into the line stream.
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    /// Runtime invocation for this request.
    ///
    /// With `shell` set, the arguments are joined with single spaces and
    /// passed to `shell_program -c`.
    pub fn to_spec(&self, shell_program: &str) -> ExecSpec {
        let cmd = if self.shell {
            vec![
                shell_program.to_string(),
                "-c".to_string(),
                self.args.join(" "),
            ]
        } else {
            self.args.clone()
        };

        ExecSpec {
            cmd,
            env: self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            working_dir: self.cwd.clone(),
        }
    }
}

/// Why a command could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    /// Human-readable cause.
    pub message: String,
}

/// Everything a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i64,
    /// Output lines (stderr included when merged).
    pub lines: Vec<String>,
    /// Stderr lines, when not merged.
    pub stderr: Vec<String>,
}

impl ExecOutput {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle to a command started in a sandbox.
pub enum ExecHandle {
    /// The command is running or has finished.
    Running(RunningExec),
    /// The command could not be started.
    Failed(ExecFailure),
}

impl ExecHandle {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self::Failed(ExecFailure {
            message: message.into(),
        })
    }

    /// Whether the command failed to start.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Start failure, if any.
    pub fn failure(&self) -> Option<&ExecFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::Running(_) => None,
        }
    }

    /// Next output line, without its line terminator. `None` once output ends.
    pub async fn next_line(&mut self) -> Option<String> {
        match self {
            Self::Running(exec) => exec.next_line().await,
            Self::Failed(_) => None,
        }
    }

    /// Output lines as a stream.
    pub fn lines(&mut self) -> impl Stream<Item = String> + '_ {
        stream::unfold(self, |handle| async move {
            let line = handle.next_line().await?;
            Some((line, handle))
        })
    }

    /// Wait for the command to exit and return its exit code.
    ///
    /// Output not yet read stays available through [`next_line`](Self::next_line).
    pub async fn wait(&mut self) -> i64 {
        match self {
            Self::Running(exec) => exec.wait().await,
            Self::Failed(_) => FAILED_EXIT_CODE,
        }
    }

    /// Exit code if the command has finished, without blocking on it.
    pub async fn poll(&mut self) -> Option<i64> {
        match self {
            Self::Running(exec) => exec.poll().await,
            Self::Failed(_) => Some(FAILED_EXIT_CODE),
        }
    }

    /// Stderr lines received so far when stderr is not merged.
    pub fn stderr(&self) -> &[String] {
        match self {
            Self::Running(exec) => &exec.stderr_lines,
            Self::Failed(_) => &[],
        }
    }

    /// Read all output and wait for exit.
    pub async fn collect(mut self) -> ExecOutput {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        let exit_code = self.wait().await;
        ExecOutput {
            exit_code,
            lines,
            stderr: self.stderr().to_vec(),
        }
    }
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running(exec) => f
                .debug_struct("Running")
                .field("exec_id", &exec.exec_id)
                .field("exit_code", &exec.exit_code)
                .finish(),
            Self::Failed(failure) => f.debug_tuple("Failed").field(failure).finish(),
        }
    }
}

/// A started command with line-buffered output.
pub struct RunningExec {
    exec_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    output: Option<OutputStream>,
    merge_stderr: bool,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    ready: VecDeque<String>,
    stderr_lines: Vec<String>,
    exit_code: Option<i64>,
}

impl RunningExec {
    pub(crate) fn new(
        session: ExecSession,
        runtime: Arc<dyn ContainerRuntime>,
        merge_stderr: bool,
    ) -> Self {
        Self {
            exec_id: session.exec_id,
            runtime,
            output: Some(session.output),
            merge_stderr,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            ready: VecDeque::new(),
            stderr_lines: Vec::new(),
            exit_code: None,
        }
    }

    /// Runtime exec id.
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if !self.pump().await {
                return self.ready.pop_front();
            }
        }
    }

    /// Pull one chunk from the output. Returns false once the output is closed.
    async fn pump(&mut self) -> bool {
        let Some(output) = self.output.as_mut() else {
            return false;
        };

        match output.next().await {
            Some(Ok(chunk)) => {
                self.push_chunk(chunk);
                true
            }
            Some(Err(e)) => {
                tracing::warn!(exec_id = %self.exec_id, error = %e, "Exec output stream failed");
                self.close_output();
                false
            }
            None => {
                self.close_output();
                false
            }
        }
    }

    fn push_chunk(&mut self, chunk: OutputChunk) {
        let buf = match chunk.kind {
            StreamKind::Stdout => &mut self.stdout_buf,
            StreamKind::Stderr => &mut self.stderr_buf,
        };
        buf.extend_from_slice(&chunk.data);

        let mut complete = Vec::new();
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            complete.push(decode_line(&raw[..pos]));
        }
        for line in complete {
            self.emit(chunk.kind, line);
        }
    }

    fn emit(&mut self, kind: StreamKind, line: String) {
        match kind {
            StreamKind::Stderr if !self.merge_stderr => self.stderr_lines.push(line),
            _ => self.ready.push_back(line),
        }
    }

    fn close_output(&mut self) {
        self.output = None;
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            let rest = match kind {
                StreamKind::Stdout => std::mem::take(&mut self.stdout_buf),
                StreamKind::Stderr => std::mem::take(&mut self.stderr_buf),
            };
            if !rest.is_empty() {
                self.emit(kind, decode_line(&rest));
            }
        }
    }

    async fn wait(&mut self) -> i64 {
        while self.pump().await {}

        if let Some(code) = self.exit_code {
            return code;
        }

        for _ in 0..STATUS_POLL_ATTEMPTS {
            match self.runtime.exec_status(&self.exec_id).await {
                Ok(status) if !status.running => {
                    let code = status.exit_code.unwrap_or(UNKNOWN_EXIT_CODE);
                    self.exit_code = Some(code);
                    return code;
                }
                Ok(_) => tokio::time::sleep(STATUS_POLL_INTERVAL).await,
                Err(e) => {
                    tracing::warn!(exec_id = %self.exec_id, error = %e, "Failed to query exec status");
                    return UNKNOWN_EXIT_CODE;
                }
            }
        }

        tracing::warn!(exec_id = %self.exec_id, "Exec still running after output closed");
        UNKNOWN_EXIT_CODE
    }

    async fn poll(&mut self) -> Option<i64> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.runtime.exec_status(&self.exec_id).await {
            Ok(status) if !status.running => {
                self.exit_code = Some(status.exit_code.unwrap_or(UNKNOWN_EXIT_CODE));
                self.exit_code
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(exec_id = %self.exec_id, error = %e, "Exec status unavailable");
                None
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::runtime::{ContainerSpec, ExecStatus, MemoryRuntime, ScriptedExec};

    fn handle(chunks: Vec<OutputChunk>, merge: bool) -> ExecHandle {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MemoryRuntime::new());
        let session = ExecSession {
            exec_id: "exec-1".into(),
            output: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        };
        ExecHandle::Running(RunningExec::new(session, runtime, merge))
    }

    /// Handle for an exec that stays running for `polls` status queries.
    async fn slow_handle(polls: u32, exit_code: i64) -> ExecHandle {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let spec = ContainerSpec {
            name: "slow".into(),
            image: "ubuntu:latest".into(),
            working_dir: "/opt".into(),
            memory_bytes: None,
            cpu_period: None,
            cpu_quota: None,
            network_enabled: false,
            privileged: false,
            env: Vec::new(),
            port_bindings: Default::default(),
        };
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.push_exec(ScriptedExec::new(exit_code).running_for(polls));
        let session = runtime
            .start_exec(&id, &ExecSpec::default())
            .await
            .unwrap();
        ExecHandle::Running(RunningExec::new(session, runtime, true))
    }

    #[test]
    fn test_direct_spec() {
        let spec = ExecRequest::new(["ls", "-la"])
            .env("A", "1")
            .env("B", "2")
            .cwd("/tmp")
            .to_spec("bash");
        assert_eq!(spec.cmd, vec!["ls", "-la"]);
        assert_eq!(spec.env, vec!["A=1", "B=2"]);
        assert_eq!(spec.working_dir.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_shell_spec_joins_args() {
        let spec = ExecRequest::new(["echo", "A", "&&", "echo", "B"])
            .shell(true)
            .to_spec("sh");
        assert_eq!(spec.cmd, vec!["sh", "-c", "echo A && echo B"]);

        let spec = ExecRequest::shell_command("for i in 1 2; do echo $i; done").to_spec("bash");
        assert_eq!(spec.cmd[2], "for i in 1 2; do echo $i; done");
    }

    #[test]
    fn test_request_defaults() {
        let request = ExecRequest::new(["true"]);
        assert!(request.merge_stderr);
        assert!(!request.shell);
        assert!(request.env.is_empty());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let mut handle = handle(
            vec![
                OutputChunk::stdout("hel"),
                OutputChunk::stdout("lo\r\nwor"),
                OutputChunk::stdout("ld\nlast"),
            ],
            true,
        );

        assert_eq!(handle.next_line().await.as_deref(), Some("hello"));
        assert_eq!(handle.next_line().await.as_deref(), Some("world"));
        assert_eq!(handle.next_line().await.as_deref(), Some("last"));
        assert_eq!(handle.next_line().await, None);
    }

    #[tokio::test]
    async fn test_stderr_merged_by_default() {
        let handle = handle(
            vec![OutputChunk::stdout("out\n"), OutputChunk::stderr("err\n")],
            true,
        );
        let lines: Vec<String> = {
            let mut handle = handle;
            handle.lines().collect().await
        };
        assert_eq!(lines, vec!["out", "err"]);
    }

    #[tokio::test]
    async fn test_stderr_separate() {
        let mut handle = handle(
            vec![OutputChunk::stderr("boom\n"), OutputChunk::stdout("ok\n")],
            false,
        );
        assert_eq!(handle.next_line().await.as_deref(), Some("ok"));
        assert_eq!(handle.next_line().await, None);
        assert_eq!(handle.stderr(), ["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_handle() {
        let mut handle = ExecHandle::failed("container gone");
        assert!(handle.is_failed());
        assert_eq!(handle.next_line().await, None);
        assert_eq!(handle.wait().await, FAILED_EXIT_CODE);
        assert_eq!(handle.poll().await, Some(FAILED_EXIT_CODE));
        assert_eq!(handle.failure().unwrap().message, "container gone");

        let output = handle.collect().await;
        assert_eq!(output.exit_code, 1);
        assert!(output.lines.is_empty());
    }

    #[tokio::test]
    async fn test_wait_keeps_unread_lines() {
        struct Finished;

        #[async_trait::async_trait]
        impl ContainerRuntime for Finished {
            async fn image_exists(&self, _: &str) -> Result<bool, RuntimeError> {
                Ok(true)
            }
            async fn pull_image(&self, _: &str) -> Result<(), RuntimeError> {
                Ok(())
            }
            async fn create_container(
                &self,
                _: &crate::runtime::ContainerSpec,
            ) -> Result<String, RuntimeError> {
                Ok("c".into())
            }
            async fn list_containers(
                &self,
                _: &str,
            ) -> Result<Vec<crate::runtime::ContainerSummary>, RuntimeError> {
                Ok(Vec::new())
            }
            async fn stop_container(&self, _: &str, _: Duration) -> Result<(), RuntimeError> {
                Ok(())
            }
            async fn remove_container(&self, _: &str, _: bool) -> Result<(), RuntimeError> {
                Ok(())
            }
            async fn put_archive(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), RuntimeError> {
                Ok(())
            }
            async fn get_archive(&self, _: &str, _: &str) -> Result<Vec<u8>, RuntimeError> {
                Ok(Vec::new())
            }
            async fn port_bindings(
                &self,
                _: &str,
            ) -> Result<std::collections::HashMap<String, Vec<u16>>, RuntimeError> {
                Ok(Default::default())
            }
            async fn start_exec(&self, _: &str, _: &ExecSpec) -> Result<ExecSession, RuntimeError> {
                Err(RuntimeError::Api("unused".into()))
            }
            async fn exec_status(&self, _: &str) -> Result<ExecStatus, RuntimeError> {
                Ok(ExecStatus {
                    running: false,
                    exit_code: Some(7),
                })
            }
        }

        let session = ExecSession {
            exec_id: "exec-2".into(),
            output: stream::iter(vec![Ok(OutputChunk::stdout("a\nb\n"))]).boxed(),
        };
        let mut handle = ExecHandle::Running(RunningExec::new(session, Arc::new(Finished), true));

        assert_eq!(handle.wait().await, 7);
        assert_eq!(handle.poll().await, Some(7));
        assert_eq!(handle.next_line().await.as_deref(), Some("a"));
        assert_eq!(handle.next_line().await.as_deref(), Some("b"));
        assert_eq!(handle.next_line().await, None);
    }

    #[tokio::test]
    async fn test_poll_while_running() {
        let mut handle = slow_handle(2, 4).await;
        assert_eq!(handle.poll().await, None);
        assert_eq!(handle.poll().await, None);
        assert_eq!(handle.poll().await, Some(4));
        assert_eq!(handle.poll().await, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_exit() {
        let mut handle = slow_handle(5, 9).await;
        let started = tokio::time::Instant::now();

        assert_eq!(handle.wait().await, 9);
        assert!(started.elapsed() >= STATUS_POLL_INTERVAL * 5);
        assert_eq!(handle.poll().await, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_on_endless_exec() {
        let mut handle = slow_handle(STATUS_POLL_ATTEMPTS + 1, 0).await;
        assert_eq!(handle.wait().await, UNKNOWN_EXIT_CODE);
        assert_eq!(handle.poll().await, None);
        assert_eq!(handle.poll().await, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_exec_reports_unknown_code() {
        let mut handle = handle(vec![OutputChunk::stdout("x\n")], true);
        assert_eq!(handle.wait().await, UNKNOWN_EXIT_CODE);
        assert_eq!(handle.poll().await, None);
    }
}
