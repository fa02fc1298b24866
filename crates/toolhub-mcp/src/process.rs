//! Child process supervision for stdio MCP servers.
//!
//! [`ProcessSupervisor::launch`] spawns the server with piped stdio and starts
//! three background tasks: one reaps the child (and kills it on request), one
//! pumps stdout into a [`ProcessEvent`] channel, and one drains stderr into
//! the log. Writes go straight to stdin under a lock so concurrent callers
//! never interleave partial lines.

use crate::config::{McpServerConfig, resolve_env};
use crate::error::McpError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};

/// How long to wait for an exit status once stdout has closed.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(250);

/// How long to wait for the child to be reaped after a kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Everything needed to start one server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Environment overrides. `${VAR}` placeholders are resolved at launch.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn from_config(config: &McpServerConfig, base_dir: Option<&Path>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.working_dir(base_dir),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Output observed from a supervised process.
#[derive(Debug)]
pub enum ProcessEvent {
    /// A chunk of stdout, split wherever the OS split it.
    Output(Bytes),
    /// The process exited or closed its stdout. Always the last event.
    Exited(ExitInfo),
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                description: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                description: format!("failed to wait for process: {e}"),
            },
        }
    }

    fn stdout_closed() -> Self {
        Self {
            code: None,
            description: "stdout closed".to_string(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Owns one server process and its stdin.
pub struct ProcessSupervisor {
    server: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    bytes_written: AtomicU64,
}

impl ProcessSupervisor {
    /// Spawn the process and start its background tasks.
    ///
    /// The returned receiver yields stdout chunks followed by exactly one
    /// [`ProcessEvent::Exited`].
    pub fn launch(
        server: &str,
        spec: &LaunchSpec,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(resolve_env(&spec.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let spawn_failed = |source: std::io::Error| McpError::SpawnFailed {
            server: server.to_string(),
            command: spec.command.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_failed)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(spawn_failed(std::io::Error::other("stdio was not piped")));
        };

        let pid = child.id();
        tracing::info!(server = %server, pid = ?pid, command = %spec.command, "Launched MCP server");

        let (kill_tx, kill_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(reap(server.to_string(), child, kill_rx, exit_tx));
        tokio::spawn(pump_stdout(stdout, exit_rx.clone(), event_tx));
        tokio::spawn(drain_stderr(server.to_string(), stderr));

        Ok((
            Self {
                server: server.to_string(),
                pid,
                stdin: Mutex::new(Some(stdin)),
                kill_tx,
                exit_rx,
                bytes_written: AtomicU64::new(0),
            },
            event_rx,
        ))
    }

    /// Write one message followed by a newline, as a single write.
    pub async fn write_line(&self, line: &[u8]) -> Result<(), McpError> {
        debug_assert!(!line.contains(&b'\n'), "frames must be single-line");

        let mut guard = self.stdin.lock().await;
        if self.has_exited() {
            *guard = None;
        }
        let Some(stdin) = guard.as_mut() else {
            return Err(self.write_failed("stdin is closed"));
        };

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line);
        frame.push(b'\n');

        let written = match stdin.write_all(&frame).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(self.write_failed(&e.to_string()))
            }
        }
    }

    /// Close stdin, which well-behaved servers treat as a request to exit.
    pub async fn close_stdin(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Ask the reaper task to kill the process. Idempotent.
    pub fn kill(&self) {
        self.kill_tx.send_replace(true);
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    pub async fn terminate(&self, grace: Duration) {
        self.close_stdin().await;
        if self.wait_exit_timeout(grace).await.is_some() {
            return;
        }
        tracing::debug!(server = %self.server, "MCP server ignored stdin close, killing");
        self.kill();
        if self.wait_exit_timeout(KILL_WAIT).await.is_none() {
            tracing::warn!(server = %self.server, "MCP server did not exit after kill");
        }
    }

    /// Wait for the process to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut exit_rx = self.exit_rx.clone();
        exited(&mut exit_rx)
            .await
            .unwrap_or_else(ExitInfo::stdout_closed)
    }

    async fn wait_exit_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait_exit()).await.ok()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn write_failed(&self, reason: &str) -> McpError {
        McpError::WriteFailed {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Wait for the child to exit, killing it first if asked to.
async fn reap(
    server: String,
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill_requested(&mut kill_rx) => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %server, "Kill failed: {e}");
            }
            child.wait().await
        }
    };

    let info = ExitInfo::from_status(status);
    tracing::info!(server = %server, status = %info, "MCP server exited");
    exit_tx.send_replace(Some(info));
}

/// Resolves once a kill is requested or the supervisor is gone.
async fn kill_requested(kill_rx: &mut watch::Receiver<bool>) {
    let _ = kill_rx.wait_for(|kill| *kill).await;
}

/// Resolves with the exit info once the reaper has published it.
async fn exited(exit_rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).clone(),
        Err(_) => None,
    }
}

/// Forward stdout chunks until EOF or exit, then report the exit.
async fn pump_stdout<R>(
    mut stdout: R,
    mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    events: mpsc::Sender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            biased;
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if events.send(ProcessEvent::Output(chunk)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read MCP server stdout: {e}");
                    break;
                }
            },
            _ = exited(&mut exit_rx) => break,
        }
    }

    let info = tokio::time::timeout(EXIT_STATUS_WAIT, exited(&mut exit_rx))
        .await
        .ok()
        .flatten();
    let _ = events
        .send(ProcessEvent::Exited(info.unwrap_or_else(ExitInfo::stdout_closed)))
        .await;
}

async fn drain_stderr<R>(server: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                tracing::debug!(target: "toolhub_mcp::stderr", server = %server, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, "Stopped reading MCP server stderr: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_output(events: &mut mpsc::Receiver<ProcessEvent>) -> (Vec<u8>, ExitInfo) {
        let mut output = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.extend_from_slice(&chunk),
                ProcessEvent::Exited(info) => return (output, info),
            }
        }
        panic!("event channel closed without an exit event");
    }

    #[tokio::test]
    async fn spawn_echo_process() {
        // `cat` echoes every line back
        let (process, mut events) =
            ProcessSupervisor::launch("cat", &LaunchSpec::new("cat")).unwrap();
        assert!(process.pid().is_some());

        process.write_line(br#"{"id":1}"#).await.unwrap();
        process.close_stdin().await;

        let (output, info) = collect_output(&mut events).await;
        assert_eq!(output, b"{\"id\":1}\n");
        assert_eq!(info.code, Some(0));
        assert_eq!(process.bytes_written(), 9);
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let result = ProcessSupervisor::launch(
            "missing",
            &LaunchSpec::new("this_command_does_not_exist_xyz123"),
        );
        match result {
            Err(McpError::SpawnFailed { server, command, .. }) => {
                assert_eq!(server, "missing");
                assert_eq!(command, "this_command_does_not_exist_xyz123");
            }
            Err(other) => panic!("Expected SpawnFailed, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("exit 3");
        let (process, mut events) = ProcessSupervisor::launch("exit", &spec).unwrap();
        let (_, info) = collect_output(&mut events).await;
        assert_eq!(info.code, Some(3));
        assert_eq!(process.wait_exit().await.code, Some(3));
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn write_after_exit_fails() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("exit 0");
        let (process, mut events) = ProcessSupervisor::launch("gone", &spec).unwrap();
        collect_output(&mut events).await;

        let err = process.write_line(b"{}").await.unwrap_err();
        assert!(matches!(err, McpError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn terminate_kills_process_that_ignores_eof() {
        // `sleep` never reads stdin, so closing it does nothing
        let spec = LaunchSpec::new("sleep").arg("30");
        let (process, mut events) = ProcessSupervisor::launch("sleepy", &spec).unwrap();

        let started = tokio::time::Instant::now();
        process.terminate(Duration::from_millis(100)).await;
        assert!(process.has_exited());
        assert!(started.elapsed() < Duration::from_secs(5));

        let (_, info) = collect_output(&mut events).await;
        assert_eq!(info.code, None); // killed by signal
    }

    #[tokio::test]
    async fn env_placeholders_are_resolved() {
        let mut spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("printf '%s|%s' \"$RESOLVED\" \"$UNRESOLVED\"");
        spec.env.insert("RESOLVED".into(), "${PATH}".into());
        spec.env.insert(
            "UNRESOLVED".into(),
            "${TOOLHUB_SURELY_UNSET_VARIABLE}".into(),
        );

        let (_process, mut events) = ProcessSupervisor::launch("env", &spec).unwrap();
        let (output, _) = collect_output(&mut events).await;
        let output = String::from_utf8(output).unwrap();

        let path = std::env::var("PATH").unwrap();
        assert_eq!(output, format!("{path}|${{TOOLHUB_SURELY_UNSET_VARIABLE}}"));
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = LaunchSpec::new("pwd");
        spec.cwd = Some(dir.path().to_path_buf());

        let (_process, mut events) = ProcessSupervisor::launch("pwd", &spec).unwrap();
        let (output, _) = collect_output(&mut events).await;
        let reported = std::path::PathBuf::from(String::from_utf8(output).unwrap().trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
