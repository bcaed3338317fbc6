//! Handle around the long-lived renderer process.
//!
//! The child reads one request per line on stdin and answers each render
//! request with one line on stdout. Stderr is drained by a background thread
//! into a bounded tail so the child never blocks on a full stderr pipe, and
//! the tail is attached to errors when the process dies.

use std::{
    env,
    ffi::OsString,
    io::{self, BufRead, BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol;
use crate::cache::mutex_lock;

const TARGET: &str = "application::render::process";
const STDERR_TAIL_BYTES: usize = 64 * 1024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const EXIT_GRACE: Duration = Duration::from_millis(250);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("renderer executable `{program}` not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn renderer `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("renderer line must not contain a newline")]
    EmbeddedNewline,
    #[error("renderer io failed: {0}")]
    Io(#[source] io::Error),
    #[error("renderer exited ({status}): {stderr}")]
    Exited { status: String, stderr: String },
    #[error("renderer closed its output stream while still running")]
    StreamClosed,
}

impl ProcessError {
    /// Whether the channel can no longer be used after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessError::Exited { .. } | ProcessError::StreamClosed | ProcessError::Io(_)
        )
    }
}

/// How to launch the renderer.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory of the child; also the root whose `node_modules` is
    /// prepended to `NODE_PATH`.
    pub project_dir: Option<PathBuf>,
    pub shutdown_timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("node"),
            args: vec!["renderer.js".to_string()],
            project_dir: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// How the process ended during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Exited(ExitStatus),
    Killed,
    AlreadyClosed,
}

#[derive(Debug, Clone, Default)]
struct StderrTail {
    buffer: Arc<Mutex<String>>,
}

impl StderrTail {
    fn push(&self, chunk: &[u8]) {
        let mut buffer = mutex_lock(&self.buffer, TARGET, "stderr.push");
        buffer.push_str(&String::from_utf8_lossy(chunk));
        if buffer.len() > STDERR_TAIL_BYTES {
            let mut cut = buffer.len() - STDERR_TAIL_BYTES;
            while !buffer.is_char_boundary(cut) {
                cut += 1;
            }
            buffer.drain(..cut);
        }
    }

    fn snapshot(&self) -> String {
        mutex_lock(&self.buffer, TARGET, "stderr.snapshot").clone()
    }
}

/// Exclusive handle on the renderer's stdin/stdout pair.
///
/// Not `Clone`: an exchange borrows the handle mutably, so at most one
/// request is in flight at any time.
pub struct RendererProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: StderrTail,
    stderr_reader: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for RendererProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RendererProcess {
    /// Spawn the renderer and send the setup message listing the server-side
    /// extensions to load (entries containing `://` are skipped). The setup is
    /// best effort: a failed write is logged and only shows up later as
    /// failed renders.
    pub fn spawn(config: &RendererConfig, contribs: &[String]) -> Result<Self, ProcessError> {
        let started_at = Instant::now();
        let program = config.program.display().to_string();

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = config.project_dir.as_ref() {
            command.current_dir(dir);
            if let Some(node_path) = node_path_with(&dir.join("node_modules")) {
                command.env("NODE_PATH", node_path);
            }
        }

        let mut child = command.spawn().map_err(|source| {
            warn!(
                target = TARGET,
                op = "renderer::spawn",
                result = "error",
                program = %program,
                error = %source,
                "Failed to spawn renderer"
            );
            if source.kind() == ErrorKind::NotFound {
                ProcessError::NotFound {
                    program: program.clone(),
                    source,
                }
            } else {
                ProcessError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::Spawn {
                    program,
                    source: io::Error::other("child stdio was not captured"),
                });
            }
        };

        let tail = StderrTail::default();
        let stderr_reader = spawn_stderr_reader(stderr, tail.clone());

        let mut process = Self {
            program,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr: tail,
            stderr_reader,
            shutdown_timeout: config.shutdown_timeout,
            closed: false,
        };

        // Remote URLs are client-side scripts; only named extensions go to the renderer.
        let contribs: Vec<String> = contribs
            .iter()
            .filter(|name| !name.contains("://"))
            .cloned()
            .collect();
        let setup = protocol::encode_setup(&contribs)
            .map_err(|err| ProcessError::Io(io::Error::other(err)))
            .and_then(|line| process.send_line(line.as_bytes()));
        if let Err(err) = setup {
            warn!(
                target = TARGET,
                op = "renderer::setup",
                result = "error",
                program = %process.program,
                error = %err,
                "Failed to deliver renderer setup message"
            );
        }

        info!(
            target = TARGET,
            op = "renderer::spawn",
            result = "ok",
            program = %process.program,
            pid = process.child.id(),
            contribs = contribs.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Renderer process started"
        );

        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write one line and flush. A single `\n` is appended.
    pub fn send_line(&mut self, line: &[u8]) -> Result<(), ProcessError> {
        if line.contains(&b'\n') {
            return Err(ProcessError::EmbeddedNewline);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ProcessError::StreamClosed);
        };

        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line);
        framed.push(b'\n');

        let written = stdin.write_all(&framed).and_then(|()| stdin.flush());
        match written {
            Ok(()) => Ok(()),
            Err(err) => Err(self.diagnose(Some(err))),
        }
    }

    /// Block until a full line arrives. `None` means the stream reached EOF.
    pub fn read_line(&mut self) -> Result<Option<String>, ProcessError> {
        let mut buf = Vec::new();
        match self.stdout.read_until(b'\n', &mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => self.read_line(),
            Err(err) => Err(self.diagnose(Some(err))),
        }
    }

    /// Send one request line and read the single response line.
    pub fn exchange(&mut self, line: &str) -> Result<String, ProcessError> {
        self.send_line(line.as_bytes())?;
        match self.read_line()? {
            Some(response) => Ok(response),
            None => Err(self.diagnose(None)),
        }
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Most recent stderr output of the child (bounded).
    pub fn stderr_tail(&self) -> String {
        self.stderr.snapshot()
    }

    /// Close stdin, wait up to the shutdown timeout, then kill and reap.
    pub fn shutdown(mut self) -> ShutdownOutcome {
        self.close()
    }

    fn close(&mut self) -> ShutdownOutcome {
        if self.closed {
            return ShutdownOutcome::AlreadyClosed;
        }
        self.closed = true;
        let started_at = Instant::now();

        // EOF on stdin asks the renderer to exit.
        drop(self.stdin.take());

        let outcome = match wait_for_exit(&mut self.child, self.shutdown_timeout) {
            Some(status) => ShutdownOutcome::Exited(status),
            None => {
                if let Err(err) = self.child.kill() {
                    debug!(
                        target = TARGET,
                        op = "renderer::shutdown",
                        error = %err,
                        "Kill failed; process may have exited already"
                    );
                }
                let _ = self.child.wait();
                ShutdownOutcome::Killed
            }
        };

        // The reader thread ends on EOF; a grandchild holding stderr open must
        // not stall shutdown, so the handle is detached instead of joined.
        self.stderr_reader.take();

        match &outcome {
            ShutdownOutcome::Killed => warn!(
                target = TARGET,
                op = "renderer::shutdown",
                result = "killed",
                program = %self.program,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Renderer did not exit in time and was killed"
            ),
            ShutdownOutcome::Exited(status) => info!(
                target = TARGET,
                op = "renderer::shutdown",
                result = "exited",
                program = %self.program,
                status = %status,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Renderer process exited"
            ),
            ShutdownOutcome::AlreadyClosed => {}
        }

        outcome
    }

    /// Turn an io failure (or EOF when `err` is `None`) into a precise error by
    /// checking whether the child is still alive.
    fn diagnose(&mut self, err: Option<io::Error>) -> ProcessError {
        match wait_for_exit(&mut self.child, EXIT_GRACE) {
            Some(status) => {
                self.drain_stderr();
                let stderr = self.stderr.snapshot();
                warn!(
                    target = TARGET,
                    op = "renderer::io",
                    result = "process_exited",
                    program = %self.program,
                    status = %status,
                    stderr = %stderr.trim(),
                    "Renderer process died"
                );
                ProcessError::Exited {
                    status: status.to_string(),
                    stderr,
                }
            }
            None => match err {
                Some(err) => ProcessError::Io(err),
                None => ProcessError::StreamClosed,
            },
        }
    }

    fn drain_stderr(&mut self) {
        let Some(handle) = self.stderr_reader.as_ref() else {
            return;
        };
        let deadline = Instant::now() + EXIT_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        if let Some(handle) = self.stderr_reader.take_if(|handle| handle.is_finished()) {
            let _ = handle.join();
        }
    }
}

impl Drop for RendererProcess {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_stderr_reader(
    mut stderr: impl Read + Send + 'static,
    tail: StderrTail,
) -> Option<JoinHandle<()>> {
    thread::Builder::new()
        .name("katex-renderer-stderr".to_string())
        .spawn(move || {
            let mut chunk = [0_u8; 4096];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => tail.push(&chunk[..n]),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
        .map_err(|err| {
            warn!(
                target = TARGET,
                op = "renderer::stderr",
                error = %err,
                "Failed to start stderr reader; renderer stderr will be discarded"
            );
        })
        .ok()
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) | Err(_) => return None,
        }
    }
}

fn node_path_with(prefix: &Path) -> Option<OsString> {
    let mut paths = vec![prefix.to_path_buf()];
    if let Some(existing) = env::var_os("NODE_PATH") {
        paths.extend(env::split_paths(&existing));
    }
    env::join_paths(paths).ok()
}
