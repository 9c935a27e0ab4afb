//! Inference subprocess lifecycle
//!
//! [`ProcessManager`] owns at most one [`InferenceProcess`]. Launching a new
//! one always shuts the previous one down first.
//!
//! Output is read by background tasks: stdout is decoded to UTF-8 (a
//! multi-byte character split across reads is carried over) and pushed as
//! chunks into a channel; stderr is logged line by line and the last lines
//! are kept for error reports.

use crate::{HerdError, Result};

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stderr lines kept for `ProcessExited` reports
const STDERR_TAIL_LINES: usize = 20;

const READ_BUFFER: usize = 4096;

/// Everything needed to start one inference process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Model the process was started for
    pub model_path: PathBuf,
    /// Prompt passed with `-p`, echoed back by the engine
    pub prompt: String,
}

/// One live inference subprocess
pub struct InferenceProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: mpsc::UnboundedReceiver<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    pid: Option<u32>,
    spec: LaunchSpec,
}

impl InferenceProcess {
    /// Spawn the binary with piped stdio and start the reader tasks
    pub async fn spawn(spec: LaunchSpec) -> Result<Self> {
        let mut child = spawn_child(&spec.executable, &spec.args).await?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HerdError::Launch("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HerdError::Launch("stderr not captured".to_string()))?;
        let stdin = child.stdin.take();

        let (tx, output) = mpsc::unbounded_channel();
        tokio::spawn(pump_stdout(stdout, tx));

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = tokio::spawn(pump_stderr(stderr, Arc::clone(&stderr_tail), pid));

        info!(
            pid = ?pid,
            executable = %spec.executable.display(),
            "inference process started"
        );
        debug!(args = ?spec.args, "launch arguments");

        Ok(Self {
            child,
            stdin,
            output,
            stderr_tail,
            stderr_task: Some(stderr_task),
            pid,
            spec,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn launch_args(&self) -> &[String] {
        &self.spec.args
    }

    pub fn model_path(&self) -> &Path {
        &self.spec.model_path
    }

    pub fn prompt(&self) -> &str {
        &self.spec.prompt
    }

    /// Next decoded stdout chunk; `None` once stdout is closed
    pub async fn recv(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// Discard output that is already buffered, returning how many bytes were dropped
    pub fn drain_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(chunk) = self.output.try_recv() {
            dropped += chunk.len();
        }
        dropped
    }

    /// Write text to the process's stdin
    pub async fn feed(&mut self, text: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            HerdError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ))
        })?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Non-destructive interrupt (SIGINT); llama.cpp in interactive mode
    /// stops generating and waits for input.
    pub fn interrupt(&mut self) {
        #[cfg(unix)]
        {
            // id() is None once the child has been reaped, so the pid cannot be stale
            if let Some(pid) = self.child.id() {
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
                if rc != 0 {
                    debug!(pid, "SIGINT not delivered");
                }
                return;
            }
        }

        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "interrupt fallback kill failed");
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code and stderr tail, waiting briefly for the process to finish
    pub async fn exit_report(&mut self) -> (Option<i32>, String) {
        let code = match tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        };
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
        (code, self.stderr_tail())
    }

    pub fn stderr_tail(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }

    /// SIGINT, then a hard kill if the process has not exited within `grace`
    pub async fn shutdown(mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        self.interrupt();
        // Closing stdin lets interactive engines waiting for input reach EOF
        self.stdin.take();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => debug!(pid = ?self.pid, "inference process exited"),
            Err(_) => {
                warn!(pid = ?self.pid, "inference process ignored SIGINT, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill inference process");
                }
            }
        }
    }
}

async fn spawn_child(executable: &Path, args: &[String]) -> Result<Child> {
    let mut attempts = 0;
    loop {
        let spawned = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => return Ok(child),
            // A binary that was just written may still be open elsewhere
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                return Err(HerdError::Launch(format!("{}: {}", executable.display(), e)));
            }
        }
    }
}

async fn pump_stdout(mut stdout: ChildStdout, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; READ_BUFFER];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "stdout read failed");
                break;
            }
        };
        carry.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut carry);
        if !text.is_empty() && tx.send(text).is_err() {
            return;
        }
    }

    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned());
    }
}

/// Take the decodable prefix of `carry`, leaving an incomplete trailing
/// character for the next read.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    let cut = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => carry.len(),
    };
    let rest = carry.split_off(cut);
    let text = String::from_utf8_lossy(carry).into_owned();
    *carry = rest;
    text
}

async fn pump_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(pid = ?pid, "stderr: {}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Owner of the single live inference process
pub struct ProcessManager {
    current: Option<InferenceProcess>,
    grace: Duration,
}

impl ProcessManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            current: None,
            grace,
        }
    }

    /// Shut down any live process, then start a new one
    pub async fn launch(&mut self, spec: LaunchSpec) -> Result<&mut InferenceProcess> {
        self.shutdown().await;
        let process = InferenceProcess::spawn(spec).await?;
        Ok(self.current.insert(process))
    }

    pub fn current(&mut self) -> Option<&mut InferenceProcess> {
        self.current.as_mut()
    }

    /// Whether a process is tracked and still running
    pub fn is_alive(&mut self) -> bool {
        self.current.as_mut().map_or(false, InferenceProcess::is_alive)
    }

    /// Write continuation input to the live process
    pub async fn feed(&mut self, text: &str) -> Result<()> {
        match self.current.as_mut() {
            Some(process) => process.feed(text).await,
            None => Err(HerdError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no live inference process",
            ))),
        }
    }

    pub fn interrupt(&mut self) {
        if let Some(process) = self.current.as_mut() {
            process.interrupt();
        }
    }

    /// Stop tracking the live process and shut it down
    pub async fn shutdown(&mut self) {
        if let Some(process) = self.current.take() {
            process.shutdown(self.grace).await;
        }
    }
}
