//! Child processes that are waited on cooperatively.
//!
//! Output is read concurrently while the child runs so that pipes never fill
//! up. The caller polls the child in short slices and decides between slices
//! whether to keep waiting or kill it.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Most bytes kept from the end of each stream.
const TAIL_LIMIT_BYTES: usize = 8192;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// First `output_limit_bytes` of stdout.
    pub stdout: Vec<u8>,
    /// First `output_limit_bytes` of stderr.
    pub stderr: Vec<u8>,
    /// Last bytes of stderr, kept even when the head was truncated.
    pub stderr_tail: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    /// Last non-empty stderr line, trimmed.
    pub fn stderr_last_line(&self) -> Option<String> {
        String::from_utf8_lossy(&self.stderr_tail)
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// One stream as read by its reader thread.
struct Captured {
    head: Vec<u8>,
    tail: Vec<u8>,
    truncated: usize,
}

type ReaderHandle = thread::JoinHandle<Result<Captured>>;

/// A spawned child with its output readers.
pub struct RunningCommand {
    child: Child,
    stdout: ReaderHandle,
    stderr: ReaderHandle,
}

impl RunningCommand {
    /// Spawn `cmd` with null stdin and captured stdout/stderr.
    ///
    /// At most `output_limit_bytes` of each stream are kept; the rest is
    /// drained and counted, apart from a short rolling tail.
    pub fn spawn(mut cmd: Command, output_limit_bytes: usize) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).context("spawn command");
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        Ok(Self {
            child,
            stdout: thread::spawn(move || read_stream_limited(stdout, output_limit_bytes)),
            stderr: thread::spawn(move || read_stream_limited(stderr, output_limit_bytes)),
        })
    }

    /// Wait up to `slice` for the child to exit.
    pub fn poll(&mut self, slice: Duration) -> Result<Option<ExitStatus>> {
        self.child.wait_timeout(slice).context("wait for command")
    }

    /// Kill the child and reap it.
    pub fn kill(&mut self) -> Result<ExitStatus> {
        self.child.kill().context("kill command")?;
        self.child.wait().context("wait command after kill")
    }

    /// Join the output readers once the child has exited.
    pub fn finish(self, status: ExitStatus) -> Result<CommandOutput> {
        let stdout = join_output(self.stdout).context("join stdout")?;
        let stderr = join_output(self.stderr).context("join stderr")?;
        let stdout_truncated = stdout.truncated;
        let stderr_truncated = stderr.truncated;

        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        debug!(exit_code = ?status.code(), "command finished");
        Ok(CommandOutput {
            status,
            stdout: stdout.head,
            stderr: stderr.head,
            stderr_tail: stderr.tail,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

fn join_output(handle: ReaderHandle) -> Result<Captured> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Keep the first `limit` bytes and a rolling tail of at most
/// `min(limit, TAIL_LIMIT_BYTES)` bytes; count the rest.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let tail_limit = limit.min(TAIL_LIMIT_BYTES);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(tail_limit);
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        tail.extend(&chunk[..n]);
        if tail.len() > tail_limit {
            let excess = tail.len() - tail_limit;
            tail.drain(..excess);
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok(Captured {
        head: buf,
        tail: tail.into_iter().collect(),
        truncated,
    })
}
