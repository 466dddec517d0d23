//! Supervises one agent CLI process per execution.
//!
//! The child's stdout is attached to the slave side of a pseudo-terminal so
//! CLIs that detect a non-tty and switch to block buffering still emit
//! line-buffered output. Stderr stays a plain pipe. Both descriptors are set
//! non-blocking and multiplexed with poll(2) on a dedicated blocking worker;
//! complete lines are handed to the async consumer over a bounded channel.

use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, Stdio};

use anyhow::Context;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use shunt_types::{RawLine, StreamSource};

/// Read size per wake, matching the per-descriptor kernel buffer drain step.
pub const CHUNK_SIZE: usize = 4096;
/// Multiplex wait bound, so child exit is observed promptly without a
/// dedicated exit-watcher thread.
pub const POLL_INTERVAL_MS: u16 = 50;

const CHANNEL_CAPACITY: usize = 256;

/// How to launch one supervised child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin before reading begins, then closed.
    /// `None` attaches /dev/null.
    pub stdin_payload: Option<Vec<u8>>,
}

impl SpawnSpec {
    pub fn new(binary: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            stdin_payload: None,
        }
    }
}

/// Spawn `spec` and stream its output as `RawLine`s.
///
/// Returns an error only when the executable cannot be launched; everything
/// after a successful spawn (read errors, non-zero exit) ends the stream
/// instead of raising. Cancelling `cancel` kills the child and closes the
/// stream; the receiver being dropped has the same effect. The pty master is
/// released on every exit path and the child is always reaped.
pub fn spawn_supervised(
    spec: SpawnSpec,
    cancel: CancellationToken,
) -> anyhow::Result<mpsc::Receiver<RawLine>> {
    let pty = openpty(None, None).context("openpty failed")?;
    let slave_stdout = pty.slave.try_clone().context("clone pty slave")?;

    let mut cmd = Command::new(&spec.binary);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdout(Stdio::from(slave_stdout))
        .stderr(Stdio::piped())
        .stdin(if spec.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", spec.binary))?;
    // The child holds its own copy of the slave; ours must close so EIO on
    // the master signals child exit.
    drop(pty.slave);

    let stdin = child.stdin.take();
    let stderr = child.stderr.take();
    let payload = spec.stdin_payload;
    let binary = spec.binary;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        multiplex(child, pty.master, stderr, stdin, payload, tx, cancel, &binary);
    });
    Ok(rx)
}

#[allow(clippy::too_many_arguments)]
fn multiplex(
    mut child: Child,
    master: OwnedFd,
    stderr: Option<ChildStderr>,
    stdin: Option<std::process::ChildStdin>,
    payload: Option<Vec<u8>>,
    tx: mpsc::Sender<RawLine>,
    cancel: CancellationToken,
    binary: &str,
) {
    if let (Some(mut stdin), Some(payload)) = (stdin, payload) {
        if let Err(err) = stdin.write_all(&payload) {
            debug!("stdin payload write failed: {err}");
        }
        // dropped here: closing stdin lets the child start
    }

    if let Err(err) = set_nonblocking(master.as_raw_fd()) {
        warn!("failed to set pty master non-blocking: {err}");
    }
    if let Some(stderr) = &stderr {
        if let Err(err) = set_nonblocking(stderr.as_raw_fd()) {
            warn!("failed to set stderr non-blocking: {err}");
        }
    }

    let mut out_buf: Vec<u8> = Vec::new();
    let mut err_buf: Vec<u8> = Vec::new();
    let mut exit_status = None;

    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            let _ = child.kill();
            break;
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                // Final non-blocking drain so output racing the exit still
                // reaches the consumer.
                drain(master.as_raw_fd(), &mut out_buf);
                if let Some(stderr) = &stderr {
                    drain(stderr.as_raw_fd(), &mut err_buf);
                }
                exit_status = Some(status);
                break;
            }
            Ok(None) => {}
            Err(err) => {
                debug!("try_wait failed: {err}");
                break;
            }
        }

        let mut readable = [false, false];
        if let Some(stderr) = &stderr {
            let mut fds = [
                PollFd::new(master.as_fd(), PollFlags::POLLIN),
                PollFd::new(stderr.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => {
                    readable[0] = wants_read(&fds[0]);
                    readable[1] = wants_read(&fds[1]);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    debug!("poll failed: {err}");
                    break;
                }
            }
        } else {
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => readable[0] = wants_read(&fds[0]),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    debug!("poll failed: {err}");
                    break;
                }
            }
        }

        if readable[0] {
            read_chunk(master.as_raw_fd(), &mut out_buf);
        }
        if readable[1] {
            if let Some(stderr) = &stderr {
                read_chunk(stderr.as_raw_fd(), &mut err_buf);
            }
        }

        if flush_lines(&mut out_buf, StreamSource::Stdout, &tx).is_err()
            || flush_lines(&mut err_buf, StreamSource::Stderr, &tx).is_err()
        {
            let _ = child.kill();
            break;
        }
    }

    // Complete lines first, then any partial trailing bytes.
    let _ = flush_lines(&mut out_buf, StreamSource::Stdout, &tx);
    let _ = flush_lines(&mut err_buf, StreamSource::Stderr, &tx);
    let _ = flush_tail(&mut out_buf, StreamSource::Stdout, &tx);
    let _ = flush_tail(&mut err_buf, StreamSource::Stderr, &tx);

    if let Some(status) = exit_status {
        if !status.success() {
            warn!("`{binary}` exited with {status}");
        }
    }

    // No zombies: kill if still alive, reap either way. The pty master
    // OwnedFd closes when this frame unwinds.
    let _ = child.kill();
    let _ = child.wait();
}

fn wants_read(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .map(|r| r.contains(PollFlags::POLLIN) || r.contains(PollFlags::POLLHUP))
        .unwrap_or(false)
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// One bounded read. EAGAIN means nothing buffered; EIO on a pty master
/// means the child closed the slave. Both are quiet no-ops.
fn read_chunk(fd: RawFd, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; CHUNK_SIZE];
    match nix::unistd::read(fd, &mut chunk) {
        Ok(0) => {}
        Ok(n) => buf.extend_from_slice(&chunk[..n]),
        Err(nix::errno::Errno::EAGAIN) => {}
        Err(nix::errno::Errno::EIO) => {}
        Err(err) => debug!("read failed: {err}"),
    }
}

/// Read until the descriptor has nothing left buffered.
fn drain(fd: RawFd, buf: &mut Vec<u8>) {
    loop {
        let before = buf.len();
        read_chunk(fd, buf);
        if buf.len() == before {
            break;
        }
    }
}

/// Emit every complete line in `buf`, leaving partial trailing bytes for the
/// next wake. Pty line discipline turns `\n` into `\r\n`; the `\r` is
/// stripped so consumers see normalized endings.
fn flush_lines(
    buf: &mut Vec<u8>,
    source: StreamSource,
    tx: &mpsc::Sender<RawLine>,
) -> Result<(), ()> {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let mut text = String::from_utf8_lossy(&line).into_owned();
        text.push('\n');
        tx.blocking_send(RawLine { source, text }).map_err(|_| ())?;
    }
    Ok(())
}

fn flush_tail(
    buf: &mut Vec<u8>,
    source: StreamSource,
    tx: &mpsc::Sender<RawLine>,
) -> Result<(), ()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut tail = std::mem::take(buf);
    if tail.last() == Some(&b'\r') {
        tail.pop();
    }
    let text = String::from_utf8_lossy(&tail).into_owned();
    if text.is_empty() {
        return Ok(());
    }
    tx.blocking_send(RawLine { source, text }).map_err(|_| ())
}
