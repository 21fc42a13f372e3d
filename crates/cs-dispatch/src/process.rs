//! Conduit process management: spawn, header protocol,
//! stdout status-line reading, and the SPC socket, with child reaping via
//! `nix::sys::wait::waitpid(WNOHANG)` instead of the source's
//! `sigsetjmp`/`SIGCHLD` dance.
//!
//! Grounded on `original_source/trunk/src/conduit.c`'s `spawn_conduit()`
//! (pipe/socketpair setup, argv `[path, "conduit", flavor]`) and
//! `run_conduit()` (header writing order, status-line reading). The
//! source's manual `fork()`+`execvp()` trampoline is replaced with
//! `std::process::Command`, which already encodes that pattern safely; the
//! one piece `Command` doesn't do natively — handing the child a second,
//! numbered fd for the SPC socket — uses a `pre_exec` hook to `dup2` it
//! into place, since the child-side half of the pair would otherwise be
//! closed by Rust's default close-on-exec behavior.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::ConduitBlock;
use crate::error::DispatcherError;
use crate::status::{parse_status_line, StatusLine};

/// The fd number the child is told to expect its SPC socket on (`SPCPipe`
/// header). Arbitrary but fixed, chosen well clear of stdin(0)/stdout(1)
/// /stderr(2) and anything `Command` itself might open.
const CHILD_SPC_FD: i32 = 20;

/// One line read from a running conduit's stdout, or notice that it exited.
pub enum ConduitEvent {
    Status(StatusLine),
    StdoutClosed,
}

pub struct SpawnedConduit {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_lines: mpsc::Receiver<ConduitEvent>,
    spc: Option<UnixStream>,
    reaped: Option<i32>,
}

impl SpawnedConduit {
    /// Spawn one conduit: pipes for stdin/stdout, plus an SPC socket pair
    /// when `enable_spc` (sync flavor only).
    pub fn spawn(block: &ConduitBlock, path: &str, flavor: &str, enable_spc: bool) -> Result<Self, DispatcherError> {
        let mut command = Command::new(path);
        command.arg("conduit").arg(flavor);
        if let Some(dir) = &block.working_dir {
            command.current_dir(Path::new(dir));
        }
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());

        let spc = if enable_spc {
            let (parent_side, child_side) = UnixStream::pair().map_err(DispatcherError::Io)?;
            let child_raw = child_side.as_raw_fd();
            // SAFETY: `dup2`/`close` are async-signal-safe and the only
            // calls made between fork and exec here; `child_side` stays
            // alive (owned by this closure) until exec replaces the image.
            unsafe {
                command.pre_exec(move || {
                    if libc::dup2(child_raw, CHILD_SPC_FD) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            Some((parent_side, child_side))
        } else {
            None
        };

        let mut child = command.spawn().map_err(|e| DispatcherError::Spawn(e.to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("stdout was piped");

        // The child-side half of the SPC pair is now duplicated in the
        // forked child (at CHILD_SPC_FD); the parent's copy can be dropped.
        let spc = spc.map(|(parent_side, _child_side)| parent_side);

        let (tx, rx) = mpsc::channel();
        spawn_stdout_reader(stdout, tx);

        Ok(SpawnedConduit { child, stdin, stdout_lines: rx, spc, reaped: None })
    }

    /// Write the header block: one `Name: value` line per
    /// header, then a blank line, then raw preference payloads.
    pub fn write_headers(&mut self, headers: &[(String, String)], spc_fd: Option<i32>) -> Result<(), DispatcherError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        for (name, value) in headers {
            if name.len() > 32 {
                return Err(DispatcherError::BadHeader(format!("{name} exceeds 32 characters")));
            }
            let line = format!("{name}: {value}\n");
            if line.len() > 255 {
                return Err(DispatcherError::BadHeader(line));
            }
            stdin.write_all(line.as_bytes())?;
        }
        if let Some(fd) = spc_fd {
            let line = format!("SPCPipe: {fd}\n");
            stdin.write_all(line.as_bytes())?;
        }
        stdin.write_all(b"\n")?;
        Ok(())
    }

    /// Raw preference payloads, each preceded by its own `Preference:
    /// cccc/id/length` header already written in `write_headers`.
    pub fn write_preference_payload(&mut self, data: &[u8]) -> Result<(), DispatcherError> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.write_all(data)?;
        }
        Ok(())
    }

    /// Close the write half of stdin once headers/preferences are sent, so
    /// the conduit's stdin reaches EOF.
    pub fn finish_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn spc_fd_number(&self) -> Option<i32> {
        self.spc.is_some().then_some(CHILD_SPC_FD)
    }

    pub fn spc_socket(&mut self) -> Option<&mut UnixStream> {
        self.spc.as_mut()
    }

    /// Block (with a cap) for the next stdout status line, or `None` once
    /// stdout has closed and no more lines remain.
    pub fn next_status(&mut self, timeout: Duration) -> Option<ConduitEvent> {
        self.stdout_lines.recv_timeout(timeout).ok()
    }

    /// Non-blocking reap: `waitpid(WNOHANG)` polled from the dispatcher's
    /// own loop rather than a SIGCHLD handler.
    pub fn try_reap(&mut self) -> Result<Option<i32>, DispatcherError> {
        if let Some(code) = self.reaped {
            return Ok(Some(code));
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.reaped = Some(code);
                Ok(Some(code))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                let code = 128 + sig as i32;
                self.reaped = Some(code);
                Ok(Some(code))
            }
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => Ok(self.reaped),
            Err(e) => Err(DispatcherError::Io(std::io::Error::from_raw_os_error(e as i32))),
        }
    }

    pub fn kill(&mut self) -> Result<(), DispatcherError> {
        self.child.kill().map_err(DispatcherError::Io)
    }
}

fn spawn_stdout_reader(stdout: ChildStdout, tx: mpsc::Sender<ConduitEvent>) {
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(ConduitEvent::Status(parse_status_line(&line))).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(ConduitEvent::StdoutClosed);
    });
}
