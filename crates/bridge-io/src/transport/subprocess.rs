//! Child processes attached over a socketpair or a pseudo-terminal.
//!
//! The child gets one end of the session on stdin and stdout and runs in a new
//! session. In PTY mode it also takes the terminal as its controlling tty and
//! its stderr goes to the terminal; otherwise stderr follows [`StderrMode`].

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};

use nix::errno::Errno;
use nix::pty::{OpenptyResult, openpty};
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, setsid};
use tokio::sync::oneshot;

use super::{ChildWatcher, Endpoint, Protocol, Transport, TransportError};
use crate::fd;
use crate::spooler::Spooler;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("failed to allocate a pseudo-terminal: {0}")]
    Pty(#[from] Errno),

    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[from] io::Error),
}

/// Where a socket-mode child's stderr goes. Ignored in PTY mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    #[default]
    Inherit,
    /// Collected by a [`Spooler`], see [`Subprocess::stderr`].
    Piped,
    Null,
}

impl StderrMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubprocessOptions {
    pub argv: Vec<String>,
    pub pty: bool,
    /// `(rows, cols)`, applied before the child starts. PTY mode only.
    pub window: Option<(u16, u16)>,
    pub stderr: StderrMode,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl SubprocessOptions {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_window_size(mut self, rows: u16, cols: u16) -> Self {
        self.window = Some((rows, cols));
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

fn set_window_size(fd: RawFd, rows: u16, cols: u16) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { tiocswinsz(fd, &size) }?;
    Ok(())
}

/// Endpoint for a spawned child. See the module docs.
pub struct Subprocess {
    session: Option<OwnedFd>,
    session_fd: RawFd,
    pty: bool,
    pid: Pid,
    /// Set by the child watcher, even after the session is torn down.
    returncode: Arc<OnceLock<i32>>,
    exit: Option<oneshot::Receiver<i32>>,
    stderr: Option<Spooler>,
}

impl std::fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subprocess")
            .field("pid", &self.pid)
            .field("pty", &self.pty)
            .field("returncode", &self.returncode())
            .finish_non_exhaustive()
    }
}

impl Subprocess {
    /// Spawn the child and register it with the process-wide child watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: &SubprocessOptions) -> Result<Self, SpawnError> {
        let (program, args) = options.argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in &options.env {
            command.env(key, value);
        }
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let session: OwnedFd = if options.pty {
            let OpenptyResult { master, slave } = openpty(None, None)?;
            if let Some((rows, cols)) = options.window {
                set_window_size(master.as_raw_fd(), rows, cols)?;
            }
            command
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave));
            master
        } else {
            let (ours, theirs) = UnixStream::pair()?;
            let theirs = OwnedFd::from(theirs);
            command
                .stdin(Stdio::from(theirs.try_clone()?))
                .stdout(Stdio::from(theirs))
                .stderr(options.stderr.stdio());
            OwnedFd::from(ours)
        };

        let pty = options.pty;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(move || {
                setsid()?;
                if pty {
                    tiocsctty(0, 0)?;
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        // our copies of the child's ends must close, or EOF never arrives
        drop(command);

        let pid = Pid::from_raw(child.id() as i32);
        // watch before anything else can fail, so the child is always reaped
        let returncode = Arc::new(OnceLock::new());
        let (exit_tx, exit_rx) = oneshot::channel();
        let store = Arc::clone(&returncode);
        ChildWatcher::get().add_child_handler(pid, move |status| {
            let _ = store.set(status);
            let _ = exit_tx.send(status);
        });

        let stderr = match child.stderr.take() {
            Some(pipe) => Some(Spooler::new(&pipe)?),
            None => None,
        };
        tracing::debug!(%pid, program = %program, pty, "Spawned subprocess");

        Ok(Self {
            session_fd: session.as_raw_fd(),
            session: Some(session),
            pty,
            pid,
            returncode,
            exit: Some(exit_rx),
            stderr,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit code, or negated signal number. `None` while running.
    pub fn returncode(&self) -> Option<i32> {
        self.returncode.get().copied()
    }

    pub fn is_pty(&self) -> bool {
        self.pty
    }

    pub fn set_window_size(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        if !self.pty {
            return Err(TransportError::NotATerminal);
        }
        if self.session.is_none() {
            return Err(TransportError::Closing);
        }
        set_window_size(self.session_fd, rows, cols)?;
        Ok(())
    }

    /// No-op once the exit has been observed.
    pub fn send_signal(&self, sig: Signal) -> Result<(), TransportError> {
        if self.returncode().is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            // reaped, exit not yet delivered
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    pub fn terminate(&self) -> Result<(), TransportError> {
        self.send_signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> Result<(), TransportError> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Stderr collected so far, when spawned with [`StderrMode::Piped`].
    pub fn stderr(&self) -> Option<Vec<u8>> {
        self.stderr.as_ref().map(Spooler::get)
    }
}

impl Endpoint for Subprocess {
    fn fds(&self) -> (RawFd, RawFd) {
        (self.session_fd, self.session_fd)
    }

    fn can_write_eof(&self) -> bool {
        !self.pty
    }

    fn write_eof(&mut self) -> io::Result<()> {
        match &self.session {
            Some(session) => fd::shutdown_write(session.as_raw_fd()),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn eio_is_eof(&self) -> bool {
        self.pty
    }

    fn close(&mut self) {
        tracing::debug!(pid = %self.pid, "Closing subprocess session");
        self.session = None;
    }

    fn poll_exit(&mut self, cx: &mut Context<'_>) -> Poll<i32> {
        let Some(exit) = self.exit.as_mut() else {
            return Poll::Pending;
        };
        let status = ready!(Pin::new(exit).poll(cx)).unwrap_or(255);
        self.exit = None;
        Poll::Ready(status)
    }
}

impl<P: Protocol> Transport<Subprocess, P> {
    pub fn spawn(options: &SubprocessOptions, protocol: P) -> Result<Self, SpawnError> {
        let process = Subprocess::spawn(options)?;
        Ok(Transport::new(process, protocol)?)
    }
}
