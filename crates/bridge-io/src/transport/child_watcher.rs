//! Exit notification for spawned children.
//!
//! Prefers a pidfd per child (Linux 5.3+). Elsewhere, each watched child gets a
//! SIGCHLD listener that reaps only its own pid, so unrelated children spawned
//! by the rest of the process are never stolen.

use std::io;
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};

/// Status reported when the child was reaped behind our back.
const UNKNOWN_STATUS: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildWatcher {
    Pidfd,
    Signal,
}

impl ChildWatcher {
    /// The best strategy this kernel supports, probed once per process.
    pub fn get() -> Self {
        static WATCHER: OnceLock<ChildWatcher> = OnceLock::new();
        *WATCHER.get_or_init(|| {
            let watcher = if pidfd::supported() {
                Self::Pidfd
            } else {
                Self::Signal
            };
            tracing::debug!(?watcher, "Selected child watcher");
            watcher
        })
    }

    /// Reap `pid` in the background and call `callback` with the exit code, or
    /// the negated signal number.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_child_handler(self, pid: Pid, callback: impl FnOnce(i32) + Send + 'static) {
        tokio::spawn(async move {
            let result = match self {
                Self::Pidfd => match pidfd::wait(pid).await {
                    Err(e) if e.kind() == io::ErrorKind::Unsupported => wait_for_sigchld(pid).await,
                    other => other,
                },
                Self::Signal => wait_for_sigchld(pid).await,
            };
            let status = result.unwrap_or_else(|e| {
                tracing::warn!(%pid, error = %e, "Unknown child process exit status");
                UNKNOWN_STATUS
            });
            tracing::debug!(%pid, status, "Child exited");
            callback(status);
        });
    }
}

fn exit_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(-(signal as i32)),
        _ => None,
    }
}

fn try_reap(pid: Pid) -> io::Result<Option<i32>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => Ok(exit_status(status)),
        Err(Errno::EINTR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn wait_for_sigchld(pid: Pid) -> io::Result<i32> {
    let mut sigchld = signal(SignalKind::child())?;
    loop {
        // check before waiting; the child may have exited before we subscribed
        if let Some(status) = try_reap(pid)? {
            return Ok(status);
        }
        if sigchld.recv().await.is_none() {
            return Err(io::Error::other("SIGCHLD stream closed"));
        }
    }
}

#[cfg(target_os = "linux")]
mod pidfd {
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    use nix::unistd::Pid;
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;

    fn open(pid: Pid) -> io::Result<OwnedFd> {
        let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
    }

    pub(super) fn supported() -> bool {
        open(nix::unistd::getpid()).is_ok()
    }

    pub(super) async fn wait(pid: Pid) -> io::Result<i32> {
        let pidfd = AsyncFd::with_interest(open(pid)?, Interest::READABLE)?;
        loop {
            let mut guard = pidfd.readable().await?;
            if let Some(status) = super::try_reap(pid)? {
                return Ok(status);
            }
            guard.clear_ready();
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod pidfd {
    use std::io;

    use nix::unistd::Pid;

    pub(super) fn supported() -> bool {
        false
    }

    pub(super) async fn wait(_pid: Pid) -> io::Result<i32> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}
