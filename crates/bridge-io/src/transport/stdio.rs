//! Endpoint over the process's own stdin/stdout.

use std::io;
use std::os::fd::RawFd;

use super::{Endpoint, Protocol, Transport};

/// Borrows fds 0 and 1 (or a given pair). They are never closed.
///
/// Both fds must be pollable: pipes, sockets or terminals. Regular files are
/// rejected by the reactor at registration time.
#[derive(Debug, Clone, Copy)]
pub struct StdioEndpoint {
    stdin: RawFd,
    stdout: RawFd,
}

impl StdioEndpoint {
    pub fn new() -> Self {
        Self::with_fds(libc::STDIN_FILENO, libc::STDOUT_FILENO)
    }

    pub fn with_fds(stdin: RawFd, stdout: RawFd) -> Self {
        Self { stdin, stdout }
    }
}

impl Default for StdioEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for StdioEndpoint {
    fn fds(&self) -> (RawFd, RawFd) {
        (self.stdin, self.stdout)
    }

    fn can_write_eof(&self) -> bool {
        false
    }

    fn write_eof(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stdio transport cannot write EOF",
        ))
    }

    fn close(&mut self) {
        tracing::trace!(stdin = self.stdin, stdout = self.stdout, "Stdio transport closed");
    }
}

impl<P: Protocol> Transport<StdioEndpoint, P> {
    pub fn stdio(protocol: P) -> io::Result<Self> {
        Transport::new(StdioEndpoint::new(), protocol)
    }
}
