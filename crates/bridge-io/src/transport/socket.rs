//! Endpoint over an already-connected socket.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::{Endpoint, Protocol, Transport};
use crate::fd;

/// Owns the socket; closing the endpoint closes it.
#[derive(Debug)]
pub struct SocketEndpoint {
    socket: Option<OwnedFd>,
}

impl SocketEndpoint {
    pub fn new(socket: impl Into<OwnedFd>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }
}

impl Endpoint for SocketEndpoint {
    fn fds(&self) -> (RawFd, RawFd) {
        let fd = self.raw_fd();
        (fd, fd)
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn write_eof(&mut self) -> io::Result<()> {
        match &self.socket {
            Some(socket) => fd::shutdown_write(socket.as_raw_fd()),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

impl<P: Protocol> Transport<SocketEndpoint, P> {
    pub fn from_socket(socket: impl Into<OwnedFd>, protocol: P) -> io::Result<Self> {
        Transport::new(SocketEndpoint::new(socket), protocol)
    }
}
