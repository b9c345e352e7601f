//! Raw fd plumbing shared by the transports and the spooler.
//!
//! ## Safety contracts
//!
//! Every helper here takes a `RawFd` that the caller keeps open for the duration
//! of the call. Reads and writes go through a `ManuallyDrop<File>` so the fd is
//! borrowed, never closed; everything else borrows it as a `BorrowedFd`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{Shutdown, shutdown};
use nix::sys::uio;
use tokio_util::bytes::Bytes;

/// Non-owning handle used for reactor registrations.
///
/// The endpoint owns the real descriptor; dropping an `FdRef` never closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FdRef(pub RawFd);

impl AsRawFd for FdRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn borrow<'a>(fd: RawFd) -> BorrowedFd<'a> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn with_file<R>(fd: RawFd, f: impl FnOnce(&mut File) -> io::Result<R>) -> io::Result<R> {
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    f(&mut file)
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    with_file(fd, |file| file.read(buf))
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    with_file(fd, |file| file.write(buf))
}

/// One scatter-write of every queued block. Callers keep the queue within
/// IOV_MAX blocks.
pub(crate) fn writev(fd: RawFd, blocks: &VecDeque<Bytes>) -> io::Result<usize> {
    let slices: Vec<IoSlice<'_>> = blocks.iter().map(|block| IoSlice::new(block)).collect();
    Ok(uio::writev(borrow(fd), &slices)?)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let fd = borrow(fd);
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Zero-timeout readiness check. Hangup and error count as ready, like select().
pub(crate) fn is_readable_now(fd: RawFd) -> bool {
    let mut fds = [PollFd::new(borrow(fd), PollFlags::POLLIN)];
    poll(&mut fds, PollTimeout::ZERO).is_ok_and(|ready| ready > 0)
}

/// Half-close the write side of a socket.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    Ok(shutdown(fd, Shutdown::Write)?)
}
