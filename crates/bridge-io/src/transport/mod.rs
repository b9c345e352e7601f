//! Bi-directional byte transports over raw file descriptors.
//!
//! A [`Transport`] is the engine: it owns the reactor registrations, the
//! pending-write queue and the flow-control state, and drives a [`Protocol`].
//! What sits behind the fds is an [`Endpoint`] strategy:
//! - [`socket::SocketEndpoint`]: any connected socket
//! - [`stdio::StdioEndpoint`]: fds 0/1, not owned
//! - [`subprocess::Subprocess`]: a child on a socketpair or a PTY
//!
//! Nothing here blocks. The owner drives the engine with [`Transport::step`]
//! (cancel-safe, usable inside `tokio::select!`) or [`Transport::run`].

mod child_watcher;
pub mod socket;
pub mod stdio;
pub mod subprocess;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::task::{Context, Poll};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio_util::bytes::{Bytes, BytesMut};

use crate::fd::{self, FdRef};

pub use child_watcher::ChildWatcher;
pub use socket::SocketEndpoint;
pub use stdio::StdioEndpoint;
pub use subprocess::Subprocess;

pub type SocketTransport<P> = Transport<SocketEndpoint, P>;
pub type StdioTransport<P> = Transport<StdioEndpoint, P>;
pub type SubprocessTransport<P> = Transport<Subprocess, P>;

/// Maximum bytes taken from the input fd per readiness event.
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// `writev` vector cap (man 2 writev). The write queue is coalesced above it.
pub const IOV_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closing")]
    Closing,

    #[error("EOF was already written")]
    EofAlreadyWritten,

    /// The endpoint has no way to half-close (e.g. stdio on a terminal).
    #[error("transport cannot write EOF")]
    CannotWriteEof,

    #[error("write buffer limits are not supported")]
    UnsupportedLimits,

    #[error("transport is not backed by a pseudo-terminal")]
    NotATerminal,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The operations a [`Protocol`] may invoke on its transport.
///
/// Implemented by the engine core and handed to protocol callbacks, so a
/// protocol can write, close or pause from inside `data_received`.
pub trait TransportHandle {
    /// Queue `data` for the peer. I/O errors abort the transport and are
    /// reported through [`Protocol::connection_lost`], not returned here.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Half-close the write side once everything queued has been sent.
    fn write_eof(&mut self) -> Result<(), TransportError>;

    fn can_write_eof(&self) -> bool;

    /// Close after flushing the write queue. Idempotent.
    fn close(&mut self);

    /// Tear down immediately, dropping anything still queued.
    fn abort(&mut self, error: Option<io::Error>);

    fn pause_reading(&mut self);

    /// No-op once the read side has seen EOF.
    fn resume_reading(&mut self);

    fn is_reading(&self) -> bool;

    fn is_closing(&self) -> bool;

    fn write_buffer_size(&self) -> usize;

    /// Watermarks are not configurable; always `(0, 0)`.
    fn write_buffer_limits(&self) -> (usize, usize) {
        (0, 0)
    }

    fn set_write_buffer_limits(
        &mut self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<(), TransportError> {
        if high.unwrap_or(0) != 0 || low.unwrap_or(0) != 0 {
            return Err(TransportError::UnsupportedLimits);
        }
        Ok(())
    }
}

/// Callbacks driven by a [`Transport`].
pub trait Protocol {
    fn connection_made(&mut self, _transport: &mut dyn TransportHandle) {}

    fn data_received(&mut self, transport: &mut dyn TransportHandle, data: &[u8]);

    /// Return `true` to keep the write side open after the peer's EOF.
    fn eof_received(&mut self, _transport: &mut dyn TransportHandle) -> bool {
        false
    }

    /// The write queue went from empty to non-empty.
    fn pause_writing(&mut self) {}

    /// The write queue drained (or was dropped by an abort).
    fn resume_writing(&mut self) {}

    fn connection_lost(&mut self, error: Option<io::Error>);

    /// Only subprocess endpoints report this. `status` is the exit code, or the
    /// negated signal number when the child was killed.
    fn process_exited(&mut self, _transport: &mut dyn TransportHandle, _status: i32) {}
}

/// The resource strategy behind a [`Transport`].
pub trait Endpoint {
    /// `(input, output)`; both may be the same fd.
    fn fds(&self) -> (RawFd, RawFd);

    fn can_write_eof(&self) -> bool;

    /// Perform the half-close now. Only called when `can_write_eof` is true.
    fn write_eof(&mut self) -> io::Result<()>;

    /// PTY masters report the far side hanging up as `EIO` instead of a
    /// zero-length read.
    fn eio_is_eof(&self) -> bool {
        false
    }

    /// Release the underlying resource. Reactor registrations are already gone.
    fn close(&mut self);

    /// Resolves once with the exit status of a child process, if any.
    fn poll_exit(&mut self, _cx: &mut Context<'_>) -> Poll<i32> {
        Poll::Pending
    }
}

enum Readiness {
    Duplex(AsyncFd<FdRef>),
    Split {
        input: AsyncFd<FdRef>,
        output: AsyncFd<FdRef>,
    },
}

impl Readiness {
    fn register(in_fd: RawFd, out_fd: RawFd) -> io::Result<Self> {
        if in_fd == out_fd {
            return Ok(Self::Duplex(AsyncFd::new(FdRef(in_fd))?));
        }
        Ok(Self::Split {
            input: AsyncFd::with_interest(FdRef(in_fd), Interest::READABLE)?,
            output: AsyncFd::with_interest(FdRef(out_fd), Interest::WRITABLE)?,
        })
    }

    fn input(&self) -> &AsyncFd<FdRef> {
        match self {
            Self::Duplex(fd) => fd,
            Self::Split { input, .. } => input,
        }
    }

    fn output(&self) -> &AsyncFd<FdRef> {
        match self {
            Self::Duplex(fd) => fd,
            Self::Split { output, .. } => output,
        }
    }
}

/// Protocol notifications raised by the core, delivered once the current
/// callback has returned.
#[derive(Debug)]
enum Notice {
    PauseWriting,
    ResumeWriting,
    ConnectionLost(Option<io::Error>),
}

#[derive(Debug)]
enum ReadOutcome {
    Data(usize),
    Eof,
    Retry,
    Failed(io::Error),
}

fn classify_read(result: io::Result<usize>, eio_is_eof: bool) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            ReadOutcome::Retry
        }
        Err(e) if eio_is_eof && e.raw_os_error() == Some(libc::EIO) => ReadOutcome::Eof,
        Err(e) => ReadOutcome::Failed(e),
    }
}

/// Drop `written` bytes from the front of the queue. Returns true once empty.
fn consume(queue: &mut VecDeque<Bytes>, mut written: usize) -> bool {
    while written > 0 {
        let Some(block) = queue.front_mut() else {
            break;
        };
        if block.len() > written {
            *block = block.slice(written..);
            break;
        }
        written -= block.len();
        queue.pop_front();
    }
    queue.is_empty()
}

fn coalesce(queue: &mut VecDeque<Bytes>) {
    let mut all = BytesMut::with_capacity(queue.iter().map(Bytes::len).sum());
    for block in queue.drain(..) {
        all.extend_from_slice(&block);
    }
    queue.push_back(all.freeze());
}

enum Event {
    Read(ReadOutcome),
    Wrote(io::Result<usize>),
    Exited(i32),
    Spurious,
}

// Field order matters: registrations drop before the endpoint closes its fds.
struct Core<E> {
    io: Option<Readiness>,
    endpoint: E,
    queue: Option<VecDeque<Bytes>>,
    reading: bool,
    read_closed: bool,
    closing: bool,
    eof: bool,
    notices: VecDeque<Notice>,
}

impl<E: Endpoint> Core<E> {
    fn new(io: Readiness, endpoint: E) -> Self {
        Self {
            io: Some(io),
            endpoint,
            queue: None,
            reading: false,
            read_closed: false,
            closing: false,
            eof: false,
            notices: VecDeque::new(),
        }
    }

    fn close_reader(&mut self) {
        self.pause_reading();
        self.read_closed = true;
    }

    fn create_write_queue(&mut self, data: Bytes) {
        debug_assert!(self.queue.is_none());
        tracing::trace!(pending = data.len(), "Write would block, queueing");
        self.queue = Some(VecDeque::from([data]));
        self.notices.push_back(Notice::PauseWriting);
    }

    fn remove_write_queue(&mut self) {
        if self.queue.take().is_some() {
            self.notices.push_back(Notice::ResumeWriting);
        }
    }

    fn write_eof_now(&mut self) {
        tracing::debug!("Writing EOF");
        if let Err(e) = self.endpoint.write_eof() {
            self.abort(Some(e));
        }
    }

    fn finish_write(&mut self, result: io::Result<usize>) {
        let written = match result {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(e) => {
                self.abort(Some(e));
                return;
            }
        };
        tracing::trace!(bytes = written, "Flushed queued data");

        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        if !consume(queue, written) {
            return;
        }

        self.remove_write_queue();
        if self.eof {
            self.write_eof_now();
        }
        if self.closing {
            self.abort(None);
        }
    }
}

impl<E: Endpoint> TransportHandle for Core<E> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closing {
            return Err(TransportError::Closing);
        }
        if self.eof {
            return Err(TransportError::EofAlreadyWritten);
        }

        if let Some(queue) = self.queue.as_mut() {
            queue.push_back(Bytes::copy_from_slice(data));
            if queue.len() > IOV_MAX {
                coalesce(queue);
            }
            return Ok(());
        }

        let Some(io) = self.io.as_ref() else {
            return Err(TransportError::Closing);
        };
        let written = match fd::write(io.output().get_ref().as_raw_fd(), data) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(e) => {
                self.abort(Some(e));
                return Ok(());
            }
        };

        if written != data.len() {
            self.create_write_queue(Bytes::copy_from_slice(&data[written..]));
        }
        Ok(())
    }

    fn write_eof(&mut self) -> Result<(), TransportError> {
        if self.eof {
            return Err(TransportError::EofAlreadyWritten);
        }
        if !self.endpoint.can_write_eof() {
            return Err(TransportError::CannotWriteEof);
        }
        if self.io.is_none() {
            return Err(TransportError::Closing);
        }

        self.eof = true;
        if self.queue.is_none() {
            self.write_eof_now();
        }
        Ok(())
    }

    fn can_write_eof(&self) -> bool {
        self.endpoint.can_write_eof()
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.close_reader();

        // finish_write() aborts once the queue drains
        if self.queue.is_some() {
            return;
        }
        self.abort(None);
    }

    fn abort(&mut self, error: Option<io::Error>) {
        let Some(io) = self.io.take() else {
            return;
        };
        tracing::debug!(error = ?error, "Tearing down transport");

        self.closing = true;
        self.reading = false;
        self.read_closed = true;
        drop(io);
        self.remove_write_queue();
        self.notices.push_back(Notice::ConnectionLost(error));
        self.endpoint.close();
    }

    fn pause_reading(&mut self) {
        self.reading = false;
    }

    fn resume_reading(&mut self) {
        if !self.reading && !self.read_closed && self.io.is_some() {
            self.reading = true;
        }
    }

    fn is_reading(&self) -> bool {
        self.reading
    }

    fn is_closing(&self) -> bool {
        self.closing
    }

    fn write_buffer_size(&self) -> usize {
        self.queue
            .as_ref()
            .map_or(0, |queue| queue.iter().map(Bytes::len).sum())
    }
}

/// A transport engine bound to an endpoint and its protocol.
pub struct Transport<E: Endpoint, P: Protocol> {
    core: Core<E>,
    protocol: P,
    read_buf: Box<[u8]>,
}

impl<E: Endpoint, P: Protocol> Transport<E, P> {
    /// Register the endpoint's fds with the reactor and start reading.
    ///
    /// Must be called from within a tokio runtime. Fails for fds epoll cannot
    /// watch (regular files).
    pub fn new(endpoint: E, protocol: P) -> io::Result<Self> {
        let (in_fd, out_fd) = endpoint.fds();
        tracing::debug!(in_fd, out_fd, "Creating transport");

        fd::set_nonblocking(in_fd)?;
        if out_fd != in_fd {
            fd::set_nonblocking(out_fd)?;
        }
        let io = Readiness::register(in_fd, out_fd)?;

        let mut transport = Self {
            core: Core::new(io, endpoint),
            protocol,
            read_buf: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
        };
        transport.protocol.connection_made(&mut transport.core);
        transport.core.resume_reading();
        transport.dispatch();
        Ok(transport)
    }

    /// Wait for the next readiness or exit event and handle it.
    ///
    /// Returns `false` once the transport has been torn down. Waits forever
    /// when reading is paused, nothing is queued and no exit is pending.
    pub async fn step(&mut self) -> bool {
        let Some(io) = self.core.io.as_ref() else {
            return false;
        };
        let eio_is_eof = self.core.endpoint.eio_is_eof();
        let want_read = self.core.reading;
        let queue = self.core.queue.as_ref();
        let endpoint = &mut self.core.endpoint;
        let read_buf = &mut self.read_buf;

        let event = tokio::select! {
            ready = io.input().readable(), if want_read => match ready {
                Ok(mut guard) => {
                    match guard.try_io(|inner| fd::read(inner.get_ref().as_raw_fd(), read_buf)) {
                        Ok(result) => Event::Read(classify_read(result, eio_is_eof)),
                        Err(_would_block) => Event::Spurious,
                    }
                }
                Err(e) => Event::Read(ReadOutcome::Failed(e)),
            },
            ready = io.output().writable(), if queue.is_some() => match ready {
                Ok(mut guard) => {
                    let written = guard.try_io(|inner| match queue {
                        Some(blocks) => fd::writev(inner.get_ref().as_raw_fd(), blocks),
                        None => Ok(0),
                    });
                    match written {
                        Ok(result) => Event::Wrote(result),
                        Err(_would_block) => Event::Spurious,
                    }
                }
                Err(e) => Event::Wrote(Err(e)),
            },
            status = poll_fn(|cx| endpoint.poll_exit(cx)) => Event::Exited(status),
        };

        match event {
            Event::Read(outcome) => self.on_read(outcome),
            Event::Wrote(result) => self.core.finish_write(result),
            Event::Exited(status) => self.on_exit(status),
            Event::Spurious => {}
        }
        self.dispatch();
        self.core.io.is_some()
    }

    /// Drive the transport until it is torn down.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    fn on_read(&mut self, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::Data(n) => {
                tracing::trace!(bytes = n, "Read data");
                self.protocol
                    .data_received(&mut self.core, &self.read_buf[..n]);
            }
            ReadOutcome::Eof => {
                tracing::debug!("Got EOF");
                self.core.close_reader();
                let keep_open = self.protocol.eof_received(&mut self.core);
                if !keep_open {
                    self.core.close();
                }
            }
            ReadOutcome::Retry => {}
            ReadOutcome::Failed(e) => {
                tracing::debug!(error = %e, "Read failed");
                self.core.abort(Some(e));
            }
        }
    }

    fn on_exit(&mut self, status: i32) {
        if !self.core.closing {
            self.protocol.process_exited(&mut self.core, status);
        }
    }

    fn dispatch(&mut self) {
        while let Some(notice) = self.core.notices.pop_front() {
            match notice {
                Notice::PauseWriting => self.protocol.pause_writing(),
                Notice::ResumeWriting => self.protocol.resume_writing(),
                Notice::ConnectionLost(error) => self.protocol.connection_lost(error),
            }
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let result = self.core.write(data);
        self.dispatch();
        result
    }

    pub fn write_eof(&mut self) -> Result<(), TransportError> {
        let result = self.core.write_eof();
        self.dispatch();
        result
    }

    pub fn close(&mut self) {
        self.core.close();
        self.dispatch();
    }

    pub fn abort(&mut self, error: Option<io::Error>) {
        self.core.abort(error);
        self.dispatch();
    }

    pub fn pause_reading(&mut self) {
        self.core.pause_reading();
    }

    pub fn resume_reading(&mut self) {
        self.core.resume_reading();
    }

    pub fn is_reading(&self) -> bool {
        self.core.is_reading()
    }

    pub fn is_closing(&self) -> bool {
        self.core.is_closing()
    }

    /// True once the fds have been released.
    pub fn is_aborted(&self) -> bool {
        self.core.io.is_none()
    }

    pub fn can_write_eof(&self) -> bool {
        self.core.can_write_eof()
    }

    pub fn write_buffer_size(&self) -> usize {
        self.core.write_buffer_size()
    }

    pub fn write_buffer_limits(&self) -> (usize, usize) {
        self.core.write_buffer_limits()
    }

    pub fn set_write_buffer_limits(
        &mut self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<(), TransportError> {
        self.core.set_write_buffer_limits(high, low)
    }

    pub fn endpoint(&self) -> &E {
        &self.core.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.core.endpoint
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }
}
