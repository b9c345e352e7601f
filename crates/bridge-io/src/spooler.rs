//! Accumulates everything readable from an fd until EOF.
//!
//! Used for a child's piped stderr: a background task appends whatever arrives,
//! and [`Spooler::get`] returns the accumulated bytes after draining anything
//! still pending, so a caller that saw the process exit gets the full output.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;

use crate::fd;

const READ_SIZE: usize = 8192;

struct SpoolState {
    fd: Option<Arc<AsyncFd<OwnedFd>>>,
    contents: Vec<Bytes>,
}

impl SpoolState {
    /// One read. Returns false when nothing more can be read right now.
    fn read_block(&mut self) -> bool {
        let Some(source) = self.fd.as_ref() else {
            return false;
        };
        let mut buf = [0u8; READ_SIZE];
        match fd::read(source.get_ref().as_raw_fd(), &mut buf) {
            Ok(0) => {
                self.fd = None;
                false
            }
            Ok(n) => {
                self.contents.push(Bytes::copy_from_slice(&buf[..n]));
                true
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                false
            }
            Err(e) => {
                // errors end the spool just like EOF
                tracing::debug!(error = %e, "Spooler read failed");
                self.fd = None;
                false
            }
        }
    }
}

pub struct Spooler {
    state: Arc<StdMutex<SpoolState>>,
    task: Option<JoinHandle<()>>,
}

impl Spooler {
    /// Start spooling from a duplicate of `fd`; the caller keeps its own copy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(fd: impl AsFd) -> io::Result<Self> {
        let owned = fd.as_fd().try_clone_to_owned()?;
        fd::set_nonblocking(owned.as_raw_fd())?;
        let source = Arc::new(AsyncFd::with_interest(owned, Interest::READABLE)?);

        let state = Arc::new(StdMutex::new(SpoolState {
            fd: Some(Arc::clone(&source)),
            contents: Vec::new(),
        }));
        let task = tokio::spawn(spool(source, Arc::clone(&state)));

        Ok(Self {
            state,
            task: Some(task),
        })
    }

    /// Everything read so far, after draining whatever is pending right now.
    pub fn get(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(source) = state.fd.as_ref() {
            if !fd::is_readable_now(source.get_ref().as_raw_fd()) || !state.read_block() {
                break;
            }
        }
        state.contents.concat()
    }

    /// True once EOF (or an error) was seen, or after [`Spooler::close`].
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fd.is_none()
    }

    /// Stop reading and release the fd. Contents are kept.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fd = None;
    }
}

impl Drop for Spooler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn spool(source: Arc<AsyncFd<OwnedFd>>, state: Arc<StdMutex<SpoolState>>) {
    loop {
        let mut guard = match source.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::debug!(error = %e, "Spooler readiness failed");
                break;
            }
        };

        let mut spool = state.lock().unwrap_or_else(|e| e.into_inner());
        if spool.fd.is_none() {
            break;
        }
        if !spool.read_block() {
            if spool.fd.is_none() {
                break;
            }
            guard.clear_ready();
        }
    }
}
