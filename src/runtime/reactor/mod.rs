//! Readiness engine for a single session.
//!
//! One `Reactor` owns the OS polling facility and the session's buffer
//! pool. Two backends satisfy the same contract: `poll` (mio, epoll on
//! Linux and kqueue on macOS) and `uring` (io_uring driving multishot
//! poll, Linux only). Sessions never see which backend is active.
//!
//! Readiness is edge-triggered on both backends: a read handler must
//! drain the socket until it would block, or it will miss data.

mod poll;
#[cfg(target_os = "linux")]
mod uring;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::RuntimeType;

use super::buffer::BufferPool;

/// What a registered descriptor is watched for.
///
/// Hangup and error conditions are always reported regardless of the
/// requested interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub writable: bool,
}

impl Interest {
    /// Readable plus peer-hangup only.
    pub const READ: Interest = Interest { writable: false };
    /// Readable plus writable.
    pub const READ_WRITE: Interest = Interest { writable: true };
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup, reset, or socket error. Callers close on this.
    pub closed: bool,
}

/// Why queueing an outbound buffer failed.
#[derive(Debug)]
pub enum WriteError {
    /// Payload larger than one pool buffer.
    TooLarge(usize),
    /// No free buffers; the caller backs off and retries later.
    PoolExhausted,
    /// The descriptor is not registered with this reactor.
    NotRegistered,
    /// The OS rejected the interest update.
    Io(io::Error),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::TooLarge(len) => write!(f, "frame of {len} bytes exceeds buffer size"),
            WriteError::PoolExhausted => write!(f, "buffer pool exhausted"),
            WriteError::NotRegistered => write!(f, "descriptor not registered"),
            WriteError::Io(e) => write!(f, "interest update failed: {e}"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        WriteError::Io(e)
    }
}

enum Backend {
    Poll(poll::PollBackend),
    #[cfg(target_os = "linux")]
    Uring(uring::UringBackend),
}

/// Per-session readiness engine plus buffer pool.
pub struct Reactor {
    backend: Backend,
    pool: BufferPool,
    interests: HashMap<RawFd, Interest>,
    ready: Vec<Event>,
}

impl Reactor {
    /// Create a reactor with the configured backend and a private pool
    /// of `buffer_count` buffers of `buffer_size` bytes.
    pub fn new(
        kind: RuntimeType,
        buffer_count: usize,
        buffer_size: usize,
        event_capacity: usize,
    ) -> io::Result<Self> {
        let backend = match kind {
            RuntimeType::Poll => Backend::Poll(poll::PollBackend::new(event_capacity)?),
            #[cfg(target_os = "linux")]
            RuntimeType::Uring => Backend::Uring(uring::UringBackend::new(event_capacity)?),
            #[cfg(not(target_os = "linux"))]
            RuntimeType::Uring => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "the uring backend requires Linux",
                ));
            }
        };

        Ok(Self {
            backend,
            pool: BufferPool::new(buffer_count, buffer_size),
            interests: HashMap::new(),
            ready: Vec::with_capacity(event_capacity),
        })
    }

    /// Start watching `fd`.
    pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match &mut self.backend {
            Backend::Poll(b) => b.register(fd, interest)?,
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.register(fd, interest)?,
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    /// Replace the interest mask for `fd`. Idempotent.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.interests.get(&fd) == Some(&interest) {
            return Ok(());
        }
        match &mut self.backend {
            Backend::Poll(b) => b.reregister(fd, interest)?,
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.reregister(fd, interest)?,
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    /// Stop watching `fd`. Tolerates descriptors that were never
    /// registered or were already removed.
    pub fn remove(&mut self, fd: RawFd) {
        if self.interests.remove(&fd).is_none() {
            return;
        }
        let _ = match &mut self.backend {
            Backend::Poll(b) => b.deregister(fd),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.deregister(fd),
        };
    }

    /// True if `fd` is currently registered.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&fd)
    }

    /// Register `fd` for reads and peer hangup.
    pub fn prepare_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.add(fd, Interest::READ)
    }

    /// Copy `bytes` into a pool buffer, queue it on `fd`'s write queue,
    /// and enable writable interest.
    pub fn prepare_write(&mut self, fd: RawFd, bytes: &[u8]) -> Result<(), WriteError> {
        if !self.is_registered(fd) {
            return Err(WriteError::NotRegistered);
        }
        if bytes.is_empty() || bytes.len() > self.pool.buffer_size() {
            return Err(WriteError::TooLarge(bytes.len()));
        }

        let idx = self.pool.alloc().ok_or(WriteError::PoolExhausted)?;
        self.pool.get_mut(idx)[..bytes.len()].copy_from_slice(bytes);

        if let Err(e) = self.modify(fd, Interest::READ_WRITE) {
            self.pool.free(idx);
            return Err(e.into());
        }
        self.pool.enqueue(fd, idx, bytes.len());
        Ok(())
    }

    /// Tear down per-fd state: release every queued buffer and drop the
    /// registration. The descriptor itself closes when its owning
    /// connection handle is dropped.
    pub fn prepare_close(&mut self, fd: RawFd) {
        self.pool.clear(fd);
        self.remove(fd);
    }

    /// Block up to `timeout` for readiness. Returns the number of
    /// events collected; 0 on timeout or interrupt.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.ready.clear();
        match &mut self.backend {
            Backend::Poll(b) => b.poll(timeout, &mut self.ready)?,
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.poll(timeout, &mut self.ready, &self.interests)?,
        }
        Ok(self.ready.len())
    }

    /// Take the events collected by the last `wait`.
    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.ready)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }
}
