//! io_uring backend (Linux only).
//!
//! Drives multishot `POLL_ADD` operations through the completion queue
//! so the session sees the same readiness contract as the mio backend:
//! the kernel posts a CQE when a descriptor becomes ready, and the
//! session performs the actual read/write syscalls.
//!
//! Interest changes re-arm the poll with a bumped generation counter in
//! the user_data; completions carrying a stale generation are dropped,
//! which covers the race between a cancel and an already-posted event.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};

use super::{Event, Interest};

/// user_data of the wait-timeout operation.
const TIMEOUT_TAG: u64 = u64::MAX;
/// user_data of operations whose completions carry no information
/// (poll cancellations).
const IGNORE_TAG: u64 = u64::MAX - 1;

pub struct UringBackend {
    ring: IoUring,
    /// Backing store for the in-flight timeout SQE.
    timeout_ts: types::Timespec,
    timeout_armed: bool,
    /// Generation per registered fd; stale CQEs are filtered against it.
    generations: HashMap<RawFd, u32>,
    next_generation: u32,
    /// Scratch batch so CQEs can be drained before SQEs are re-armed.
    cqe_batch: Vec<(u64, i32, u32)>,
}

impl UringBackend {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let entries = (event_capacity.max(8) as u32).next_power_of_two();
        Ok(Self {
            ring: IoUring::new(entries)?,
            timeout_ts: types::Timespec::new(),
            timeout_armed: false,
            generations: HashMap::new(),
            next_generation: 0,
            cqe_batch: Vec::with_capacity(event_capacity.max(8) * 2),
        })
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let generation = self.bump_generation();
        self.generations.insert(fd, generation);
        self.arm_poll(fd, generation, interest)
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let old = match self.generations.get(&fd) {
            Some(&generation) => generation,
            None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        };
        self.cancel_poll(fd, old)?;
        let generation = self.bump_generation();
        self.generations.insert(fd, generation);
        self.arm_poll(fd, generation, interest)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.generations.remove(&fd) {
            Some(generation) => self.cancel_poll(fd, generation),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn poll(
        &mut self,
        timeout: Duration,
        ready: &mut Vec<Event>,
        interests: &HashMap<RawFd, Interest>,
    ) -> io::Result<()> {
        if !self.timeout_armed {
            self.timeout_ts = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let entry = opcode::Timeout::new(&self.timeout_ts as *const types::Timespec)
                .build()
                .user_data(TIMEOUT_TAG);
            self.push(&entry)?;
            self.timeout_armed = true;
        }

        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        self.cqe_batch.clear();
        {
            let cq = self.ring.completion();
            for cqe in cq {
                self.cqe_batch
                    .push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        for i in 0..self.cqe_batch.len() {
            let (user_data, result, flags) = self.cqe_batch[i];
            match user_data {
                TIMEOUT_TAG => {
                    self.timeout_armed = false;
                    continue;
                }
                IGNORE_TAG => continue,
                _ => {}
            }

            let (fd, generation) = unpack(user_data);
            if self.generations.get(&fd) != Some(&generation) {
                continue; // stale: interest changed or fd removed
            }

            if result < 0 {
                if -result == libc::ECANCELED {
                    continue;
                }
                // Poll failed outright; surface it as a close condition.
                ready.push(Event {
                    fd,
                    readable: false,
                    writable: false,
                    closed: true,
                });
                continue;
            }

            let revents = result as u32;
            let hup =
                (libc::POLLHUP | libc::POLLERR | libc::POLLRDHUP | libc::POLLNVAL) as u32;
            ready.push(Event {
                fd,
                readable: revents & libc::POLLIN as u32 != 0,
                writable: revents & libc::POLLOUT as u32 != 0,
                closed: revents & hup != 0,
            });

            // A terminated multishot poll must be re-armed by hand.
            if !cqueue::more(flags) {
                if let Some(&interest) = interests.get(&fd) {
                    let _ = self.arm_poll(fd, generation, interest);
                }
            }
        }

        Ok(())
    }

    fn bump_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        generation
    }

    fn arm_poll(&mut self, fd: RawFd, generation: u32, interest: Interest) -> io::Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(fd), poll_mask(interest))
            .multi(true)
            .build()
            .user_data(pack(fd, generation));
        self.push(&entry)
    }

    fn cancel_poll(&mut self, fd: RawFd, generation: u32) -> io::Result<()> {
        let entry = opcode::PollRemove::new(pack(fd, generation))
            .build()
            .user_data(IGNORE_TAG);
        self.push(&entry)
    }

    fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }
        // Submission queue full: flush it and retry once.
        self.ring.submit()?;
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue overflow"))
    }
}

fn poll_mask(interest: Interest) -> u32 {
    let mut mask = (libc::POLLIN | libc::POLLRDHUP) as u32;
    if interest.writable {
        mask |= libc::POLLOUT as u32;
    }
    mask
}

fn pack(fd: RawFd, generation: u32) -> u64 {
    ((generation as u64) << 32) | (fd as u32 as u64)
}

fn unpack(user_data: u64) -> (RawFd, u32) {
    (user_data as u32 as RawFd, (user_data >> 32) as u32)
}
