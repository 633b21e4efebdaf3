//! A session: one set of client connections driven by one reactor on
//! one worker thread.
//!
//! The session owns the protocol dispatch. Reads accumulate into a
//! per-connection pool buffer until a whole frame is present (a frame
//! never exceeds one buffer), complete frames are dispatched in arrival
//! order, and responses go out through the reactor's write queues.
//! Handlers catch and log every per-connection failure so one
//! misbehaving client cannot take the session down.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, MessageType, ParseResult};

use super::manager::{Command, ManagerHandle};
use super::reactor::{Interest, Reactor};

/// Fairness bound: how many read passes one descriptor gets per event.
const MAX_READ_PASSES: usize = 100;

/// The single owning handle for one client connection.
///
/// The raw fd is the connection's identity in the session map and the
/// reactor; the stream closes exactly once, when this handle drops.
pub struct ClientConn {
    stream: TcpStream,
    /// Pool slot accumulating a partial frame, if any.
    rx_buf: Option<usize>,
    /// Valid bytes in the accumulation buffer.
    rx_len: usize,
}

impl ClientConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rx_buf: None,
            rx_len: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
    Fatal(io::Error),
}

pub struct Session {
    id: i32,
    clients: HashMap<RawFd, ClientConn>,
    reactor: Reactor,
    inbox: Receiver<Command>,
    manager: ManagerHandle,
}

impl Session {
    pub(crate) fn new(
        id: i32,
        reactor: Reactor,
        inbox: Receiver<Command>,
        manager: ManagerHandle,
    ) -> Self {
        Self {
            id,
            clients: HashMap::new(),
            reactor,
            inbox,
            manager,
        }
    }

    pub fn session_id(&self) -> i32 {
        self.id
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Apply queued manager commands. Called at the top of every worker
    /// iteration; this is the only way state enters the session from
    /// another thread.
    pub fn drain_inbox(&mut self) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Add { conn, notify } => {
                    let fd = conn.fd();
                    if self.add_client(conn) {
                        if notify {
                            let text = format!("Joined session {}", self.id);
                            self.send_message(
                                fd,
                                MessageType::ServerNotification,
                                text.as_bytes(),
                            );
                        }
                    } else {
                        // Registration failed and the connection is
                        // gone; the mapping must not outlive it.
                        self.manager.forget(fd);
                    }
                }
                Command::Remove(fd) => {
                    // Manager-initiated removal drops (and closes) the
                    // connection.
                    if self.remove_client(fd).is_some() {
                        debug!(session = self.id, fd, "client removed by manager");
                    }
                }
            }
        }
    }

    /// Insert a connection and register it for reads.
    ///
    /// Returns false (dropping, and thereby closing, the connection) if
    /// the descriptor cannot be registered.
    pub fn add_client(&mut self, conn: ClientConn) -> bool {
        let fd = conn.fd();
        if fd < 0 {
            warn!(session = self.id, "refusing connection with invalid fd");
            return false;
        }
        if let Err(e) = self.reactor.prepare_read(fd) {
            error!(session = self.id, fd, error = %e, "failed to register client");
            return false;
        }
        self.clients.insert(fd, conn);
        info!(
            session = self.id,
            fd,
            clients = self.clients.len(),
            "client added"
        );
        true
    }

    /// Detach a connection without closing it: unregister from the
    /// reactor and release any buffers it holds. Queued unflushed
    /// writes are dropped with the buffers; they belong to this
    /// session's pool and cannot follow the connection.
    pub fn remove_client(&mut self, fd: RawFd) -> Option<ClientConn> {
        let mut conn = self.clients.remove(&fd)?;
        if let Some(idx) = conn.rx_buf.take() {
            self.reactor.pool_mut().free(idx);
            conn.rx_len = 0;
        }
        self.reactor.prepare_close(fd);
        info!(
            session = self.id,
            fd,
            clients = self.clients.len(),
            "client removed"
        );
        Some(conn)
    }

    /// One tick of the event loop. Returns true if any event was
    /// handled.
    pub fn process_events(&mut self, timeout: Duration) -> bool {
        if self.clients.is_empty() {
            return false;
        }

        match self.reactor.wait(timeout) {
            Ok(0) => return false,
            Ok(_) => {}
            Err(e) => {
                error!(session = self.id, error = %e, "reactor wait failed");
                return false;
            }
        }

        // The reactor coalesces readiness per descriptor, so each fd
        // appears at most once per tick.
        for event in self.reactor.drain() {
            let fd = event.fd;
            if !self.clients.contains_key(&fd) {
                self.reactor.remove(fd);
                continue;
            }
            if event.closed {
                debug!(session = self.id, fd, "peer hangup");
                self.handle_close(fd);
                continue;
            }
            if event.writable {
                self.handle_write(fd);
            }
            if event.readable {
                self.handle_read(fd);
            }
        }
        true
    }

    /// Frame a payload and queue it for delivery on `fd`.
    pub fn send_message(&mut self, fd: RawFd, kind: MessageType, payload: &[u8]) {
        let mut frame = [0u8; protocol::MAX_FRAME];
        let Some(len) = protocol::encode(&mut frame, kind, payload) else {
            error!(
                session = self.id,
                fd,
                payload_len = payload.len(),
                "payload rejected by encoder"
            );
            return;
        };
        if let Err(e) = self.reactor.prepare_write(fd, &frame[..len]) {
            warn!(session = self.id, fd, error = %e, "failed to queue message");
        }
    }

    /// Queue a `SERVER_CHAT` copy of `payload` to every client in the
    /// session except the sender. Not reachable from dispatch; kept as
    /// an extension point.
    pub fn broadcast(&mut self, from_fd: RawFd, payload: &[u8]) {
        let peers: Vec<RawFd> = self
            .clients
            .keys()
            .copied()
            .filter(|&fd| fd != from_fd)
            .collect();
        for fd in &peers {
            self.send_message(*fd, MessageType::ServerChat, payload);
        }
        debug!(
            session = self.id,
            from_fd,
            peers = peers.len(),
            "broadcast queued"
        );
    }

    fn handle_read(&mut self, fd: RawFd) {
        let buffer_size = self.reactor.pool().buffer_size();

        for _ in 0..MAX_READ_PASSES {
            let Some(conn) = self.clients.get_mut(&fd) else {
                return;
            };

            let idx = match conn.rx_buf {
                Some(idx) => idx,
                None => match self.reactor.pool_mut().alloc() {
                    Some(idx) => {
                        conn.rx_buf = Some(idx);
                        conn.rx_len = 0;
                        idx
                    }
                    None => {
                        // Back-pressure: leave the bytes in the socket
                        // and let TCP throttle the peer. Never close.
                        warn!(session = self.id, fd, "buffer pool exhausted, deferring read");
                        return;
                    }
                },
            };

            let rx_len = conn.rx_len;
            let room = buffer_size - rx_len;
            let outcome = {
                let buf = &mut self.reactor.pool_mut().get_mut(idx)[rx_len..buffer_size];
                match conn.stream.read(buf) {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => ReadOutcome::Data(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => ReadOutcome::Fatal(e),
                }
            };

            match outcome {
                ReadOutcome::Data(n) => {
                    conn.rx_len += n;
                    if !self.process_frames(fd) {
                        return; // connection closed or moved away
                    }
                    if n < room {
                        return; // socket drained
                    }
                }
                ReadOutcome::WouldBlock => {
                    if rx_len == 0 {
                        conn.rx_buf = None;
                        self.reactor.pool_mut().free(idx);
                    }
                    return;
                }
                ReadOutcome::Eof => {
                    debug!(session = self.id, fd, "connection closed by peer");
                    self.handle_close(fd);
                    return;
                }
                ReadOutcome::Fatal(e) => {
                    error!(session = self.id, fd, error = %e, "read failed");
                    self.handle_close(fd);
                    return;
                }
            }
        }
        warn!(session = self.id, fd, "read pass limit reached, yielding");
    }

    /// Dispatch every complete frame buffered for `fd`. Returns false
    /// when the connection left the session (closed or moved).
    fn process_frames(&mut self, fd: RawFd) -> bool {
        enum Parsed {
            Frame(MessageType, Vec<u8>, usize),
            Incomplete,
            Invalid,
        }

        loop {
            let (idx, len) = {
                let Some(conn) = self.clients.get(&fd) else {
                    return false;
                };
                match conn.rx_buf {
                    Some(idx) => (idx, conn.rx_len),
                    None => return true,
                }
            };

            // Copied out so dispatch below can borrow the session freely.
            let parsed = {
                let buf = &self.reactor.pool().get(idx)[..len];
                match protocol::parse(buf) {
                    ParseResult::Complete(frame) => {
                        Parsed::Frame(frame.kind, frame.payload.to_vec(), frame.wire_len())
                    }
                    ParseResult::Incomplete => Parsed::Incomplete,
                    ParseResult::Invalid(err) => {
                        warn!(session = self.id, fd, error = %err, "protocol violation");
                        Parsed::Invalid
                    }
                }
            };

            match parsed {
                Parsed::Incomplete => return true,
                Parsed::Invalid => {
                    self.handle_close(fd);
                    return false;
                }
                Parsed::Frame(kind, payload, consumed) => {
                    // Consume before dispatch so a JOIN that moves the
                    // connection does not strand the frame's bytes.
                    {
                        let Some(conn) = self.clients.get_mut(&fd) else {
                            return false;
                        };
                        let remaining = conn.rx_len - consumed;
                        if remaining > 0 {
                            let rx_len = conn.rx_len;
                            self.reactor
                                .pool_mut()
                                .get_mut(idx)
                                .copy_within(consumed..rx_len, 0);
                        } else {
                            conn.rx_buf = None;
                            self.reactor.pool_mut().free(idx);
                        }
                        conn.rx_len = remaining;
                    }
                    if !self.process_message(fd, kind, &payload) {
                        return false;
                    }
                }
            }
        }
    }

    /// Protocol dispatch. Returns false when `fd` is no longer a member
    /// of this session afterwards.
    fn process_message(&mut self, fd: RawFd, kind: MessageType, payload: &[u8]) -> bool {
        match kind {
            MessageType::ClientChat => {
                self.send_message(fd, MessageType::ServerEcho, payload);
                true
            }
            MessageType::ClientJoin => self.handle_join(fd, payload),
            MessageType::ClientLeave => {
                info!(session = self.id, fd, "client leaving");
                self.handle_close(fd);
                false
            }
            MessageType::ClientCommand => {
                debug!(session = self.id, fd, "ignoring CLIENT_COMMAND");
                true
            }
            other => {
                // Server-typed frames are rejected by the parser; this
                // arm only keeps the match exhaustive.
                warn!(session = self.id, fd, kind = ?other, "unhandled message type");
                true
            }
        }
    }

    fn handle_join(&mut self, fd: RawFd, payload: &[u8]) -> bool {
        // Payloads shorter than four bytes target the current session.
        let target = if payload.len() >= 4 {
            i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
        } else {
            self.id
        };

        if target == self.id {
            let text = format!("Already in session {}", self.id);
            self.send_message(fd, MessageType::ServerAck, text.as_bytes());
            return true;
        }

        if !self.manager.has_session(target) {
            warn!(session = self.id, fd, target, "join target does not exist");
            let text = format!("No such session {target}");
            self.send_message(fd, MessageType::ServerError, text.as_bytes());
            return true;
        }

        let Some(conn) = self.remove_client(fd) else {
            return false;
        };
        match self.manager.move_client(conn, target) {
            Ok(()) => {
                info!(session = self.id, fd, target, "client moved");
                false
            }
            Err(conn) => {
                // The fleet is shutting down; put the client back so the
                // error reaches it before the worker exits.
                if self.add_client(conn) {
                    let text = format!("Failed to join session {target}");
                    self.send_message(fd, MessageType::ServerError, text.as_bytes());
                    true
                } else {
                    false
                }
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        loop {
            let Some(pending) = self.reactor.pool().front(fd) else {
                break;
            };
            let Some(conn) = self.clients.get_mut(&fd) else {
                return;
            };

            let result = {
                let buf = &self.reactor.pool().get(pending.idx)[pending.written..pending.len];
                conn.stream.write(buf)
            };

            match result {
                Ok(0) => {
                    error!(session = self.id, fd, "write returned zero");
                    self.handle_close(fd);
                    return;
                }
                Ok(n) => {
                    if self.reactor.pool_mut().advance_front(fd, n) == 0 {
                        self.reactor.pool_mut().pop_and_release(fd);
                    } else {
                        break; // partial write, stay write-interested
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(session = self.id, fd, error = %e, "write failed");
                    self.handle_close(fd);
                    return;
                }
            }
        }

        let interest = if self.reactor.pool().has_pending(fd) {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };
        if let Err(e) = self.reactor.modify(fd, interest) {
            error!(session = self.id, fd, error = %e, "failed to update interest");
        }
    }

    /// Tear down one connection: unregister, release buffers, drop the
    /// manager mapping, close the descriptor. Idempotent; never
    /// propagates errors.
    fn handle_close(&mut self, fd: RawFd) {
        let Some(mut conn) = self.clients.remove(&fd) else {
            return;
        };
        if let Some(idx) = conn.rx_buf.take() {
            self.reactor.pool_mut().free(idx);
        }
        self.reactor.prepare_close(fd);
        self.manager.forget(fd);
        info!(
            session = self.id,
            fd,
            clients = self.clients.len(),
            "connection closed"
        );
        // conn drops here, closing the descriptor exactly once
    }
}
