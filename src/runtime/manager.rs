//! The session fleet.
//!
//! A fixed set of sessions is created at initialization, one worker
//! thread per session. Accepted connections are assigned round-robin;
//! everything that has to cross a thread boundary travels through a
//! session's inbox, so a session's reactor is only ever touched by its
//! own worker. The manager's own state is one fd-to-session map behind
//! a mutex plus an atomic round-robin counter.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error, info};

use crate::config::Config;

use super::reactor::Reactor;
use super::session::{ClientConn, Session};

/// How long a worker blocks in the reactor per iteration. Shutdown is
/// observed within one timeout of the flag flip.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);
/// Sleep applied when a session has no clients, to avoid busy-spinning.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Work delivered to a session through its inbox.
pub enum Command {
    /// Take ownership of a connection. `notify` is set for cross-session
    /// moves so the target session can greet the client.
    Add { conn: ClientConn, notify: bool },
    /// Drop the named connection (closing it).
    Remove(RawFd),
}

struct Shared {
    inboxes: Vec<Sender<Command>>,
    client_sessions: Mutex<HashMap<RawFd, i32>>,
    next_index: AtomicUsize,
    running: AtomicBool,
    terminate: AtomicBool,
}

/// Cloneable handle to the fleet, held by the acceptor and by every
/// session. Replaces the original design's process-wide singleton.
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<Shared>,
}

impl ManagerHandle {
    pub fn session_count(&self) -> usize {
        self.shared.inboxes.len()
    }

    /// True if `id` names a session in the fleet.
    pub fn has_session(&self, id: i32) -> bool {
        id >= 0 && (id as usize) < self.shared.inboxes.len()
    }

    /// Number of clients currently mapped to a session.
    pub fn client_count(&self) -> usize {
        self.shared.client_sessions.lock().unwrap().len()
    }

    /// Which session `fd` is mapped to, if any.
    pub fn session_of(&self, fd: RawFd) -> Option<i32> {
        self.shared.client_sessions.lock().unwrap().get(&fd).copied()
    }

    /// Round-robin a new connection onto a session. Returns the chosen
    /// session id, or `None` if the fleet cannot take it.
    pub fn assign(&self, conn: ClientConn) -> Option<i32> {
        if self.shared.inboxes.is_empty() {
            return None;
        }

        let index = self.shared.next_index.fetch_add(1, Ordering::Relaxed)
            % self.shared.inboxes.len();
        let id = index as i32;
        let fd = conn.fd();

        let mut map = self.shared.client_sessions.lock().unwrap();
        map.insert(fd, id);
        if self.shared.inboxes[index]
            .send(Command::Add {
                conn,
                notify: false,
            })
            .is_err()
        {
            map.remove(&fd);
            return None;
        }
        drop(map);

        info!(fd, session = id, "client assigned");
        Some(id)
    }

    /// Detach `fd` from whichever session owns it and close it.
    pub fn remove(&self, fd: RawFd) {
        let mut map = self.shared.client_sessions.lock().unwrap();
        if let Some(id) = map.remove(&fd) {
            let _ = self.shared.inboxes[id as usize].send(Command::Remove(fd));
            debug!(fd, session = id, "client removal requested");
        }
    }

    /// Drop the mapping for `fd` without contacting any session. Used
    /// by a session's own close path, which already owns the
    /// connection.
    pub fn forget(&self, fd: RawFd) {
        self.shared.client_sessions.lock().unwrap().remove(&fd);
    }

    /// Hand a connection to `target`'s inbox. On failure the caller
    /// gets the connection back.
    pub fn move_client(&self, conn: ClientConn, target: i32) -> Result<(), ClientConn> {
        if !self.has_session(target) {
            return Err(conn);
        }
        let fd = conn.fd();

        let mut map = self.shared.client_sessions.lock().unwrap();
        map.insert(fd, target);
        match self.shared.inboxes[target as usize].send(Command::Add { conn, notify: true }) {
            Ok(()) => Ok(()),
            Err(send_error) => {
                map.remove(&fd);
                match send_error.into_inner() {
                    Command::Add { conn, .. } => Err(conn),
                    // Only Add commands are sent above.
                    Command::Remove(_) => unreachable!(),
                }
            }
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shared.terminate.load(Ordering::Relaxed) || !self.shared.running.load(Ordering::Relaxed)
    }
}

/// Owns the sessions and their worker threads.
pub struct SessionManager {
    shared: Arc<Shared>,
    sessions: Vec<Option<Session>>,
    workers: Vec<JoinHandle<()>>,
}

impl SessionManager {
    /// Build the fleet: `config.threads` sessions (0 = one per hardware
    /// thread, minimum 1), each with its own reactor and pool.
    pub fn initialize(config: &Config) -> io::Result<Self> {
        let count = if config.threads == 0 {
            num_cpus()
        } else {
            config.threads
        };

        let mut inboxes = Vec::with_capacity(count);
        let mut receivers = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = unbounded();
            inboxes.push(tx);
            receivers.push(rx);
        }

        let shared = Arc::new(Shared {
            inboxes,
            client_sessions: Mutex::new(HashMap::new()),
            next_index: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        });

        let handle = ManagerHandle {
            shared: Arc::clone(&shared),
        };
        let mut sessions = Vec::with_capacity(count);
        for (id, inbox) in receivers.into_iter().enumerate() {
            let reactor = Reactor::new(
                config.runtime,
                config.buffer_count,
                config.buffer_size,
                config.event_capacity,
            )?;
            sessions.push(Some(Session::new(
                id as i32,
                reactor,
                inbox,
                handle.clone(),
            )));
        }

        info!(sessions = count, "session manager initialized");
        Ok(Self {
            shared,
            sessions,
            workers: Vec::new(),
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn one worker thread per session.
    pub fn start(&mut self) {
        self.shared.running.store(true, Ordering::Relaxed);
        self.shared.terminate.store(false, Ordering::Relaxed);

        for slot in self.sessions.iter_mut() {
            let Some(mut session) = slot.take() else {
                continue;
            };
            let id = session.session_id();
            let shared = Arc::clone(&self.shared);

            let worker = thread::Builder::new()
                .name(format!("session-{id}"))
                .spawn(move || {
                    debug!(session = id, "worker started");
                    while shared.running.load(Ordering::Relaxed)
                        && !shared.terminate.load(Ordering::Relaxed)
                    {
                        session.drain_inbox();
                        if session.client_count() == 0 {
                            thread::sleep(IDLE_SLEEP);
                            continue;
                        }
                        session.process_events(WAIT_TIMEOUT);
                    }
                    info!(
                        session = id,
                        clients = session.client_count(),
                        "worker stopped"
                    );
                })
                .expect("failed to spawn session worker");
            self.workers.push(worker);
        }

        info!(workers = self.workers.len(), "session manager started");
    }

    /// Signal every worker to exit, join them, and clear the mapping
    /// table. Workers observe the flag within one wait timeout.
    pub fn stop(&mut self) {
        self.shared.terminate.store(true, Ordering::Relaxed);
        self.shared.running.store(false, Ordering::Relaxed);

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("session worker panicked");
            }
        }
        self.shared.client_sessions.lock().unwrap().clear();
        info!("session manager stopped");
    }

    /// Direct access to a not-yet-started session, for driving its
    /// event loop without worker threads.
    #[cfg(test)]
    pub(crate) fn session_mut(&mut self, index: usize) -> &mut Session {
        self.sessions[index]
            .as_mut()
            .expect("session already moved to a worker")
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeType};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn test_config(threads: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            threads,
            log_level: "warn".to_string(),
            runtime: RuntimeType::Poll,
            buffer_size: 1024,
            buffer_count: 16,
            event_capacity: 64,
        }
    }

    /// Server-side ends of freshly connected sockets. The client ends
    /// are returned too so the fds stay open for the test's duration.
    fn server_conns(n: usize) -> (Vec<TcpStream>, Vec<ClientConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..n {
            clients.push(TcpStream::connect(addr).unwrap());
            let (server, _) = listener.accept().unwrap();
            server.set_nonblocking(true).unwrap();
            conns.push(ClientConn::new(server));
        }
        (clients, conns)
    }

    #[test]
    fn round_robin_is_fair() {
        let manager = SessionManager::initialize(&test_config(3)).unwrap();
        let handle = manager.handle();

        let (_clients, conns) = server_conns(6);
        let fds: Vec<_> = conns.iter().map(|c| c.fd()).collect();

        let assigned: Vec<i32> = conns
            .into_iter()
            .map(|conn| handle.assign(conn).unwrap())
            .collect();
        assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2]);

        for (fd, id) in fds.iter().zip(&assigned) {
            assert_eq!(handle.session_of(*fd), Some(*id));
        }
        assert_eq!(handle.client_count(), 6);
    }

    #[test]
    fn default_thread_count_is_at_least_one() {
        let manager = SessionManager::initialize(&test_config(0)).unwrap();
        assert!(manager.handle().session_count() >= 1);
    }

    #[test]
    fn has_session_bounds() {
        let manager = SessionManager::initialize(&test_config(2)).unwrap();
        let handle = manager.handle();
        assert!(handle.has_session(0));
        assert!(handle.has_session(1));
        assert!(!handle.has_session(2));
        assert!(!handle.has_session(-1));
    }

    #[test]
    fn remove_drops_mapping_and_closes() {
        let mut manager = SessionManager::initialize(&test_config(1)).unwrap();
        let handle = manager.handle();

        let (mut clients, mut conns) = server_conns(1);
        let conn = conns.pop().unwrap();
        let fd = conn.fd();
        handle.assign(conn).unwrap();
        assert_eq!(handle.session_of(fd), Some(0));

        handle.remove(fd);
        assert_eq!(handle.session_of(fd), None);

        // The owning session drains the Remove command and closes the
        // connection; its peer observes EOF.
        manager.session_mut(0).drain_inbox();
        use std::io::Read;
        let client = clients.pop().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut byte = [0u8; 1];
        assert_eq!((&client).read(&mut byte).unwrap(), 0);
    }

    #[test]
    fn workers_stop_within_grace_period() {
        let mut manager = SessionManager::initialize(&test_config(2)).unwrap();
        manager.start();

        // Give a worker a client so it sits in the reactor wait path.
        let (_clients, mut conns) = server_conns(1);
        manager.handle().assign(conns.pop().unwrap()).unwrap();
        thread::sleep(Duration::from_millis(150));

        let started = Instant::now();
        manager.stop();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "workers took {:?} to stop",
            started.elapsed()
        );
        assert_eq!(manager.handle().client_count(), 0);
    }

    #[test]
    fn move_client_rejects_bad_target() {
        let manager = SessionManager::initialize(&test_config(1)).unwrap();
        let handle = manager.handle();

        let (_clients, mut conns) = server_conns(1);
        let conn = conns.pop().unwrap();
        let fd = conn.fd();

        let conn = handle.move_client(conn, 7).unwrap_err();
        assert_eq!(conn.fd(), fd);
        assert_eq!(handle.session_of(fd), None);
    }
}
