//! Accepts inbound connections and hands them to the session fleet.
//!
//! The acceptor owns the listening socket and a small reactor of its
//! own. Each readiness notification drains the accept queue completely;
//! accepted sockets are switched to non-blocking mode and assigned
//! round-robin through the manager handle.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::Config;

use super::manager::ManagerHandle;
use super::reactor::Reactor;
use super::session::ClientConn;

/// The acceptor never queues writes; its pool exists only because the
/// reactor carries one.
const ACCEPTOR_POOL_BUFFERS: usize = 4;
const LISTEN_BACKLOG: i32 = 1024;

pub struct Acceptor {
    listener: TcpListener,
    reactor: Reactor,
    manager: ManagerHandle,
}

impl Acceptor {
    /// Bind the listening socket and register it for accept readiness.
    pub fn bind(config: &Config, manager: ManagerHandle) -> io::Result<Self> {
        let addr = resolve(&config.host, config.port)?;
        let listener = create_listener(addr)?;

        let mut reactor = Reactor::new(
            config.runtime,
            ACCEPTOR_POOL_BUFFERS,
            config.buffer_size,
            16,
        )?;
        reactor.prepare_read(listener.as_raw_fd())?;

        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            reactor,
            manager,
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// One tick: wait for accept readiness and drain the accept queue.
    pub fn process_events(&mut self, timeout: Duration) {
        match self.reactor.wait(timeout) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "acceptor wait failed");
                return;
            }
        }

        let listener_fd = self.listener.as_raw_fd();
        for event in self.reactor.drain() {
            if event.fd == listener_fd {
                self.accept_ready();
            }
        }
    }

    /// Stop watching the listener. Dropping the acceptor closes it.
    pub fn stop(&mut self) {
        self.reactor.remove(self.listener.as_raw_fd());
        info!("listener stopped");
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(peer = %peer, error = %e, "failed to set non-blocking, dropping");
                        continue;
                    }
                    let fd: RawFd = stream.as_raw_fd();
                    match self.manager.assign(ClientConn::new(stream)) {
                        Some(session) => debug!(peer = %peer, fd, session, "accepted"),
                        None => warn!(peer = %peer, "no session available, dropping"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient accept failures must not kill the
                    // listener.
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot resolve {host}:{port}"),
            )
        })
}

/// Non-blocking listener with `SO_REUSEADDR` so restarts do not trip
/// over sockets in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeType};
    use crate::runtime::manager::SessionManager;
    use std::net::TcpStream;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            threads: 1,
            log_level: "warn".to_string(),
            runtime: RuntimeType::Poll,
            buffer_size: 1024,
            buffer_count: 16,
            event_capacity: 64,
        }
    }

    #[test]
    fn accepted_connections_reach_the_fleet() {
        let config = test_config();
        let manager = SessionManager::initialize(&config).unwrap();
        let handle = manager.handle();
        let mut acceptor = Acceptor::bind(&config, handle.clone()).unwrap();

        let addr = acceptor.local_addr().unwrap();
        let _client_a = TcpStream::connect(addr).unwrap();
        let _client_b = TcpStream::connect(addr).unwrap();

        for _ in 0..50 {
            acceptor.process_events(Duration::from_millis(10));
            if handle.client_count() == 2 {
                break;
            }
        }
        assert_eq!(handle.client_count(), 2);
    }

    #[test]
    fn bind_failure_is_fatal() {
        let mut config = test_config();
        // Port already taken by another listener.
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        config.port = occupied.local_addr().unwrap().port();

        let manager = SessionManager::initialize(&config).unwrap();
        // SO_REUSEADDR does not permit two live listeners on one port.
        assert!(Acceptor::bind(&config, manager.handle()).is_err());
    }
}
