//! The server runtime: buffer pool, reactor, sessions, fleet, acceptor.
//!
//! Layering, leaves first: `buffer` (pool + write queues), `reactor`
//! (readiness engine, two backends), `session` (connection handling and
//! protocol dispatch), `manager` (the session fleet and its worker
//! threads), `acceptor` (listener). `run` wires them together.

mod acceptor;
mod buffer;
pub mod manager;
mod reactor;
mod session;

pub use acceptor::Acceptor;
pub use manager::{ManagerHandle, SessionManager};
pub use reactor::{Event, Interest, Reactor, WriteError};
pub use session::{ClientConn, Session};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Config;

/// How long the acceptor blocks per iteration; the shutdown flag is
/// observed at this granularity.
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Run the server until `shutdown` is set.
///
/// Brings up the fleet and the acceptor, drives accepts on the calling
/// thread, and tears down in the original order: listener first so no
/// new connections arrive while the sessions drain.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let mut manager = SessionManager::initialize(config)?;
    let mut acceptor = Acceptor::bind(config, manager.handle())?;
    manager.start();

    info!(
        addr = %acceptor.local_addr()?,
        sessions = manager.handle().session_count(),
        "server started"
    );

    while !shutdown.load(Ordering::Relaxed) {
        acceptor.process_events(ACCEPT_TIMEOUT);
    }

    info!("shutting down");
    acceptor.stop();
    drop(acceptor);
    manager.stop();
    Ok(())
}
