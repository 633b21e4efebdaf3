//! End-to-end tests over real sockets.
//!
//! Each test starts a full server (fleet + acceptor) on a free port in
//! a background thread and speaks the wire protocol through
//! `std::net::TcpStream`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chatd::config::{Config, RuntimeType};
use chatd::runtime;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for the server to be ready by polling the port.
fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(threads: usize) -> Self {
        let port = get_available_port();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port,
            threads,
            log_level: "warn".to_string(),
            runtime: RuntimeType::Poll,
            buffer_size: 1024,
            buffer_count: 256,
            event_capacity: 512,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = runtime::run(&config, flag) {
                panic!("server failed: {e}");
            }
        });

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        assert!(
            wait_for_server(addr, Duration::from_secs(5)),
            "server did not come up on {addr}"
        );

        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![kind];
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// True once the peer has closed the connection (EOF), draining any
/// residual bytes along the way.
fn reaches_eof(stream: &mut TcpStream) -> bool {
    let mut scratch = [0u8; 256];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

#[test]
fn single_echo_round_trip() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    // 13 05 00 "Hello"
    client.write_all(&frame(0x13, b"Hello")).unwrap();

    // 05 05 00 "Hello"
    let reply = read_exact(&mut client, 8);
    assert_eq!(reply, frame(0x05, b"Hello"));
}

#[test]
fn back_to_back_frames_in_one_write() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    // 13 02 00 A B 13 02 00 C D
    let mut bytes = frame(0x13, b"AB");
    bytes.extend_from_slice(&frame(0x13, b"CD"));
    client.write_all(&bytes).unwrap();

    // 05 02 00 A B 05 02 00 C D, in order
    let reply = read_exact(&mut client, 10);
    let mut expected = frame(0x05, b"AB");
    expected.extend_from_slice(&frame(0x05, b"CD"));
    assert_eq!(reply, expected);
}

#[test]
fn frame_split_across_writes_is_reassembled() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    let bytes = frame(0x13, b"patience");
    client.write_all(&bytes[..2]).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(200));
    client.write_all(&bytes[2..]).unwrap();

    let reply = read_exact(&mut client, 3 + 8);
    assert_eq!(reply, frame(0x05, b"patience"));
}

#[test]
fn maximum_payload_echoes() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    let payload: Vec<u8> = (0..1021u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&frame(0x13, &payload)).unwrap();

    let reply = read_exact(&mut client, 1024);
    assert_eq!(reply, frame(0x05, &payload));
}

#[test]
fn oversize_length_closes_before_any_echo() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    // 13 FE 03 -> length 1022
    client.write_all(&[0x13, 0xFE, 0x03]).unwrap();
    assert!(reaches_eof(&mut client), "connection not closed");
}

#[test]
fn empty_payload_closes_without_echo() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    client.write_all(&[0x13, 0x00, 0x00]).unwrap();

    // EOF with zero payload bytes delivered.
    let mut scratch = [0u8; 64];
    let n = client.read(&mut scratch).unwrap();
    assert_eq!(n, 0, "server echoed data for an empty frame");
}

#[test]
fn unknown_type_closes_connection() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    client.write_all(&frame(0x42, b"junk")).unwrap();
    assert!(reaches_eof(&mut client), "connection not closed");
}

#[test]
fn join_same_session_acks() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    // 11 04 00 00 00 00 00 -> join session 0 while on session 0
    client.write_all(&frame(0x11, &0i32.to_le_bytes())).unwrap();

    let expected = b"Already in session 0";
    let reply = read_exact(&mut client, 3 + expected.len());
    assert_eq!(reply, frame(0x01, expected));
}

#[test]
fn join_moves_between_sessions() {
    let server = TestServer::start(2);
    let mut client = server.connect();

    // The first accepted client lands on session 0; move it to 1.
    client.write_all(&frame(0x11, &1i32.to_le_bytes())).unwrap();

    let notified = b"Joined session 1";
    let reply = read_exact(&mut client, 3 + notified.len());
    assert_eq!(reply, frame(0x04, notified));

    // Echo still works from the new session.
    client.write_all(&frame(0x13, b"still here")).unwrap();
    let reply = read_exact(&mut client, 3 + 10);
    assert_eq!(reply, frame(0x05, b"still here"));

    // And the new session considers it a member.
    client.write_all(&frame(0x11, &1i32.to_le_bytes())).unwrap();
    let acked = b"Already in session 1";
    let reply = read_exact(&mut client, 3 + acked.len());
    assert_eq!(reply, frame(0x01, acked));
}

#[test]
fn join_unknown_session_errors_but_keeps_connection() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    client.write_all(&frame(0x11, &42i32.to_le_bytes())).unwrap();

    let expected = b"No such session 42";
    let reply = read_exact(&mut client, 3 + expected.len());
    assert_eq!(reply, frame(0x02, expected));

    client.write_all(&frame(0x13, b"alive")).unwrap();
    let reply = read_exact(&mut client, 3 + 5);
    assert_eq!(reply, frame(0x05, b"alive"));
}

#[test]
fn leave_disconnects() {
    let server = TestServer::start(1);
    let mut client = server.connect();

    client.write_all(&frame(0x12, b"-")).unwrap();
    assert!(reaches_eof(&mut client), "connection not closed after LEAVE");
}

#[test]
fn round_robin_spreads_clients() {
    let server = TestServer::start(3);

    // Six clients accepted in order land on sessions 0,1,2,0,1,2. Each
    // asks to "join" its expected session and must get the same-session
    // ack rather than a move notification.
    let mut clients: Vec<TcpStream> = (0..6).map(|_| server.connect()).collect();

    for (i, client) in clients.iter_mut().enumerate() {
        let expected_session = (i % 3) as i32;
        client
            .write_all(&frame(0x11, &expected_session.to_le_bytes()))
            .unwrap();

        let expected = format!("Already in session {expected_session}");
        let reply = read_exact(client, 3 + expected.len());
        assert_eq!(
            reply,
            frame(0x01, expected.as_bytes()),
            "client {i} was not on session {expected_session}"
        );
    }
}

#[test]
fn many_clients_echo_concurrently() {
    let server = TestServer::start(2);

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let mut client = server.connect();
            thread::spawn(move || {
                for round in 0..20 {
                    let text = format!("client {i} round {round}");
                    let sent = frame(0x13, text.as_bytes());
                    client.write_all(&sent).unwrap();
                    let reply = read_exact(&mut client, sent.len());
                    assert_eq!(reply, frame(0x05, text.as_bytes()));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn shutdown_is_prompt() {
    let server = TestServer::start(4);
    let _client = server.connect();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    drop(server); // sets the flag and joins acceptor + workers
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "shutdown took {:?}",
        started.elapsed()
    );
}
