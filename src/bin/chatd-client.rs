//! Minimal console client for the chat server.
//!
//! Lines typed at the prompt are sent as chat frames and the server's
//! echo is printed. Slash commands cover the rest of the protocol:
//! `/join <id>` to move to another session, `/leave` to disconnect,
//! `/echo <text>` for an explicit echo, `/help`, `/quit`.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::thread;

use clap::Parser;

use chatd::protocol::{self, MessageType, HEADER_LEN, MAX_PAYLOAD};

#[derive(Parser, Debug)]
#[command(name = "chatd-client")]
#[command(about = "Console client for chatd", long_about = None)]
struct CliArgs {
    /// Server host
    host: String,
    /// Server port
    port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))?;
    println!("connected to {}:{}", args.host, args.port);
    print_help();

    let reader = stream.try_clone()?;
    let printer = thread::spawn(move || print_server_frames(reader));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(rest) = input.strip_prefix("/join ") {
            match rest.trim().parse::<i32>() {
                Ok(session_id) => {
                    send_frame(&mut stream, MessageType::ClientJoin, &session_id.to_le_bytes())?
                }
                Err(_) => println!("usage: /join <session-id>"),
            }
        } else if input == "/leave" {
            send_frame(&mut stream, MessageType::ClientLeave, b"-")?;
        } else if let Some(text) = input.strip_prefix("/echo ") {
            send_chat(&mut stream, text)?;
        } else if input == "/help" {
            print_help();
        } else if input == "/quit" {
            break;
        } else if input.starts_with('/') {
            println!("unknown command, try /help");
        } else {
            send_chat(&mut stream, input)?;
        }
    }

    stream.shutdown(std::net::Shutdown::Both)?;
    let _ = printer.join();
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  /echo <text>   ask the server to echo text back");
    println!("  /join <id>     move to another session");
    println!("  /leave         disconnect from the server");
    println!("  /help          show this help");
    println!("  /quit          exit");
    println!("anything else is sent as a chat message");
}

fn send_chat(stream: &mut TcpStream, text: &str) -> io::Result<()> {
    if text.len() > MAX_PAYLOAD {
        println!("message too long ({} > {MAX_PAYLOAD} bytes)", text.len());
        return Ok(());
    }
    send_frame(stream, MessageType::ClientChat, text.as_bytes())
}

fn send_frame(stream: &mut TcpStream, kind: MessageType, payload: &[u8]) -> io::Result<()> {
    let mut frame = [0u8; protocol::MAX_FRAME];
    let len = protocol::encode(&mut frame, kind, payload)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload rejected"))?;
    stream.write_all(&frame[..len])
}

/// Read server frames until EOF and print them.
fn print_server_frames(mut stream: TcpStream) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            println!("disconnected");
            return;
        }

        let length = u16::from_le_bytes([header[1], header[2]]) as usize;
        if length > MAX_PAYLOAD {
            println!("malformed frame from server (length {length})");
            return;
        }

        let mut payload = vec![0u8; length];
        if stream.read_exact(&mut payload).is_err() {
            println!("disconnected mid-frame");
            return;
        }

        let text = String::from_utf8_lossy(&payload);
        match MessageType::from_u8(header[0]) {
            Some(MessageType::ServerEcho) => println!("echo: {text}"),
            Some(MessageType::ServerNotification) => println!("[server] {text}"),
            Some(MessageType::ServerAck) => println!("[ok] {text}"),
            Some(MessageType::ServerError) => println!("[error] {text}"),
            Some(MessageType::ServerChat) => println!("chat: {text}"),
            _ => println!("[type {:#04x}] {text}", header[0]),
        }
    }
}
