//! Standalone SSE server for status streaming
//!
//! Runs on its own port so long-lived `EventSource` connections never tie up
//! the axum workers. Browsers connect cross-origin, hence the CORS header.

use log::{debug, error, info, warn};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

const MAX_SSE_CLIENTS: usize = 3;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Message types for the SSE server
pub enum SseMessage {
    /// Status JSON to broadcast
    Status(String),
}

pub type SseSender = Sender<SseMessage>;

/// Bind the SSE port and start serving; returns the sender for status updates
pub fn start_sse_server(host: &str, port: u16) -> std::io::Result<(SseSender, SocketAddr)> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel::<SseMessage>();

    std::thread::Builder::new()
        .name("sse".to_string())
        .spawn(move || run_sse_server(&listener, &rx))?;

    info!("SSE server started on {addr}");
    Ok((tx, addr))
}

fn run_sse_server(listener: &TcpListener, rx: &Receiver<SseMessage>) {
    let mut clients: SmallVec<[TcpStream; MAX_SSE_CLIENTS]> = SmallVec::new();
    let mut latest: Option<String> = None;
    let mut last_heartbeat = Instant::now();
    // Handshakes run on their own threads so a slow client cannot stall the stream
    let (ready_tx, ready_rx) = mpsc::channel::<TcpStream>();

    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("SSE: New connection from {addr}");
                let ready_tx = ready_tx.clone();
                let spawned = std::thread::Builder::new()
                    .name("sse-handshake".to_string())
                    .spawn(move || {
                        if let Some(client) = handle_new_connection(stream) {
                            let _ = ready_tx.send(client);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("SSE: Cannot spawn handshake for {addr}: {e}");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("SSE: Accept error: {e}");
            }
        }

        while let Ok(client) = ready_rx.try_recv() {
            if let Some(status) = &latest {
                if send_to_client(&client, event(status).as_bytes()).is_err() {
                    debug!("SSE: Client left before the first event");
                    continue;
                }
            }
            if clients.len() >= MAX_SSE_CLIENTS {
                info!("SSE: Max clients reached ({MAX_SSE_CLIENTS}), closing oldest connection");
                let oldest = clients.remove(0);
                let _ = oldest.shutdown(Shutdown::Both);
            }
            clients.push(client);
            info!("SSE: Client connected (total={})", clients.len());
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL && !clients.is_empty() {
            let before = clients.len();
            clients.retain(|client| send_to_client(client, b": heartbeat\n\n").is_ok());
            let removed = before - clients.len();
            if removed > 0 {
                info!("SSE: Heartbeat removed {removed} dead clients, {} remaining", clients.len());
            }
            last_heartbeat = Instant::now();
        }

        match rx.try_recv() {
            Ok(SseMessage::Status(status)) => {
                let msg = event(&status);
                let before = clients.len();
                clients.retain(|client| send_to_client(client, msg.as_bytes()).is_ok());
                let removed = before - clients.len();
                if removed > 0 {
                    debug!("SSE: Removed {removed} dead clients during broadcast, {} remaining", clients.len());
                }
                latest = Some(status);
            }
            Err(TryRecvError::Empty) => {
                std::thread::sleep(IDLE_SLEEP);
            }
            Err(TryRecvError::Disconnected) => {
                info!("SSE: Channel closed, shutting down");
                break;
            }
        }
    }
}

fn event(status: &str) -> String {
    format!("data: {status}\n\n")
}

/// Consume the HTTP request and answer with SSE headers
fn handle_new_connection(mut stream: TcpStream) -> Option<TcpStream> {
    // Accepted sockets may inherit non-blocking mode from the listener
    stream.set_nonblocking(false).ok()?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok()?;
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT)).ok()?;

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) if n > 0 => n,
        _ => {
            debug!("SSE: Failed to read request");
            return None;
        }
    };

    let request = String::from_utf8_lossy(&buf[..n]);
    if !request.starts_with("GET ") {
        debug!("SSE: Not a GET request");
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        return None;
    }

    let response = concat!(
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: text/event-stream\r\n",
        "Cache-Control: no-cache\r\n",
        "Connection: keep-alive\r\n",
        "Access-Control-Allow-Origin: *\r\n",
        "\r\n",
    );

    if stream.write_all(response.as_bytes()).is_err() {
        debug!("SSE: Failed to send headers");
        return None;
    }

    stream.set_read_timeout(None).ok();
    Some(stream)
}

fn send_to_client(client: &TcpStream, data: &[u8]) -> std::io::Result<()> {
    (&*client).write_all(data)?;
    (&*client).flush()
}

/// Log-and-continue wrapper used by the status publisher
pub fn publish(tx: &SseSender, status: String) -> bool {
    if tx.send(SseMessage::Status(status)).is_err() {
        error!("SSE server is gone, stopping status stream");
        return false;
    }
    true
}
