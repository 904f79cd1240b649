//! Broadcast WebSocket server for map telemetry.
//!
//! One listening socket, any number of clients, no per-client queue.
//!
//! # Delivery Model
//!
//! - `broadcast()` hands the current frame to every connected client.
//! - `service()` accepts connections, advances handshakes, drains inbound
//!   messages and flushes outbound bytes. Nothing reaches the network until
//!   it runs.
//! - All sockets are non-blocking. Delivery is decided per tick at the `A`
//!   frame: a client that is congested then skips the whole tick, otherwise
//!   it is handed every frame of that tick, even if its socket fills up
//!   halfway (the remainder waits in its write buffer). Every sequence a
//!   client sees is a complete `A..Z` tick. Newly connected clients start
//!   at the next `A`.
//! - Write failures drop the client silently; the producer never sees them.
//!
//! If the listener cannot be bound, the server stays inert: broadcasts are
//! discarded and `service()` does nothing until `init()` succeeds.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tungstenite::handshake::HandshakeError;
use tungstenite::handshake::MidHandshake;
use tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response, ServerHandshake};
use tungstenite::http::HeaderValue;
use tungstenite::{Message, WebSocket};

use super::{FrameSink, FrameTag};
use crate::error::{Error, Result};

/// WebSocket sub-protocol answered when a client asks for it.
pub const SUBPROTOCOL: &str = "ws";

/// Handshakes not completed within this window are abandoned.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on inbound messages drained per client per service step.
const MAX_READS_PER_SERVICE: usize = 32;

/// Echo the `ws` sub-protocol back to clients that request it.
#[derive(Debug, Clone, Copy)]
struct SubprotocolCallback;

impl Callback for SubprotocolCallback {
    fn on_request(
        self,
        request: &Request,
        mut response: Response,
    ) -> std::result::Result<Response, ErrorResponse> {
        let requested = request
            .headers()
            .get_all("Sec-WebSocket-Protocol")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|p| p.trim() == SUBPROTOCOL);

        if requested {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(response)
    }
}

type ServerHandshakeState = ServerHandshake<TcpStream, SubprotocolCallback>;
type PendingHandshake = MidHandshake<ServerHandshakeState>;

/// Outcome of one non-blocking handshake round.
enum HandshakeStep {
    Established(WebSocket<TcpStream>),
    Pending(PendingHandshake),
}

/// Classify a handshake round; protocol or I/O failures become errors.
fn handshake_step(
    result: std::result::Result<WebSocket<TcpStream>, HandshakeError<ServerHandshakeState>>,
) -> Result<HandshakeStep> {
    match result {
        Ok(ws) => Ok(HandshakeStep::Established(ws)),
        Err(HandshakeError::Interrupted(handshake)) => Ok(HandshakeStep::Pending(handshake)),
        Err(HandshakeError::Failure(e)) => Err(e.into()),
    }
}

/// Connection whose HTTP upgrade has not finished yet.
struct PendingClient {
    handshake: PendingHandshake,
    addr: SocketAddr,
    started: Instant,
}

/// Keeps a client's frame stream aligned to whole ticks.
///
/// A client joins a tick only at its `A` frame and only if it is not
/// congested at that moment. Once joined, it takes the rest of the tick.
#[derive(Debug, Clone, Copy, Default)]
struct TickAlignment {
    in_tick: bool,
}

impl TickAlignment {
    /// Whether `frame` is delivered to a client in the given state.
    fn admit(&mut self, frame: &[u8], congested: bool) -> bool {
        if frame.first() == Some(&FrameTag::Pose.as_byte()) {
            self.in_tick = !congested;
        }
        self.in_tick
    }

    /// An admitted frame did not reach the client; withhold the rest of the tick.
    fn dropped(&mut self) {
        self.in_tick = false;
    }
}

/// Connected WebSocket client.
struct Client {
    ws: WebSocket<TcpStream>,
    addr: SocketAddr,
    /// Socket refused bytes on the last write or flush; skip ticks until it drains.
    congested: bool,
    alignment: TickAlignment,
    /// Connection closed or errored (for cleanup).
    failed: bool,
}

impl Client {
    fn new(ws: WebSocket<TcpStream>, addr: SocketAddr) -> Self {
        Self {
            ws,
            addr,
            congested: false,
            alignment: TickAlignment::default(),
            failed: false,
        }
    }

    /// Queue a message. Returns false if the frame was not taken.
    fn try_write(&mut self, message: Message) -> bool {
        match self.ws.write(message) {
            Ok(()) => true,
            Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {
                // Frame is buffered, socket is full
                self.congested = true;
                true
            }
            Err(tungstenite::Error::WriteBufferFull(_)) => {
                self.congested = true;
                false
            }
            Err(e) => {
                log::debug!("Write to client {} failed: {}", self.addr, e);
                self.failed = true;
                false
            }
        }
    }

    /// Flush buffered frames, updating the congestion flag.
    fn flush(&mut self) {
        match self.ws.flush() {
            Ok(()) => self.congested = false,
            Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {
                self.congested = true;
            }
            Err(e) => {
                log::debug!("Flush to client {} failed: {}", self.addr, e);
                self.failed = true;
            }
        }
    }

    /// Drain inbound messages (non-blocking).
    fn drain_incoming(&mut self) {
        for _ in 0..MAX_READS_PER_SERVICE {
            match self.ws.read() {
                Ok(Message::Text(text)) => {
                    log::debug!("Received data from {}: {}", self.addr, text.as_str());
                }
                Ok(Message::Binary(data)) => {
                    log::debug!("Received {} bytes from {}", data.len(), self.addr);
                }
                Ok(Message::Close(_)) => {
                    log::debug!("Client {} sent close", self.addr);
                }
                // Ping replies are queued by tungstenite and go out on flush
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    self.failed = true;
                    return;
                }
                Err(e) => {
                    log::debug!("Read from client {} failed: {}", self.addr, e);
                    self.failed = true;
                    return;
                }
            }
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Frames handed to `broadcast()` while the server was active.
    pub frames_broadcast: u64,
    /// Frames discarded because the server was inert or had no clients.
    pub frames_discarded: u64,
    /// Per-client frame deliveries skipped (congestion or write failure).
    pub client_frames_skipped: u64,
    /// Clients that completed the WebSocket handshake.
    pub clients_accepted: u64,
    /// Connections dropped during the handshake (protocol error or timeout).
    pub handshakes_failed: u64,
}

/// Broadcast WebSocket server.
///
/// Created inert by [`StreamServer::new`]; [`StreamServer::init`] binds the
/// listener. Must be driven by [`StreamServer::service`].
pub struct StreamServer {
    listener: Option<TcpListener>,
    pending: Vec<PendingClient>,
    clients: Vec<Client>,
    stats: ServerStats,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamServer {
    /// Create an inert server with no listening endpoint.
    pub fn new() -> Self {
        Self {
            listener: None,
            pending: Vec::new(),
            clients: Vec::new(),
            stats: ServerStats::default(),
        }
    }

    /// Bind the listening endpoint on `0.0.0.0:port`.
    ///
    /// Re-initialising an active server tears the old endpoint down first.
    /// On failure the server stays inert; the error is logged and returned.
    pub fn init(&mut self, port: u16) -> Result<()> {
        if self.listener.is_some() {
            self.shutdown();
        }

        let listener = match Self::bind(port) {
            Ok(l) => l,
            Err(e) => {
                log::error!("Failed to create stream listener on port {}: {}", port, e);
                return Err(e);
            }
        };

        match listener.local_addr() {
            Ok(addr) => log::info!("Stream server listening on {}", addr),
            Err(_) => log::info!("Stream server listening on port {}", port),
        }
        self.listener = Some(listener);
        Ok(())
    }

    fn bind(port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Whether a listening endpoint exists.
    pub fn is_active(&self) -> bool {
        self.listener.is_some()
    }

    /// Bound address of the listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(l) => Ok(l.local_addr()?),
            None => Err(Error::NotInitialized),
        }
    }

    /// Number of clients with a completed handshake.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether any client has ever connected.
    pub fn has_seen_client(&self) -> bool {
        self.stats.clients_accepted > 0
    }

    /// Delivery counters.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Close every connection and the listener.
    ///
    /// The server is inert afterwards and can be reused via `init()`.
    pub fn shutdown(&mut self) {
        if self.listener.is_none() && self.clients.is_empty() && self.pending.is_empty() {
            return;
        }

        for client in self.clients.iter_mut() {
            // Best effort: the peer may already be gone
            let _ = client.ws.close(None);
            let _ = client.ws.flush();
        }

        let closed = self.clients.len();
        self.clients.clear();
        self.pending.clear();
        self.listener = None;

        log::info!(
            "Stream server stopped ({} clients closed, {} frames broadcast, {} discarded, {} skipped)",
            closed,
            self.stats.frames_broadcast,
            self.stats.frames_discarded,
            self.stats.client_frames_skipped
        );
    }

    /// Accept new TCP connections and start their handshakes.
    fn accept_new(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("Failed to set non-blocking mode for {}: {}", addr, e);
                        continue;
                    }
                    stream.set_nodelay(true).ok();
                    accepted.push((stream, addr));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Error accepting client connection: {}", e);
                    break;
                }
            }
        }

        for (stream, addr) in accepted {
            let step = handshake_step(tungstenite::accept_hdr(stream, SubprotocolCallback));
            self.on_handshake_step(step, addr, Instant::now());
        }
    }

    /// Advance handshakes that were waiting on the socket.
    fn progress_handshakes(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        for pending in std::mem::take(&mut self.pending) {
            if pending.started.elapsed() > HANDSHAKE_TIMEOUT {
                log::warn!("WebSocket handshake with {} timed out", pending.addr);
                self.stats.handshakes_failed += 1;
                continue;
            }

            let step = handshake_step(pending.handshake.handshake());
            self.on_handshake_step(step, pending.addr, pending.started);
        }
    }

    fn on_handshake_step(
        &mut self,
        step: Result<HandshakeStep>,
        addr: SocketAddr,
        started: Instant,
    ) {
        match step {
            Ok(HandshakeStep::Established(ws)) => {
                log::info!("WebSocket connection established: {}", addr);
                self.stats.clients_accepted += 1;
                self.clients.push(Client::new(ws, addr));
            }
            Ok(HandshakeStep::Pending(handshake)) => {
                self.pending.push(PendingClient {
                    handshake,
                    addr,
                    started,
                });
            }
            Err(e) => {
                log::warn!("WebSocket handshake with {} failed: {}", addr, e);
                self.stats.handshakes_failed += 1;
            }
        }
    }

    /// Drop closed and failed clients.
    fn reap_clients(&mut self) {
        let before = self.clients.len();
        self.clients.retain(|c| {
            if c.failed {
                log::info!("WebSocket connection closed: {}", c.addr);
            }
            !c.failed
        });

        if self.clients.len() < before {
            log::debug!(
                "Removed {} disconnected clients, {} remaining",
                before - self.clients.len(),
                self.clients.len()
            );
        }
    }
}

impl FrameSink for StreamServer {
    fn open(&mut self, port: u16) -> Result<()> {
        self.init(port)
    }

    fn close(&mut self) {
        self.shutdown();
    }

    fn broadcast(&mut self, frame: &[u8]) {
        if self.listener.is_none() || self.clients.is_empty() {
            self.stats.frames_discarded += 1;
            return;
        }
        self.stats.frames_broadcast += 1;

        // One copy shared by every client
        let message = Message::binary(frame.to_vec());

        for client in self.clients.iter_mut() {
            if client.failed || !client.alignment.admit(frame, client.congested) {
                self.stats.client_frames_skipped += 1;
            } else if !client.try_write(message.clone()) {
                client.alignment.dropped();
                self.stats.client_frames_skipped += 1;
            }
        }
    }

    fn service(&mut self) {
        if self.listener.is_none() {
            return;
        }

        self.accept_new();
        self.progress_handshakes();

        for client in self.clients.iter_mut() {
            client.drain_incoming();
            if !client.failed {
                client.flush();
            }
        }

        self.reap_clients();
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
