//! STOMP over WebSocket
//!
//! The game server speaks STOMP 1.2 on a WebSocket endpoint. This module
//! provides the frame codec and a [`Transport`] implementation on top of
//! `tokio-tungstenite`:
//!
//! ```text
//!   publish/subscribe ──► outgoing mpsc ──► writer task ──► WebSocket
//!   Subscription mpsc ◄── route by id  ◄── reader task ◄── WebSocket
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::network::transport::{Subscription, Transport, TransportError};

// =============================================================================
// FRAME CODEC
// =============================================================================

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    /// CONNECT, SEND, MESSAGE, ...
    pub command: String,
    /// Headers in order; the first occurrence of a name wins.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: String,
}

impl StompFrame {
    /// Frame with no headers and an empty body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    // CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    /// Serialize, NUL-terminated.
    pub fn encode(&self) -> String {
        let escape = self.escapes_headers();
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame. Heart-beat EOLs decode to `None`.
    pub fn decode(raw: &str) -> Result<Option<Self>, StompError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() || raw == "\0" {
            return Ok(None);
        }

        let (head, rest) = split_head(raw).ok_or_else(|| StompError::Frame("missing blank line after headers".into()))?;
        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim_end)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| StompError::Frame("missing command".into()))?
            .to_string();

        let mut frame = StompFrame::new(command);
        let unescape = frame.escapes_headers();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::Frame(format!("bad header line: {line}")))?;
            if unescape {
                frame.headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                frame.headers.push((name.to_string(), value.to_string()));
            }
        }

        frame.body = match rest.find('\0') {
            Some(end) => rest[..end].to_string(),
            None => rest.to_string(),
        };
        Ok(Some(frame))
    }
}

fn split_head(raw: &str) -> Option<(&str, &str)> {
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let crlf = raw.find("\r\n\r\n").map(|i| (i, 4));
    let (at, len) = match (lf, crlf) {
        (Some(a), Some(b)) => if a.0 <= b.0 { a } else { b },
        (a, b) => a.or(b)?,
    };
    Some((&raw[..at], &raw[at + len..]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => return Err(StompError::Frame(format!("bad header escape: \\{}", other.unwrap_or(' ')))),
        }
    }
    Ok(out)
}

// =============================================================================
// TRANSPORT
// =============================================================================

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<String, mpsc::Sender<String>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// STOMP client over one WebSocket connection.
pub struct StompTransport {
    outgoing: mpsc::UnboundedSender<StompFrame>,
    routes: Routes,
    next_subscription: AtomicU64,
    subscription_buffer: usize,
    closed: watch::Receiver<bool>,
}

impl StompTransport {
    /// Buffered messages per subscription.
    pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

    /// Open the WebSocket, perform the STOMP handshake and start the I/O tasks.
    pub async fn connect(url: &str, host: &str) -> Result<Self, StompError> {
        info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0");
        write.send(Message::Text(connect.encode())).await?;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match StompFrame::decode(&text)? {
                    Some(frame) if frame.command == "CONNECTED" => {
                        info!(version = ?frame.get("version"), "STOMP session established");
                        break;
                    }
                    Some(frame) if frame.command == "ERROR" => {
                        let reason = frame.get("message").unwrap_or("connection refused").to_string();
                        return Err(StompError::Rejected(reason));
                    }
                    Some(frame) => debug!(command = %frame.command, "Ignoring frame before CONNECTED"),
                    None => {}
                },
                Some(Ok(Message::Close(_))) | None => return Err(StompError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<StompFrame>();
        let (closed_tx, closed_rx) = watch::channel(false);

        // Reader task
        let reader_routes = routes.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match StompFrame::decode(&text) {
                        Ok(Some(frame)) => route_frame(&reader_routes, frame).await,
                        Ok(None) => {}
                        Err(e) => warn!("Failed to parse STOMP frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Ends every subscription stream.
            lock_routes(&reader_routes).clear();
            closed_tx.send_replace(true);
            info!("Reader task ended");
        });

        // Writer task
        let mut writer_closed = closed_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outgoing_rx.recv() => {
                        let Some(frame) = frame else { break };
                        debug!(command = %frame.command, destination = ?frame.get("destination"), "Sending frame");
                        if let Err(e) = write.send(Message::Text(frame.encode())).await {
                            error!("Failed to send frame: {}", e);
                            break;
                        }
                    }
                    _ = writer_closed.changed() => break,
                }
            }
            let _ = write.close().await;
            info!("Writer loop ended");
            reader_handle.abort();
        });

        Ok(Self {
            outgoing: outgoing_tx,
            routes,
            next_subscription: AtomicU64::new(0),
            subscription_buffer: Self::DEFAULT_SUBSCRIPTION_BUFFER,
            closed: closed_rx,
        })
    }

    /// Has the connection gone away?
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outgoing.is_closed()
    }

    /// Wait until the connection goes away.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send DISCONNECT; the server then closes the socket.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.outgoing
            .send(StompFrame::new("DISCONNECT"))
            .map_err(|_| TransportError::Closed)
    }
}

async fn route_frame(routes: &Routes, frame: StompFrame) {
    match frame.command.as_str() {
        "MESSAGE" => {
            let Some(id) = frame.get("subscription").map(str::to_string) else {
                warn!("MESSAGE frame without subscription header");
                return;
            };
            let sender = lock_routes(routes).get(&id).cloned();
            match sender {
                Some(sender) => {
                    if sender.send(frame.body).await.is_err() {
                        debug!(subscription = %id, "Subscriber gone, dropping route");
                        lock_routes(routes).remove(&id);
                    }
                }
                None => debug!(subscription = %id, "MESSAGE for unknown subscription"),
            }
        }
        "ERROR" => {
            error!(message = ?frame.get("message"), body = %frame.body, "STOMP error frame");
        }
        "RECEIPT" => {}
        other => debug!(command = %other, "Unhandled STOMP frame"),
    }
}

impl Transport for StompTransport {
    fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
        let id = format!("sub-{}", self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        lock_routes(&self.routes).insert(id.clone(), tx);

        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", destination)
            .header("ack", "auto");
        if self.outgoing.send(frame).is_err() {
            lock_routes(&self.routes).remove(&id);
            return Err(TransportError::Subscribe {
                destination: destination.to_string(),
                reason: "connection closed".into(),
            });
        }

        info!(%destination, subscription = %id, "Subscribed");
        Ok(rx)
    }

    fn publish(&self, destination: &str, body: String) -> Result<(), TransportError> {
        let frame = StompFrame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .body(body);
        self.outgoing.send(frame).map_err(|_| TransportError::Publish {
            destination: destination.to_string(),
            reason: "connection closed".into(),
        })
    }
}

/// STOMP transport errors.
#[derive(Debug, thiserror::Error)]
pub enum StompError {
    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Unparseable frame.
    #[error("Malformed STOMP frame: {0}")]
    Frame(String),

    /// Server answered CONNECT with ERROR.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// Socket closed during the handshake.
    #[error("Connection closed")]
    Closed,
}
