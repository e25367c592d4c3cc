//! Wire socket: owns one transport connection, frames queries and
//! responses, and multiplexes concurrent queries by token.
//!
//! A dedicated reader task owns the read half and the unconsumed byte
//! buffer. Each replied query registers a per-token completion channel
//! before its frame is written, so a response racing ahead of the write
//! cannot be lost. The token map and buffer are touched only by the
//! send and receive paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::ServerOptions;
use crate::connection::handshake::{self, HandshakeMessage};
use crate::error::{DriverError, Result};
use crate::proto::{self, Query, QueryType, ResponseType, HEADER_SIZE, NULL_BYTE};

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type Writer = WriteHalf<Box<dyn Transport>>;
type Reader = ReadHalf<Box<dyn Transport>>;
type Settlement = std::result::Result<Value, DriverError>;

const EVENT_CAPACITY: usize = 64;

/// Health state of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Handshake,
    Open,
    Errored,
    Closed,
}

/// Notifications published by a socket. An event with no subscribers is
/// dropped; in particular an unattended error never escapes the socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Transport connected and handshake completed.
    Connect,
    /// A fresh query (not a continuation) was written.
    QuerySent { token: u64 },
    /// Raw response delivered for a token, independent of the read API.
    Data { token: u64, response: Value },
    /// A token's bookkeeping was cleared; carries the remaining count.
    Release { remaining: usize },
    /// The socket failed; it has already been force-closed.
    Error { error: DriverError },
}

/// Per-token record: the completion channel for the current fetch plus
/// the originating query, kept for diagnostics across continuations.
struct PendingQuery {
    tx: Option<oneshot::Sender<Settlement>>,
    rx: Option<oneshot::Receiver<Settlement>>,
    query: Query,
}

struct Shared {
    pending: Mutex<HashMap<u64, PendingQuery>>,
    next_token: AtomicU64,
    /// Read cursor for handshake messages: they carry no token, but the
    /// handshake is fully serial, so arrival order matches send order.
    handshake_cursor: AtomicU64,
    steady: AtomicBool,
    is_open: AtomicBool,
    last_error: Mutex<Option<DriverError>>,
    events: Mutex<broadcast::Sender<SocketEvent>>,
    /// Set while no queries are pending; basis for idle reaping.
    idle_since: Mutex<Option<Instant>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            handshake_cursor: AtomicU64::new(0),
            steady: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            last_error: Mutex::new(None),
            events: Mutex::new(broadcast::channel(EVENT_CAPACITY).0),
            idle_since: Mutex::new(None),
        }
    }

    fn register(&self, token: u64, query: Query) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        // a continuation keeps the originating query for diagnostics
        let original = pending.remove(&token).map(|pq| pq.query).unwrap_or(query);
        pending.insert(
            token,
            PendingQuery {
                tx: Some(tx),
                rx: Some(rx),
                query: original,
            },
        );
        *self.idle_since.lock().unwrap() = None;
    }

    fn settle(&self, token: u64, result: Settlement) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(pq) = pending.get_mut(&token) {
            if let Some(tx) = pq.tx.take() {
                let _ = tx.send(result);
            }
        }
    }

    fn remove(&self, token: u64) -> usize {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(&token);
        let remaining = pending.len();
        if remaining == 0 {
            *self.idle_since.lock().unwrap() = Some(Instant::now());
        }
        remaining
    }

    fn drain_pending(&self) -> Vec<PendingQuery> {
        let mut pending = self.pending.lock().unwrap();
        let drained = pending.drain().map(|(_, pq)| pq).collect();
        *self.idle_since.lock().unwrap() = Some(Instant::now());
        drained
    }

    fn last_error(&self) -> Option<DriverError> {
        self.last_error.lock().unwrap().clone()
    }

    fn emit(&self, event: SocketEvent) {
        // send to a channel with no receivers just drops the event
        let _ = self.events.lock().unwrap().send(event);
    }

    /// Replaces the event channel, detaching every subscriber.
    fn reset_events(&self) {
        *self.events.lock().unwrap() = broadcast::channel(EVENT_CAPACITY).0;
    }

    /// Transport failure: record, settle pending waiters, force-close,
    /// and notify error subscribers only if at least one exists.
    fn fail(&self, err: DriverError) {
        tracing::warn!(error = %err, "socket error, force-closing");
        *self.last_error.lock().unwrap() = Some(err.clone());
        for mut pq in self.drain_pending() {
            if let Some(tx) = pq.tx.take() {
                let _ = tx.send(Err(DriverError::closed_before_completion()));
            }
        }
        self.is_open.store(false, Ordering::SeqCst);
        self.steady.store(false, Ordering::SeqCst);
        {
            let events = self.events.lock().unwrap();
            if events.receiver_count() > 0 {
                let _ = events.send(SocketEvent::Error { error: err });
            }
        }
        self.reset_events();
    }
}

/// One framed, multiplexing connection to a server.
pub struct ReqlSocket {
    server: ServerOptions,
    user: String,
    password: String,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReqlSocket {
    pub fn new(server: ServerOptions, user: &str, password: &str) -> Self {
        ReqlSocket {
            server,
            user: user.to_string(),
            password: password.to_string(),
            shared: Arc::new(Shared::new()),
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SocketStatus {
        if self.shared.last_error().is_some() {
            SocketStatus::Errored
        } else if !self.shared.is_open.load(Ordering::SeqCst) {
            SocketStatus::Closed
        } else if !self.shared.steady.load(Ordering::SeqCst) {
            SocketStatus::Handshake
        } else {
            SocketStatus::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == SocketStatus::Open
    }

    pub fn last_error(&self) -> Option<DriverError> {
        self.shared.last_error()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// How long the socket has had no pending queries, or `None` while busy.
    pub fn idle_for(&self) -> Option<Duration> {
        self.shared
            .idle_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.events.lock().unwrap().subscribe()
    }

    /// Opens the transport and runs the authenticated handshake. On any
    /// failure the socket ends closed with the error recorded.
    pub async fn connect(&self) -> Result<()> {
        {
            let writer = self.writer.lock().await;
            if writer.is_some() {
                return Err(DriverError::connection("socket already connected"));
            }
        }
        *self.shared.last_error.lock().unwrap() = None;
        let transport = self.open_transport().await?;
        let (read_half, write_half) = tokio::io::split(transport);

        self.shared.next_token.store(0, Ordering::SeqCst);
        self.shared.handshake_cursor.store(0, Ordering::SeqCst);
        self.shared.steady.store(false, Ordering::SeqCst);
        self.shared.is_open.store(true, Ordering::SeqCst);
        *self.shared.idle_since.lock().unwrap() = Some(Instant::now());
        *self.writer.lock().await = Some(write_half);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(read_loop(shared, read_half));
        *self.reader_task.lock().unwrap() = Some(handle);

        if let Err(err) = self.perform_handshake().await {
            *self.shared.last_error.lock().unwrap() = Some(err.clone());
            self.teardown().await;
            return Err(err);
        }
        tracing::debug!(addr = %self.server.addr(), user = %self.user, "connection established");
        self.shared.emit(SocketEvent::Connect);
        Ok(())
    }

    async fn open_transport(&self) -> Result<Box<dyn Transport>> {
        let addr = self.server.addr();
        let tcp = TcpStream::connect(&addr).await.map_err(|e| {
            DriverError::connection(format!("failed to connect to {}: {}", addr, e))
        })?;
        tcp.set_nodelay(true)
            .map_err(|e| DriverError::connection(format!("failed to set TCP_NODELAY: {}", e)))?;

        match &self.server.tls {
            None => Ok(Box::new(tcp) as Box<dyn Transport>),
            Some(tls) => {
                let mut builder = tokio_native_tls::native_tls::TlsConnector::builder();
                if tls.accept_invalid_certs {
                    builder.danger_accept_invalid_certs(true);
                }
                let connector = tokio_native_tls::TlsConnector::from(
                    builder
                        .build()
                        .map_err(|e| DriverError::connection(e.to_string()))?,
                );
                let domain = tls.domain.as_deref().unwrap_or(&self.server.host);
                let stream = connector.connect(domain, tcp).await.map_err(|e| {
                    DriverError::connection(format!("TLS handshake failed: {}", e))
                })?;
                Ok(Box::new(stream) as Box<dyn Transport>)
            }
        }
    }

    /// Serializes and writes one query frame, auto-incrementing the token
    /// unless one is supplied. Returns the token.
    pub async fn send_query(&self, query: Query, token: Option<u64>) -> Result<u64> {
        if self.status() != SocketStatus::Open {
            return Err(self.shared.last_error().unwrap_or_else(|| {
                DriverError::connection("query sent on a connection that is not open")
            }));
        }
        let token =
            token.unwrap_or_else(|| self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        let payload = serde_json::to_vec(&query.to_wire())?;
        let frame = proto::encode_frame(token, &payload);
        let query_type = query.query_type;

        if query_type == QueryType::Stop {
            self.write_raw(&frame).await?;
            // resolve, never reject: a cancelled waiter that nobody reads
            // must not become an unobserved failure
            let remaining = {
                let mut pending = self.shared.pending.lock().unwrap();
                match pending.remove(&token) {
                    Some(mut pq) => {
                        if let Some(tx) = pq.tx.take() {
                            let _ = tx.send(Err(DriverError::Cancel));
                        }
                        if pending.is_empty() {
                            *self.shared.idle_since.lock().unwrap() = Some(Instant::now());
                        }
                        Some(pending.len())
                    }
                    None => None,
                }
            };
            if let Some(remaining) = remaining {
                self.shared.emit(SocketEvent::Release { remaining });
            }
            return Ok(token);
        }

        if query.is_noreply() {
            self.write_raw(&frame).await?;
            self.shared.emit(SocketEvent::QuerySent { token });
            return Ok(token);
        }

        // waiter registered before the write completes so a response
        // racing ahead of the write cannot be lost
        self.shared.register(token, query);
        if let Err(err) = self.write_raw(&frame).await {
            self.shared.remove(token);
            return Err(err);
        }
        if query_type != QueryType::Continue {
            self.shared.emit(SocketEvent::QuerySent { token });
        }
        Ok(token)
    }

    /// Issues STOP for the token.
    pub async fn stop_query(&self, token: u64) -> Result<u64> {
        self.send_query(Query::stop(), Some(token)).await
    }

    /// Suspends until the token's waiter settles. A SUCCESS_PARTIAL
    /// settlement issues CONTINUE for the same token before returning:
    /// continuation is pull-driven.
    pub async fn read_next(&self, token: u64) -> Result<Value> {
        if !self.shared.is_open.load(Ordering::SeqCst) {
            return Err(self
                .shared
                .last_error()
                .unwrap_or_else(DriverError::closed_before_completion));
        }
        let rx = {
            let mut pending = self.shared.pending.lock().unwrap();
            let entry = pending
                .get_mut(&token)
                .ok_or_else(|| DriverError::protocol(format!("query {} is not running", token)))?;
            entry.rx.take().ok_or_else(|| {
                DriverError::protocol(format!("query {} is already being read", token))
            })?
        };
        let settled = rx.await.map_err(|_| {
            self.shared
                .last_error()
                .unwrap_or_else(DriverError::closed_before_completion)
        })?;
        match settled {
            Err(err) => {
                self.shared.remove(token);
                Err(err)
            }
            Ok(value) => {
                if !self.shared.steady.load(Ordering::SeqCst) {
                    // handshake reads always clear their token
                    self.shared.remove(token);
                    return Ok(value);
                }
                let partial = value.get("t").and_then(Value::as_u64)
                    == Some(ResponseType::SuccessPartial as u64);
                if partial {
                    self.send_query(Query::continuation(), Some(token)).await?;
                } else {
                    let remaining = self.shared.remove(token);
                    self.shared.emit(SocketEvent::Release { remaining });
                }
                Ok(value)
            }
        }
    }

    /// Tears down one token's bookkeeping, e.g. after a timeout or a
    /// dropped cursor. A no-op for tokens that are not registered.
    pub fn abandon(&self, token: u64) {
        let remaining = {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.remove(&token).is_none() {
                return;
            }
            let remaining = pending.len();
            if remaining == 0 {
                *self.shared.idle_since.lock().unwrap() = Some(Instant::now());
            }
            remaining
        };
        self.shared.emit(SocketEvent::Release { remaining });
    }

    /// Settles every pending waiter with a connection error, destroys the
    /// transport, and resets the socket to its pre-connect state.
    pub async fn close(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        for mut pq in self.shared.drain_pending() {
            if let Some(tx) = pq.tx.take() {
                let _ = tx.send(Err(DriverError::closed_before_completion()));
            }
        }
        self.shared.is_open.store(false, Ordering::SeqCst);
        self.shared.steady.store(false, Ordering::SeqCst);
        self.shared.next_token.store(0, Ordering::SeqCst);
        self.shared.handshake_cursor.store(0, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.reset_events();
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| DriverError::connection("socket is not connected"))?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// V1_0 handshake. All three server messages route through the same
    /// token-indexed waiter mechanism as ordinary queries, on reserved
    /// tokens 0, 1, and 2, each registered before its corresponding write.
    async fn perform_handshake(&self) -> Result<()> {
        let auth = handshake::build_auth_buffer(&self.user);

        let token0 = self.register_handshake_waiter();
        let token1 = self.register_handshake_waiter();
        self.write_raw(&auth.buffer).await?;

        let version = handshake_message(self.read_next(token0).await?)?;
        handshake::validate_version(&version)?;

        let challenge_msg = handshake_message(self.read_next(token1).await?)?;
        let challenge = challenge_msg
            .authentication
            .ok_or_else(|| DriverError::auth("server challenge is missing authentication"))?;
        let salted = handshake::compute_salted_password(
            &challenge,
            &auth.nonce,
            &self.user,
            &self.password,
        )?;

        let token2 = self.register_handshake_waiter();
        self.write_raw(&salted.proof).await?;

        let final_msg = handshake_message(self.read_next(token2).await?)?;
        let signature = final_msg
            .authentication
            .ok_or_else(|| DriverError::auth("server final message is missing a signature"))?;
        handshake::compare_digest(&signature, &salted.server_signature)?;

        self.shared.steady.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn register_handshake_waiter(&self) -> u64 {
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        self.shared.register(
            token,
            Query {
                query_type: QueryType::Start,
                term: None,
                options: None,
            },
        );
        token
    }
}

fn handshake_message(value: Value) -> Result<HandshakeMessage> {
    serde_json::from_value(value)
        .map_err(|e| DriverError::auth(format!("malformed handshake message: {}", e)))
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) {
    let mut buffer: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                shared.fail(DriverError::connection("connection closed by server"));
                return;
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                let result = if shared.steady.load(Ordering::SeqCst) {
                    process_frames(&shared, &mut buffer)
                } else {
                    process_handshake(&shared, &mut buffer)
                };
                if let Err(err) = result {
                    shared.fail(err);
                    return;
                }
            }
            Err(err) => {
                shared.fail(err.into());
                return;
            }
        }
    }
}

/// Handshake mode: scan for NUL-delimited JSON messages and match each
/// to the oldest outstanding handshake token.
fn process_handshake(shared: &Shared, buffer: &mut Vec<u8>) -> Result<()> {
    while let Some(pos) = buffer.iter().position(|&b| b == NULL_BYTE) {
        let mut raw: Vec<u8> = buffer.drain(..=pos).collect();
        raw.pop();
        let text = String::from_utf8_lossy(&raw).into_owned();
        let token = shared.handshake_cursor.fetch_add(1, Ordering::SeqCst);
        match HandshakeMessage::parse(&text) {
            Ok(_) => {
                let value: Value = serde_json::from_str(&text)?;
                shared.settle(token, Ok(value));
            }
            Err(err) => {
                // handshake failures are fatal to the socket
                shared.settle(token, Err(err.clone()));
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Steady-state mode: a frame is acted on only once the full declared
/// payload is buffered.
fn process_frames(shared: &Shared, buffer: &mut Vec<u8>) -> Result<()> {
    while buffer.len() >= HEADER_SIZE {
        let (token, len) = proto::decode_header(&buffer[..HEADER_SIZE])?;
        if buffer.len() < HEADER_SIZE + len {
            break;
        }
        let frame: Vec<u8> = buffer.drain(..HEADER_SIZE + len).collect();
        let response: Value = serde_json::from_slice(&frame[HEADER_SIZE..])?;
        tracing::trace!(token, "response frame received");
        shared.settle(token, Ok(response.clone()));
        shared.emit(SocketEvent::Data { token, response });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;

    fn local_socket(port: u16) -> ReqlSocket {
        ReqlSocket::new(ServerOptions::new("127.0.0.1", port), "admin", "")
    }

    #[test]
    fn fresh_socket_reports_closed() {
        let socket = local_socket(28015);
        assert_eq!(socket.status(), SocketStatus::Closed);
        assert_eq!(socket.pending_count(), 0);
        assert!(socket.last_error().is_none());
    }

    #[tokio::test]
    async fn send_query_on_closed_socket_fails() {
        let socket = local_socket(28015);
        let err = socket
            .send_query(Query::start(serde_json::json!(1), None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)));
    }

    #[tokio::test]
    async fn read_next_on_closed_socket_raises_immediately() {
        let socket = local_socket(28015);
        let err = socket.read_next(0).await.unwrap_err();
        assert!(matches!(err, DriverError::Connection(_)));
    }

    #[tokio::test]
    async fn connect_fails_when_server_hangs_up_during_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // accept and immediately drop the connection
            let _ = listener.accept().await;
        });

        let socket = local_socket(port);
        let err = socket.connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert_ne!(socket.status(), SocketStatus::Open);
        assert_eq!(socket.pending_count(), 0);
    }
}
