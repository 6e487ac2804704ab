/// WebSocket transport — hand-rolled RFC 6455 server.
///
/// Owns the HTTP Upgrade handshake, the frame codec, and a per-socket
/// heartbeat. Text frames carry UTF-8 JSON messages which are pushed into
/// the hub; outbound messages are written as unmasked single-fragment text
/// frames.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::SinkExt;
use serde_json::Map;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::hub::{ClientCommand, ClientContext, Hub};
use crate::message::Message;
use crate::transport::{Transport, TransportError};

/// RFC 6455 handshake GUID, concatenated with the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request head.
const MAX_HEADER_BYTES: usize = 8192;

/// Upper bound on a single frame payload. Guards the accumulation buffer
/// against absurd declared lengths from untrusted clients.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

pub mod opcode {
    pub const TEXT: u8 = 0x1;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub host: String,
    pub port: u16,
    /// When set, upgrade requests whose URL does not start with this prefix
    /// are rejected.
    pub path: Option<String>,
    pub heartbeat_interval: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7070,
            path: None,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// A single WebSocket frame. Fragmentation is not supported: outbound
/// frames are always FIN=1, and inbound continuation frames are ignored
/// by the opcode dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: opcode::TEXT,
            payload: payload.into(),
        }
    }

    pub fn ping() -> Self {
        Self {
            opcode: opcode::PING,
            payload: Bytes::new(),
        }
    }

    pub fn pong(payload: Bytes) -> Self {
        Self {
            opcode: opcode::PONG,
            payload,
        }
    }

    pub fn close() -> Self {
        Self {
            opcode: opcode::CLOSE,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WsFrameError {
    #[error("frame payload of {len} bytes exceeds the {MAX_FRAME_PAYLOAD} byte limit")]
    FrameTooLarge { len: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream into WebSocket frames and back.
///
/// Decoding handles the 7-bit, 16-bit, and 64-bit length encodings and
/// unmasks client payloads. A frame is produced only once the buffer holds
/// the complete payload. Encoding writes unmasked single-fragment frames.
#[derive(Debug, Default)]
pub struct WsFrameCodec;

impl Decoder for WsFrameCodec {
    type Item = Frame;
    type Error = WsFrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let opcode = src[0] & 0x0F;
        let masked = src[1] & 0x80 != 0;
        let short_len = (src[1] & 0x7F) as u64;

        let (len, header_len) = match short_len {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(bytes), 10)
            }
            n => (n, 2),
        };

        if len > MAX_FRAME_PAYLOAD as u64 {
            return Err(WsFrameError::FrameTooLarge { len });
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mask = if masked {
            let key = [src[0], src[1], src[2], src[3]];
            src.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(len as usize);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for WsFrameCodec {
    type Error = WsFrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.payload.len() + 10);
        dst.put_u8(0x80 | (frame.opcode & 0x0F));
        let len = frame.payload.len();
        if len < 126 {
            dst.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(len as u64);
        }
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Upgrade handshake
// ---------------------------------------------------------------------------

/// `Sec-WebSocket-Accept` for a client key: Base64(SHA1(key ‖ GUID)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("request head exceeds {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("connection closed before request head completed")]
    UnexpectedEof,
    #[error("malformed request head")]
    Malformed,
    #[error("not a websocket upgrade")]
    NotAnUpgrade,
    #[error("request path rejected by filter")]
    PathRejected,
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct UpgradeRequest {
    path: String,
    upgrade: Option<String>,
    key: Option<String>,
}

fn parse_upgrade(head: &str) -> Result<UpgradeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(HandshakeError::Malformed)?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next().ok_or(HandshakeError::Malformed)?;
    let path = parts.next().ok_or(HandshakeError::Malformed)?.to_owned();

    let mut upgrade = None;
    let mut key = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_lowercase().as_str() {
            "upgrade" => upgrade = Some(value.trim().to_owned()),
            "sec-websocket-key" => key = Some(value.trim().to_owned()),
            _ => {}
        }
    }

    Ok(UpgradeRequest { path, upgrade, key })
}

/// Read the upgrade request head, returning it plus whatever bytes the
/// client sent past the blank line (they belong to the frame stream).
async fn read_upgrade(
    stream: &mut TcpStream,
) -> Result<(UpgradeRequest, BytesMut), HandshakeError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(pos + 4);
            let head = std::str::from_utf8(&head).map_err(|_| HandshakeError::Malformed)?;
            return Ok((parse_upgrade(head)?, buf));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(HandshakeError::HeadersTooLarge);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
    }
}

/// Validate the upgrade and write the 101 response. Any failure destroys
/// the socket without a response body.
async fn complete_handshake(
    stream: &mut TcpStream,
    opts: &WsOptions,
) -> Result<BytesMut, HandshakeError> {
    let (request, leftover) = read_upgrade(stream).await?;

    let is_websocket = request
        .upgrade
        .as_deref()
        .is_some_and(|u| u.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(HandshakeError::NotAnUpgrade);
    }
    if let Some(prefix) = &opts.path {
        if !request.path.starts_with(prefix.as_str()) {
            return Err(HandshakeError::PathRejected);
        }
    }
    let key = match request.key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => return Err(HandshakeError::MissingKey),
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(leftover)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct WsTransport {
    inner: Arc<WsShared>,
}

struct WsShared {
    opts: WsOptions,
    shutdown: watch::Sender<bool>,
    /// Externally provided listener, consumed on the first start.
    preopened: StdMutex<Option<std::net::TcpListener>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WsTransport {
    pub fn new(opts: WsOptions) -> Self {
        Self::build(opts, None)
    }

    /// Reuse an externally bound listener instead of binding `host:port`.
    pub fn with_listener(opts: WsOptions, listener: std::net::TcpListener) -> Self {
        Self::build(opts, Some(listener))
    }

    fn build(opts: WsOptions, preopened: Option<std::net::TcpListener>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(WsShared {
                opts,
                shutdown,
                preopened: StdMutex::new(preopened),
                local_addr: StdMutex::new(None),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// The address the listener is bound to, once started. Lets callers
    /// configure port 0 and discover the ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn start_inner(&self, hub: Arc<Hub>) -> Result<(), TransportError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);

        let preopened = self
            .inner
            .preopened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let addr = format!("{}:{}", self.inner.opts.host, self.inner.opts.port);
        let bound = match preopened {
            Some(listener) => listener
                .set_nonblocking(true)
                .and_then(|()| TcpListener::from_std(listener)),
            None => TcpListener::bind(&addr).await,
        };
        let listener = bound.map_err(|source| {
            self.inner.started.store(false, Ordering::SeqCst);
            TransportError::Bind { addr: addr.clone(), source }
        })?;
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner()) =
            listener.local_addr().ok();
        info!(%addr, "websocket transport listening");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(accept_loop(inner, listener, hub));
        self.inner.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn stop_inner(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        loop {
            let drained: Vec<JoinHandle<()>> =
                self.inner.tasks.lock().await.drain(..).collect();
            if drained.is_empty() {
                break;
            }
            for task in drained {
                let _ = task.await;
            }
        }
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn start(&self, hub: Arc<Hub>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.start_inner(hub))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }
}

async fn accept_loop(inner: Arc<WsShared>, listener: TcpListener, hub: Arc<Hub>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        // A stop signalled before we subscribed is only visible by value.
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming websocket connection");
                    let conn_inner = Arc::clone(&inner);
                    let hub = Arc::clone(&hub);
                    let handle = tokio::spawn(async move {
                        run_connection(conn_inner, stream, addr, hub).await;
                    });
                    inner.tasks.lock().await.push(handle);
                }
                Err(e) => warn!(error = %e, "accept error"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_connection(inner: Arc<WsShared>, mut stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>) {
    let leftover = match complete_handshake(&mut stream, &inner.opts).await {
        Ok(leftover) => leftover,
        Err(e) => {
            debug!(%addr, error = %e, "handshake failed");
            return;
        }
    };

    let mut parts = FramedParts::new::<Frame>(stream, WsFrameCodec);
    parts.read_buf = leftover;
    let mut framed = Framed::from_parts(parts);

    let client_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.register_client(ClientContext::new(client_id.clone(), "websocket", Map::new(), tx))
        .await;
    info!(client = %client_id, %addr, "websocket client connected");

    let reason = session(&inner, &mut framed, &mut rx, &hub, &client_id).await;

    // Exactly one unregister per connection, on every exit path.
    hub.unregister_client(&client_id, reason.clone()).await;
    info!(client = %client_id, %addr, ?reason, "websocket client closed");
}

/// Drive one connection until it closes. Returns the disconnect reason.
async fn session(
    inner: &WsShared,
    framed: &mut Framed<TcpStream, WsFrameCodec>,
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    hub: &Arc<Hub>,
    client_id: &str,
) -> Option<String> {
    let mut shutdown = inner.shutdown.subscribe();
    let mut heartbeat = interval_at(
        Instant::now() + inner.opts.heartbeat_interval,
        inner.opts.heartbeat_interval,
    );
    // The completed handshake counts as traffic for the first tick.
    let mut alive = true;

    loop {
        if *shutdown.borrow() {
            let _ = framed.send(Frame::close()).await;
            return Some("transport stopped".into());
        }
        tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(client = %client_id, error = %e, "frame error");
                        return Some("frame error".into());
                    }
                    None => return Some("connection closed by peer".into()),
                };
                alive = true;
                match frame.opcode {
                    opcode::TEXT => match std::str::from_utf8(&frame.payload) {
                        Ok(text) => match Message::from_json(text) {
                            Ok(message) => hub.receive(message, client_id).await,
                            Err(e) => {
                                error!(client = %client_id, error = %e, "dropping invalid message");
                            }
                        },
                        Err(e) => {
                            error!(client = %client_id, error = %e, "dropping non-UTF-8 text frame");
                        }
                    },
                    opcode::CLOSE => return Some("close frame".into()),
                    opcode::PING => {
                        if framed.send(Frame::pong(frame.payload)).await.is_err() {
                            return Some("write failed".into());
                        }
                    }
                    opcode::PONG => {} // alive already set above
                    other => debug!(client = %client_id, opcode = other, "ignoring frame"),
                }
            }

            command = rx.recv() => match command {
                Some(ClientCommand::Deliver(message)) => match message.to_json() {
                    Ok(json) => {
                        if framed.send(Frame::text(json)).await.is_err() {
                            return Some("write failed".into());
                        }
                    }
                    Err(e) => error!(client = %client_id, error = %e, "failed to serialize outbound message"),
                },
                Some(ClientCommand::Close(reason)) => {
                    let _ = framed.send(Frame::close()).await;
                    return reason.or_else(|| Some("closed".into()));
                }
                None => return Some("hub channel closed".into()),
            },

            _ = heartbeat.tick() => {
                if !alive {
                    return Some("heartbeat timeout".into());
                }
                alive = false;
                if framed.send(Frame::ping()).await.is_err() {
                    return Some("write failed".into());
                }
            }

            _ = shutdown.changed() => {
                let _ = framed.send(Frame::close()).await;
                return Some("transport stopped".into());
            }
        }
    }
}
