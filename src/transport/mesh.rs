/// Peer-mesh transport — TCP federation between sibling nodes.
///
/// Each node listens on a TCP port and dials its configured peers. Frames
/// are UTF-8 lines, each a JSON envelope: `{"kind":"hello","nodeId":…}` for
/// the identity handshake, `{"kind":"message","message":…}` afterwards.
/// A remote node is surfaced locally as one synthetic hub client with id
/// `mesh:<nodeId>`; duplicate connections to the same node are closed
/// immediately, and configured peer addresses are redialed on a fixed
/// interval for as long as the transport runs.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::future::BoxFuture;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::hub::{ClientCommand, ClientContext, Hub};
use crate::message::Message;
use crate::transport::{Transport, TransportError};

/// Maximum envelope line length.
const MAX_LINE_LENGTH: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// Stable identity of this node on the mesh.
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// `host:port` targets to dial and keep redialing.
    pub peers: Vec<String>,
    pub reconnect_interval: Duration,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            host: "0.0.0.0".into(),
            port: 9090,
            peers: Vec::new(),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// The sole on-the-wire type — one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// Identity exchange — first line on every connection.
    Hello {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// A federated message.
    Message { message: Message },
}

#[derive(Debug, thiserror::Error)]
pub enum NdjsonError {
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream into newline-delimited UTF-8 lines.
///
/// Empty lines and non-UTF-8 lines are skipped; an over-long line without a
/// newline errors the connection.
#[derive(Debug)]
pub struct NdjsonCodec {
    max_line: usize,
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self {
            max_line: MAX_LINE_LENGTH,
        }
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = NdjsonError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let line = src.split_to(pos);
                    src.advance(1); // skip \n
                    match std::str::from_utf8(&line) {
                        Ok(s) => {
                            let s = s.trim_end_matches('\r');
                            if s.is_empty() {
                                continue;
                            }
                            return Ok(Some(s.to_owned()));
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping non-UTF-8 mesh line");
                            continue;
                        }
                    }
                }
                None => {
                    if src.len() > self.max_line {
                        return Err(NdjsonError::LineTooLong(self.max_line));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = NdjsonError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Normalize a configured peer target into a dialable `host:port` string.
///
/// Anything that already parses as a socket address — `1.2.3.4:9090`,
/// `[::1]:9090` — passes through untouched. A bracketed IPv6 literal or a
/// hostname without a numeric port gets the transport's default port
/// appended; `hostname:port` keeps its explicit port.
fn dial_target(peer: &str, default_port: u16) -> String {
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_owned();
    }
    if peer.starts_with('[') && peer.ends_with(']') {
        return format!("{peer}:{default_port}");
    }
    let has_explicit_port = peer
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.contains(':') && port.parse::<u16>().is_ok());
    if has_explicit_port {
        peer.to_owned()
    } else {
        format!("{peer}:{default_port}")
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct MeshTransport {
    inner: Arc<MeshShared>,
}

struct MeshShared {
    opts: MeshOptions,
    shutdown: watch::Sender<bool>,
    local_addr: StdMutex<Option<SocketAddr>>,
    /// Live peers: remote node id → outbound channel of its session.
    ready: Mutex<HashMap<String, mpsc::UnboundedSender<ClientCommand>>>,
    /// Node id last seen at each configured dial address, learned from the
    /// hello. Lets the dial loop skip addresses whose node already has a
    /// live session, whichever side opened it.
    peer_nodes: Mutex<HashMap<String, String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MeshTransport {
    pub fn new(opts: MeshOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(MeshShared {
                opts,
                shutdown,
                local_addr: StdMutex::new(None),
                ready: Mutex::new(HashMap::new()),
                peer_nodes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// This node's identity on the mesh.
    pub fn node_id(&self) -> &str {
        &self.inner.opts.node_id
    }

    /// The address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forward a message to every ready peer.
    pub async fn broadcast(&self, message: Message) -> usize {
        let ready = self.inner.ready.lock().await;
        let mut sent = 0;
        for tx in ready.values() {
            if tx.send(ClientCommand::Deliver(message.clone())).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    async fn start_inner(&self, hub: Arc<Hub>) -> Result<(), TransportError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);

        let addr = format!("{}:{}", self.inner.opts.host, self.inner.opts.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            self.inner.started.store(false, Ordering::SeqCst);
            TransportError::Bind { addr: addr.clone(), source }
        })?;
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner()) =
            listener.local_addr().ok();
        info!(node = %self.inner.opts.node_id, %addr, "mesh transport listening");

        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            Arc::clone(&hub),
        )));
        for peer in &self.inner.opts.peers {
            tasks.push(tokio::spawn(dial_loop(
                Arc::clone(&self.inner),
                Arc::clone(&hub),
                dial_target(peer, self.inner.opts.port),
            )));
        }
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

impl Transport for MeshTransport {
    fn name(&self) -> &'static str {
        "mesh"
    }

    fn start(&self, hub: Arc<Hub>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.start_inner(hub))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }
}

async fn accept_loop(inner: Arc<MeshShared>, listener: TcpListener, hub: Arc<Hub>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        // A stop signalled before we subscribed is only visible by value.
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming mesh connection");
                    let conn_inner = Arc::clone(&inner);
                    let hub = Arc::clone(&hub);
                    let handle = tokio::spawn(async move {
                        peer_session(conn_inner, hub, stream, None).await;
                    });
                    inner.tasks.lock().await.push(handle);
                }
                Err(e) => warn!(error = %e, "accept error"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Whether the node known to live at a dial address currently has a live
/// session, whichever side opened it.
async fn has_live_session(inner: &MeshShared, addr: &str) -> bool {
    let node = inner.peer_nodes.lock().await.get(addr).cloned();
    match node {
        Some(id) => inner.ready.lock().await.contains_key(&id),
        None => false,
    }
}

/// Dial loop for one configured peer address. Redials on a fixed interval
/// after every session end or dial failure, but never while a live
/// connection to the node known at this address exists.
async fn dial_loop(inner: Arc<MeshShared>, hub: Arc<Hub>, addr: String) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }

        if !has_live_session(&inner, &addr).await {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    debug!(%addr, "mesh dial connected");
                    peer_session(
                        Arc::clone(&inner),
                        Arc::clone(&hub),
                        stream,
                        Some(addr.clone()),
                    )
                    .await;
                }
                Err(e) => debug!(%addr, error = %e, "mesh dial failed"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.opts.reconnect_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn send_envelope(
    framed: &mut Framed<TcpStream, NdjsonCodec>,
    envelope: &Envelope,
) -> Result<(), NdjsonError> {
    match serde_json::to_string(envelope) {
        Ok(line) => framed.send(line).await,
        Err(e) => {
            error!(error = %e, "failed to serialize mesh envelope");
            Ok(())
        }
    }
}

/// Drive one mesh connection. `dial_addr` is set for outbound connections;
/// the dialer speaks its hello first, the acceptor replies on receipt.
async fn peer_session(
    inner: Arc<MeshShared>,
    hub: Arc<Hub>,
    stream: TcpStream,
    dial_addr: Option<String>,
) {
    let outbound = dial_addr.is_some();
    let addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let mut framed = Framed::new(stream, NdjsonCodec::default());
    let mut shutdown = inner.shutdown.subscribe();

    if outbound {
        let hello = Envelope::Hello {
            node_id: inner.opts.node_id.clone(),
        };
        if send_envelope(&mut framed, &hello).await.is_err() {
            return;
        }
    }

    // Handshake: wait for the remote hello.
    let remote_id = loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => match serde_json::from_str::<Envelope>(&line) {
                    Ok(Envelope::Hello { node_id }) => break node_id,
                    Ok(_) => continue, // message before hello — not yet ready, ignore
                    Err(e) => {
                        warn!(%addr, error = %e, "dropping invalid mesh line");
                        continue;
                    }
                },
                Some(Err(e)) => {
                    warn!(%addr, error = %e, "mesh connection error before hello");
                    return;
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    };

    // Remember which node answers at this address, so the dial loop can
    // tell when the peer is already connected through either side.
    if let Some(dial) = &dial_addr {
        inner
            .peer_nodes
            .lock()
            .await
            .insert(dial.clone(), remote_id.clone());
    }

    if !outbound {
        let hello = Envelope::Hello {
            node_id: inner.opts.node_id.clone(),
        };
        if send_envelope(&mut framed, &hello).await.is_err() {
            return;
        }
    }

    // At most one live connection per remote node.
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut ready = inner.ready.lock().await;
        if ready.contains_key(&remote_id) {
            info!(peer = %remote_id, %addr, "duplicate mesh connection, closing");
            return;
        }
        ready.insert(remote_id.clone(), tx.clone());
    }

    let client_id = format!("mesh:{remote_id}");
    let mut metadata = Map::new();
    metadata.insert("nodeId".into(), json!(remote_id.clone()));
    hub.register_client(ClientContext::new(client_id.clone(), "mesh", metadata, tx))
        .await;
    info!(peer = %remote_id, %addr, outbound, "mesh peer ready");

    let reason = loop {
        if *shutdown.borrow() {
            break Some("transport stopped".to_owned());
        }
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => match serde_json::from_str::<Envelope>(&line) {
                    Ok(Envelope::Message { message }) => {
                        if message.kind.is_empty() {
                            error!(peer = %remote_id, "dropping mesh message with empty type");
                        } else {
                            hub.receive(message, &client_id).await;
                        }
                    }
                    Ok(Envelope::Hello { .. }) => {} // redundant hello
                    Err(e) => warn!(peer = %remote_id, error = %e, "dropping invalid mesh line"),
                },
                Some(Err(e)) => {
                    warn!(peer = %remote_id, error = %e, "mesh connection error");
                    break Some("connection error".to_owned());
                }
                None => break Some("connection closed by peer".to_owned()),
            },

            command = rx.recv() => match command {
                Some(ClientCommand::Deliver(message)) => {
                    let envelope = Envelope::Message { message };
                    if send_envelope(&mut framed, &envelope).await.is_err() {
                        break Some("write failed".to_owned());
                    }
                }
                Some(ClientCommand::Close(reason)) => {
                    break reason.or_else(|| Some("closed".to_owned()));
                }
                None => break Some("hub channel closed".to_owned()),
            },

            _ = shutdown.changed() => break Some("transport stopped".to_owned()),
        }
    };

    hub.unregister_client(&client_id, reason).await;
    inner.ready.lock().await.remove(&remote_id);
    info!(peer = %remote_id, %addr, "mesh peer closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    // ── Envelope ─────────────────────────────────────────────────

    #[test]
    fn hello_wire_shape_is_exact() {
        let envelope = Envelope::Hello {
            node_id: "3f2b".into(),
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"kind":"hello","nodeId":"3f2b"}"#
        );
    }

    #[test]
    fn hello_round_trip() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"kind":"hello","nodeId":"abc"}"#).unwrap();
        assert_eq!(
            parsed,
            Envelope::Hello {
                node_id: "abc".into()
            }
        );
    }

    #[test]
    fn message_envelope_round_trip() {
        let envelope = Envelope::Message {
            message: Message::event("chat:message", serde_json::json!({"body": "hi"})),
        };
        let line = serde_json::to_string(&envelope).unwrap();
        assert!(line.starts_with(r#"{"kind":"message""#));
        let back: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn unknown_kind_fails() {
        assert!(serde_json::from_str::<Envelope>(r#"{"kind":"bogus"}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"{"nodeId":"x"}"#).is_err());
    }

    // ── Line codec ───────────────────────────────────────────────

    #[test]
    fn decode_splits_lines() {
        let mut codec = NdjsonCodec::default();
        let mut buf = BytesMut::from("one\ntwo\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("one"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("two"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_skips_empty_lines() {
        let mut codec = NdjsonCodec::default();
        let mut buf = BytesMut::from("\n\r\n{\"kind\":\"hello\",\"nodeId\":\"x\"}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some(r#"{"kind":"hello","nodeId":"x"}"#)
        );
    }

    #[test]
    fn decode_waits_for_newline() {
        let mut codec = NdjsonCodec::default();
        let mut buf = BytesMut::from("partial");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b" line\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("partial line"));
    }

    #[test]
    fn decode_rejects_oversized_line() {
        let mut codec = NdjsonCodec { max_line: 8 };
        let mut buf = BytesMut::from(&b"way too long without newline"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            NdjsonError::LineTooLong(8)
        ));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = NdjsonCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("{}".to_owned(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{}\n");
    }

    // ── Peer target normalization ────────────────────────────────

    #[test]
    fn dial_target_appends_default_port() {
        assert_eq!(dial_target("node-a", 9090), "node-a:9090");
        assert_eq!(dial_target("[::1]", 9090), "[::1]:9090");
    }

    #[test]
    fn dial_target_keeps_explicit_port() {
        assert_eq!(dial_target("node-a:1234", 9090), "node-a:1234");
        assert_eq!(dial_target("10.0.0.1:9091", 9090), "10.0.0.1:9091");
        assert_eq!(dial_target("[::1]:9091", 9090), "[::1]:9091");
    }

    // ── Options ──────────────────────────────────────────────────

    #[test]
    fn default_node_id_is_fresh_uuid() {
        let a = MeshOptions::default();
        let b = MeshOptions::default();
        assert_ne!(a.node_id, b.node_id);
        assert!(Uuid::parse_str(&a.node_id).is_ok());
        assert_eq!(a.port, 9090);
        assert_eq!(a.reconnect_interval, Duration::from_secs(5));
    }

    #[test]
    fn metadata_value_shape() {
        // The synthetic client's metadata carries the bare node id.
        let mut metadata = Map::new();
        metadata.insert("nodeId".into(), json!("abc"));
        assert_eq!(metadata.get("nodeId"), Some(&Value::String("abc".into())));
    }
}
