/// Dispatch kernel — handler registry, transport lifecycle, and the single
/// dispatch worker that routes hub events to user handlers.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{KernelOptions, LogLevel};
use crate::hub::{Hub, HubEvent};
use crate::message::{Message, SYSTEM_ACK, SYSTEM_ERROR, SYSTEM_REPLY};
use crate::presence::ClientSnapshot;
use crate::toolkit::Toolkit;
use crate::transport::{Transport, TransportError};

/// Application-level handler error. Failures are isolated: logged, reported
/// to the originator as `system:error`, and the remaining handlers run.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// A registered handler. Invoked with the dispatched message and a toolkit
/// bound to the originating client.
pub type Handler = Arc<dyn Fn(Message, Toolkit) -> HandlerFuture + Send + Sync>;

/// Errors from template-based handler registration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template has {placeholders} placeholders but {params} parameters were supplied")]
    Mismatch { placeholders: usize, params: usize },
    #[error("unterminated placeholder in template")]
    Unterminated,
}

/// Substitute bracketed placeholders (`chat:join:[roomId]`) in order with
/// the supplied parameters. The counts must match exactly.
pub fn expand_template(template: &str, params: &[&str]) -> Result<String, TemplateError> {
    let placeholders = template.matches('[').count();
    if placeholders != params.len() {
        return Err(TemplateError::Mismatch {
            placeholders,
            params: params.len(),
        });
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut next = params.iter();
    while let Some(start) = rest.find('[') {
        let end = match rest[start..].find(']') {
            Some(offset) => start + offset,
            None => return Err(TemplateError::Unterminated),
        };
        out.push_str(&rest[..start]);
        // Counts already matched, so the iterator cannot run dry.
        if let Some(param) = next.next() {
            out.push_str(param);
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Default)]
struct HandlerRegistry {
    /// Ordered handlers per event type.
    typed: HashMap<String, Vec<Handler>>,
    /// Wildcard handlers, applied after the typed ones for every event.
    wildcard: Vec<Handler>,
}

pub struct Kernel {
    hub: Arc<Hub>,
    handlers: Arc<StdRwLock<HandlerRegistry>>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    log_level: LogLevel,
    started: AtomicBool,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<HubEvent>>>,
    worker: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<HubEvent>>>>,
    shutdown: watch::Sender<bool>,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Self {
        let (hub, inbox) = Hub::new();
        let (shutdown, _) = watch::channel(false);
        Self {
            hub,
            handlers: Arc::new(StdRwLock::new(HandlerRegistry::default())),
            transports: Mutex::new(options.transports),
            log_level: options.log_level,
            started: AtomicBool::new(false),
            inbox: Mutex::new(Some(inbox)),
            worker: Mutex::new(None),
            shutdown,
        }
    }

    /// The hub clients, rooms, and presence live in. Custom transports
    /// receive this on start; embedders may also drive it directly.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Register a handler for an event type, or for every event with `"*"`.
    /// The reserved `system:*` types cannot be shadowed; registering one is
    /// ignored with a warning.
    pub fn on<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Message, Toolkit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if matches!(kind, SYSTEM_ACK | SYSTEM_ERROR | SYSTEM_REPLY) {
            warn!(kind, "refusing to register handler for reserved event type");
            return;
        }
        let handler: Handler =
            Arc::new(move |msg, tk| -> HandlerFuture { Box::pin(handler(msg, tk)) });
        let mut reg = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if kind == "*" {
            reg.wildcard.push(handler);
        } else {
            reg.typed.entry(kind.to_owned()).or_default().push(handler);
        }
    }

    /// Register a handler for an event template with bracketed placeholders,
    /// substituted in order with `params`.
    pub fn on_template<F, Fut>(
        &self,
        template: &str,
        params: &[&str],
        handler: F,
    ) -> Result<(), TemplateError>
    where
        F: Fn(Message, Toolkit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let kind = expand_template(template, params)?;
        self.on(&kind, handler);
        Ok(())
    }

    /// Add a transport. If the kernel is already running, the transport is
    /// started immediately.
    pub async fn use_transport(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        self.transports.lock().await.push(Arc::clone(&transport));
        if self.started.load(Ordering::SeqCst) {
            transport.start(Arc::clone(&self.hub)).await?;
        }
        Ok(())
    }

    /// Start the dispatch worker and every transport, in parallel.
    /// Idempotent; a transport start failure is fatal and unwinds the rest.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        if let Some(inbox) = self.inbox.lock().await.take() {
            let handle = tokio::spawn(dispatch_loop(
                Arc::clone(&self.hub),
                Arc::clone(&self.handlers),
                inbox,
                self.shutdown.subscribe(),
            ));
            *self.worker.lock().await = Some(handle);
        }

        let transports = self.transports.lock().await.clone();
        let results =
            futures::future::join_all(transports.iter().map(|t| t.start(Arc::clone(&self.hub))))
                .await;
        for result in results {
            if let Err(e) = result {
                futures::future::join_all(transports.iter().map(|t| t.stop())).await;
                self.halt_worker().await;
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every transport (closing their connections, which emits one
    /// disconnect per client), then the dispatch worker.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let transports = self.transports.lock().await.clone();
        futures::future::join_all(transports.iter().map(|t| t.stop())).await;
        self.halt_worker().await;
    }

    async fn halt_worker(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.worker.lock().await.take() {
            if let Ok(inbox) = handle.await {
                *self.inbox.lock().await = Some(inbox);
            }
        }
    }

    /// Read-only presence view.
    pub async fn presence(&self) -> Vec<ClientSnapshot> {
        self.hub.presence_list().await
    }

    /// Names of rooms with at least one member.
    pub async fn rooms(&self) -> Vec<String> {
        self.hub.room_names().await
    }

    /// Members of a room.
    pub async fn room_members(&self, room: &str) -> Vec<String> {
        self.hub.room_members(room).await
    }
}

/// The single dispatch worker. Draining one channel from one task keeps
/// handlers strictly sequential per message and preserves per-client FIFO.
/// Returns the inbox so a stopped kernel can be started again.
async fn dispatch_loop(
    hub: Arc<Hub>,
    handlers: Arc<StdRwLock<HandlerRegistry>>,
    mut inbox: mpsc::UnboundedReceiver<HubEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<HubEvent> {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            event = inbox.recv() => match event {
                None => break,
                Some(HubEvent::Connected { id }) => {
                    debug!(client = %id, "client connected");
                }
                Some(HubEvent::Disconnected { id, reason }) => {
                    debug!(client = %id, ?reason, "client disconnected");
                }
                Some(HubEvent::Message { message, client_id }) => {
                    dispatch(&hub, &handlers, message, client_id).await;
                }
            },
        }
    }
    inbox
}

async fn dispatch(
    hub: &Arc<Hub>,
    handlers: &StdRwLock<HandlerRegistry>,
    message: Message,
    client_id: String,
) {
    let matched: Vec<Handler> = {
        let reg = handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut matched = reg
            .typed
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();
        matched.extend(reg.wildcard.iter().cloned());
        matched
    };

    if matched.is_empty() {
        debug!(client = %client_id, kind = %message.kind, "no handlers for message");
        if message.wants_ack() {
            hub.send(&client_id, Message::ack(message.ack.clone())).await;
        }
        return;
    }

    // The client may have raced a disconnect; its presence entry is the
    // authority on whether dispatch proceeds.
    let Some(snapshot) = hub.presence_get(&client_id).await else {
        return;
    };

    let toolkit = Toolkit::new(Arc::clone(hub), snapshot.id, message.room.clone());
    let ack = message.ack.clone();
    let wants_ack = message.wants_ack();

    for handler in matched {
        if let Err(error) = handler(message.clone(), toolkit.clone()).await {
            warn!(client = %client_id, kind = %message.kind, %error, "handler failed");
            hub.send(
                &client_id,
                Message::error("Internal handler error", Some(error.to_string())),
            )
            .await;
        }
    }

    if wants_ack {
        hub.send(&client_id, Message::ack(ack)).await;
    }
}
