/// Transport seam — anything that accepts connections, registers clients
/// with the hub, and writes outbound messages to the wire.
///
/// Transports hold a reference to the hub only; they never reach into the
/// kernel. The trait is object-safe via boxed futures so the kernel can
/// hold a heterogeneous set.
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::hub::Hub;

pub mod mesh;
pub mod ws;

/// Fatal transport errors, surfaced out of `Kernel::start`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait Transport: Send + Sync {
    /// Tag stamped onto clients this transport registers.
    fn name(&self) -> &'static str;

    /// Start accepting connections, registering clients with the hub.
    /// A second call on a running transport is a no-op.
    fn start(&self, hub: Arc<Hub>) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close all connections (emitting one disconnect per registered
    /// client) and stop accepting. Resolves once everything is down.
    fn stop(&self) -> BoxFuture<'_, ()>;
}
