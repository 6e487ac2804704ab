//! estuary — an embeddable real-time messaging kernel.
//!
//! Transports accept connections and register clients with the [`Hub`];
//! inbound messages flow through the hub into the [`Kernel`], which routes
//! them to user handlers with a per-invocation [`Toolkit`]. Two transports
//! ship in the box: a hand-rolled WebSocket server for user clients and a
//! TCP peer mesh that federates messages between sibling nodes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use estuary::{Kernel, KernelOptions, Transport, WsOptions, WsTransport};
//!
//! # async fn run() -> Result<(), estuary::TransportError> {
//! let kernel = Kernel::new(KernelOptions {
//!     transports: vec![Arc::new(WsTransport::new(WsOptions::default())) as Arc<dyn Transport>],
//!     ..Default::default()
//! });
//! kernel.on("chat:join", |msg, tk| async move {
//!     if let Some(room) = &msg.room {
//!         tk.rooms().join(room).await;
//!     }
//!     Ok(())
//! });
//! kernel.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod hub;
pub mod kernel;
pub mod message;
pub mod presence;
pub mod rooms;
pub mod signal;
pub mod toolkit;
pub mod transport;

pub use config::{KernelOptions, LogLevel};
pub use hub::{ClientCommand, ClientContext, Hub, HubEvent};
pub use kernel::{HandlerError, Kernel, TemplateError};
pub use message::{Message, Target};
pub use presence::ClientSnapshot;
pub use signal::{SignalBridge, SignalOptions};
pub use toolkit::{RoomBroadcast, Toolkit};
pub use transport::mesh::{MeshOptions, MeshTransport};
pub use transport::ws::{WsOptions, WsTransport};
pub use transport::{Transport, TransportError};
