use std::sync::Arc;

use serde_json::json;
use tracing::info;

use estuary::{
    Kernel, KernelOptions, LogLevel, MeshOptions, MeshTransport, Message, RoomBroadcast,
    SignalBridge, SignalOptions, Transport, WsOptions, WsTransport,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let log_level: LogLevel = std::env::var("ESTUARY_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(log_level.to_filter().into()),
        )
        .init();

    info!("estuary — real-time messaging kernel");

    let ws_port = env_u16("ESTUARY_WS_PORT", 7070);
    let mesh_port = env_u16("ESTUARY_MESH_PORT", 9090);
    let peers: Vec<String> = std::env::var("ESTUARY_PEERS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();

    let ws = WsTransport::new(WsOptions {
        port: ws_port,
        ..Default::default()
    });
    let mesh = MeshTransport::new(MeshOptions {
        port: mesh_port,
        peers,
        ..Default::default()
    });

    let kernel = Kernel::new(KernelOptions {
        transports: vec![Arc::new(ws) as Arc<dyn Transport>, Arc::new(mesh)],
        log_level,
    });

    kernel.on("chat:join", |msg, tk| async move {
        if let Some(room) = &msg.room {
            tk.rooms().join(room).await;
        }
        Ok(())
    });
    kernel.on("chat:leave", |msg, tk| async move {
        if let Some(room) = &msg.room {
            tk.rooms().leave(room).await;
        }
        Ok(())
    });
    kernel.on("chat:message", |msg, tk| async move {
        let Some(room) = msg.room.clone() else {
            return Ok(());
        };
        let body = msg
            .payload
            .get("body")
            .cloned()
            .unwrap_or_else(|| msg.payload.clone());
        let out = Message::event(
            "chat:message",
            json!({ "from": tk.client_id(), "body": body, "room": room }),
        );
        tk.rooms()
            .broadcast(
                Some(&room),
                out,
                RoomBroadcast {
                    except_self: true,
                    ..Default::default()
                },
            )
            .await;
        Ok(())
    });
    kernel.on("presence:update", |msg, tk| async move {
        if let Some(patch) = msg.payload.as_object() {
            tk.presence().update(patch.clone()).await;
        }
        Ok(())
    });

    SignalBridge::new(SignalOptions::default()).attach(&kernel);

    kernel.start().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    kernel.stop().await;
    Ok(())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
