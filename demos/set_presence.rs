//! # Set Presence Example
//!
//! Demonstrates a complete presence-ipc client lifecycle:
//!
//! 1. Find the local peer and handshake with an application ID
//! 2. Publish rich presence
//! 3. Answer join requests and react to join/spectate events
//! 4. Clear presence and disconnect on Ctrl+C or when the peer goes away
//!
//! ## Running
//!
//! ```sh
//! # With the peer application running:
//! PRESENCE_APP_ID=123456789012345678 cargo run --example set_presence
//!
//! # Log every discovery attempt and frame:
//! RUST_LOG=presence_ipc=trace cargo run --example set_presence
//! ```

use presence_ipc::discovery::AttemptLogging;
use presence_ipc::{IpcConfig, JoinReply, PresenceClient, PresenceEvent};
use serde_json::json;

/// Application ID used when `PRESENCE_APP_ID` is not set.
const DEFAULT_APP_ID: &str = "123456789012345678";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let app_id = std::env::var("PRESENCE_APP_ID").unwrap_or_else(|_| DEFAULT_APP_ID.to_string());
    let mut config = IpcConfig::new(app_id);
    if tracing::enabled!(tracing::Level::DEBUG) {
        config = config.with_attempt_logging(AttemptLogging::Debug);
    }

    // ── Connect ─────────────────────────────────────────────────────
    let (client, mut events) = PresenceClient::new(config);
    client.connect().await?;
    if let Some(endpoint) = client.endpoint().await {
        tracing::info!("Connected via {endpoint}");
    }

    let started = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    client
        .set_presence(&json!({
            "state": "In the lobby",
            "details": "Waiting for players",
            "timestamps": {"start": started},
            "party": {"id": "demo-party", "size": [1, 4]},
            "secrets": {"join": "demo-join-secret"},
        }))
        .await?;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                match event {
                    PresenceEvent::Ready { user } => {
                        let name = user.map(|u| u.username).unwrap_or_else(|| "unknown".into());
                        tracing::info!("Ready as {name}");
                    }
                    PresenceEvent::ActivityJoin { secret } => {
                        tracing::info!("Join requested with secret {secret}");
                    }
                    PresenceEvent::ActivitySpectate { secret } => {
                        tracing::info!("Spectate requested with secret {secret}");
                    }
                    PresenceEvent::ActivityJoinRequest { user } => {
                        tracing::info!("{} asked to join; accepting", user.username);
                        if let Err(e) = client.reply(&user, JoinReply::Yes).await {
                            tracing::warn!("Reply failed: {e}");
                        }
                    }
                    PresenceEvent::Error { code, message } => {
                        tracing::warn!("Peer error {}: {message}", code.code());
                    }
                    PresenceEvent::Disconnected { reason } => {
                        tracing::info!("Disconnected: {reason}");
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, clearing presence");
                client.disconnect().await;
                break;
            }
        }
    }

    Ok(())
}
