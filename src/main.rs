//! Real-time collaborative editing relay: a WebSocket hub that hosts
//! named rooms, each backed by a shared CRDT document, and multiplexes
//! document-update and awareness traffic between their participants.
//!
//! Environment variables (see `config::Config`):
//!   RELAY_BIND_ADDR               - bind address (default 127.0.0.1:8080)
//!   RELAY_PATH                    - upgraded HTTP path (default /yjs)
//!   RELAY_ORIGIN_ALLOWLIST        - comma-separated allowed Origins
//!   RELAY_ROOM_FALLBACK           - room name when none is given
//!   RELAY_CAPACITY                - max participants per room
//!   RELAY_MAX_ROOMS               - max simultaneously live rooms
//!   RELAY_MAX_DOC_SIZE            - max serialized document size, bytes
//!   RELAY_PROTOCOL_ERROR_THRESHOLD - violations tolerated before closing a session
//!   RELAY_ROOM_QUEUE_DEPTH        - room inbound command queue depth
//!   RELAY_SESSION_QUEUE_DEPTH     - per-session outbound queue depth

mod config;
mod error;
mod protocol;
mod room;
mod session;
mod sync;

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;

use config::Config;
use room::Registry;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::from_env());
    info!(
        "collab-relay starting: bind={} path={} capacity={} max_rooms={} max_doc_size={}",
        config.bind_addr, config.relay_path, config.capacity, config.max_rooms, config.max_doc_size
    );
    if config.origin_allowlist.is_empty() {
        info!("no RELAY_ORIGIN_ALLOWLIST configured: browser origins will be rejected, non-browser clients admitted");
    }

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind listen address");
    info!("listening on ws://{}{}", config.bind_addr, config.relay_path);

    let registry = Arc::new(Registry::new(config.max_rooms));

    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let snapshot = registry.snapshot();
                info!(
                    "diagnostics: {} room(s) live: {}",
                    snapshot.len(),
                    snapshot
                        .iter()
                        .map(|(name, count)| format!("{name}={count}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        });
    }

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("failed to accept connection: {err}");
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            session::handle_connection(stream, addr, registry, config).await;
        });
    }
}
