use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use spanlink::link::config;
use spanlink::link::server::{self, NetworkEvent, NetworkState, SERVER_DESC, SERVER_NAME};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let name = SERVER_NAME.clone();
    info!(server = %name, "spanlink starting");

    let blocks = config::blocks_from_env();
    info!(links = blocks.len(), "link configuration loaded");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let state = Arc::new(RwLock::new(NetworkState::new(
        &name,
        &SERVER_DESC,
        blocks,
        event_tx,
        server::unix_now(),
    )));

    // Drain events: topology changes are logged here; Dispatch lines
    // would be handed to the command dispatcher in a full daemon.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NetworkEvent::ServerLinked { name, via } => {
                    info!(server = %name, %via, "server joined the network")
                }
                NetworkEvent::ServerLost { name } => {
                    info!(server = %name, "server leaving the network")
                }
                NetworkEvent::SplitComplete { name, servers_lost, users_lost } => {
                    info!(server = %name, servers_lost, users_lost, "netsplit finished")
                }
                NetworkEvent::Dispatch { from, message } => {
                    info!(%from, command = %message.command, "unhandled server command")
                }
            }
        }
    });

    server::autoconnect_pass(&state).await;

    let bind = std::env::var("SPANLINK_BIND").unwrap_or_else(|_| "127.0.0.1:7000".to_string());
    server::run(state, &[&bind]).await?;
    Ok(())
}
