//! Hide and Seek Client
//!
//! Headless session client: connects to the STOMP broker, follows one
//! game session and logs what happens until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hide_seek::{
    ClientConfig, GameSession, StompTransport, TransportSlot, VERSION,
    game::hooks::Collaborators,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Hide and Seek client v{}", VERSION);

    let config = ClientConfig::from_env();
    info!(server = %config.server_url, room = %config.room_id, "Starting session");

    let slot = TransportSlot::new();
    let session = Arc::new(GameSession::new(
        config.room_id.clone(),
        config.game_destination.clone(),
        slot.handle(),
        Collaborators::default(),
        config.session.clone(),
    ));
    let (dispatch, mut failures) = session.spawn()?;

    let host = host_of(&config.server_url);
    let transport = tokio::select! {
        transport = connect_with_retry(&config.server_url, &host, config.connect_retry_interval) => Arc::new(transport),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before connecting");
            dispatch.abort();
            return Ok(());
        }
    };
    slot.fill(transport.clone());

    if let Some(player) = config.player.clone() {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.initialize_player(player).await {
                error!("Player initialization failed: {}", e);
            }
        });
    }

    loop {
        tokio::select! {
            Some(failure) = failures.recv() => {
                warn!(channel = ?failure.channel, raw = %failure.raw, "Message dropped: {}", failure.error);
            }
            _ = transport.closed() => {
                warn!("Connection lost");
                slot.clear();
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                if let Err(e) = transport.disconnect() {
                    warn!("Disconnect failed: {}", e);
                }
                break;
            }
        }
    }

    dispatch.abort();

    let state = session.snapshot().await;
    info!(
        phase = %state.phase(),
        players = state.players().count(),
        round = ?state.round(),
        "Final session state"
    );
    Ok(())
}

/// Keep trying until the broker accepts the connection.
async fn connect_with_retry(url: &str, host: &str, interval: Duration) -> StompTransport {
    loop {
        match StompTransport::connect(url, host).await {
            Ok(transport) => return transport,
            Err(e) => {
                warn!("Connection failed, retrying in {:?}: {}", interval, e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Value for the STOMP `host` header.
fn host_of(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}
