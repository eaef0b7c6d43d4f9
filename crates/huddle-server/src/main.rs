//! # Huddle Server
//!
//! Runs the presence and signaling relay. Media never flows through this
//! process — once two room members finish signaling, their audio and video
//! travel peer to peer.
//!
//! Account management, token issuance, and text chat live in their own
//! services; this binary only validates the tokens they issue.

use huddle_relay::RelayState;
use huddle_relay::auth::TokenAuthenticator;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = huddle_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Huddle relay v{}", env!("CARGO_PKG_VERSION"));

    let authenticator = Arc::new(TokenAuthenticator::new(config.auth.jwt_secret.clone()));
    let relay = RelayState::new(authenticator, config.relay.heartbeat_interval_ms);

    let router = huddle_relay::build_router(relay).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    tracing::info!("Signaling relay listening on ws://{addr}/signal");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
