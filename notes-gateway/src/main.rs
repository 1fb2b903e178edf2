//! Notes Gateway: realtime collaboration server for notes.
//!
//! Serves `/realtime/<note id or alias>` over WebSocket with an in-memory
//! note store. Configure with `NOTES_BIND_ADDR`, `NOTES_HANDSHAKE_RETRY_MS`
//! and `NOTES_PRESENCE_POLICY`; `RUST_LOG` controls verbosity.

use std::sync::Arc;

use log::info;
use notes_realtime::{
    AccessLevel, GatewayConfig, GrantTable, Identity, InMemoryNoteStore, RealtimeGateway,
    TokenAuthenticator,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = GatewayConfig::from_env()?;

    let store = Arc::new(InMemoryNoteStore::new());
    let welcome = store.insert(
        "Welcome",
        Some("welcome"),
        "# Welcome\n\nOpen this note in two tabs and start typing.\n",
    );
    info!("Seeded note {} (alias 'welcome')", welcome.id);

    let authenticator = Arc::new(TokenAuthenticator::new(true));
    if let Ok(token) = std::env::var("NOTES_DEMO_TOKEN") {
        authenticator.register(token, Identity::user("Demo User", "demo"));
    }
    let permissions = Arc::new(GrantTable::new(AccessLevel::Write));

    let gateway = RealtimeGateway::new(config, store, permissions, authenticator);
    let registry = gateway.registry().clone();

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            registry.shutdown();
            info!("Final stats: {:?}", registry.stats());
        }
    }
    Ok(())
}
