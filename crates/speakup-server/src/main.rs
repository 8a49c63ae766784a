mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use speakup_api::AppStateInner;
use speakup_gateway::{Gateway, connection, sweeper};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speakup=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(speakup_db::Database::open(&config.db_path)?);
    let gateway = Gateway::new(db, &config.jwt_secret, config.gateway.clone());

    // Nobody is connected yet
    match gateway.presence.reset_all().await {
        Ok(n) if n > 0 => info!("Marked {} stale presence records offline", n),
        Ok(_) => {}
        Err(e) => warn!("Presence reset failed: {}", e),
    }

    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweeper::run_sweeper(gateway.clone(), cancel.clone()));

    let app_state = AppStateInner::new(gateway.clone(), config.ice.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(speakup_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("SpeakUp server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = sweeper_task.await;
    Ok(())
}

async fn ws_upgrade(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway))
}
