use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{CrmDb, DbHandle};
use super::feed::ChangeFeed;
use super::notify::{HttpRelayNotifier, LogNotifier, Notifier};
use super::service::CrmService;
use super::webhook::WebhookReconciler;
use super::ws;
use crate::config::LeadboardConfig;

/// How often idle change-feed channels are dropped.
const FEED_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws/pipeline-updates/{tenant_id}", get(ws::ws_handler))
        .with_state(state)
}

/// Pick the confirmation notifier for the configured relay.
pub fn notifier_for(config: &LeadboardConfig) -> Arc<dyn Notifier> {
    match &config.notifications.relay_url {
        Some(url) => Arc::new(HttpRelayNotifier::new(
            url.clone(),
            config.notifications.from_address.clone(),
        )),
        None => Arc::new(LogNotifier),
    }
}

/// Wire the service, reconciler and feed around an opened database.
pub fn build_state(config: &LeadboardConfig, db: CrmDb) -> Arc<AppState> {
    let db = DbHandle::new(db);
    let feed = ChangeFeed::new(config.pipeline.feed_capacity);
    let service = CrmService::new(db.clone(), feed.clone(), config.pipeline.board_tag_limit);
    let reconciler = WebhookReconciler::from_config(db, notifier_for(config), &config.payments);
    Arc::new(AppState {
        service,
        reconciler,
        feed,
        webhook_secret: config.payments.webhook_secret.clone(),
        signature_tolerance: config.signature_tolerance(),
    })
}

/// Open (creating if needed) the database at the configured path.
pub fn open_database(config: &LeadboardConfig) -> Result<CrmDb> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    CrmDb::new(db_path).context("Failed to initialize leadboard database")
}

/// Start the leadboard server and run until Ctrl+C.
pub async fn start_server(config: LeadboardConfig) -> Result<()> {
    let db = open_database(&config)?;
    let state = build_state(&config, db);
    if state.webhook_secret.is_none() {
        tracing::warn!("no webhook secret configured; payment webhooks will be refused");
    }

    let feed = state.feed.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FEED_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = feed.prune();
            if pruned > 0 {
                tracing::debug!(pruned, "dropped idle change feed channels");
            }
        }
    });

    let mut app = build_router(state).layer(TraceLayer::new_for_http());

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        config.server.host.as_str()
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db_path = %config.server.db_path.display(),
        "leadboard listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
