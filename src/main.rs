//! NetOps Assist - rule-based chat support for the NetOps Center dashboard
//!
//! Each conversation runs as its own controller task: user text is
//! recorded immediately, answered from a keyword rule catalog, and the
//! reply lands in the transcript after a simulated typing delay.

mod api;
mod config;
mod rules;
mod runtime;
mod state_machine;
mod transcript;

use api::{create_router, AppState};
use config::AppConfig;
use rules::RuleMatcher;
use runtime::ConversationSettings;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netops_assist=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let config = AppConfig::from_env();

    // A bad catalog is fatal; the service never runs without a fallback
    let catalog = config.load_catalog()?;
    tracing::info!(
        rules = catalog.rule_set.len(),
        greeting = catalog.greeting.is_some(),
        reply_delay_ms = u64::try_from(config.reply_delay.as_millis()).unwrap_or(u64::MAX),
        "Rule catalog loaded"
    );

    let state = AppState::new(ConversationSettings {
        matcher: Arc::new(RuleMatcher::new(catalog.rule_set)),
        reply_delay: config.reply_delay,
        greeting: catalog.greeting,
        idle_timeout: config.idle_timeout,
    });
    let runtime = state.runtime.clone();

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("NetOps Assist listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends every open SSE stream and cancels outstanding replies
            runtime.close_all().await;
        })
        .await?;

    tracing::info!("Server shut down");

    Ok(())
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT - shutting down"),
        () = terminate => tracing::info!("Received SIGTERM - shutting down"),
    }
}
