use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use ledger_broker::api::{create_router, BrokerAppState};
use ledger_broker::config::{apply_env_overrides, load_config, BrokerConfig};
use ledger_broker::oauth::{run_state_cleanup, StateManager};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "broker.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_broker=info,tower_http=info".into()),
        )
        .init();

    info!("Ledger broker starting...");

    let config = load_broker_config()?;
    info!(
        port = config.server.port,
        storage = ?config.storage.backend,
        directory = %config.storage.directory.display(),
        "Configuration loaded"
    );

    // CSRF states + periodic cleanup
    let states = StateManager::new(
        config.oauth.state_ttl_seconds,
        config.oauth.exclusive_per_provider,
    );
    tokio::spawn(run_state_cleanup(
        states.clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let state = BrokerAppState::from_config(&config, states)?;
    let enabled: Vec<_> = state.configured().map(|k| k.to_string()).collect();
    if enabled.is_empty() {
        warn!("No provider configured; set XERO_CLIENT_ID/SECRET or QB_CLIENT_ID/SECRET");
    }

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .server
                .cors_origin
                .parse::<HeaderValue>()
                .context("Invalid CORS origin")?,
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(Arc::new(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(address = %addr, providers = ?enabled, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Ledger broker stopped");
    Ok(())
}

/// File config (`BROKER_CONFIG`, else `broker.toml` when present), then
/// environment overrides.
fn load_broker_config() -> Result<BrokerConfig> {
    let mut config = match std::env::var("BROKER_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default.exists() {
                load_config(&default)?
            } else {
                BrokerConfig::default()
            }
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
