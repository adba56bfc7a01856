use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod channel;
mod config;
mod continuation;
mod error;
mod format;
mod keys;
mod proxy;
mod state;
mod traffic;
mod validate;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Docker HEALTHCHECK entry point: no curl/wget needed in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let config_path = std::env::var("LMR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/lm-relay/config.toml"));

    let config = Config::load(&config_path);

    // RUST_LOG wins over the config file's log_level.
    let default_filter = config
        .as_ref()
        .ok()
        .and_then(|c| c.gateway.log_level.clone())
        .unwrap_or_else(|| "lm_relay=info,tower_http=warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config =
        config.with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        groups = config.groups.len(),
        "lm-relay starting"
    );

    let client_addr = SocketAddr::from(([0, 0, 0, 0], config.gateway.client_port));
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.gateway.admin_port));

    let state = Arc::new(state::AppState::new(config, config_path)?);

    // Polls the config file every 5 seconds.
    tokio::spawn(config_watcher(Arc::clone(&state)));

    let client_listener = tokio::net::TcpListener::bind(client_addr)
        .await
        .with_context(|| format!("binding client listener on {client_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {admin_addr}"))?;
    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::proxy::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET /healthz on the client port; exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LMR_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/healthz")).await?;
    std::process::exit(if resp.status().is_success() { 0 } else { 1 });
}

/// Hot reload: re-read the config when its mtime changes.
///
/// Parse failures are logged and the running config is kept; the file is
/// retried on the next change.
async fn config_watcher(state: Arc<state::AppState>) {
    let path = state.config_path.clone();
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    // The first tick fires immediately; skip it so startup is not a reload.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;

        match state.reload() {
            Ok(()) => info!(path = %path.display(), "config hot-reloaded"),
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "config reload failed; keeping previous config"),
        }
    }
}
