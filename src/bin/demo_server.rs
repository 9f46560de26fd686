//! Small end-to-end demo wiring [`edl_guard::EdlGuardLayer`] into a trivial
//! `axum::Router`, in the manner of `sem_os_server::main`: this binary is
//! the one place that installs a global `tracing_subscriber`, since the
//! library itself never does (a host-embedded plugin must not steal the
//! embedding process's logging setup).

use std::net::SocketAddr;

use axum::{routing::get, Router};
use edl_guard::{config::IpStrategy, EdlGuardConfig, EdlGuardLayer, Manager};
use tower_http::catch_panic::CatchPanicLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bootstrap_token =
        std::env::var("EDL_GUARD_BOOTSTRAP_TOKEN").unwrap_or_else(|_| String::new());

    let config = EdlGuardConfig::new(bootstrap_token).with_ip_strategy(IpStrategy::XForwardedFor, "");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string())),
        )
        .init();

    match Manager::get_or_init(config).await {
        Ok(_) => tracing::info!("edl-guard manager initialized"),
        Err(e) => {
            tracing::error!(error = %e, "edl-guard manager failed to initialize");
            return Err(e.into());
        }
    }

    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(EdlGuardLayer::new())
        .layer(CatchPanicLayer::new());

    let addr: SocketAddr = "0.0.0.0:8080".parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "demo server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
