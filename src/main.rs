use std::net::SocketAddr;
use std::process::ExitCode;

use api_gateway::config::Config;
use api_gateway::server;

/// Exit codes: 1 for configuration errors, 2 for a coordination store that
/// cannot be reached at boot.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let bind_addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, addr = %config.bind_addr, "invalid bind address");
            return ExitCode::from(1);
        }
    };

    let state = match server::build_state(config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "coordination store unreachable at startup");
            return ExitCode::from(2);
        }
    };

    let app = server::build_router(state);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %bind_addr, "failed to bind");
            return ExitCode::from(1);
        }
    };

    tracing::info!(%bind_addr, "gateway listening");

    let shutdown_notify = std::sync::Arc::new(tokio::sync::Notify::new());
    let signal_notify = shutdown_notify.clone();
    let grace_notify = shutdown_notify.clone();

    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        tracing::info!("shutdown signal received, draining in-flight requests");
        signal_notify.notify_waiters();
    };

    let serve_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal);
    tokio::pin!(serve_fut);

    tokio::select! {
        result = &mut serve_fut => {
            if let Err(err) = result {
                tracing::error!(%err, "server error");
                return ExitCode::from(1);
            }
        }
        _ = async {
            grace_notify.notified().await;
            tokio::time::sleep(server::SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!(grace = ?server::SHUTDOWN_GRACE, "graceful shutdown deadline exceeded, forcing exit");
        }
    }

    ExitCode::SUCCESS
}
