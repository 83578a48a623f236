use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use xpert_server::plugins::PluginRegistry;
use xpert_server::{router, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.tracing_directive())),
        )
        .init();

    let plugins = PluginRegistry::with_builtins();
    let toolsets = plugins.load(&config.plugins);
    tracing::info!(toolsets = toolsets.len(), "plugins initialized");

    // Providers are registered by deployment-specific setup; the model used
    // here replays nothing and exists so the server boots without one.
    let model = Arc::new(xpert_core::MockChatModel::with_replies(vec![]));
    let state = AppState::new(config.clone(), model);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "xpert server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
