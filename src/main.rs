//! Scriptorium -- collaborative document editing server.
//!
//! Thin binary shell: initialize structured logging, load configuration from
//! the environment, and hand off to the library's server loop.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = scriptorium::config::Config::from_env()?;
    tracing::info!(component = "server", port = config.listen_port, "starting scriptorium");

    if let Err(err) = scriptorium::run(config).await {
        tracing::error!(component = "server", error = %err, "fatal error, shutting down");
        return Err(err.into());
    }

    Ok(())
}
