//! Berth demonstration driver.
//!
//! Creates sandboxes on the local Docker daemon and walks through file
//! transfer, command execution and port mapping, then removes everything.
//! Configuration comes from `BERTH_*` environment variables (see
//! [`SandboxConfig::from_env`]). Ctrl-C removes all sandboxes before exiting.

mod demo;

use berth_core::{SandboxConfig, SandboxRegistry};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, demo output to stdout
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("berth=info".parse()?)
                .add_directive("berth_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SandboxConfig::from_env();
    config.validate()?;
    tracing::info!(?config, "Configuration loaded");

    let registry = SandboxRegistry::obtain(Some(config)).await?;

    tokio::select! {
        result = demo::run(&registry) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Demo failed");
            }
            let removed = registry.remove_all().await;
            tracing::info!(removed, "Cleanup complete");
            result
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, cleaning up...");
            let removed = registry.remove_all().await;
            tracing::info!(removed, "Cleanup complete");
            Ok(())
        }
    }
}
