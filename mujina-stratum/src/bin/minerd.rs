//! Main entry point for the mujina-stratum daemon.

use mujina_stratum::{config::Config, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    tracing::init(&config.log);

    Daemon::new(config).run().await
}
