#![doc = include_str!("../README.md")]

pub mod airlock;
pub mod config;
pub mod logging;
pub mod lsp;
pub mod marks;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log in to the ship, subscribe to the agent and serve LSP on stdio until
/// the editor disconnects.
pub async fn run(config: Config) -> Result<()> {
    let delay = config.server.startup_delay();
    if !delay.is_zero() {
        info!(delay_ms = config.server.delay_ms, "waiting before connecting");
        tokio::time::sleep(delay).await;
    }

    let base = config.ship.base_url()?;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build HTTP client")?;

    let cookie = airlock::login(&http, &base, &config.ship.code)
        .await
        .with_context(|| format!("failed to log in to {base}"))?;

    let channel = airlock::Channel::new(http, &base, cookie, config.server.reconnect_delay())?;
    info!(url = %channel.url(), "opened channel");

    let agent = Arc::new(lsp::Agent::new(
        channel,
        &config.ship.name,
        &config.ship.app,
    ));
    let updates = agent
        .subscribe(&config.ship.path)
        .await
        .with_context(|| format!("failed to subscribe to %{}", config.ship.app))?;

    let bridge = Arc::new(lsp::Bridge::new(
        agent,
        lsp::BridgeOptions::from(&config.server),
    ));
    lsp::serve_stdio(bridge, updates).await;
    info!("editor disconnected");
    Ok(())
}
