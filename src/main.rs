mod auth;
mod buffer_pool;
mod config;
mod connector;
mod record;
mod relay;
mod server;
mod session;
mod tls;

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use daemonize::Daemonize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::auth::HttpAuthorizer;
use crate::config::{Cli, ProxyConfig};
use crate::server::ConsoleProxyServer;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("console_relay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    // Daemonize before the runtime exists so the forked child never
    // shares an event loop with the parent process.
    if config.daemon {
        Daemonize::new()
            .start()
            .map_err(|e| eyre!("failed to daemonize: {e}"))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        info!(
            variant = config.variant.name(),
            auth_url = %config.auth_url,
            "starting console proxy"
        );

        let authorizer = Arc::new(HttpAuthorizer::new(
            config.auth_url.clone(),
            config.auth_timeout,
        ));

        ConsoleProxyServer::new(config, authorizer).run().await
    })
}
