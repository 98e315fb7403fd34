use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod connector;
mod exchange;
mod relay;
mod server;
mod socks5;
mod tunnel;

#[cfg(test)]
mod testutil;

use config::{Args, Config};
use connector::Socks5Dialer;
use server::Server;
use tunnel::TunnelHandler;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse()).context("invalid configuration")?;
    init_logging(config.verbose);

    let dialer = Socks5Dialer::new(config.upstream.clone(), config.connect_timeout);
    let handler = TunnelHandler::new(dialer, config.idle_timeout);
    let server = Server::bind(&config, handler)
        .await
        .with_context(|| format!("can not start http server on {}", config.listen_addr))?;

    info!(
        listen = %server.local_addr()?,
        upstream = %config.upstream.authority(),
        "http proxy ready"
    );

    tokio::select! {
        _ = server.serve() => {}
        res = signal::ctrl_c() => {
            res.context("can not listen for shutdown signal")?;
            info!("shutdown signal received");
        }
    }

    Ok(())
}
