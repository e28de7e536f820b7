use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sdisk::cli::DaemonOpts;
use sdisk::{logger, FileConfig, Server, Shutdown};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    logger::init(opts.verbose);

    let file = FileConfig::load_or_default(opts.config.as_deref()).context("Failed to load config")?;
    let config = opts.server_config(&file)?;

    if config.bind.starts_with("0.0.0.0") {
        warn!(bind = %config.bind, "listening on all interfaces; the protocol is unauthenticated");
    }

    let shutdown = Shutdown::new();
    let stopper = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        stopper.trigger();
    })
    .context("Failed to set Ctrl-C handler")?;

    let bind = config.bind.clone();
    let server = Server::bind(config, shutdown).with_context(|| format!("Failed to start server on {bind}"))?;
    let handle = server.handle();
    let runner = std::thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || server.run())
        .context("Failed to spawn server thread")?;

    for user in &opts.prepare {
        handle
            .prepare_disk(opts.disk_size, *user)
            .with_context(|| format!("Failed to queue disk for {user}"))?;
    }

    match runner.join() {
        Ok(result) => result.context("Server stopped with an error"),
        Err(_) => anyhow::bail!("Server thread panicked"),
    }
}
