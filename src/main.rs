//! sdisk client: push a local folder to the server and pull the server's
//! copy back, or compare two trees.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;

use sdisk::cli::{ClientOpts, Command};
use sdisk::verify::compare_trees;
use sdisk::{logger, Client, FileConfig, Shutdown, UserId};

fn main() -> Result<ExitCode> {
    let opts = ClientOpts::parse();
    logger::init(opts.verbose);

    let file = FileConfig::load_or_default(opts.config.as_deref()).context("Failed to load config")?;

    match &opts.command {
        Command::NewId => {
            println!("{}", UserId::new());
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify { other, checksum } => {
            let root = opts.sync_root(&file)?;
            let diff = compare_trees(&root, other, *checksum)
                .with_context(|| format!("Failed to compare {} with {}", root.display(), other.display()))?;
            for path in &diff.missing_right {
                println!("only in {}: {path}", root.display());
            }
            for path in &diff.missing_left {
                println!("only in {}: {path}", other.display());
            }
            for path in &diff.differing {
                println!("differs: {path}");
            }
            if diff.is_clean() {
                println!("trees match");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Sync | Command::Push => {
            let config = opts.client_config(&file)?;
            let shutdown = Shutdown::new();
            let stopper = shutdown.clone();
            ctrlc::set_handler(move || {
                eprintln!("\nInterrupted, stopping...");
                stopper.trigger();
            })
            .context("Failed to set Ctrl-C handler")?;

            let server = config.server.clone();
            let mut client = Client::connect(config, shutdown)
                .with_context(|| format!("Failed to connect to {server}"))?;

            if matches!(opts.command, Command::Push) {
                let report = client.push().context("Push failed")?;
                println!(
                    "pushed {} files ({} bytes in {} chunks)",
                    report.files_sent, report.bytes_sent, report.chunks_sent
                );
            } else {
                let report = client.run().context("Sync failed")?;
                println!(
                    "pushed {} files ({} bytes), applied {} bytes in {} chunks",
                    report.files_sent, report.bytes_sent, report.bytes_applied, report.chunks_applied
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
