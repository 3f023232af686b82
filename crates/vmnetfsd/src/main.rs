//! vmnetfsd — opens the images named in a config document and blocks
//! until stdin closes, then shuts them down.
//!
//! ```text
//! vmnetfsd standalone --config /etc/vmnetfs/images.json
//! ```
//!
//! This binary is a minimal control plane: it does not mount a FUSE
//! filesystem, negotiate with a parent process, or expose a pseudo-file
//! tree. Those remain the job of whatever embeds `vmnetfs-core`.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use vmnetfs_core::{Image, ImageConfig};

#[derive(Parser)]
#[command(name = "vmnetfsd", about = "vmnetfs chunk I/O daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open every image in a config document and run until stdin closes.
    Standalone {
        /// Path to a JSON document with an `images` array.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct ImagesDocument {
    images: Vec<ImageConfig>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmnetfsd=debug,vmnetfs_core=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Standalone { config } => run_standalone(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vmnetfsd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_standalone(config_path: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&config_path)?;
    let document: ImagesDocument = serde_json::from_str(&raw)?;

    let mut images = Vec::with_capacity(document.images.len());
    for config in &document.images {
        let image = Image::open(config)?;
        info!(
            name = image.name(),
            size = image.image_size(),
            "image opened"
        );
        images.push(image);
    }
    info!(count = images.len(), "all images opened, awaiting shutdown");

    wait_for_stdin_eof();

    for image in &images {
        image.close();
    }
    info!("vmnetfsd stopped");
    Ok(())
}

/// Block until stdin reaches EOF (the parent process closing its end is
/// this daemon's shutdown signal, in place of a real mount-handshake
/// protocol).
fn wait_for_stdin_eof() {
    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let mut sink = String::new();
        let _ = std::io::stdin().read_to_string(&mut sink);
        let _ = tx.send(());
    });
    let _ = rx.recv();
}
