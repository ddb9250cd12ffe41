//! Fetch one file over HTTPS and print the raw response.
//!
//! Run with:
//! ```bash
//! cargo run -p picofetch-core --bin picofetch -- --host localhost --port 8443 --ca cert.pem
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use picofetch_core::http::body_offset;
use picofetch_core::{FetchConfig, FetchSession, Fetcher, StdStack, StdStackConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "picofetch")]
#[command(about = "Fetch one file over HTTPS, trusting a single pinned root")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server host name, also used for certificate verification
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Request path
    #[arg(long)]
    path: Option<String>,

    /// Trust anchor (PEM or DER) replacing the embedded root
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Print only what follows the blank line after the headers
    #[arg(long)]
    body_only: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => FetchConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FetchConfig::default(),
    }
    .apply_env();
    if let Some(host) = args.host {
        config.hostname = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = args.path {
        config.path = path;
    }
    if let Some(ca) = args.ca {
        config.trust_anchor_pem = None;
        config.trust_anchor_path = Some(ca);
    }

    let stack = StdStack::spawn(StdStackConfig::default()).context("failed to start network stack")?;
    let fetcher = Fetcher::new(stack, config);
    let session = FetchSession::new();
    let len = fetcher.fetch(&session)?;

    if let Ok(response) = session.http_response() {
        info!(status = response.status, reason = %response.reason, bytes = len, "done");
    }

    let raw = session.raw();
    let out = if args.body_only {
        match body_offset(&raw) {
            Some(offset) => &raw[offset..],
            None => bail!("response has no blank line after the headers"),
        }
    } else {
        &raw[..]
    };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(out)?;
    stdout.flush()?;
    Ok(())
}
