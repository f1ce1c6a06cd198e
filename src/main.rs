use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use rss_digest::config::{ConfigStore, TomlConfigStore};
use rss_digest::digest::{Renderer, SmtpMailer};
use rss_digest::feed::build_client;
use rss_digest::runner::{run_once, RunOptions};

/// Get the default config file path (~/.config/rss-digest/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("rss-digest")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(
    name = "rss-digest",
    about = "Mail new RSS/Atom items as an HTML digest, one run per invocation"
)]
struct Args {
    /// Config file (default: ~/.config/rss-digest/config.toml)
    #[arg(value_name = "CONFIG", env = "RSS_DIGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Render digests without sending mail or saving watermarks
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    // Config errors are fatal: nothing has been fetched or sent yet.
    let store = TomlConfigStore::new(config_path);
    let config = store
        .load()
        .with_context(|| format!("Failed to load config from {}", store.path().display()))?;

    let renderer = Arc::new(
        Renderer::for_mode(config.descriptions).context("Failed to prepare digest template")?,
    );
    let client = build_client().context("Failed to create HTTP client")?;
    let mailer = SmtpMailer::new(config.from.clone());

    let report = run_once(
        &config,
        &store,
        &mailer,
        &client,
        renderer,
        RunOptions {
            dry_run: args.dry_run,
        },
    )
    .await;

    if report.failed() > 0 {
        tracing::warn!(
            failed = report.failed(),
            "Some sources failed; their items will be retried next run"
        );
    }
    Ok(())
}
