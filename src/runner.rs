//! One digest run: fan out over every source, join, then deliver and commit
//! in configuration order.
//!
//! ```text
//! Idle → Dispatching → Collecting → (Delivering → Committing)* → Done
//! ```
//!
//! Fetch, parse and render run concurrently, one task per source. Nothing is
//! mailed until every task has finished. Delivery and watermark commits then
//! happen one source at a time in the order the config file lists them, so a
//! run that fails halfway leaves a predictable prefix of watermarks advanced.
//!
//! A watermark moves only after its digest was accepted by the SMTP server.
//! A failed send leaves it in place and the same items go out next run.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, ConfigError, ConfigStore, FeedSource};
use crate::digest::{Digest, MailError, Mailer, RenderError, Renderer};
use crate::feed::{fetch, parse, FetchError, ParseError};

/// Why a source produced no digest this run.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Render(#[from] RenderError),
    /// The per-source task panicked or was cancelled.
    #[error("Source task failed: {0}")]
    Task(String),
}

/// Final state of one source after a run.
#[derive(Debug)]
pub enum SourceStatus {
    /// Mailed and watermark committed.
    Delivered {
        items: usize,
        new_watermark: DateTime<Utc>,
    },
    /// Rendered but neither mailed nor committed (dry run).
    Rendered {
        items: usize,
        new_watermark: DateTime<Utc>,
    },
    /// No item newer than the watermark.
    NothingNew,
    /// Fetch, parse or render failed.
    Failed(SourceError),
    /// SMTP refused the digest. Watermark unchanged.
    MailFailed(MailError),
    /// Mailed, but the watermark could not be written. The items will be
    /// sent again next run.
    CommitFailed(ConfigError),
}

#[derive(Debug)]
pub struct SourceReport {
    pub source: String,
    pub status: SourceStatus,
}

/// Outcome of every source, in configuration order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn delivered(&self) -> usize {
        self.sources
            .iter()
            .filter(|r| matches!(r.status, SourceStatus::Delivered { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.sources
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    SourceStatus::Failed(_)
                        | SourceStatus::MailFailed(_)
                        | SourceStatus::CommitFailed(_)
                )
            })
            .count()
    }

    pub fn status(&self, source: &str) -> Option<&SourceStatus> {
        self.sources
            .iter()
            .find(|r| r.source == source)
            .map(|r| &r.status)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Render digests but skip mail and watermark commits.
    pub dry_run: bool,
}

/// Subject line for a digest.
pub fn subject_for(digest: &Digest) -> String {
    format!("{} by rss-digest", digest.title)
}

/// Runs every configured source once.
///
/// Per-source failures are logged and recorded in the report; they never
/// stop other sources. The report lists sources in configuration order.
pub async fn run_once<S, M>(
    config: &Config,
    store: &S,
    mailer: &M,
    client: &reqwest::Client,
    renderer: Arc<Renderer>,
    options: RunOptions,
) -> RunReport
where
    S: ConfigStore + ?Sized,
    M: Mailer,
{
    if config.sources.is_empty() {
        return RunReport::default();
    }

    // Dispatching: one task per source.
    let handles: Vec<_> = config
        .sources
        .iter()
        .cloned()
        .map(|source| {
            let client = client.clone();
            let renderer = Arc::clone(&renderer);
            tokio::spawn(async move { prepare(&client, &renderer, &source).await })
        })
        .collect();

    // Collecting: wait for exactly one outcome per source.
    let outcomes = join_all(handles).await;
    tracing::debug!(sources = outcomes.len(), "All sources collected");

    let mut report = RunReport::default();
    for (source, outcome) in config.sources.iter().zip(outcomes) {
        let outcome = outcome.unwrap_or_else(|e| Err(SourceError::Task(e.to_string())));

        let status = match outcome {
            Ok(Some(digest)) => deliver(config, store, mailer, source, digest, options).await,
            Ok(None) => {
                tracing::info!(source = %source.name, "Nothing new");
                SourceStatus::NothingNew
            }
            Err(e) => {
                tracing::warn!(source = %source.name, url = %source.url, error = %e, "Source failed");
                SourceStatus::Failed(e)
            }
        };

        report.sources.push(SourceReport {
            source: source.name.clone(),
            status,
        });
    }

    tracing::info!(
        sources = report.sources.len(),
        delivered = report.delivered(),
        failed = report.failed(),
        "Run finished"
    );
    report
}

async fn prepare(
    client: &reqwest::Client,
    renderer: &Renderer,
    source: &FeedSource,
) -> Result<Option<Digest>, SourceError> {
    let bytes = fetch(client, &source.url).await?;
    let feed = parse(&bytes, source.watermark, &source.name)?;
    let new_watermark = feed.next_watermark(source.watermark);
    Ok(renderer.render(&feed, new_watermark)?)
}

// Delivering, then Committing for one source.
async fn deliver<S, M>(
    config: &Config,
    store: &S,
    mailer: &M,
    source: &FeedSource,
    digest: Digest,
    options: RunOptions,
) -> SourceStatus
where
    S: ConfigStore + ?Sized,
    M: Mailer,
{
    let items = digest.item_count;
    let new_watermark = digest.new_watermark;

    if options.dry_run {
        tracing::info!(
            source = %source.name,
            items = items,
            watermark = %new_watermark,
            "Dry run: digest rendered, not sent"
        );
        return SourceStatus::Rendered {
            items,
            new_watermark,
        };
    }

    let subject = subject_for(&digest);
    if let Err(e) = mailer
        .send(&config.smtp, &config.email, &subject, &digest.body_html)
        .await
    {
        tracing::warn!(source = %source.name, error = %e, "Mail failed, watermark kept");
        return SourceStatus::MailFailed(e);
    }

    if new_watermark > source.watermark {
        if let Err(e) = store.commit_watermark(&source.name, new_watermark) {
            tracing::error!(
                source = %source.name,
                error = %e,
                "Digest sent but watermark not saved; items will be resent"
            );
            return SourceStatus::CommitFailed(e);
        }
    }

    tracing::info!(
        source = %source.name,
        items = items,
        watermark = %new_watermark,
        "Digest delivered"
    );
    SourceStatus::Delivered {
        items,
        new_watermark,
    }
}
