use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use newsletter_digest::channels::EmlDirectorySource;
use newsletter_digest::config::RunConfig;
use newsletter_digest::extract::{Extractor, GenerativeExtractor, HeuristicExtractor};
use newsletter_digest::llm::create_provider;
use newsletter_digest::output::ArtifactWriter;
use newsletter_digest::pipeline::DigestProcessor;
use newsletter_digest::pipeline::priority::{PriorityResolver, PriorityTable};
use newsletter_digest::pipeline::types::FetchQuery;
use newsletter_digest::store::LibSqlCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = RunConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    if let Some(key_var) = config.missing_llm_key {
        warn!(
            key_var,
            "Generative extraction requested but the API key is not set, using heuristic extraction only"
        );
    }

    let pipeline_config = config.pipeline_config();
    let now = Utc::now();

    eprintln!("📰 Newsletter Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}/{}", config.mailbox_dir.display(), config.mailbox);
    eprintln!("   Priorities: {}", config.priority_file.display());
    eprintln!("   Output: {}", config.output_dir.display());

    // ── Priority table ──────────────────────────────────────────────
    let table = PriorityTable::load(&config.priority_file)
        .await
        .with_context(|| format!("reading {}", config.priority_file.display()))?;
    let resolver = PriorityResolver::new(Arc::new(table), config.unresolved_policy);

    // ── Extraction strategy ─────────────────────────────────────────
    let extractor: Arc<dyn Extractor> = match &config.llm {
        Some(llm_config) => {
            let llm = create_provider(llm_config)?;
            eprintln!("   Extraction: generative ({})", llm.model_name());
            Arc::new(GenerativeExtractor::new(llm, &pipeline_config)?)
        }
        None => {
            eprintln!("   Extraction: heuristic");
            Arc::new(HeuristicExtractor::new(&pipeline_config)?)
        }
    };

    let mut processor = DigestProcessor::new(&pipeline_config, resolver, extractor)?;

    // ── Cache ───────────────────────────────────────────────────────
    match LibSqlCache::new_local(&config.cache_path).await {
        Ok(cache) => {
            eprintln!("   Cache: {}", config.cache_path.display());
            processor = processor.with_cache(Arc::new(cache));
        }
        Err(e) => {
            warn!(path = %config.cache_path.display(), error = %e, "Extraction cache unavailable, running without it");
        }
    }

    // ── Run ─────────────────────────────────────────────────────────
    let source = EmlDirectorySource::new(&config.mailbox_dir);
    let query = FetchQuery {
        host: config.imap_host.clone(),
        user: config.imap_user.clone(),
        credential: config.imap_password.clone(),
        since: now - Duration::days(config.since_days),
        mailbox: config.mailbox.clone(),
    };

    let outcome = processor.run(&source, &query, now).await?;
    let summary = ArtifactWriter::new(&config.output_dir, config.audit)
        .write(&outcome, now)
        .await?;

    eprintln!(
        "   Digest: {} selected of {} candidates ({} artifacts written, {} failed)\n",
        outcome.selected.len(),
        outcome.audit.len(),
        summary.written,
        summary.failed
    );
    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "digest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}
