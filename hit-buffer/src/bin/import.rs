//! Loads a JSON-lines export of hits, one hit per line, through the same
//! buffer and flush pipeline the collector uses.
//!
//! ```bash
//! IMPORT_FILE=hits.jsonl DATABASE_URL=postgres://... import
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use hit_buffer::{
    app_context::AppContext, config::Config, driver::flush_once, hit::Hit,
    metrics_consts::IMPORT_LINES_INVALID,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Envconfig, Clone)]
struct ImportConfig {
    #[envconfig(nested = true)]
    pub hits: Config,

    pub import_file: String,

    #[envconfig(default = "1000")]
    pub import_batch_size: usize,

    #[envconfig(default = "true")]
    pub run_migrations: bool,
}

#[derive(Debug, Default)]
struct Totals {
    lines: usize,
    invalid: usize,
    persisted: usize,
    skipped: usize,
}

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn flush(context: &AppContext, timeout: Duration, totals: &mut Totals) -> Result<()> {
    let report = flush_once(&context.flusher, &context.buffer, timeout).await?;
    let persisted = report.persisted_count();
    totals.persisted += persisted;
    totals.skipped += report.len() - persisted;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = ImportConfig::init_from_env().context("failed to load configuration from env")?;
    let batch_size = config.import_batch_size.max(1);

    let context = AppContext::new(&config.hits)
        .await
        .context("failed to connect to postgres")?;
    if config.run_migrations {
        context
            .run_migrations()
            .await
            .context("failed to run migrations")?;
    }
    let timeout = context.schedule.timeout;

    let file = tokio::fs::File::open(&config.import_file)
        .await
        .with_context(|| format!("failed to open {}", config.import_file))?;
    let mut lines = BufReader::new(file).lines();

    info!(file = %config.import_file, batch_size, "importing hits");

    let mut totals = Totals::default();
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(line) = lines.next_line().await? {
        totals.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Hit>(&line) {
            Ok(hit) => batch.push(hit),
            Err(e) => {
                warn!(line = totals.lines, "skipping undecodable line: {}", e);
                metrics::counter!(IMPORT_LINES_INVALID).increment(1);
                totals.invalid += 1;
                continue;
            }
        }

        if batch.len() >= batch_size {
            context.buffer.append(batch.drain(..));
            flush(&context, timeout, &mut totals)
                .await
                .with_context(|| format!("flush failed near line {}", totals.lines))?;
        }
    }

    if !batch.is_empty() {
        context.buffer.append(batch);
        flush(&context, timeout, &mut totals)
            .await
            .context("final flush failed")?;
    }

    info!(
        lines = totals.lines,
        invalid = totals.invalid,
        persisted = totals.persisted,
        skipped = totals.skipped,
        "import finished"
    );

    Ok(())
}
