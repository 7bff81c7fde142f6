use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::HitBuffer;
use crate::bulk::{BulkInsert, HitRow, HitWriter};
use crate::errors::{FlushError, ResolveError};
use crate::hit::{Hit, HitRules, ValidationError};
use crate::metrics_consts::{
    FLUSH_BATCH_SIZE, FLUSH_FAILED, FLUSH_TIME, HITS_DRAINED, HITS_DROPPED, HITS_PERSISTED,
    HITS_SKIPPED,
};
use crate::refspam::SpamFilter;
use crate::session::SessionResolver;
use crate::site::{SiteCache, SiteResolver};

pub const DEFAULT_TABLE: &str = "hits";

/// Why a drained hit was left out of the batch.
#[derive(Error, Debug)]
pub enum SkipReason {
    #[error("referrer host {host} is spam")]
    Spam { host: String },
    #[error("site lookup failed: {0}")]
    Site(#[source] ResolveError),
    #[error("session lookup failed: {0}")]
    Session(#[source] ResolveError),
    #[error("invalid hit: {0}")]
    Invalid(#[source] ValidationError),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Spam { .. } => "spam",
            SkipReason::Site(_) => "site",
            SkipReason::Session(_) => "session",
            SkipReason::Invalid(_) => "invalid",
        }
    }
}

#[derive(Debug)]
pub enum HitOutcome {
    Persisted,
    Skipped(SkipReason),
}

impl HitOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, HitOutcome::Persisted)
    }
}

/// Result of one flush. `hits` and `outcomes` line up index for index and
/// follow the order the hits were buffered in. Persisted hits are in their
/// enriched form, skipped ones exactly as they were buffered.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub hits: Vec<Hit>,
    pub outcomes: Vec<HitOutcome>,
    pub written: u64,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn persisted(&self) -> impl Iterator<Item = &Hit> {
        self.hits
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, outcome)| outcome.is_persisted())
            .map(|(hit, _)| hit)
    }

    pub fn persisted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_persisted()).count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&Hit, &SkipReason)> {
        self.hits
            .iter()
            .zip(&self.outcomes)
            .filter_map(|(hit, outcome)| match outcome {
                HitOutcome::Skipped(reason) => Some((hit, reason)),
                HitOutcome::Persisted => None,
            })
    }
}

enum ProcessError {
    Skip(SkipReason),
    Cancelled,
}

/// Drains a [`HitBuffer`] and writes what survives enrichment in one batch.
pub struct Flusher {
    sites: Arc<dyn SiteResolver>,
    sessions: Arc<dyn SessionResolver>,
    rules: Arc<dyn HitRules>,
    writer: Arc<dyn HitWriter>,
    spam: SpamFilter,
    table: String,
}

impl Flusher {
    pub fn new(
        sites: Arc<dyn SiteResolver>,
        sessions: Arc<dyn SessionResolver>,
        rules: Arc<dyn HitRules>,
        writer: Arc<dyn HitWriter>,
    ) -> Self {
        Self {
            sites,
            sessions,
            rules,
            writer,
            spam: SpamFilter::new(),
            table: DEFAULT_TABLE.to_string(),
        }
    }

    pub fn with_spam_filter(mut self, spam: SpamFilter) -> Self {
        self.spam = spam;
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    /// Flushes everything currently buffered.
    ///
    /// Problems with individual hits only ever skip that hit. The call as a
    /// whole fails when the batch can't be written, or when `cancel` fires
    /// first; in both cases nothing from this flush should be considered
    /// stored, and the hits are not put back in the buffer.
    pub async fn persist(
        &self,
        buffer: &HitBuffer,
        cancel: &CancellationToken,
    ) -> Result<FlushReport, FlushError> {
        let drained = buffer.drain();
        if drained.is_empty() {
            return Ok(FlushReport::default());
        }

        let start = Instant::now();
        let total = drained.len();
        metrics::counter!(HITS_DRAINED).increment(total as u64);
        metrics::histogram!(FLUSH_BATCH_SIZE).record(total as f64);

        let mut sites = SiteCache::new(self.sites.as_ref());
        let mut insert = BulkInsert::new(&self.table);
        let mut report = FlushReport {
            hits: Vec::with_capacity(total),
            outcomes: Vec::with_capacity(total),
            written: 0,
        };

        for original in drained {
            match self.process(&mut sites, &original, cancel).await {
                Ok(hit) => {
                    insert.values(HitRow::from(&hit));
                    report.hits.push(hit);
                    report.outcomes.push(HitOutcome::Persisted);
                }
                Err(ProcessError::Skip(reason)) => {
                    match &reason {
                        SkipReason::Spam { host } => {
                            debug!(host = %host, "skipping hit with spam referrer")
                        }
                        _ => error!(hit = ?original, error = %reason, "skipping hit"),
                    }
                    metrics::counter!(HITS_SKIPPED, "reason" => reason.label()).increment(1);
                    report.hits.push(original);
                    report.outcomes.push(HitOutcome::Skipped(reason));
                }
                Err(ProcessError::Cancelled) => {
                    return Err(self.cancelled(report.hits, total));
                }
            }
        }

        let rows = insert.len();
        match cancellable(cancel, insert.finish(self.writer.as_ref())).await {
            None => return Err(self.cancelled(report.hits, total)),
            Some(Err(source)) => {
                metrics::counter!(FLUSH_FAILED, "reason" => "storage").increment(1);
                return Err(FlushError::Storage {
                    rows,
                    hits: report.hits,
                    source,
                });
            }
            Some(Ok(written)) => report.written = written,
        }

        metrics::counter!(HITS_PERSISTED).increment(rows as u64);
        metrics::histogram!(FLUSH_TIME).record(start.elapsed().as_millis() as f64);
        info!(
            drained = total,
            persisted = rows,
            skipped = total - rows,
            "flushed hits"
        );

        Ok(report)
    }

    fn cancelled(&self, hits: Vec<Hit>, drained: usize) -> FlushError {
        let processed = hits.len();
        metrics::counter!(FLUSH_FAILED, "reason" => "cancelled").increment(1);
        metrics::counter!(HITS_DROPPED).increment((drained - processed) as u64);
        warn!(processed, drained, "flush cancelled, batch not written");
        FlushError::Cancelled {
            processed,
            drained,
            hits,
        }
    }

    async fn process(
        &self,
        sites: &mut SiteCache<'_>,
        original: &Hit,
        cancel: &CancellationToken,
    ) -> Result<Hit, ProcessError> {
        let mut hit = original.clone();

        hit.parse_referrer();
        if let Some(host) = hit.referrer_host() {
            if self.spam.is_spam(host) {
                return Err(ProcessError::Skip(SkipReason::Spam {
                    host: host.to_string(),
                }));
            }
        }

        let site = match cancellable(cancel, sites.get(hit.site)).await {
            None | Some(Err(ResolveError::Cancelled)) => return Err(ProcessError::Cancelled),
            Some(Err(e)) => return Err(ProcessError::Skip(SkipReason::Site(e))),
            Some(Ok(site)) => site,
        };

        if !hit.has_session() {
            let resolved = cancellable(
                cancel,
                self.sessions
                    .resolve_session(site, &hit.path, &hit.browser, &hit.remote_addr),
            )
            .await;
            match resolved {
                None | Some(Err(ResolveError::Cancelled)) => return Err(ProcessError::Cancelled),
                Some(Err(e)) => return Err(ProcessError::Skip(SkipReason::Session(e))),
                Some(Ok(session)) => {
                    hit.session = Some(session.id);
                    if session.first_visit {
                        hit.first_visit = Some(true);
                    }
                }
            }
        }

        self.rules.apply_defaults(site, &mut hit);
        self.rules
            .validate(site, &hit)
            .map_err(|e| ProcessError::Skip(SkipReason::Invalid(e)))?;

        Ok(hit)
    }
}

/// Runs `fut` unless `cancel` fires first, in which case `fut` is dropped.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}
