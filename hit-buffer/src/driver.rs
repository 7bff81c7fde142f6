use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::HitBuffer;
use crate::config::Config;
use crate::errors::FlushError;
use crate::flush::{FlushReport, Flusher};
use crate::session::PgSessions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&Config> for FlushSchedule {
    fn from(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.flush_interval_secs),
            timeout: Duration::from_secs(config.flush_timeout_secs),
        }
    }
}

/// One flush that gets cancelled if it's still running after `timeout`.
pub async fn flush_once(
    flusher: &Flusher,
    buffer: &HitBuffer,
    timeout: Duration,
) -> Result<FlushReport, FlushError> {
    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let result = flusher.persist(buffer, &cancel).await;
    deadline.abort();
    result
}

/// Flushes `buffer` every `schedule.interval` until `shutdown` fires, then
/// flushes one last time so that nothing appended before shutdown is left
/// behind. Failed flushes are logged and the loop carries on.
pub async fn flush_loop(
    flusher: Arc<Flusher>,
    buffer: Arc<HitBuffer>,
    schedule: FlushSchedule,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(schedule.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        report(flush_once(&flusher, &buffer, schedule.timeout).await);
    }

    info!(buffered = buffer.len(), "shutting down, flushing remaining hits");
    report(flush_once(&flusher, &buffer, schedule.timeout).await);
}

fn report(result: Result<FlushReport, FlushError>) {
    match result {
        Ok(report) if report.is_empty() => {}
        Ok(report) => info!(
            persisted = report.persisted_count(),
            skipped = report.len() - report.persisted_count(),
            "flush finished"
        ),
        Err(e) => error!(lost = e.hits().len(), "flush failed with: {}", e),
    }
}

/// Deletes expired sessions every `interval` until `shutdown` fires.
pub async fn prune_loop(
    sessions: Arc<PgSessions>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match sessions.prune_expired().await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned expired sessions"),
            Err(e) => warn!("session pruning failed with: {}", e),
        }
    }
}
