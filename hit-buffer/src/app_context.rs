use std::sync::Arc;
use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    buffer::HitBuffer,
    bulk::PgHitWriter,
    config::Config,
    driver::{flush_loop, prune_loop, FlushSchedule},
    flush::Flusher,
    hit::StandardRules,
    session::PgSessions,
    site::PgSites,
};

pub struct AppContext {
    pub pool: PgPool,
    pub buffer: Arc<HitBuffer>,
    pub flusher: Arc<Flusher>,
    pub sessions: Arc<PgSessions>,
    pub schedule: FlushSchedule,
    pub session_prune_interval: Duration,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, sqlx::Error> {
        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;

        if config.session_salt.is_none() {
            warn!("SESSION_SALT is not set, session fingerprints are unsalted");
        }

        let sessions = Arc::new(
            PgSessions::new(pool.clone(), config.session_salt())
                .with_max_age(Duration::from_secs(config.session_max_age_secs)),
        );

        let flusher = Flusher::new(
            Arc::new(PgSites::new(pool.clone())),
            sessions.clone(),
            Arc::new(StandardRules),
            Arc::new(PgHitWriter::new(pool.clone())),
        )
        .with_spam_filter(config.spam_filter())
        .with_table(&config.hits_table);

        Ok(Self {
            pool,
            buffer: Arc::new(HitBuffer::new()),
            flusher: Arc::new(flusher),
            sessions,
            schedule: FlushSchedule::from(config),
            session_prune_interval: Duration::from_secs(config.session_prune_interval_secs),
        })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Starts flushing the buffer in the background. The returned task ends
    /// after the final flush that follows `shutdown`.
    pub fn spawn_flush_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(flush_loop(
            self.flusher.clone(),
            self.buffer.clone(),
            self.schedule,
            shutdown,
        ))
    }

    pub fn spawn_session_pruner(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(prune_loop(
            self.sessions.clone(),
            self.session_prune_interval,
            shutdown,
        ))
    }
}
