mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{hit, MemorySessions, MemorySites, MemoryWriter};
use hit_buffer::{
    buffer::HitBuffer,
    driver::{flush_loop, flush_once, FlushSchedule},
    errors::{FlushError, ResolveError},
    flush::Flusher,
    hit::StandardRules,
    session::{ResolvedSession, SessionResolver},
    site::Site,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn final_flush_on_shutdown() {
    let sites = Arc::new(MemorySites::new(&[1]));
    let sessions = Arc::new(MemorySessions::new());
    let writer = Arc::new(MemoryWriter::new());
    let flusher = Arc::new(common::flusher(&sites, &sessions, &writer));
    let buffer = Arc::new(HitBuffer::new());
    let shutdown = CancellationToken::new();

    let schedule = FlushSchedule {
        interval: Duration::from_secs(3600),
        timeout: Duration::from_secs(5),
    };
    let handle = tokio::spawn(flush_loop(
        flusher,
        buffer.clone(),
        schedule,
        shutdown.clone(),
    ));

    buffer.append([hit(1, "/a"), hit(1, "/b"), hit(1, "/c")]);
    shutdown.cancel();
    handle.await.unwrap();

    assert!(buffer.is_empty());
    assert_eq!(writer.rows().len(), 3);
}

#[tokio::test]
async fn loop_survives_failed_flushes() {
    let sites = Arc::new(MemorySites::new(&[1]));
    let sessions = Arc::new(MemorySessions::new());
    let writer = Arc::new(MemoryWriter::failing());
    let flusher = Arc::new(common::flusher(&sites, &sessions, &writer));
    let buffer = Arc::new(HitBuffer::new());
    let shutdown = CancellationToken::new();

    let schedule = FlushSchedule {
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    };
    let handle = tokio::spawn(flush_loop(
        flusher,
        buffer.clone(),
        schedule,
        shutdown.clone(),
    ));

    buffer.append([hit(1, "/a")]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    buffer.append([hit(1, "/b")]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(writer.writes(), 2);
    assert!(buffer.is_empty());
}

struct StuckSessions;

#[async_trait]
impl SessionResolver for StuckSessions {
    async fn resolve_session(
        &self,
        _site: &Site,
        _path: &str,
        _browser: &str,
        _remote_addr: &str,
    ) -> Result<ResolvedSession, ResolveError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ResolvedSession {
            id: 1,
            first_visit: true,
        })
    }
}

#[tokio::test]
async fn flush_deadline_cancels_slow_flush() {
    let writer = Arc::new(MemoryWriter::new());
    let flusher = Flusher::new(
        Arc::new(MemorySites::new(&[1])),
        Arc::new(StuckSessions),
        Arc::new(StandardRules),
        writer.clone(),
    );
    let buffer = HitBuffer::new();
    buffer.append([hit(1, "/a"), hit(1, "/b")]);

    let err = flush_once(&flusher, &buffer, Duration::from_millis(20))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FlushError::Cancelled {
            processed: 0,
            drained: 2,
            ..
        }
    ));
    assert_eq!(writer.writes(), 0);
}

#[test]
fn schedule_from_config() {
    let config = hit_buffer::config::Config {
        database_url: "postgres://localhost/hits".to_string(),
        max_pg_connections: 1,
        hits_table: "hits".to_string(),
        flush_interval_secs: 2,
        flush_timeout_secs: 7,
        refspam_extra_hosts: None,
        session_salt: None,
        session_max_age_secs: 60,
        session_prune_interval_secs: 60,
    };

    let schedule = FlushSchedule::from(&config);
    assert_eq!(schedule.interval, Duration::from_secs(2));
    assert_eq!(schedule.timeout, Duration::from_secs(7));
}
