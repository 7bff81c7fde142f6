#![allow(dead_code)]
//! In-memory stand-ins for the Postgres collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use hit_buffer::{
    bulk::{HitRow, HitWriter},
    errors::{ResolveError, StorageError},
    flush::Flusher,
    hit::{Hit, SessionId, SiteId, StandardRules},
    session::{ResolvedSession, SessionResolver},
    site::{Site, SiteResolver},
};

pub struct MemorySites {
    sites: HashMap<SiteId, Site>,
    loads: AtomicUsize,
}

impl MemorySites {
    pub fn new(ids: &[SiteId]) -> Self {
        Self {
            sites: ids.iter().map(|id| (*id, Site::new(*id, "test"))).collect(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SiteResolver for MemorySites {
    async fn load_site(&self, id: SiteId) -> Result<Site, ResolveError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.sites
            .get(&id)
            .cloned()
            .ok_or(ResolveError::SiteNotFound(id))
    }
}

type SessionKey = (SiteId, String, String);

/// First creation wins: the first hit for a (site, browser, address) creates
/// the session, every later one reuses it.
#[derive(Default)]
pub struct MemorySessions {
    sessions: Mutex<HashMap<SessionKey, (SessionId, HashSet<String>)>>,
    calls: AtomicUsize,
    failing: bool,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionResolver for MemorySessions {
    async fn resolve_session(
        &self,
        site: &Site,
        path: &str,
        browser: &str,
        remote_addr: &str,
    ) -> Result<ResolvedSession, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ResolveError::QueryError {
                entity: "session",
                error: sqlx::Error::PoolTimedOut,
            });
        }

        let mut sessions = self.sessions.lock().unwrap();
        let next_id = sessions.len() as SessionId + 1;
        let (id, paths) = sessions
            .entry((site.id, browser.to_string(), remote_addr.to_string()))
            .or_insert_with(|| (next_id, HashSet::new()));

        Ok(ResolvedSession {
            id: *id,
            first_visit: paths.insert(path.to_string()),
        })
    }
}

#[derive(Default)]
pub struct MemoryWriter {
    rows: Mutex<Vec<HitRow>>,
    tables: Mutex<Vec<String>>,
    writes: AtomicUsize,
    failing: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn rows(&self) -> Vec<HitRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn tables(&self) -> Vec<String> {
        self.tables.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HitWriter for MemoryWriter {
    async fn write(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[HitRow],
    ) -> Result<u64, StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        assert_eq!(columns.len(), 13);
        if self.failing {
            return Err(StorageError::QueryError {
                command: "INSERT",
                error: sqlx::Error::PoolTimedOut,
            });
        }

        self.tables.lock().unwrap().push(table.to_string());
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

pub fn flusher(
    sites: &Arc<MemorySites>,
    sessions: &Arc<MemorySessions>,
    writer: &Arc<MemoryWriter>,
) -> Flusher {
    Flusher::new(
        sites.clone(),
        sessions.clone(),
        Arc::new(StandardRules),
        writer.clone(),
    )
}

pub fn hit(site: SiteId, path: &str) -> Hit {
    Hit {
        site,
        path: path.to_string(),
        browser: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0"
            .to_string(),
        remote_addr: "192.0.2.10".to_string(),
        created_at: Utc::now(),
        ..Default::default()
    }
}

pub fn with_referrer(mut hit: Hit, referrer: &str) -> Hit {
    hit.referrer = referrer.to_string();
    hit
}
