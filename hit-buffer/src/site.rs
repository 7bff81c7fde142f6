use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::ResolveError;
use crate::hit::SiteId;

pub const STATE_ACTIVE: &str = "a";
pub const STATE_DELETED: &str = "d";

/// Which optional hit fields a site wants stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct SiteSettings {
    pub collect_referrer: bool,
    pub collect_screen_size: bool,
    pub collect_location: bool,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            collect_referrer: true,
            collect_screen_size: true,
            collect_location: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Site {
    pub id: SiteId,
    pub code: String,
    pub cname: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(flatten)]
    pub settings: SiteSettings,
}

impl Site {
    pub fn new(id: SiteId, code: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            cname: None,
            state: STATE_ACTIVE.to_string(),
            created_at: Utc::now(),
            settings: SiteSettings::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == STATE_ACTIVE
    }
}

#[async_trait]
pub trait SiteResolver: Send + Sync {
    async fn load_site(&self, id: SiteId) -> Result<Site, ResolveError>;
}

pub struct PgSites {
    pool: PgPool,
}

impl PgSites {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SiteResolver for PgSites {
    async fn load_site(&self, id: SiteId) -> Result<Site, ResolveError> {
        sqlx::query_as::<_, Site>(
            r#"
SELECT
    id, code, cname, state, created_at,
    collect_referrer, collect_screen_size, collect_location
FROM sites
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| ResolveError::QueryError {
            entity: "site",
            error,
        })?
        .ok_or(ResolveError::SiteNotFound(id))
    }
}

/// Sites looked up during a single flush. Every distinct id hits the
/// resolver at most once; failed lookups are remembered too, so a broken site
/// doesn't cost one query per hit.
pub struct SiteCache<'a> {
    resolver: &'a dyn SiteResolver,
    sites: HashMap<SiteId, Option<Site>>,
}

impl<'a> SiteCache<'a> {
    pub fn new(resolver: &'a dyn SiteResolver) -> Self {
        Self {
            resolver,
            sites: HashMap::new(),
        }
    }

    pub async fn get(&mut self, id: SiteId) -> Result<&Site, ResolveError> {
        let cached = match self.sites.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.resolver.load_site(id).await {
                Ok(site) => entry.insert(Some(site)),
                Err(ResolveError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(err) => {
                    entry.insert(None);
                    return Err(err);
                }
            },
        };

        cached.as_ref().ok_or(ResolveError::SiteUnavailable(id))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSites {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SiteResolver for CountingSites {
        async fn load_site(&self, id: SiteId) -> Result<Site, ResolveError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            match id {
                1 | 2 => Ok(Site::new(id, "site")),
                _ => Err(ResolveError::SiteNotFound(id)),
            }
        }
    }

    #[tokio::test]
    async fn each_site_is_loaded_once() {
        let resolver = CountingSites {
            loads: AtomicUsize::new(0),
        };
        let mut cache = SiteCache::new(&resolver);

        assert_eq!(cache.get(1).await.unwrap().id, 1);
        assert_eq!(cache.get(1).await.unwrap().id, 1);
        assert_eq!(cache.get(2).await.unwrap().id, 2);
        assert_eq!(resolver.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_lookups_are_not_repeated() {
        let resolver = CountingSites {
            loads: AtomicUsize::new(0),
        };
        let mut cache = SiteCache::new(&resolver);

        assert!(matches!(
            cache.get(9).await,
            Err(ResolveError::SiteNotFound(9))
        ));
        assert!(matches!(
            cache.get(9).await,
            Err(ResolveError::SiteUnavailable(9))
        ));
        assert_eq!(resolver.loads.load(Ordering::SeqCst), 1);
    }

    // Gives up on the first load, as a resolver does when its flush is cancelled.
    struct CancelledOnce {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SiteResolver for CancelledOnce {
        async fn load_site(&self, id: SiteId) -> Result<Site, ResolveError> {
            match self.loads.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ResolveError::Cancelled),
                _ => Ok(Site::new(id, "site")),
            }
        }
    }

    #[tokio::test]
    async fn cancelled_lookups_are_retried() {
        let resolver = CancelledOnce {
            loads: AtomicUsize::new(0),
        };
        let mut cache = SiteCache::new(&resolver);

        assert!(matches!(cache.get(1).await, Err(ResolveError::Cancelled)));
        assert!(cache.is_empty());

        assert_eq!(cache.get(1).await.unwrap().id, 1);
        assert_eq!(resolver.loads.load(Ordering::SeqCst), 2);
    }
}
