use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};

use crate::errors::ResolveError;
use crate::hit::{SessionId, SiteId};
use crate::metrics_consts::SESSIONS_PRUNED;
use crate::site::Site;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSession {
    pub id: SessionId,
    /// True if the session is new, or hasn't seen this path before.
    pub first_visit: bool,
}

#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve_session(
        &self,
        site: &Site,
        path: &str,
        browser: &str,
        remote_addr: &str,
    ) -> Result<ResolvedSession, ResolveError>;
}

/// Identifies a visitor without storing their address or user agent.
pub fn fingerprint(salt: &[u8], site: SiteId, browser: &str, remote_addr: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(site.to_be_bytes());
    hasher.update(browser.as_bytes());
    hasher.update([0u8]);
    hasher.update(remote_addr.as_bytes());
    hasher.finalize().to_vec()
}

/// How long a session stays alive after its last hit.
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(8 * 60 * 60);

/// Sessions kept in the `sessions` table. Storing them is what lets first
/// visit tracking survive a restart.
///
/// A session is reused while its last hit is younger than `max_age`. After
/// that the visitor gets a fresh session and every path counts as a first
/// visit again.
pub struct PgSessions {
    pool: PgPool,
    salt: Vec<u8>,
    max_age: Duration,
}

impl PgSessions {
    pub fn new(pool: PgPool, salt: &[u8]) -> Self {
        Self {
            pool,
            salt: salt.to_vec(),
            max_age: DEFAULT_SESSION_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Deletes sessions that can no longer be reused. Returns how many went.
    pub async fn prune_expired(&self) -> Result<u64, ResolveError> {
        let result = sqlx::query(
            r#"
DELETE FROM sessions
WHERE last_seen < now() - make_interval(secs => $1)
            "#,
        )
        .bind(self.max_age.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        let pruned = result.rows_affected();
        metrics::counter!(SESSIONS_PRUNED).increment(pruned);
        Ok(pruned)
    }
}

fn query_error(error: sqlx::Error) -> ResolveError {
    ResolveError::QueryError {
        entity: "session",
        error,
    }
}

// Locks the session row and reports whether it has seen `path` before.
async fn lock_session(
    conn: &mut PgConnection,
    site: SiteId,
    hash: &[u8],
    path: &str,
    max_age: Option<f64>,
) -> Result<Option<(SessionId, bool)>, ResolveError> {
    sqlx::query_as(
        r#"
SELECT id, $3 = ANY(paths)
FROM sessions
WHERE site = $1 AND hash = $2
    AND ($4::float8 IS NULL OR last_seen >= now() - make_interval(secs => $4))
FOR UPDATE
        "#,
    )
    .bind(site)
    .bind(hash)
    .bind(path)
    .bind(max_age)
    .fetch_optional(conn)
    .await
    .map_err(query_error)
}

async fn touch_session(
    conn: &mut PgConnection,
    id: SessionId,
    path: &str,
) -> Result<(), ResolveError> {
    sqlx::query(
        r#"
UPDATE sessions
SET
    last_seen = now(),
    paths = CASE WHEN $2 = ANY(paths) THEN paths ELSE array_append(paths, $2) END
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(path)
    .execute(conn)
    .await
    .map_err(query_error)?;
    Ok(())
}

#[async_trait]
impl SessionResolver for PgSessions {
    async fn resolve_session(
        &self,
        site: &Site,
        path: &str,
        browser: &str,
        remote_addr: &str,
    ) -> Result<ResolvedSession, ResolveError> {
        let hash = fingerprint(&self.salt, site.id, browser, remote_addr);
        let max_age = self.max_age.as_secs_f64();
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        // Reusing a live session never reaches the insert, so it doesn't
        // consume a sequence value.
        let live = lock_session(&mut tx, site.id, &hash, path, Some(max_age)).await?;
        if let Some((id, seen)) = live {
            touch_session(&mut tx, id, path).await?;
            tx.commit().await.map_err(query_error)?;
            return Ok(ResolvedSession {
                id,
                first_visit: !seen,
            });
        }

        // An expired session for this visitor makes way for a new one.
        sqlx::query(
            r#"
DELETE FROM sessions
WHERE site = $1 AND hash = $2 AND last_seen < now() - make_interval(secs => $3)
            "#,
        )
        .bind(site.id)
        .bind(&hash)
        .bind(max_age)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        // Racing creators of the same session both land on the unique
        // constraint; only the one whose insert went through sees it as new.
        let created: Option<(SessionId,)> = sqlx::query_as(
            r#"
INSERT INTO sessions (site, hash, paths, created_at, last_seen)
VALUES ($1, $2, ARRAY[$3]::text[], now(), now())
ON CONFLICT (site, hash) DO NOTHING
RETURNING id
            "#,
        )
        .bind(site.id)
        .bind(&hash)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?;

        let resolved = match created {
            Some((id,)) => ResolvedSession {
                id,
                first_visit: true,
            },
            None => {
                let (id, seen) = lock_session(&mut tx, site.id, &hash, path, None)
                    .await?
                    .ok_or_else(|| query_error(sqlx::Error::RowNotFound))?;
                touch_session(&mut tx, id, path).await?;
                ResolvedSession {
                    id,
                    first_visit: !seen,
                }
            }
        };

        tx.commit().await.map_err(query_error)?;
        Ok(resolved)
    }
}
