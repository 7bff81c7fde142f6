use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::errors::StorageError;
use crate::hit::{Hit, SessionId, SiteId};
use crate::metrics_consts::BULK_STATEMENTS;

/// Column order of every row handed to a [`HitWriter`].
pub const HIT_COLUMNS: [&str; 13] = [
    "site",
    "path",
    "ref",
    "ref_scheme",
    "browser",
    "size",
    "location",
    "created_at",
    "bot",
    "title",
    "event",
    "session",
    "first_visit",
];

pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Postgres refuses statements with more bind parameters than this.
const PG_BIND_LIMIT: usize = 65535;

/// One hit, flattened in `HIT_COLUMNS` order.
#[derive(Debug, Clone, PartialEq)]
pub struct HitRow {
    pub site: SiteId,
    pub path: String,
    pub referrer: String,
    pub ref_scheme: Option<&'static str>,
    pub browser: String,
    pub size: String,
    pub location: String,
    pub created_at: String,
    pub bot: bool,
    pub title: String,
    pub event: bool,
    pub session: Option<SessionId>,
    pub first_visit: Option<bool>,
}

impl From<&Hit> for HitRow {
    fn from(hit: &Hit) -> Self {
        Self {
            site: hit.site,
            path: hit.path.clone(),
            referrer: hit.referrer.clone(),
            ref_scheme: hit.ref_scheme.map(|scheme| scheme.as_str()),
            browser: hit.browser.clone(),
            size: hit.size_string(),
            location: hit.location.clone(),
            created_at: hit.created_at.format(CREATED_AT_FORMAT).to_string(),
            bot: hit.bot,
            title: hit.title.clone(),
            event: hit.event,
            session: hit.session,
            first_visit: hit.first_visit,
        }
    }
}

/// Durable storage for batches of hit rows.
#[async_trait]
pub trait HitWriter: Send + Sync {
    /// Stores all rows, or none of them. Returns the number of rows written.
    async fn write(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[HitRow],
    ) -> Result<u64, StorageError>;
}

/// Collects rows during a flush and writes them in one go.
#[derive(Debug)]
pub struct BulkInsert {
    table: String,
    rows: Vec<HitRow>,
}

impl BulkInsert {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn values(&mut self, row: HitRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the collected rows. Finishing an empty insert doesn't touch
    /// storage at all.
    pub async fn finish(self, writer: &dyn HitWriter) -> Result<u64, StorageError> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        writer.write(&self.table, &HIT_COLUMNS, &self.rows).await
    }
}

pub struct PgHitWriter {
    pool: PgPool,
}

impl PgHitWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn rows_per_statement(columns: usize) -> usize {
    (PG_BIND_LIMIT / columns.max(1)).max(1)
}

fn build_insert<'a>(table: &str, columns: &[&str], rows: &'a [HitRow]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, columns.join(", ")));
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.site)
            .push_bind(&row.path)
            .push_bind(&row.referrer)
            .push_bind(row.ref_scheme)
            .push_bind(&row.browser)
            .push_bind(&row.size)
            .push_bind(&row.location)
            .push_bind(&row.created_at)
            .push_unseparated("::timestamp")
            .push_bind(row.bot)
            .push_bind(&row.title)
            .push_bind(row.event)
            .push_bind(row.session)
            .push_bind(row.first_visit);
    });
    builder
}

#[async_trait]
impl HitWriter for PgHitWriter {
    async fn write(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[HitRow],
    ) -> Result<u64, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::QueryError {
                command: "BEGIN",
                error,
            })?;

        let mut written = 0;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let mut builder = build_insert(table, columns, chunk);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|error| StorageError::QueryError {
                    command: "INSERT",
                    error,
                })?;
            written += result.rows_affected();
            metrics::counter!(BULK_STATEMENTS).increment(1);
        }

        tx.commit()
            .await
            .map_err(|error| StorageError::QueryError {
                command: "COMMIT",
                error,
            })?;

        Ok(written)
    }
}
