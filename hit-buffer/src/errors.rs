use thiserror::Error;

use crate::hit::{Hit, SiteId};

/// Errors from the site and session lookups done for each hit.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("site {0} not found")]
    SiteNotFound(SiteId),
    #[error("site {0} failed to load earlier in this flush")]
    SiteUnavailable(SiteId),
    #[error("{entity} query failed with: {error}")]
    QueryError {
        entity: &'static str,
        error: sqlx::Error,
    },
    #[error("lookup cancelled")]
    Cancelled,
}

/// Errors writing a batch of hits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

/// The only errors a flush reports to its caller. Whatever was drained from
/// the buffer is handed back, but none of it should be assumed stored.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("failed to write {rows} hits: {source}")]
    Storage {
        rows: usize,
        hits: Vec<Hit>,
        source: StorageError,
    },
    #[error("flush cancelled after processing {processed} of {drained} hits")]
    Cancelled {
        processed: usize,
        drained: usize,
        hits: Vec<Hit>,
    },
}

impl FlushError {
    pub fn hits(&self) -> &[Hit] {
        match self {
            FlushError::Storage { hits, .. } | FlushError::Cancelled { hits, .. } => hits,
        }
    }
}
