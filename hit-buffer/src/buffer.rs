use std::sync::{PoisonError, RwLock};

use crate::hit::Hit;
use crate::metrics_consts::{BUFFER_SIZE, HITS_BUFFERED};

/// Hits waiting for the next flush.
///
/// Producers append from any thread; the flusher takes everything at once
/// with [`HitBuffer::drain`]. The lock is only held to extend the vector or to
/// swap it for an empty one, so a slow flush never blocks ingestion.
///
/// A panic while holding the lock can't leave the vector half-updated, so a
/// poisoned lock is simply taken over.
#[derive(Debug, Default)]
pub struct HitBuffer {
    hits: RwLock<Vec<Hit>>,
}

impl HitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds hits to the end of the buffer, keeping their order.
    pub fn append<I>(&self, hits: I)
    where
        I: IntoIterator<Item = Hit>,
    {
        // Collect before locking, the iterator may be arbitrarily slow.
        let mut hits: Vec<Hit> = hits.into_iter().collect();
        if hits.is_empty() {
            return;
        }
        let added = hits.len();

        let len = {
            let mut buffered = self.hits.write().unwrap_or_else(PoisonError::into_inner);
            buffered.append(&mut hits);
            buffered.len()
        };

        metrics::counter!(HITS_BUFFERED).increment(added as u64);
        metrics::gauge!(BUFFER_SIZE).set(len as f64);
    }

    /// Number of buffered hits. Stale as soon as it returns.
    pub fn len(&self) -> usize {
        self.hits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every buffered hit, leaving the buffer empty. Each appended hit
    /// is returned by exactly one drain.
    pub fn drain(&self) -> Vec<Hit> {
        if self.is_empty() {
            return Vec::new();
        }

        let drained = {
            let mut buffered = self.hits.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *buffered)
        };

        metrics::gauge!(BUFFER_SIZE).set(0.0);
        drained
    }
}
