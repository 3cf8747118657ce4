//! Content-addressed result cache.
//!
//! The cache guarantees at most one expensive enhancement per
//! (owner, near-duplicate content): before enqueueing work, handlers look up
//! the content fingerprint and reuse the prior result on a hit.
//!
//! Entries are immutable and never actively deleted; expiry is passive (an
//! optional TTL on the backing store). Each owner additionally has a small
//! index of (fingerprint, simhash) pairs so lookups can match *near*
//! duplicates above [`SIMILARITY_THRESHOLD`] without scanning entry bodies.
//! The index is append-only and maintained via compare-and-swap.

pub mod fingerprint;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::{SharedStore, StoreError};
use crate::types::{DocumentId, EnhancementId, OwnerId};

pub use fingerprint::{Fingerprint, similarity, simhash};

/// Minimum simhash similarity for a near-duplicate hit.
pub const SIMILARITY_THRESHOLD: f64 = 0.95;

/// Bounded CAS retries for index appends; on exhaustion the entry is still
/// reachable by exact match, only near-matching degrades.
const INDEX_CAS_ATTEMPTS: usize = 8;

/// Errors raised by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The reusable result of one successful enhancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub document_id: DocumentId,
    pub enhancement_id: EnhancementId,
    pub result_url: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// What is actually stored per fingerprint: the entry plus the simhash that
/// lets index rebuilds stay consistent.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    entry: CacheEntry,
    simhash: u64,
}

/// One row of an owner's near-duplicate index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRow {
    fingerprint: Fingerprint,
    simhash: u64,
}

/// Content-addressed deduplication of enhancement results.
pub struct DocumentCache {
    store: Arc<dyn SharedStore>,
    entry_ttl: Option<Duration>,
}

impl DocumentCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        DocumentCache {
            store,
            entry_ttl: None,
        }
    }

    /// Sets a passive expiry for entries. The default is no expiry.
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    /// Looks up a prior result for this owner's content, matching exactly or
    /// by near-duplicate similarity.
    pub async fn lookup(&self, owner: &OwnerId, content: &[u8]) -> Result<Option<CacheEntry>> {
        let fingerprint = Fingerprint::of(content);

        // Exact match first: one cheap point read.
        if let Some(record) = self.load_record(owner, &fingerprint).await? {
            debug!(owner = %owner, fingerprint = %fingerprint, "cache hit (exact)");
            return Ok(Some(record.entry));
        }

        // Near match: scan the owner's index for a simhash neighbor.
        let content_hash = simhash(content);
        for row in self.load_index(owner).await? {
            if similarity(row.simhash, content_hash) >= SIMILARITY_THRESHOLD {
                // The index can reference a passively expired entry; skip it.
                if let Some(record) = self.load_record(owner, &row.fingerprint).await? {
                    debug!(
                        owner = %owner,
                        fingerprint = %row.fingerprint,
                        "cache hit (near-duplicate)"
                    );
                    return Ok(Some(record.entry));
                }
            }
        }

        Ok(None)
    }

    /// Stores the result of the first successful processing of this content.
    ///
    /// No-op if an entry already exists for the fingerprint. Entries are
    /// immutable and equivalent, so a lost race is harmless (last writer
    /// wins).
    pub async fn store(&self, owner: &OwnerId, content: &[u8], entry: CacheEntry) -> Result<()> {
        let fingerprint = Fingerprint::of(content);

        if self.load_record(owner, &fingerprint).await?.is_some() {
            return Ok(());
        }

        let record = StoredRecord {
            entry,
            simhash: simhash(content),
        };
        let serialized = serde_json::to_string(&record)?;
        self.store
            .set(&entry_key(owner, &fingerprint), &serialized, self.entry_ttl)
            .await?;

        self.append_index_row(
            owner,
            IndexRow {
                fingerprint,
                simhash: record.simhash,
            },
        )
        .await
    }

    async fn load_record(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StoredRecord>> {
        match self.store.get(&entry_key(owner, fingerprint)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_index(&self, owner: &OwnerId) -> Result<Vec<IndexRow>> {
        match self.store.get(&index_key(owner)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Appends a row to the owner's index via CAS, retrying on contention.
    async fn append_index_row(&self, owner: &OwnerId, row: IndexRow) -> Result<()> {
        let key = index_key(owner);

        for _ in 0..INDEX_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let mut rows: Vec<IndexRow> = match raw.as_deref() {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            };

            if rows.iter().any(|existing| existing.fingerprint == row.fingerprint) {
                return Ok(());
            }
            rows.push(row.clone());

            let serialized = serde_json::to_string(&rows)?;
            if self
                .store
                .compare_and_swap(&key, raw.as_deref(), &serialized, None)
                .await?
            {
                return Ok(());
            }
        }

        // Entry remains reachable by exact fingerprint; only near-duplicate
        // matching misses it.
        debug!(owner = %owner, "cache index append lost CAS races, skipping");
        Ok(())
    }
}

fn entry_key(owner: &OwnerId, fingerprint: &Fingerprint) -> String {
    format!("dc:{}:{}", owner.as_str(), fingerprint.as_str())
}

fn index_key(owner: &OwnerId) -> String {
    format!("dcix:{}", owner.as_str())
}
