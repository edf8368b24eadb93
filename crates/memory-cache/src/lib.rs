//! Process Memory Cache (spec.md §4.C): a bounded, TTL-aware cache of
//! compressed WASM memory, keyed by process id.

use ao_types::sort_key;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to compress memory")]
    Compress(#[source] std::io::Error),
    #[error("failed to decompress memory")]
    Decompress(#[source] std::io::Error),
}

/// Identifies the evaluation a cached memory corresponds to, for the
/// later-than-monotonic comparison used by `set`.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub sort_key: String,
    pub timestamp: u64,
    pub cron: Option<String>,
}

struct Entry {
    key: CacheKey,
    /// Gzip-compressed memory.
    compressed: Vec<u8>,
    inserted_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Called when an entry is evicted to make room, so the evictor can
/// publish a Checkpoint for the memory about to be dropped. Never called
/// for TTL expiry (those entries are served stale, not removed).
pub trait OnEviction: Send + Sync {
    fn on_eviction(&self, process_id: &str, key: &CacheKey);
}

impl<F: Fn(&str, &CacheKey) + Send + Sync> OnEviction for F {
    fn on_eviction(&self, process_id: &str, key: &CacheKey) {
        self(process_id, key)
    }
}

pub struct ProcessMemoryCache<E: OnEviction> {
    max_size: u64,
    ttl: Duration,
    on_eviction: E,
    entries: HashMap<String, Entry>,
}

/// The result of a successful `get`: the decompressed memory, the
/// evaluation it corresponds to, and whether it is past its TTL (stale
/// entries are served but should be refreshed by the caller).
pub struct CacheHit {
    pub memory: Vec<u8>,
    pub key: CacheKey,
    pub stale: bool,
}

impl<E: OnEviction> ProcessMemoryCache<E> {
    pub fn new(max_size: u64, ttl: Duration, on_eviction: E) -> Self {
        ProcessMemoryCache {
            max_size,
            ttl,
            on_eviction,
            entries: HashMap::new(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_bytes: self.entries.values().map(|e| e.compressed.len() as u64).sum(),
        }
    }

    /// Fetch and decompress the cached memory for `process_id`, renewing
    /// its TTL. Returns `None` on a miss.
    pub fn get(&mut self, process_id: &str) -> Result<Option<CacheHit>, CacheError> {
        let now = Instant::now();
        let Some(entry) = self.entries.get_mut(process_id) else {
            return Ok(None);
        };

        let stale = now.duration_since(entry.inserted_at) > self.ttl;
        entry.last_access = now;

        let mut decoder = GzDecoder::new(entry.compressed.as_slice());
        let mut memory = Vec::new();
        decoder
            .read_to_end(&mut memory)
            .map_err(CacheError::Decompress)?;

        Ok(Some(CacheHit {
            memory,
            key: entry.key.clone(),
            stale,
        }))
    }

    /// Insert or replace the cached memory for `process_id`. A no-op if
    /// the currently cached evaluation is later-than the incoming one
    /// (cache updates are later-than-monotonic).
    pub fn set(&mut self, process_id: &str, key: CacheKey, memory: &[u8]) -> Result<(), CacheError> {
        if let Some(existing) = self.entries.get(process_id) {
            if sort_key::is_later_than(
                existing.key.timestamp,
                existing.key.cron.as_deref(),
                key.timestamp,
                key.cron.as_deref(),
            ) {
                return Ok(());
            }
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(memory).map_err(CacheError::Compress)?;
        let compressed = encoder.finish().map_err(CacheError::Compress)?;

        let now = Instant::now();
        self.entries.insert(
            process_id.to_string(),
            Entry {
                key,
                compressed,
                inserted_at: now,
                last_access: now,
            },
        );

        self.evict_to_bound();
        Ok(())
    }

    /// Evict approximately-least-recently-used entries until the
    /// aggregate compressed size is within `max_size`, invoking
    /// `on_eviction` for each entry removed.
    fn evict_to_bound(&mut self) {
        loop {
            let total: u64 = self.entries.values().map(|e| e.compressed.len() as u64).sum();
            if total <= self.max_size {
                return;
            }

            let Some(lru_process_id) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(id, _)| id.clone())
            else {
                return;
            };

            if let Some(entry) = self.entries.remove(&lru_process_id) {
                self.on_eviction.on_eviction(&lru_process_id, &entry.key);
            }
        }
    }
}
