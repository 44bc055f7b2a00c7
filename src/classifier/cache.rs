//! Per-worker classification cache.
//!
//! Maps the canonical statement form to its classification result. The
//! cache is owned by one worker and never shared, so no locking is
//! involved. Memory is bounded: the configured capacity is divided evenly
//! among workers and freeing space evicts uniformly random entries instead
//! of maintaining LRU order on the hot path.

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

use super::{ClassifiedStmt, ParserOptions, SqlMode};

/// Entries larger than the protocol packet limit can never be sent by a
/// well-formed client; rejecting them up front keeps a single statement
/// from dominating the budget
const MAX_ENTRY_SIZE: u64 = (MAX_PACKET_SIZE - PACKET_HEADER_SIZE - 1) as u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Entry {
    stmt: ClassifiedStmt,
    sql_mode: SqlMode,
    options: ParserOptions,
    hits: u64,
    /// Position of this entry's key in the sampling index
    slot: usize,
}

/// Outcome of the pre-dispatch cache probe. Carried through routing and
/// resolved by the post-dispatch `store` hook, which is called exactly once
/// per classified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheProbe {
    /// The classification was found in the cache
    Hit,
    /// Not cached; `key` is where the result should be stored
    Miss { key: String },
    /// The cache is disabled or the packet is not cacheable
    Bypass,
}

/// Bounded classification cache, one per worker
#[derive(Debug)]
pub struct StmtCache {
    entries: HashMap<String, Entry>,
    /// Keys by slot, for O(1) uniform sampling during eviction
    keys: Vec<String>,
    capacity: u64,
    sql_mode: SqlMode,
    options: ParserOptions,
    stats: CacheStats,
    rng: SmallRng,
}

impl StmtCache {
    /// `capacity` is this worker's share of the configured total; zero
    /// disables the cache
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: HashMap::new(),
            keys: Vec::new(),
            capacity,
            sql_mode: SqlMode::Default,
            options: ParserOptions::default(),
            stats: CacheStats::default(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Update the classification context. Cached results from another
    /// context are treated as misses and evicted on access.
    pub fn set_context(&mut self, sql_mode: SqlMode, options: ParserOptions) {
        self.sql_mode = sql_mode;
        self.options = options;
    }

    /// Cache key for a packet: the canonical form, with a discriminator for
    /// PREPARE statements since their classification differs from the same
    /// text executed directly.
    pub fn cache_key(&self, packet: &Packet, canonical: &str) -> String {
        let mut key = canonical.to_string();
        let is_prepare = packet.command() == Some(Command::StmtPrepare)
            || packet
                .sql()
                .map(|sql| {
                    sql.trim_start()
                        .get(..8)
                        .map(|head| head.eq_ignore_ascii_case("prepare "))
                        .unwrap_or(false)
                })
                .unwrap_or(false);
        if is_prepare {
            key.push_str(":P");
        }
        key
    }

    /// Pre-dispatch lookup. On a hit the stored classification is returned
    /// together with `CacheProbe::Hit`; on a miss the computed key is handed
    /// back so the post-dispatch hook can store the result.
    pub fn probe(&mut self, key: String) -> (CacheProbe, Option<ClassifiedStmt>) {
        if !self.enabled() {
            return (CacheProbe::Bypass, None);
        }

        match self.entries.get_mut(&key) {
            Some(entry) if entry.sql_mode == self.sql_mode && entry.options == self.options => {
                entry.hits += 1;
                self.stats.hits += 1;
                let stmt = entry.stmt.clone();
                (CacheProbe::Hit, Some(stmt))
            }
            Some(_) => {
                // Context changed since this entry was stored
                self.remove(&key);
                self.stats.misses += 1;
                (CacheProbe::Miss { key }, None)
            }
            None => {
                self.stats.misses += 1;
                (CacheProbe::Miss { key }, None)
            }
        }
    }

    /// Post-dispatch write-back. Stores the result of a missed probe;
    /// results that flip autocommit are session state, not statement
    /// classification, and are never stored.
    pub fn store(&mut self, probe: CacheProbe, stmt: &ClassifiedStmt) {
        let CacheProbe::Miss { key } = probe else {
            return;
        };
        if stmt.type_mask.toggles_autocommit() {
            return;
        }
        self.insert(key, stmt.clone());
    }

    fn insert(&mut self, key: String, stmt: ClassifiedStmt) {
        if !self.enabled() || self.entries.contains_key(&key) {
            return;
        }

        let size = key.len() as u64;
        if size >= MAX_ENTRY_SIZE || size > self.capacity {
            return;
        }

        let required = (self.stats.size + size).saturating_sub(self.capacity);
        if required > 0 {
            self.make_space(required);
        }

        if self.stats.size + size <= self.capacity {
            let slot = self.keys.len();
            self.keys.push(key.clone());
            self.entries.insert(
                key,
                Entry {
                    stmt,
                    sql_mode: self.sql_mode,
                    options: self.options,
                    hits: 0,
                    slot,
                },
            );
            self.stats.inserts += 1;
            self.stats.size += size;
        }
    }

    /// Free at least `required` bytes by evicting uniformly random entries
    fn make_space(&mut self, required: u64) {
        let mut freed = 0;
        while freed < required && !self.keys.is_empty() {
            let slot = self.rng.gen_range(0..self.keys.len());
            let key = self.keys[slot].clone();
            freed += key.len() as u64;
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.stats.size -= key.len() as u64;
            self.stats.evictions += 1;

            // Swap-remove from the sampling index and fix up the moved key
            let slot = entry.slot;
            self.keys.swap_remove(slot);
            if slot < self.keys.len() {
                let moved = self.keys[slot].clone();
                if let Some(moved_entry) = self.entries.get_mut(&moved) {
                    moved_entry.slot = slot;
                }
            }
        }
    }
}
