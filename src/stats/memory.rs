//! # Stage: Bounded In-Memory Statistics
//!
//! ## Responsibility
//! Count signature hits in a process-local map guarded by a read/write lock.
//!
//! ## Guarantees
//! - Bounded: at most `max_keys` distinct signatures are ever tracked. Once
//!   full, unseen signatures are dropped silently while known ones keep
//!   counting. Nothing is evicted, so a dropped signature stays invisible.
//! - Atomic increments: the absent-check, cap-check and insert run under one
//!   write lock, so concurrent first hits of a signature never double-insert.
//! - Non-panicking: a poisoned lock is recovered, the map holds plain counters.
//!
//! ## NOT Responsible For
//! - Persistence (lost on restart)
//! - Sharing counts between processes (use the Redis backend)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use super::repository::{prefer_greater_member, StatsRepository, Top};
use super::signature::Signature;
use crate::error::StatsError;

/// Default cap on distinct signatures.
pub const DEFAULT_MAX_KEYS: usize = 100_000;

/// Process-local [`StatsRepository`].
#[derive(Debug)]
pub struct MemoryRepository {
    counts: RwLock<HashMap<Signature, u64>>,
    /// `0` disables the cap.
    max_keys: usize,
    dropped: AtomicU64,
    cap_reported: AtomicBool,
}

impl MemoryRepository {
    /// Repository capped at [`DEFAULT_MAX_KEYS`].
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    /// Repository capped at `max_keys` distinct signatures (`0` = unbounded).
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            max_keys,
            dropped: AtomicU64::new(0),
            cap_reported: AtomicBool::new(false),
        }
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Number of distinct signatures currently tracked.
    pub fn len(&self) -> usize {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Increments discarded because the map was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn bump(&self, signature: &Signature) {
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(hits) = counts.get_mut(signature) {
            *hits = hits.saturating_add(1);
            return;
        }

        if self.max_keys > 0 && counts.len() >= self.max_keys {
            drop(counts);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.cap_reported.swap(true, Ordering::Relaxed) {
                warn!(
                    max_keys = self.max_keys,
                    "stats map is full; new signatures are no longer counted"
                );
            }
            return;
        }

        counts.insert(signature.clone(), 1);
    }

    // Linear scan: the map is bounded and `/stats` is the cold path.
    fn scan(&self) -> Result<Option<Top>, StatsError> {
        let counts = self.counts.read().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(&Signature, u64)> = None;
        // Canonical form of `best`, computed only once a tie needs it.
        let mut best_member: Option<String> = None;

        for (signature, &hits) in counts.iter() {
            match best {
                Some((_, best_hits)) if hits < best_hits => {}
                Some((best_sig, best_hits)) if hits == best_hits => {
                    let incumbent = match best_member.take() {
                        Some(member) => member,
                        None => best_sig.canonical()?,
                    };
                    let (kept, replaced) =
                        prefer_greater_member(incumbent, signature.canonical()?);
                    if replaced {
                        best = Some((signature, hits));
                    }
                    best_member = Some(kept);
                }
                _ => {
                    best = Some((signature, hits));
                    best_member = None;
                }
            }
        }

        Ok(best.map(|(signature, hits)| Top {
            parameters: signature.clone(),
            hits,
        }))
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatsRepository for MemoryRepository {
    async fn increment(&self, signature: &Signature) -> Result<(), StatsError> {
        self.bump(signature);
        Ok(())
    }

    async fn top(&self) -> Result<Option<Top>, StatsError> {
        self.scan()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
