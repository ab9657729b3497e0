//! Per-trace ownership.
//!
//! A trace is owned by the user recorded on its server root span, or by the
//! user who first reported any span for it within the retention window,
//! whichever was established first. A second user claiming an owned trace is
//! a conflict and rejects the batch.
//!
//! Resolved owners are cached in a bounded LRU sharded by trace id; entries
//! expire at the retention cutoff. Each shard takes its own lock so ingest
//! batches touching different traces do not contend.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use sidechain_telemetry::TraceId;

const SHARD_COUNT: usize = 16;

/// Outcome of an ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipClaim {
    /// The caller owns this trace (or just established ownership).
    Owned,
    /// Another user owns the trace.
    Conflict { owner: String },
}

#[derive(Debug, Clone)]
struct OwnerEntry {
    user_id: String,
    claimed_at: DateTime<Utc>,
}

struct Shard {
    entries: HashMap<TraceId, OwnerEntry>,
    order: VecDeque<TraceId>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, trace_id: TraceId) {
        if let Some(pos) = self.order.iter().position(|id| *id == trace_id) {
            self.order.remove(pos);
        }
        self.order.push_back(trace_id);
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Sharded LRU of trace owners.
pub struct TraceOwnership {
    shards: Vec<Mutex<Shard>>,
    entries_per_shard: usize,
    retention: Duration,
}

impl TraceOwnership {
    pub fn new(entries_per_shard: usize, retention_days: u32) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
            entries_per_shard: entries_per_shard.max(1),
            retention: Duration::days(retention_days as i64),
        }
    }

    fn shard(&self, trace_id: TraceId) -> &Mutex<Shard> {
        let index = (trace_id.as_u128() % SHARD_COUNT as u128) as usize;
        &self.shards[index]
    }

    /// The cached owner of a trace, ignoring expired entries.
    pub fn cached_owner(&self, trace_id: TraceId) -> Option<String> {
        let now = Utc::now();
        let mut shard = self.shard(trace_id).lock();
        match shard.entries.get(&trace_id) {
            Some(entry) if now - entry.claimed_at < self.retention => {
                let owner = entry.user_id.clone();
                shard.touch(trace_id);
                Some(owner)
            }
            Some(_) => {
                // Expired: the trace's spans have aged out, so ownership is
                // up for grabs again.
                shard.entries.remove(&trace_id);
                None
            }
            None => None,
        }
    }

    /// Claim a trace for `user_id`, or detect a conflict with the cached
    /// owner. Callers resolve uncached traces against storage first and seed
    /// the cache via [`TraceOwnership::record_owner`].
    pub fn claim(&self, trace_id: TraceId, user_id: &str) -> OwnershipClaim {
        let now = Utc::now();
        let mut shard = self.shard(trace_id).lock();

        if let Some(entry) = shard.entries.get(&trace_id) {
            if now - entry.claimed_at < self.retention {
                let claim = if entry.user_id == user_id {
                    OwnershipClaim::Owned
                } else {
                    OwnershipClaim::Conflict {
                        owner: entry.user_id.clone(),
                    }
                };
                shard.touch(trace_id);
                return claim;
            }
            shard.entries.remove(&trace_id);
        }

        shard.entries.insert(
            trace_id,
            OwnerEntry {
                user_id: user_id.to_string(),
                claimed_at: now,
            },
        );
        shard.touch(trace_id);
        let capacity = self.entries_per_shard;
        shard.evict_to(capacity);
        OwnershipClaim::Owned
    }

    /// Seed the cache with an owner resolved from storage.
    pub fn record_owner(&self, trace_id: TraceId, user_id: &str, claimed_at: DateTime<Utc>) {
        let mut shard = self.shard(trace_id).lock();
        shard.entries.insert(
            trace_id,
            OwnerEntry {
                user_id: user_id.to_string(),
                claimed_at,
            },
        );
        shard.touch(trace_id);
        let capacity = self.entries_per_shard;
        shard.evict_to(capacity);
    }

    pub fn cached_traces(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }
}
