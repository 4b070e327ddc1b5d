//! Bounded duplicate-share filter.
//!
//! Keys are `(job_id, nonce, extranonce2)`. Entries live as long as their job:
//! invalidating a job drops its keys, and when more than `max_jobs` jobs are
//! tracked the oldest job is evicted wholesale.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    nonce: u32,
    extranonce2: String,
}

#[derive(Debug)]
pub struct DuplicateFilter {
    jobs: HashMap<String, HashSet<ShareKey>>,
    /// Job ids, oldest first
    order: VecDeque<String>,
    max_jobs: usize,
}

impl DuplicateFilter {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: VecDeque::new(),
            max_jobs: max_jobs.max(1),
        }
    }

    /// Record a share. Returns false if it was already seen.
    pub fn insert(&mut self, job_id: &str, nonce: u32, extranonce2: &str) -> bool {
        let key = ShareKey {
            nonce,
            extranonce2: extranonce2.to_ascii_lowercase(),
        };

        if !self.jobs.contains_key(job_id) {
            self.order.push_back(job_id.to_string());
            while self.order.len() > self.max_jobs {
                if let Some(oldest) = self.order.pop_front() {
                    self.jobs.remove(&oldest);
                }
            }
        }

        self.jobs.entry(job_id.to_string()).or_default().insert(key)
    }

    pub fn contains(&self, job_id: &str, nonce: u32, extranonce2: &str) -> bool {
        self.jobs.get(job_id).map_or(false, |keys| {
            keys.contains(&ShareKey {
                nonce,
                extranonce2: extranonce2.to_ascii_lowercase(),
            })
        })
    }

    /// Forget every key of a stale job
    pub fn evict_job(&mut self, job_id: &str) {
        if self.jobs.remove(job_id).is_some() {
            self.order.retain(|id| id != job_id);
        }
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.order.clear();
    }

    /// Number of remembered shares
    pub fn len(&self) -> usize {
        self.jobs.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }
}
