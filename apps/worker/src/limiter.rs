//! In-process concurrency ceilings
//!
//! A job may start only when both the global cap and its type's cap have
//! room. Slots are held by an [`InflightPermit`] and released on drop, so a
//! panicking or early-returning job task cannot leak capacity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::queue::JobType;

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    by_type: HashMap<JobType, usize>,
}

/// Global and per-type inflight counters
pub struct InflightLimiter {
    global_cap: usize,
    type_caps: HashMap<JobType, usize>,
    counts: Mutex<Counts>,
}

impl InflightLimiter {
    /// Per-type caps are clamped to `1..=global_cap`; types without an
    /// override share the global cap
    pub fn new(global_cap: usize, type_caps: HashMap<JobType, usize>) -> Self {
        let global_cap = global_cap.max(1);
        let type_caps = type_caps
            .into_iter()
            .map(|(job_type, cap)| (job_type, cap.clamp(1, global_cap)))
            .collect();
        Self {
            global_cap,
            type_caps,
            counts: Mutex::new(Counts::default()),
        }
    }

    pub fn global_cap(&self) -> usize {
        self.global_cap
    }

    pub fn cap_for(&self, job_type: &JobType) -> usize {
        self.type_caps
            .get(job_type)
            .copied()
            .unwrap_or(self.global_cap)
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_room(&self, counts: &Counts, job_type: &JobType) -> bool {
        let running = counts.by_type.get(job_type).copied().unwrap_or(0);
        counts.total < self.global_cap && running < self.cap_for(job_type)
    }

    /// Both the global and the per-type ceiling have room
    pub fn can_run(&self, job_type: &JobType) -> bool {
        let counts = self.lock();
        self.has_room(&counts, job_type)
    }

    /// Take a slot for `job_type` if one is free
    pub fn try_acquire(self: &Arc<Self>, job_type: &JobType) -> Option<InflightPermit> {
        let mut counts = self.lock();
        if !self.has_room(&counts, job_type) {
            return None;
        }
        counts.total += 1;
        *counts.by_type.entry(job_type.clone()).or_insert(0) += 1;
        Some(InflightPermit {
            limiter: Arc::clone(self),
            job_type: job_type.clone(),
        })
    }

    pub fn inflight(&self) -> usize {
        self.lock().total
    }

    pub fn inflight_for(&self, job_type: &JobType) -> usize {
        self.lock().by_type.get(job_type).copied().unwrap_or(0)
    }

    fn release(&self, job_type: &JobType) {
        let mut counts = self.lock();
        counts.total = counts.total.saturating_sub(1);
        if let Some(running) = counts.by_type.get_mut(job_type) {
            *running = running.saturating_sub(1);
        }
    }
}

impl fmt::Debug for InflightLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightLimiter")
            .field("global_cap", &self.global_cap)
            .field("type_caps", &self.type_caps)
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// One occupied slot; released on drop
pub struct InflightPermit {
    limiter: Arc<InflightLimiter>,
    job_type: JobType,
}

impl InflightPermit {
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.limiter.release(&self.job_type);
    }
}

impl fmt::Debug for InflightPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightPermit")
            .field("job_type", &self.job_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global: usize, caps: &[(&str, usize)]) -> Arc<InflightLimiter> {
        let caps = caps
            .iter()
            .map(|(name, cap)| (JobType::from(*name), *cap))
            .collect();
        Arc::new(InflightLimiter::new(global, caps))
    }

    #[test]
    fn test_per_type_cap_throttles_before_global() {
        let limiter = limiter(4, &[("slow", 1)]);
        let slow = JobType::from("slow");
        let fast = JobType::from("fast");

        let held = limiter.try_acquire(&slow).unwrap();
        assert!(!limiter.can_run(&slow));
        assert!(limiter.try_acquire(&slow).is_none());
        assert!(limiter.can_run(&fast));

        drop(held);
        assert!(limiter.can_run(&slow));
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn test_global_cap_applies_across_types() {
        let limiter = limiter(2, &[]);
        let a = JobType::from("a");
        let b = JobType::from("b");

        let _first = limiter.try_acquire(&a).unwrap();
        let _second = limiter.try_acquire(&b).unwrap();
        assert!(!limiter.can_run(&a));
        assert!(limiter.try_acquire(&b).is_none());
        assert_eq!(limiter.inflight_for(&a), 1);
        assert_eq!(limiter.inflight(), 2);
    }

    #[test]
    fn test_type_cap_clamped_to_global() {
        let limiter = limiter(3, &[("big", 50), ("zero", 0)]);
        assert_eq!(limiter.cap_for(&JobType::from("big")), 3);
        assert_eq!(limiter.cap_for(&JobType::from("zero")), 1);
        assert_eq!(limiter.cap_for(&JobType::from("other")), 3);
    }
}
