//! Shared supply of work for a single run.
//!
//! A [`WorkManager`] is the only piece of state every worker mutates. It is a
//! pair of atomics: a counter of issued permits and a stop flag. No locking is
//! involved, workers simply stop looping once a permit is refused.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct WorkManager {
    /// `None` means continuous mode.
    limit: Option<u64>,
    issued: AtomicU64,
    stopped: AtomicBool,
}

impl WorkManager {
    /// Issues exactly `count` permits, then refuses.
    pub fn fixed(count: u64) -> Self {
        Self {
            limit: Some(count),
            issued: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Issues permits until [`stop`](Self::stop) is called.
    pub fn continuous() -> Self {
        Self {
            limit: None,
            issued: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Returns whether one more unit of work may proceed.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_index().is_some()
    }

    /// Like [`try_acquire`](Self::try_acquire), but also hands out the logical
    /// index of the granted unit. Indices are unique across all callers and
    /// dense from zero.
    pub fn try_acquire_index(&self) -> Option<u64> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        match self.limit {
            None => Some(self.issued.fetch_add(1, Ordering::AcqRel)),
            Some(limit) => self
                .issued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .ok(),
        }
    }

    /// Refuses all further permits. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of permits handed out so far.
    pub fn issued(&self) -> u64 {
        let issued = self.issued.load(Ordering::Acquire);
        match self.limit {
            Some(limit) => issued.min(limit),
            None => issued,
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.limit.is_none()
    }
}
