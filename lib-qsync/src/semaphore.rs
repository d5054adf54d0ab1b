use std::time::Duration;

use crate::{
    error::SyncError,
    fairness::Fairness,
    sync::{Policy, Synchronizer},
};

/// Permits live in the state word.
#[derive(Debug, Default)]
pub struct PermitPolicy {
    fairness: Fairness,
}

impl PermitPolicy {
    fn nonfair_try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> i32 {
        loop {
            let available = sync.state();
            let Some(remaining) = available.checked_sub(acquires) else {
                return -1;
            };
            if remaining < 0 || sync.compare_and_set_state(available, remaining) {
                return remaining;
            }
        }
    }
}

impl Policy for PermitPolicy {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, acquires: i32) -> Result<i32, SyncError> {
        if self.fairness.is_fair() && sync.has_queued_predecessors() {
            return Ok(-1);
        }
        Ok(self.nonfair_try_acquire(sync, acquires))
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, releases: i32) -> Result<bool, SyncError> {
        loop {
            let current = sync.state();
            let next = current.checked_add(releases).ok_or(SyncError::Overflow)?;
            if sync.compare_and_set_state(current, next) {
                return Ok(true);
            }
        }
    }
}

/// Counting semaphore.
///
/// The initial permit count may be negative, in which case releases must
/// happen before any acquire succeeds.
#[derive(Debug)]
pub struct Semaphore {
    sync: Synchronizer<PermitPolicy>,
}

fn check_permits(permits: i32) -> Result<i32, SyncError> {
    if permits < 0 {
        return Err(SyncError::IllegalArgument("permit count must not be negative"));
    }
    Ok(permits)
}

impl Semaphore {
    pub fn new(permits: i32, fairness: Fairness) -> Self {
        Self {
            sync: Synchronizer::with_state(PermitPolicy { fairness }, permits),
        }
    }

    /// Blocks until `permits` are available or the thread is interrupted.
    pub fn acquire(&self, permits: i32) -> Result<(), SyncError> {
        self.sync
            .acquire_shared_interruptibly(check_permits(permits)?)
    }

    pub fn acquire_uninterruptibly(&self, permits: i32) -> Result<(), SyncError> {
        self.sync.acquire_shared(check_permits(permits)?)
    }

    /// Takes `permits` if available right now, ahead of queued threads even
    /// on a fair semaphore.
    pub fn try_acquire(&self, permits: i32) -> Result<bool, SyncError> {
        let permits = check_permits(permits)?;
        Ok(self.sync.policy().nonfair_try_acquire(&self.sync, permits) >= 0)
    }

    pub fn try_acquire_for(&self, permits: i32, timeout: Duration) -> Result<bool, SyncError> {
        self.sync
            .try_acquire_shared_for(check_permits(permits)?, timeout)
    }

    pub fn release(&self, permits: i32) -> Result<(), SyncError> {
        self.sync
            .release_shared(check_permits(permits)?)
            .map(|_| ())
    }

    pub fn available_permits(&self) -> i32 {
        self.sync.state()
    }

    /// Takes every immediately available permit and returns how many.
    pub fn drain_permits(&self) -> i32 {
        loop {
            let current = self.sync.state();
            if current == 0 || self.sync.compare_and_set_state(current, 0) {
                return current;
            }
        }
    }

    /// Shrinks the permit count without blocking, possibly below zero.
    pub fn reduce_permits(&self, reduction: i32) -> Result<(), SyncError> {
        let reduction = check_permits(reduction)?;
        loop {
            let current = self.sync.state();
            let next = current.checked_sub(reduction).ok_or(SyncError::Overflow)?;
            if self.sync.compare_and_set_state(current, next) {
                return Ok(());
            }
        }
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fairness.is_fair()
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_accounting() {
        let sem = Semaphore::new(3, Fairness::NonFair);
        assert_eq!(sem.try_acquire(2), Ok(true));
        assert_eq!(sem.try_acquire(2), Ok(false));
        assert_eq!(sem.available_permits(), 1);
        sem.release(4).unwrap();
        assert_eq!(sem.drain_permits(), 5);
        assert_eq!(sem.drain_permits(), 0);
        sem.reduce_permits(2).unwrap();
        assert_eq!(sem.available_permits(), -2);
        assert_eq!(
            sem.try_acquire_for(1, Duration::from_millis(5)),
            Ok(false)
        );
    }

    #[test]
    fn limits_are_reported() {
        let sem = Semaphore::new(i32::MAX, Fairness::Fair);
        assert!(sem.is_fair());
        assert_eq!(sem.release(1), Err(SyncError::Overflow));
        assert!(matches!(sem.acquire(-1), Err(SyncError::IllegalArgument(_))));
        assert!(matches!(sem.release(-1), Err(SyncError::IllegalArgument(_))));

        let sem = Semaphore::new(i32::MIN, Fairness::NonFair);
        assert_eq!(sem.reduce_permits(1), Err(SyncError::Overflow));
        assert_eq!(sem.try_acquire(1), Ok(false));
    }
}
