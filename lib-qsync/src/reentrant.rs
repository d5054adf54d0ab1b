use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    condition::ConditionObject,
    error::SyncError,
    fairness::Fairness,
    guard::ReentrantGuard,
    parker::{self, ThreadHandle},
    sync::{Policy, Synchronizer},
};

/// Hold count in the state word, owner id in the synchronizer.
#[derive(Debug, Default)]
pub struct ReentrantPolicy {
    fairness: Fairness,
}

impl ReentrantPolicy {
    /// First attempt made by `lock`, before any queueing.
    fn initial_try_lock(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        let c = sync.state();
        if c == 0 {
            let barred = self.fairness.is_fair() && sync.has_queued_threads();
            if !barred && sync.compare_and_set_state(0, 1) {
                sync.set_exclusive_owner(Some(parker::current_id()));
                return Ok(true);
            }
        } else if sync.is_owned_by_current() {
            sync.set_state(c.checked_add(1).ok_or(SyncError::Overflow)?);
            return Ok(true);
        }
        Ok(false)
    }

    /// Takes the lock if free or already owned, regardless of fairness.
    fn barging_try_lock(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        let c = sync.state();
        if c == 0 {
            if sync.compare_and_set_state(0, 1) {
                sync.set_exclusive_owner(Some(parker::current_id()));
                return Ok(true);
            }
        } else if sync.is_owned_by_current() {
            sync.set_state(c.checked_add(1).ok_or(SyncError::Overflow)?);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Policy for ReentrantPolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> Result<bool, SyncError> {
        if sync.state() == 0
            && !(self.fairness.is_fair() && sync.has_queued_predecessors())
            && sync.compare_and_set_state(0, acquires)
        {
            sync.set_exclusive_owner(Some(parker::current_id()));
            return Ok(true);
        }
        Ok(false)
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: i32) -> Result<bool, SyncError> {
        if !sync.is_owned_by_current() {
            debug!("unlock by a thread that does not own the lock");
            return Err(SyncError::IllegalMonitorState);
        }
        let c = sync.state() - releases;
        let free = c == 0;
        if free {
            sync.set_exclusive_owner(None);
        }
        sync.set_state(c);
        Ok(free)
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        Ok(sync.is_owned_by_current())
    }
}

/// Reentrant mutual exclusion lock.
///
/// The owning thread may lock again; each `lock` needs a matching `unlock`.
/// Hold counts are limited to `i32::MAX`.
#[derive(Debug, Default)]
pub struct ReentrantLock {
    sync: Synchronizer<ReentrantPolicy>,
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self::with_fairness(Fairness::NonFair)
    }

    pub const fn with_fairness(fairness: Fairness) -> Self {
        Self {
            sync: Synchronizer::new(ReentrantPolicy { fairness }),
        }
    }

    /// Blocks until the lock is held, ignoring interrupts.
    pub fn lock(&self) -> Result<(), SyncError> {
        if !self.sync.policy().initial_try_lock(&self.sync)? {
            self.sync.acquire(1)?;
        }
        Ok(())
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !self.sync.policy().initial_try_lock(&self.sync)? {
            self.sync.acquire_interruptibly(1)?;
        }
        Ok(())
    }

    /// Takes the lock only if it is free right now, even when the lock is
    /// fair and other threads are queued.
    pub fn try_lock(&self) -> Result<bool, SyncError> {
        self.sync.policy().barging_try_lock(&self.sync)
    }

    /// Honours fairness, unlike [`try_lock`](Self::try_lock).
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.sync.policy().initial_try_lock(&self.sync)? {
            return Ok(true);
        }
        self.sync.try_acquire_for(1, timeout)
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Result<bool, SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.sync.policy().initial_try_lock(&self.sync)? {
            return Ok(true);
        }
        self.sync.try_acquire_until(1, deadline)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.sync.release(1).map(|_| ())
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard(&self) -> Result<ReentrantGuard<'_>, SyncError> {
        self.lock()?;
        Ok(ReentrantGuard::new(self))
    }

    pub fn new_condition(&self) -> ConditionObject<'_, ReentrantPolicy> {
        self.sync.new_condition()
    }

    /// Holds by the current thread, zero if it does not own the lock.
    pub fn hold_count(&self) -> u32 {
        if self.sync.is_owned_by_current() {
            self.sync.state() as u32
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.is_owned_by_current()
    }

    pub fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fairness.is_fair()
    }

    /// Id of the owning thread, see [`parker::current_id`].
    pub fn owner(&self) -> Option<u64> {
        self.sync.exclusive_owner()
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    pub fn has_queued_thread(&self, thread: &ThreadHandle) -> bool {
        self.sync.is_queued(thread)
    }

    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.sync.queued_threads()
    }

    pub fn has_waiters(
        &self,
        condition: &ConditionObject<'_, ReentrantPolicy>,
    ) -> Result<bool, SyncError> {
        self.sync.has_waiters(condition)
    }

    pub fn wait_queue_length(
        &self,
        condition: &ConditionObject<'_, ReentrantPolicy>,
    ) -> Result<usize, SyncError> {
        self.sync.wait_queue_length(condition)
    }

    pub fn waiting_threads(
        &self,
        condition: &ConditionObject<'_, ReentrantPolicy>,
    ) -> Result<Vec<ThreadHandle>, SyncError> {
        self.sync.waiting_threads(condition)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn holds_nest() {
        let lock = ReentrantLock::new();
        for depth in 1..=5 {
            lock.lock().unwrap();
            assert_eq!(lock.hold_count(), depth);
        }
        assert_eq!(lock.owner(), Some(parker::current_id()));
        for depth in (0..5).rev() {
            lock.unlock().unwrap();
            assert_eq!(lock.hold_count(), depth);
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn unlock_without_lock_is_rejected() {
        let lock = ReentrantLock::new();
        assert_eq!(lock.unlock(), Err(SyncError::IllegalMonitorState));

        lock.lock().unwrap();
        thread::scope(|s| {
            let other = s.spawn(|| (lock.unlock(), lock.try_lock()));
            assert_eq!(
                other.join().unwrap(),
                (Err(SyncError::IllegalMonitorState), Ok(false))
            );
        });
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
    }

    #[test]
    fn hold_count_overflow() {
        let lock = ReentrantLock::new();
        lock.lock().unwrap();
        lock.sync.set_state(i32::MAX);
        assert_eq!(lock.lock(), Err(SyncError::Overflow));
        assert_eq!(lock.try_lock(), Err(SyncError::Overflow));
        lock.sync.set_state(1);
        lock.unlock().unwrap();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let lock = ReentrantLock::with_fairness(Fairness::Fair);
        assert!(lock.is_fair());
        {
            let _outer = lock.guard().unwrap();
            let _inner = lock.guard().unwrap();
            assert_eq!(lock.hold_count(), 2);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn timed_lock_times_out_while_held_elsewhere() {
        let lock = ReentrantLock::new();
        lock.lock().unwrap();
        thread::scope(|s| {
            let other = s.spawn(|| lock.try_lock_for(Duration::from_millis(20)));
            assert_eq!(other.join().unwrap(), Ok(false));
        });
        assert!(!lock.has_queued_threads());
        lock.unlock().unwrap();
    }
}
