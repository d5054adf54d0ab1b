//! Reentrant read/write lock.
//!
//! The state word is split in two 16 bit halves: the upper half counts read
//! holds across all threads, the lower half counts the writer's reentrant
//! holds. Each thread's own read hold count lives in a [`ThreadLocal`] so
//! that unmatched unlocks can be detected and reentrant reads are never
//! blocked behind a queued writer.
//!
//! Slots of the [`ThreadLocal`] are reused once their thread exits, so each
//! count is tagged with the id of the thread that took it. Read holds still
//! held by a thread when it exits are never released: the shared count stays
//! raised and writers block until the lock is dropped.
//!
//! The writer may also take read holds, which is how a write lock is
//! downgraded. Upgrading a read hold is not supported and will block.

use std::{cell::Cell, time::Duration};

use thread_local::ThreadLocal;
use tracing::debug;

use crate::{
    condition::ConditionObject,
    error::SyncError,
    fairness::Fairness,
    guard::{ReadGuard, WriteGuard},
    parker::{self, ThreadHandle},
    sync::{Policy, Synchronizer},
};

const SHARED_SHIFT: u32 = 16;
const SHARED_UNIT: u32 = 1 << SHARED_SHIFT;
const MAX_COUNT: u32 = (1 << SHARED_SHIFT) - 1;
const EXCLUSIVE_MASK: u32 = MAX_COUNT;

fn shared_count(c: i32) -> u32 {
    (c as u32) >> SHARED_SHIFT
}

fn exclusive_count(c: i32) -> u32 {
    c as u32 & EXCLUSIVE_MASK
}

fn add_shared(c: i32) -> i32 {
    (c as u32).wrapping_add(SHARED_UNIT) as i32
}

fn sub_shared(c: i32) -> i32 {
    (c as u32).wrapping_sub(SHARED_UNIT) as i32
}

#[derive(Debug, Default)]
pub struct RwPolicy {
    fairness: Fairness,
    /// Owning thread id and its read hold count.
    read_holds: ThreadLocal<Cell<(u64, u32)>>,
}

impl RwPolicy {
    fn reader_should_block(&self, sync: &Synchronizer<Self>) -> bool {
        if self.fairness.is_fair() {
            sync.has_queued_predecessors()
        } else {
            sync.apparently_first_queued_is_exclusive()
        }
    }

    fn writer_should_block(&self, sync: &Synchronizer<Self>) -> bool {
        self.fairness.is_fair() && sync.has_queued_predecessors()
    }

    /// This thread's slot, reset first if an exited thread left it behind.
    fn holds(&self) -> &Cell<(u64, u32)> {
        let me = parker::current_id();
        let slot = self.read_holds.get_or(|| Cell::new((me, 0)));
        let (owner, count) = slot.get();
        if owner != me {
            if count != 0 {
                debug!(owner, count, "discarding read holds of an exited thread");
            }
            slot.set((me, 0));
        }
        slot
    }

    fn bump_holds(&self) {
        let holds = self.holds();
        let (me, count) = holds.get();
        holds.set((me, count + 1));
    }

    fn read_hold_count(&self) -> u32 {
        match self.read_holds.get().map(Cell::get) {
            Some((owner, count)) if owner == parker::current_id() => count,
            _ => 0,
        }
    }

    /// Slow path of shared acquisition, handles CAS misses and reentrant
    /// reads that must not block behind a queued writer.
    fn full_try_acquire_shared(&self, sync: &Synchronizer<Self>) -> Result<i32, SyncError> {
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 {
                if !sync.is_owned_by_current() {
                    return Ok(-1);
                }
            } else if self.reader_should_block(sync) && self.read_hold_count() == 0 {
                return Ok(-1);
            }
            if shared_count(c) == MAX_COUNT {
                return Err(SyncError::Overflow);
            }
            if sync.compare_and_set_state(c, add_shared(c)) {
                self.bump_holds();
                return Ok(1);
            }
        }
    }

    /// Barging write attempt used by `try_lock`.
    fn try_write_lock(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        let c = sync.state();
        if c != 0 {
            let w = exclusive_count(c);
            if w == 0 || !sync.is_owned_by_current() {
                return Ok(false);
            }
            if w == MAX_COUNT {
                return Err(SyncError::Overflow);
            }
        }
        if !sync.compare_and_set_state(c, c.wrapping_add(1)) {
            return Ok(false);
        }
        sync.set_exclusive_owner(Some(parker::current_id()));
        Ok(true)
    }

    /// Barging read attempt used by `try_lock`.
    fn try_read_lock(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 && !sync.is_owned_by_current() {
                return Ok(false);
            }
            if shared_count(c) == MAX_COUNT {
                return Err(SyncError::Overflow);
            }
            if sync.compare_and_set_state(c, add_shared(c)) {
                self.bump_holds();
                return Ok(true);
            }
        }
    }
}

impl Policy for RwPolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: i32) -> Result<bool, SyncError> {
        let c = sync.state();
        let w = exclusive_count(c);
        if c != 0 {
            // c != 0 with w == 0 means readers hold the lock
            if w == 0 || !sync.is_owned_by_current() {
                return Ok(false);
            }
            if w + exclusive_count(acquires) > MAX_COUNT {
                return Err(SyncError::Overflow);
            }
            sync.set_state(c.wrapping_add(acquires));
            return Ok(true);
        }
        if self.writer_should_block(sync) || !sync.compare_and_set_state(c, acquires) {
            return Ok(false);
        }
        sync.set_exclusive_owner(Some(parker::current_id()));
        Ok(true)
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: i32) -> Result<bool, SyncError> {
        if !sync.is_owned_by_current() {
            debug!("write unlock by a thread that does not hold the write lock");
            return Err(SyncError::IllegalMonitorState);
        }
        let next = sync.state().wrapping_sub(releases);
        let free = exclusive_count(next) == 0;
        if free {
            sync.set_exclusive_owner(None);
        }
        sync.set_state(next);
        Ok(free)
    }

    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<i32, SyncError> {
        let c = sync.state();
        if exclusive_count(c) != 0 && !sync.is_owned_by_current() {
            return Ok(-1);
        }
        if !self.reader_should_block(sync)
            && shared_count(c) < MAX_COUNT
            && sync.compare_and_set_state(c, add_shared(c))
        {
            self.bump_holds();
            return Ok(1);
        }
        self.full_try_acquire_shared(sync)
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<bool, SyncError> {
        let holds = self.holds();
        let (me, count) = holds.get();
        if count == 0 {
            debug!("read unlock without a matching read lock");
            return Err(SyncError::IllegalMonitorState);
        }
        holds.set((me, count - 1));
        loop {
            let c = sync.state();
            let next = sub_shared(c);
            if sync.compare_and_set_state(c, next) {
                return Ok(next == 0);
            }
        }
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        Ok(sync.is_owned_by_current())
    }
}

#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    sync: Synchronizer<RwPolicy>,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::with_fairness(Fairness::NonFair)
    }

    pub fn with_fairness(fairness: Fairness) -> Self {
        Self {
            sync: Synchronizer::new(RwPolicy {
                fairness,
                read_holds: ThreadLocal::new(),
            }),
        }
    }

    pub fn read(&self) -> ReadLock<'_> {
        ReadLock { lock: self }
    }

    pub fn write(&self) -> WriteLock<'_> {
        WriteLock { lock: self }
    }

    /// Read holds across all threads.
    pub fn read_lock_count(&self) -> u32 {
        shared_count(self.sync.state())
    }

    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.sync.state()) != 0
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.sync.is_owned_by_current()
    }

    pub fn write_hold_count(&self) -> u32 {
        if self.sync.is_owned_by_current() {
            exclusive_count(self.sync.state())
        } else {
            0
        }
    }

    /// Read holds of the calling thread.
    pub fn read_hold_count(&self) -> u32 {
        self.sync.policy().read_hold_count()
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fairness.is_fair()
    }

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

    pub fn queued_writer_threads(&self) -> Vec<ThreadHandle> {
        self.sync.exclusive_queued_threads()
    }

    pub fn queued_reader_threads(&self) -> Vec<ThreadHandle> {
        self.sync.shared_queued_threads()
    }

    pub fn has_waiters(&self, condition: &ConditionObject<'_, RwPolicy>) -> Result<bool, SyncError> {
        self.sync.has_waiters(condition)
    }

    pub fn wait_queue_length(
        &self,
        condition: &ConditionObject<'_, RwPolicy>,
    ) -> Result<usize, SyncError> {
        self.sync.wait_queue_length(condition)
    }
}

/// Shared view of a [`ReentrantRwLock`].
#[derive(Debug, Clone, Copy)]
pub struct ReadLock<'a> {
    lock: &'a ReentrantRwLock,
}

impl<'a> ReadLock<'a> {
    pub fn lock(&self) -> Result<(), SyncError> {
        self.lock.sync.acquire_shared(1)
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.lock.sync.acquire_shared_interruptibly(1)
    }

    /// Takes a read hold unless a writer holds the lock right now, ignoring
    /// fairness and queued writers.
    pub fn try_lock(&self) -> Result<bool, SyncError> {
        self.lock.sync.policy().try_read_lock(&self.lock.sync)
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.lock.sync.try_acquire_shared_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.lock.sync.release_shared(1).map(|_| ())
    }

    pub fn guard(&self) -> Result<ReadGuard<'a>, SyncError> {
        self.lock()?;
        Ok(ReadGuard::new(*self))
    }

    /// Read holds cannot wait on conditions.
    pub fn new_condition(&self) -> Result<ConditionObject<'a, RwPolicy>, SyncError> {
        Err(SyncError::Unsupported)
    }
}

/// Exclusive view of a [`ReentrantRwLock`].
#[derive(Debug, Clone, Copy)]
pub struct WriteLock<'a> {
    lock: &'a ReentrantRwLock,
}

impl<'a> WriteLock<'a> {
    pub fn lock(&self) -> Result<(), SyncError> {
        self.lock.sync.acquire(1)
    }

    pub fn lock_interruptibly(&self) -> Result<(), SyncError> {
        self.lock.sync.acquire_interruptibly(1)
    }

    /// Takes the write lock if it is free or already ours, ignoring fairness.
    pub fn try_lock(&self) -> Result<bool, SyncError> {
        self.lock.sync.policy().try_write_lock(&self.lock.sync)
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.lock.sync.try_acquire_for(1, timeout)
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        self.lock.sync.release(1).map(|_| ())
    }

    pub fn guard(&self) -> Result<WriteGuard<'a>, SyncError> {
        self.lock()?;
        Ok(WriteGuard::new(*self))
    }

    pub fn new_condition(&self) -> Result<ConditionObject<'a, RwPolicy>, SyncError> {
        Ok(self.lock.sync.new_condition())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock.is_write_locked_by_current_thread()
    }

    pub fn hold_count(&self) -> u32 {
        self.lock.write_hold_count()
    }

    pub(crate) fn read_view(&self) -> ReadLock<'a> {
        self.lock.read()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn state_halves() {
        let c = add_shared(add_shared(3));
        assert_eq!(shared_count(c), 2);
        assert_eq!(exclusive_count(c), 3);
        assert_eq!(shared_count(sub_shared(c)), 1);
        let full = (MAX_COUNT << SHARED_SHIFT) as i32;
        assert_eq!(shared_count(full), MAX_COUNT);
        assert_eq!(exclusive_count(full), 0);
    }

    #[test]
    fn write_lock_downgrades() {
        let lock = ReentrantRwLock::new();
        let guard = lock.write().guard().unwrap();
        assert!(lock.is_write_locked_by_current_thread());
        let read = guard.downgrade().unwrap();
        assert!(!lock.is_write_locked());
        assert_eq!(lock.read_lock_count(), 1);
        assert_eq!(lock.read_hold_count(), 1);

        thread::scope(|s| {
            let other = s.spawn(|| (lock.write().try_lock(), lock.read().try_lock()));
            assert_eq!(other.join().unwrap(), (Ok(false), Ok(true)));
        });
        drop(read);
        assert_eq!(lock.read_lock_count(), 1);
    }

    #[test]
    fn read_hold_does_not_upgrade() {
        let lock = ReentrantRwLock::new();
        lock.read().lock().unwrap();
        assert_eq!(lock.write().try_lock(), Ok(false));
        assert_eq!(lock.write().try_lock_for(Duration::from_millis(10)), Ok(false));
        lock.read().unlock().unwrap();
        assert_eq!(lock.write().try_lock(), Ok(true));
        lock.write().unlock().unwrap();
    }

    #[test]
    fn unmatched_unlocks_are_rejected() {
        let lock = ReentrantRwLock::new();
        assert_eq!(lock.read().unlock(), Err(SyncError::IllegalMonitorState));
        assert_eq!(lock.write().unlock(), Err(SyncError::IllegalMonitorState));

        lock.read().lock().unwrap();
        thread::scope(|s| {
            let other = s.spawn(|| lock.read().unlock());
            assert_eq!(other.join().unwrap(), Err(SyncError::IllegalMonitorState));
        });
        assert_eq!(lock.read_lock_count(), 1);
        lock.read().unlock().unwrap();
    }

    #[test]
    fn exited_reader_holds_are_not_inherited() {
        let lock = ReentrantRwLock::new();
        thread::scope(|s| {
            s.spawn(|| lock.read().lock()).join().unwrap().unwrap();
        });
        assert_eq!(lock.read_lock_count(), 1);

        for _ in 0..4 {
            thread::scope(|s| {
                let next = s.spawn(|| (lock.read_hold_count(), lock.read().unlock()));
                assert_eq!(
                    next.join().unwrap(),
                    (0, Err(SyncError::IllegalMonitorState))
                );
            });
        }
        assert_eq!(lock.read_lock_count(), 1);
        assert_eq!(lock.write().try_lock(), Ok(false));
    }

    #[test]
    fn read_count_saturates() {
        let lock = ReentrantRwLock::new();
        for _ in 0..MAX_COUNT {
            assert_eq!(lock.read().try_lock(), Ok(true));
        }
        assert_eq!(lock.read().try_lock(), Err(SyncError::Overflow));
        assert_eq!(lock.read().lock(), Err(SyncError::Overflow));
        assert_eq!(lock.read_hold_count(), MAX_COUNT);
        for _ in 0..MAX_COUNT {
            lock.read().unlock().unwrap();
        }
        assert_eq!(lock.read_lock_count(), 0);
    }

    #[test]
    fn write_holds_nest_and_saturate() {
        let lock = ReentrantRwLock::with_fairness(Fairness::Fair);
        lock.write().lock().unwrap();
        lock.write().lock().unwrap();
        assert_eq!(lock.write().hold_count(), 2);
        lock.sync.set_state(MAX_COUNT as i32);
        assert_eq!(lock.write().lock(), Err(SyncError::Overflow));
        assert_eq!(lock.write().try_lock(), Err(SyncError::Overflow));
        lock.sync.set_state(1);
        lock.write().unlock().unwrap();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn conditions_only_on_write_view() {
        let lock = ReentrantRwLock::new();
        assert_eq!(lock.read().new_condition().err(), Some(SyncError::Unsupported));
        let cond = lock.write().new_condition().unwrap();
        lock.write().lock().unwrap();
        assert_eq!(cond.wait_timeout(Duration::from_millis(5)), Ok(false));
        assert_eq!(lock.has_waiters(&cond), Ok(false));
        lock.write().unlock().unwrap();
        assert_eq!(cond.signal(), Err(SyncError::IllegalMonitorState));
    }
}
