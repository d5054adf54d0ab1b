//! Non-reentrant mutex on the queued synchronizer, exposed through
//! `lock_api` so it can back a data-carrying [`QueuedMutex`].

use std::time::{Duration, Instant};

use lock_api::{GuardSend, RawMutex, RawMutexTimed};

use crate::{
    error::SyncError,
    sync::{Policy, Synchronizer},
};

/// State `0` is unlocked, `1` locked. No owner is recorded, so the guard may
/// be released from another thread.
#[derive(Debug, Default)]
pub struct MutexPolicy;

impl Policy for MutexPolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, _: i32) -> Result<bool, SyncError> {
        Ok(sync.compare_and_set_state(0, 1))
    }

    fn try_release(&self, sync: &Synchronizer<Self>, _: i32) -> Result<bool, SyncError> {
        if sync.state() == 0 {
            return Err(SyncError::IllegalMonitorState);
        }
        sync.set_state(0);
        Ok(true)
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        Ok(sync.state() == 1)
    }
}

#[derive(Debug)]
pub struct RawQueuedMutex {
    sync: Synchronizer<MutexPolicy>,
}

impl RawQueuedMutex {
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }
}

unsafe impl RawMutex for RawQueuedMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sync: Synchronizer::new(MutexPolicy),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        // hooks of the mutex policy cannot fail
        let _ = self.sync.acquire(1);
    }

    fn try_lock(&self) -> bool {
        self.sync.try_acquire(1).unwrap_or(false)
    }

    unsafe fn unlock(&self) {
        let _ = self.sync.release(1);
    }

    fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }
}

/// Timed attempts report a pending interrupt as a failed attempt and
/// consume it.
unsafe impl RawMutexTimed for RawQueuedMutex {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        self.sync.try_acquire_for(1, timeout).unwrap_or(false)
    }

    fn try_lock_until(&self, deadline: Instant) -> bool {
        self.sync.try_acquire_until(1, deadline).unwrap_or(false)
    }
}

pub type QueuedMutex<T> = lock_api::Mutex<RawQueuedMutex, T>;
pub type QueuedMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawQueuedMutex, T>;
