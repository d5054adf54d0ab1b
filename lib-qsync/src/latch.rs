use std::time::Duration;

use crate::{
    error::SyncError,
    sync::{Policy, Synchronizer},
};

#[derive(Debug, Default)]
pub struct CountPolicy;

impl Policy for CountPolicy {
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<i32, SyncError> {
        Ok(if sync.state() == 0 { 1 } else { -1 })
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<bool, SyncError> {
        loop {
            let c = sync.state();
            if c == 0 {
                return Ok(false);
            }
            if sync.compare_and_set_state(c, c - 1) {
                return Ok(c == 1);
            }
        }
    }
}

/// One-shot gate that opens once `count_down` was called `count` times.
#[derive(Debug)]
pub struct CountDownLatch {
    sync: Synchronizer<CountPolicy>,
}

impl CountDownLatch {
    pub fn new(count: i32) -> Result<Self, SyncError> {
        if count < 0 {
            return Err(SyncError::IllegalArgument("latch count must not be negative"));
        }
        Ok(Self {
            sync: Synchronizer::with_state(CountPolicy, count),
        })
    }

    /// Blocks until the count reaches zero or the thread is interrupted.
    pub fn wait(&self) -> Result<(), SyncError> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// `Ok(false)` if the timeout elapsed while the count was still positive.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.sync.try_acquire_shared_for(1, timeout)
    }

    /// Releases every waiter when the count reaches zero. No effect once it
    /// is zero.
    pub fn count_down(&self) {
        // the count policy never fails
        let _ = self.sync.release_shared(1);
    }

    pub fn count(&self) -> i32 {
        self.sync.state()
    }
}
