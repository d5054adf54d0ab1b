//! Scoped holds on the derived locks.
//!
//! A guard unlocks on drop. Guards are neither `Send` nor `Sync`: ownership is
//! tracked per thread, so the release must happen on the acquiring thread.

use std::marker::PhantomData;

use lock_api::GuardNoSend;
use tracing::debug;

use crate::{
    error::SyncError,
    reentrant::ReentrantLock,
    rwlock::{ReadLock, WriteLock},
};

pub struct ReentrantGuard<'s> {
    lock: &'s ReentrantLock,
    _marker: PhantomData<GuardNoSend>,
}

impl<'s> ReentrantGuard<'s> {
    pub(crate) fn new(lock: &'s ReentrantLock) -> Self {
        Self {
            lock,
            _marker: PhantomData,
        }
    }
}

impl<'s> Drop for ReentrantGuard<'s> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            debug!(%err, "reentrant guard release failed");
        }
    }
}

pub struct ReadGuard<'s> {
    lock: ReadLock<'s>,
    _marker: PhantomData<GuardNoSend>,
}

impl<'s> ReadGuard<'s> {
    pub(crate) fn new(lock: ReadLock<'s>) -> Self {
        Self {
            lock,
            _marker: PhantomData,
        }
    }
}

impl<'s> Drop for ReadGuard<'s> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            debug!(%err, "read guard release failed");
        }
    }
}

pub struct WriteGuard<'s> {
    lock: WriteLock<'s>,
    _marker: PhantomData<GuardNoSend>,
}

impl<'s> WriteGuard<'s> {
    pub(crate) fn new(lock: WriteLock<'s>) -> Self {
        Self {
            lock,
            _marker: PhantomData,
        }
    }

    /// Takes a read hold and releases the write hold, keeping the lock
    /// continuously held.
    pub fn downgrade(self) -> Result<ReadGuard<'s>, SyncError> {
        let read = self.lock.read_view();
        read.lock()?;
        // drops self, releasing the write hold
        Ok(ReadGuard::new(read))
    }
}

impl<'s> Drop for WriteGuard<'s> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            debug!(%err, "write guard release failed");
        }
    }
}
