use std::sync::Mutex;

use clap::Subcommand;
use libqsync::{Fairness, QueuedMutex, ReentrantLock, ReentrantRwLock, Semaphore, StampedLock};
use strum::{Display, EnumIter};

use crate::counter_lock::{BenchmarkType, Guarded};

#[derive(Debug, Subcommand, EnumIter, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LockTarget {
    /// Benchmark the non-fair reentrant lock
    Reentrant,
    /// Benchmark the fair reentrant lock
    ReentrantFair,
    /// Benchmark the non-fair read-write lock
    RwLock,
    /// Benchmark the fair read-write lock
    RwLockFair,
    /// Benchmark the stamped lock
    Stamped,
    /// Benchmark the queued mutex behind lock_api
    QueuedMutex,
    /// Benchmark a single-permit semaphore
    Semaphore,
    /// Benchmark std::sync::Mutex
    Mutex,
}

impl LockTarget {
    pub fn to_locktype(&self) -> BenchmarkType {
        match self {
            LockTarget::Reentrant => Guarded::new(ReentrantLock::new()).into(),
            LockTarget::ReentrantFair => {
                Guarded::new(ReentrantLock::with_fairness(Fairness::Fair)).into()
            }
            LockTarget::RwLock => Guarded::new(ReentrantRwLock::new()).into(),
            LockTarget::RwLockFair => {
                Guarded::new(ReentrantRwLock::with_fairness(Fairness::Fair)).into()
            }
            LockTarget::Stamped => Guarded::new(StampedLock::new()).into(),
            LockTarget::QueuedMutex => Guarded::new(QueuedMutex::new(())).into(),
            LockTarget::Semaphore => Guarded::new(Semaphore::new(1, Fairness::NonFair)).into(),
            LockTarget::Mutex => Guarded::new(Mutex::new(())).into(),
        }
    }
}
