pub mod condition;
pub mod error;
pub mod fairness;
pub mod guard;
pub mod latch;
pub mod mutex;
pub mod parker;
pub mod reentrant;
pub mod rwlock;
pub mod semaphore;
pub mod stamped;
pub mod sync;

mod queue;

pub use condition::ConditionObject;
pub use error::SyncError;
pub use fairness::Fairness;
pub use guard::{ReadGuard, ReentrantGuard, WriteGuard};
pub use latch::CountDownLatch;
pub use mutex::{QueuedMutex, QueuedMutexGuard, RawQueuedMutex};
pub use reentrant::ReentrantLock;
pub use rwlock::{ReadLock, ReentrantRwLock, WriteLock};
pub use semaphore::Semaphore;
pub use stamped::{Stamp, StampedLock};
pub use sync::{Policy, Synchronizer};
