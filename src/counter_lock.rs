use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use anyhow::{anyhow, Result};
use enum_dispatch::enum_dispatch;
use libqsync::{QueuedMutex, ReentrantLock, ReentrantRwLock, Semaphore, StampedLock};

/// A shared counter behind one of the benchmarked locks.
///
/// The counter is read and written with relaxed loads and stores, so a lock
/// that fails to exclude shows up as lost increments.
#[enum_dispatch]
pub trait CounterLock {
    /// Runs `f` on the counter while holding the lock exclusively.
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()>;

    /// Reads the counter in the lock's shared mode, or exclusively when the
    /// lock has none.
    fn observe(&self) -> Result<u64>;

    fn name(&self) -> String;
}

#[enum_dispatch(CounterLock)]
#[derive(Debug)]
pub enum BenchmarkType {
    Reentrant(Guarded<ReentrantLock>),
    RwLock(Guarded<ReentrantRwLock>),
    Stamped(Guarded<StampedLock>),
    QueuedMutex(Guarded<QueuedMutex<()>>),
    Semaphore(Guarded<Semaphore>),
    Mutex(Guarded<Mutex<()>>),
}

#[derive(Debug)]
pub struct Guarded<L> {
    lock: L,
    value: AtomicU64,
}

impl<L> Guarded<L> {
    pub fn new(lock: L) -> Self {
        Self {
            lock,
            value: AtomicU64::new(0),
        }
    }

    fn apply(&self, f: &mut dyn FnMut(&mut u64)) {
        let mut value = self.value.load(Ordering::Relaxed);
        f(&mut value);
        self.value.store(value, Ordering::Relaxed);
    }

    fn peek(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl CounterLock for Guarded<ReentrantLock> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        let _guard = self.lock.guard()?;
        self.apply(f);
        Ok(())
    }

    fn observe(&self) -> Result<u64> {
        let _guard = self.lock.guard()?;
        Ok(self.peek())
    }

    fn name(&self) -> String {
        format!("ReentrantLock({})", fairness(self.lock.is_fair()))
    }
}

impl CounterLock for Guarded<ReentrantRwLock> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        let _guard = self.lock.write().guard()?;
        self.apply(f);
        Ok(())
    }

    fn observe(&self) -> Result<u64> {
        let _guard = self.lock.read().guard()?;
        Ok(self.peek())
    }

    fn name(&self) -> String {
        format!("ReentrantRwLock({})", fairness(self.lock.is_fair()))
    }
}

impl CounterLock for Guarded<StampedLock> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        let stamp = self.lock.write_lock();
        self.apply(f);
        self.lock.unlock_write(stamp)?;
        Ok(())
    }

    /// Tries an optimistic read first and falls back to a read lock when a
    /// writer intervened.
    fn observe(&self) -> Result<u64> {
        if let Some(stamp) = self.lock.try_optimistic_read() {
            let value = self.peek();
            if self.lock.validate(stamp) {
                return Ok(value);
            }
        }
        let stamp = self.lock.read_lock();
        let value = self.peek();
        self.lock.unlock_read(stamp)?;
        Ok(value)
    }

    fn name(&self) -> String {
        "StampedLock".to_string()
    }
}

impl CounterLock for Guarded<QueuedMutex<()>> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        let _guard = self.lock.lock();
        self.apply(f);
        Ok(())
    }

    fn observe(&self) -> Result<u64> {
        let _guard = self.lock.lock();
        Ok(self.peek())
    }

    fn name(&self) -> String {
        "QueuedMutex".to_string()
    }
}

impl CounterLock for Guarded<Semaphore> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        self.lock.acquire_uninterruptibly(1)?;
        self.apply(f);
        self.lock.release(1)?;
        Ok(())
    }

    fn observe(&self) -> Result<u64> {
        self.lock.acquire_uninterruptibly(1)?;
        let value = self.peek();
        self.lock.release(1)?;
        Ok(value)
    }

    fn name(&self) -> String {
        format!("Semaphore({})", fairness(self.lock.is_fair()))
    }
}

impl CounterLock for Guarded<Mutex<()>> {
    fn update(&self, f: &mut dyn FnMut(&mut u64)) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("mutex poisoned"))?;
        self.apply(f);
        Ok(())
    }

    fn observe(&self) -> Result<u64> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("mutex poisoned"))?;
        Ok(self.peek())
    }

    fn name(&self) -> String {
        "Mutex".to_string()
    }
}

fn fairness(fair: bool) -> &'static str {
    if fair {
        "fair"
    } else {
        "nonfair"
    }
}
