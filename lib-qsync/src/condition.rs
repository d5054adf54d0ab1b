//! Condition variables bound to an exclusive [`Synchronizer`].
//!
//! Waiters live on a private singly linked list that is only touched while
//! the synchronizer is held exclusively. Signalling moves a waiter from that
//! list onto the synchronizer's wait queue, where it competes for the lock
//! again with the state it held before waiting.

use std::{
    fmt,
    hint::spin_loop,
    ptr,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::{
    error::SyncError,
    parker::{self, ThreadHandle},
    queue::{self, Link, Node, NodeKind, CANCELLED, COND, WAITING},
    sync::{Policy, Synchronizer},
};

pub struct ConditionObject<'a, P> {
    sync: &'a Synchronizer<P>,
    first_waiter: Link,
    last_waiter: Link,
}

impl<'a, P: Policy> ConditionObject<'a, P> {
    pub(crate) fn new(sync: &'a Synchronizer<P>) -> Self {
        Self {
            sync,
            first_waiter: ArcSwapOption::empty(),
            last_waiter: ArcSwapOption::empty(),
        }
    }

    pub fn is_owned_by(&self, sync: &Synchronizer<P>) -> bool {
        ptr::eq(self.sync, sync)
    }

    fn check_held(&self) -> Result<(), SyncError> {
        if self.sync.is_held_exclusively()? {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState)
        }
    }

    /// Moves the longest waiting thread to the lock's wait queue.
    pub fn signal(&self) -> Result<(), SyncError> {
        self.check_held()?;
        if let Some(first) = self.first_waiter.load_full() {
            self.do_signal(first, false);
        }
        Ok(())
    }

    pub fn signal_all(&self) -> Result<(), SyncError> {
        self.check_held()?;
        if let Some(first) = self.first_waiter.load_full() {
            self.do_signal(first, true);
        }
        Ok(())
    }

    /// Releases the lock, waits for a signal and re-acquires the lock with
    /// the hold count it had before.
    ///
    /// An interrupt before the signal arrives cancels the wait and returns
    /// `Err(Interrupted)` once the lock is held again. An interrupt after the
    /// signal is re-asserted on the thread instead.
    pub fn wait(&self) -> Result<(), SyncError> {
        self.block(None, true).map(|_| ())
    }

    /// Like [`wait`](Self::wait) but interrupts never end the wait, they are
    /// re-asserted on return.
    pub fn wait_uninterruptibly(&self) -> Result<(), SyncError> {
        self.block(None, false).map(|_| ())
    }

    /// `Ok(false)` if the timeout elapsed before a signal. The lock is held
    /// again either way.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => self.wait().map(|_| true),
        }
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<bool, SyncError> {
        self.block(Some(deadline), true)
    }

    fn block(&self, deadline: Option<Instant>, interruptible: bool) -> Result<bool, SyncError> {
        if interruptible && parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        let node = Node::new(NodeKind::Condition, parker::current());
        let saved = self.enable_wait(&node)?;

        let mut interrupted = false;
        let mut cancelled = false;
        while !self.can_reacquire(&node) {
            interrupted |= parker::interrupted();
            let expired = deadline.is_some_and(|d| parker::remaining(d).is_none());
            if (interrupted && interruptible) || expired {
                if node.get_and_unset_status(COND) & COND != 0 {
                    cancelled = true;
                    break;
                }
                // signalled concurrently, wait for the transfer to finish
                spin_loop();
            } else if node.status() & COND != 0 {
                match deadline {
                    None => parker::park(self),
                    Some(deadline) => parker::park_until(self, deadline),
                }
            } else {
                // woken while being enqueued
                spin_loop();
            }
        }

        node.clear_status();
        self.sync
            .acquire_queued(Some(node.clone()), saved, false, false, None)?;

        if cancelled {
            debug!(interrupted, "condition wait cancelled");
            self.unlink_cancelled_waiters(Some(&node));
            if interrupted {
                return Err(SyncError::Interrupted);
            }
        } else if interrupted {
            parker::self_interrupt();
        }
        Ok(!cancelled)
    }

    /// Adds `node` to the waiter list and fully releases the synchronizer,
    /// returning the state to restore on re-acquire.
    fn enable_wait(&self, node: &Arc<Node>) -> Result<i32, SyncError> {
        if self.sync.is_held_exclusively()? {
            node.set_status(COND | WAITING);
            match self.last_waiter.load_full() {
                None => self.first_waiter.store(Some(node.clone())),
                Some(last) => last.next_waiter.store(Some(node.clone())),
            }
            self.last_waiter.store(Some(node.clone()));
            let saved = self.sync.state();
            match self.sync.release(saved) {
                Ok(true) => return Ok(saved),
                Ok(false) => {}
                Err(err) => {
                    node.set_status(CANCELLED);
                    return Err(err);
                }
            }
        }
        node.set_status(CANCELLED);
        Err(SyncError::IllegalMonitorState)
    }

    /// Whether a signal already transferred `node` to the wait queue.
    fn can_reacquire(&self, node: &Arc<Node>) -> bool {
        match node.prev.load_full() {
            Some(p) => {
                queue::same(&p.next.load_full(), node) || self.sync.queue().is_enqueued(node)
            }
            None => false,
        }
    }

    fn do_signal(&self, first: Arc<Node>, all: bool) {
        let mut current = Some(first);
        while let Some(node) = current {
            let next = node.next_waiter.swap(None);
            if next.is_none() {
                self.last_waiter.store(None);
            }
            self.first_waiter.store(next.clone());
            if node.get_and_unset_status(COND) & COND != 0 {
                self.sync.queue().enqueue(&node);
                if !all {
                    break;
                }
            }
            current = next;
        }
    }

    fn unlink_cancelled_waiters(&self, node: Option<&Arc<Node>>) {
        let needed = match node {
            None => true,
            Some(node) => {
                !queue::is_empty(&node.next_waiter)
                    || queue::same(&self.last_waiter.load_full(), node)
            }
        };
        if !needed {
            return;
        }
        let mut w = self.first_waiter.load_full();
        let mut trail: Option<Arc<Node>> = None;
        while let Some(n) = w {
            let next = n.next_waiter.load_full();
            if n.status() & COND == 0 {
                n.next_waiter.store(None);
                match &trail {
                    None => self.first_waiter.store(next.clone()),
                    Some(t) => t.next_waiter.store(next.clone()),
                }
                if next.is_none() {
                    self.last_waiter.store(trail.clone());
                }
            } else {
                trail = Some(n);
            }
            w = next;
        }
    }

    fn waiters(&self) -> impl Iterator<Item = Arc<Node>> {
        let mut w = self.first_waiter.load_full();
        std::iter::from_fn(move || loop {
            let n = w.take()?;
            w = n.next_waiter.load_full();
            if n.status() & COND != 0 {
                return Some(n);
            }
        })
    }

    pub(crate) fn has_waiters(&self) -> Result<bool, SyncError> {
        self.check_held()?;
        Ok(self.waiters().next().is_some())
    }

    pub(crate) fn wait_queue_length(&self) -> Result<usize, SyncError> {
        self.check_held()?;
        Ok(self.waiters().count())
    }

    pub(crate) fn waiting_threads(&self) -> Result<Vec<ThreadHandle>, SyncError> {
        self.check_held()?;
        Ok(self
            .waiters()
            .filter_map(|n| n.waiter().cloned())
            .collect())
    }
}

impl<P> fmt::Debug for ConditionObject<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionObject")
            .field("sync", &(self.sync as *const Synchronizer<P>))
            .field("waiting", &!queue::is_empty(&self.first_waiter))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering::SeqCst},
        thread,
        time::{Duration, Instant},
    };

    use crate::{error::SyncError, parker, reentrant::ReentrantLock};

    #[test]
    fn signal_requires_the_lock() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        assert_eq!(cond.signal(), Err(SyncError::IllegalMonitorState));
        assert_eq!(cond.signal_all(), Err(SyncError::IllegalMonitorState));
        assert_eq!(cond.wait(), Err(SyncError::IllegalMonitorState));
        assert!(!lock.is_locked());
    }

    #[test]
    fn timed_wait_reacquires_with_hold_count() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock().unwrap();
        lock.lock().unwrap();
        let begin = Instant::now();
        assert_eq!(cond.wait_timeout(Duration::from_millis(20)), Ok(false));
        assert!(begin.elapsed() >= Duration::from_millis(20));
        assert_eq!(lock.hold_count(), 2);
        assert_eq!(lock.wait_queue_length(&cond), Ok(0));
        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn signal_wakes_waiter() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();
        let ready = AtomicBool::new(false);

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                lock.lock().unwrap();
                while !ready.load(SeqCst) {
                    cond.wait().unwrap();
                }
                lock.unlock().unwrap();
            });

            loop {
                lock.lock().unwrap();
                let waiting = lock.has_waiters(&cond).unwrap();
                if waiting {
                    ready.store(true, SeqCst);
                    cond.signal().unwrap();
                    assert!(!lock.has_waiters(&cond).unwrap());
                    lock.unlock().unwrap();
                    break;
                }
                lock.unlock().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            waiter.join().unwrap();
        });
    }

    #[test]
    fn interrupt_cancels_wait() {
        let lock = ReentrantLock::new();
        let cond = lock.new_condition();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                lock.lock().unwrap();
                let result = cond.wait();
                let held = lock.is_held_by_current_thread();
                lock.unlock().unwrap();
                (result, held)
            });

            let handle = loop {
                lock.lock().unwrap();
                let threads = lock.waiting_threads(&cond).unwrap();
                lock.unlock().unwrap();
                if let Some(handle) = threads.into_iter().next() {
                    break handle;
                }
                thread::sleep(Duration::from_millis(1));
            };
            handle.interrupt();
            assert_eq!(waiter.join().unwrap(), (Err(SyncError::Interrupted), true));
        });

        lock.lock().unwrap();
        assert!(!lock.has_waiters(&cond).unwrap());
        lock.unlock().unwrap();
        assert!(!parker::is_interrupted());
    }
}
