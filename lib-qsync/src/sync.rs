//! The generic queued synchronizer.
//!
//! A [`Synchronizer`] owns a 32-bit state word and a [`WaitQueue`]. What the
//! state means and when it may be taken is decided by a [`Policy`]; the
//! synchronizer only runs the queueing state machine around the policy hooks:
//!
//! ```text
//! UNQUEUED -> SPINNING (first in line) -> PARKED -> RE-SPIN -> ACQUIRED
//!                                                           \-> CANCELLED
//! ```
//!
//! Signalling follows queue order. Acquisition order is whatever the policy
//! allows, so a policy that does not consult
//! [`Synchronizer::has_queued_predecessors`] lets arriving threads barge.

use std::{
    fmt,
    hint::spin_loop,
    sync::{
        atomic::{
            AtomicI32, AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam::utils::{Backoff, CachePadded};
use tracing::debug;

use crate::{
    condition::ConditionObject,
    error::SyncError,
    parker::{self, ThreadHandle},
    queue::{self, Node, NodeKind, WaitQueue, CANCELLED, WAITING},
};

/// Acquire and release rules plugged into a [`Synchronizer`].
///
/// Every hook receives the synchronizer so it can inspect and CAS the state
/// word, record the exclusive owner and look at the queue. Hooks must not
/// block. Hooks a policy does not support keep the default, which reports
/// [`SyncError::Unsupported`].
pub trait Policy: Sized + Send + Sync {
    /// Tries to take the state in exclusive mode.
    fn try_acquire(&self, sync: &Synchronizer<Self>, arg: i32) -> Result<bool, SyncError> {
        let _ = (sync, arg);
        Err(SyncError::Unsupported)
    }

    /// Returns `true` once the state is fully released and waiters may
    /// proceed.
    fn try_release(&self, sync: &Synchronizer<Self>, arg: i32) -> Result<bool, SyncError> {
        let _ = (sync, arg);
        Err(SyncError::Unsupported)
    }

    /// Negative on failure, zero on success with nothing left for other
    /// shared waiters, positive on success when the next shared waiter may
    /// succeed too.
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> Result<i32, SyncError> {
        let _ = (sync, arg);
        Err(SyncError::Unsupported)
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, arg: i32) -> Result<bool, SyncError> {
        let _ = (sync, arg);
        Err(SyncError::Unsupported)
    }

    /// Whether the calling thread holds the state exclusively. Required by
    /// conditions.
    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> Result<bool, SyncError> {
        let _ = sync;
        Err(SyncError::Unsupported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acquired,
    Failed,
    Interrupted,
}

pub struct Synchronizer<P> {
    queue: WaitQueue,
    state: CachePadded<AtomicI32>,
    owner: AtomicU64,
    policy: P,
}

impl<P: Policy> Synchronizer<P> {
    pub const fn new(policy: P) -> Self {
        Self {
            queue: WaitQueue::new(),
            state: CachePadded::new(AtomicI32::new(0)),
            owner: AtomicU64::new(0),
            policy,
        }
    }

    pub fn with_state(policy: P, state: i32) -> Self {
        let sync = Self::new(policy);
        sync.set_state(state);
        sync
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub(crate) fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    pub fn state(&self) -> i32 {
        self.state.load(Acquire)
    }

    pub fn set_state(&self, state: i32) {
        self.state.store(state, Release);
    }

    pub fn compare_and_set_state(&self, expect: i32, update: i32) -> bool {
        self.state
            .compare_exchange(expect, update, AcqRel, Acquire)
            .is_ok()
    }

    pub fn set_exclusive_owner(&self, owner: Option<u64>) {
        self.owner.store(owner.unwrap_or(0), Relaxed);
    }

    pub fn exclusive_owner(&self) -> Option<u64> {
        match self.owner.load(Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load(Relaxed) == parker::current_id()
    }

    pub fn is_held_exclusively(&self) -> Result<bool, SyncError> {
        self.policy.is_held_exclusively(self)
    }

    /// Core acquire loop shared by every blocking entry point.
    ///
    /// `node` is `Some` only when a condition waiter re-acquires with its own
    /// node. `deadline` bounds the wait, `interruptible` turns an interrupt
    /// into [`Outcome::Interrupted`]; otherwise it is re-asserted on return.
    pub(crate) fn acquire_queued(
        &self,
        mut node: Option<Arc<Node>>,
        arg: i32,
        shared: bool,
        interruptible: bool,
        deadline: Option<Instant>,
    ) -> Result<Outcome, SyncError> {
        let backoff = Backoff::new();
        let mut interrupted = false;
        let mut first = false;
        let mut pred: Option<Arc<Node>> = None;

        loop {
            if !first {
                pred = node.as_ref().and_then(|n| n.prev.load_full());
                if let Some(p) = &pred {
                    first = self.queue.is_head(p);
                    if !first {
                        if p.is_cancelled() {
                            self.queue.clean();
                            continue;
                        }
                        if queue::is_empty(&p.prev) {
                            // predecessor is about to become head
                            spin_loop();
                            continue;
                        }
                    }
                }
            }

            if first || pred.is_none() {
                let attempt = if shared {
                    self.policy
                        .try_acquire_shared(self, arg)
                        .map(|remaining| remaining >= 0)
                } else {
                    self.policy.try_acquire(self, arg)
                };
                let acquired = match attempt {
                    Ok(acquired) => acquired,
                    Err(err) => {
                        self.cancel_acquire(node.as_ref(), interrupted, false);
                        return Err(err);
                    }
                };
                if acquired {
                    if let (true, Some(n), Some(p)) = (first, &node, &pred) {
                        self.queue.set_head(n, p);
                        if shared {
                            queue::signal_next_if_shared(n);
                        }
                        if interrupted {
                            parker::self_interrupt();
                        }
                    }
                    return Ok(Outcome::Acquired);
                }
            }

            let Some(tail) = self.queue.tail() else {
                self.queue.try_initialize_head();
                continue;
            };
            if node.is_none() {
                let kind = if shared {
                    NodeKind::Shared
                } else {
                    NodeKind::Exclusive
                };
                node = Some(Node::new(kind, parker::current()));
                continue;
            }
            let Some(n) = node.as_ref() else { continue };

            if pred.is_none() {
                self.queue.try_append(&tail, n);
            } else if first && !backoff.is_completed() {
                backoff.snooze();
            } else if n.status() == 0 {
                n.set_status(WAITING);
            } else {
                backoff.reset();
                match deadline {
                    None => parker::park(self),
                    Some(deadline) => match parker::remaining(deadline) {
                        Some(left) => parker::park_timeout(self, left),
                        None => break,
                    },
                }
                n.clear_status();
                interrupted |= parker::interrupted();
                if interrupted && interruptible {
                    break;
                }
            }
        }

        Ok(self.cancel_acquire(node.as_ref(), interrupted, interruptible))
    }

    fn cancel_acquire(
        &self,
        node: Option<&Arc<Node>>,
        interrupted: bool,
        interruptible: bool,
    ) -> Outcome {
        if let Some(node) = node {
            node.set_status(CANCELLED);
            if !queue::is_empty(&node.prev) {
                self.queue.clean();
            }
            debug!(interrupted, "queued acquire cancelled");
        }
        if interrupted {
            if interruptible {
                return Outcome::Interrupted;
            }
            parker::self_interrupt();
        }
        Outcome::Failed
    }

    fn timed(&self, outcome: Outcome) -> Result<bool, SyncError> {
        match outcome {
            Outcome::Acquired => Ok(true),
            Outcome::Failed => Ok(false),
            Outcome::Interrupted => Err(SyncError::Interrupted),
        }
    }

    /// Acquires in exclusive mode, ignoring interrupts.
    pub fn acquire(&self, arg: i32) -> Result<(), SyncError> {
        if !self.policy.try_acquire(self, arg)? {
            self.acquire_queued(None, arg, false, false, None)?;
        }
        Ok(())
    }

    pub fn acquire_interruptibly(&self, arg: i32) -> Result<(), SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !self.policy.try_acquire(self, arg)?
            && self.acquire_queued(None, arg, false, true, None)? == Outcome::Interrupted
        {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }

    /// Single attempt through the policy, never queues.
    pub fn try_acquire(&self, arg: i32) -> Result<bool, SyncError> {
        self.policy.try_acquire(self, arg)
    }

    pub fn try_acquire_for(&self, arg: i32, timeout: Duration) -> Result<bool, SyncError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_until(arg, deadline),
            None => self.acquire_interruptibly(arg).map(|_| true),
        }
    }

    /// `Ok(false)` on timeout, `Err(Interrupted)` on interrupt.
    pub fn try_acquire_until(&self, arg: i32, deadline: Instant) -> Result<bool, SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire(self, arg)? {
            return Ok(true);
        }
        if parker::remaining(deadline).is_none() {
            return Ok(false);
        }
        let outcome = self.acquire_queued(None, arg, false, true, Some(deadline))?;
        self.timed(outcome)
    }

    /// Releases in exclusive mode and wakes the next waiter once the policy
    /// reports the state free.
    pub fn release(&self, arg: i32) -> Result<bool, SyncError> {
        if self.policy.try_release(self, arg)? {
            self.signal_head();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn acquire_shared(&self, arg: i32) -> Result<(), SyncError> {
        if self.policy.try_acquire_shared(self, arg)? < 0 {
            self.acquire_queued(None, arg, true, false, None)?;
        }
        Ok(())
    }

    pub fn acquire_shared_interruptibly(&self, arg: i32) -> Result<(), SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(self, arg)? < 0
            && self.acquire_queued(None, arg, true, true, None)? == Outcome::Interrupted
        {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }

    pub fn try_acquire_shared(&self, arg: i32) -> Result<bool, SyncError> {
        Ok(self.policy.try_acquire_shared(self, arg)? >= 0)
    }

    pub fn try_acquire_shared_for(&self, arg: i32, timeout: Duration) -> Result<bool, SyncError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_shared_until(arg, deadline),
            None => self.acquire_shared_interruptibly(arg).map(|_| true),
        }
    }

    pub fn try_acquire_shared_until(&self, arg: i32, deadline: Instant) -> Result<bool, SyncError> {
        if parker::interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(self, arg)? >= 0 {
            return Ok(true);
        }
        if parker::remaining(deadline).is_none() {
            return Ok(false);
        }
        let outcome = self.acquire_queued(None, arg, true, true, Some(deadline))?;
        self.timed(outcome)
    }

    pub fn release_shared(&self, arg: i32) -> Result<bool, SyncError> {
        if self.policy.try_release_shared(self, arg)? {
            self.signal_head();
            return Ok(true);
        }
        Ok(false)
    }

    fn signal_head(&self) {
        if let Some(head) = self.queue.head() {
            queue::signal_next(&head);
        }
    }

    /// Snapshot: some thread other than the owner is waiting.
    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    /// Whether any thread ever had to queue.
    pub fn has_contended(&self) -> bool {
        self.queue.has_contended()
    }

    pub fn first_queued_thread(&self) -> Option<ThreadHandle> {
        self.queue.first_queued()
    }

    pub fn is_queued(&self, thread: &ThreadHandle) -> bool {
        self.queue.is_queued(thread)
    }

    /// Heuristic used by non-fair read locks to avoid starving a writer that
    /// is next in line.
    pub fn apparently_first_queued_is_exclusive(&self) -> bool {
        self.queue.apparently_first_queued_is_exclusive()
    }

    /// Whether some other thread has been waiting longer than the caller.
    /// Fair policies refuse to acquire while this holds.
    pub fn has_queued_predecessors(&self) -> bool {
        self.queue.has_queued_predecessors(parker::current_id())
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.queue.threads(|_| true)
    }

    pub fn exclusive_queued_threads(&self) -> Vec<ThreadHandle> {
        self.queue
            .threads(|kind| !matches!(kind, NodeKind::Shared | NodeKind::Reader))
    }

    pub fn shared_queued_threads(&self) -> Vec<ThreadHandle> {
        self.queue
            .threads(|kind| matches!(kind, NodeKind::Shared | NodeKind::Reader))
    }

    pub fn new_condition(&self) -> ConditionObject<'_, P> {
        ConditionObject::new(self)
    }

    pub fn owns(&self, condition: &ConditionObject<'_, P>) -> bool {
        condition.is_owned_by(self)
    }

    fn check_owned(&self, condition: &ConditionObject<'_, P>) -> Result<(), SyncError> {
        if self.owns(condition) {
            Ok(())
        } else {
            debug!("condition handed to a synchronizer that did not create it");
            Err(SyncError::ForeignCondition)
        }
    }

    pub fn has_waiters(&self, condition: &ConditionObject<'_, P>) -> Result<bool, SyncError> {
        self.check_owned(condition)?;
        condition.has_waiters()
    }

    pub fn wait_queue_length(&self, condition: &ConditionObject<'_, P>) -> Result<usize, SyncError> {
        self.check_owned(condition)?;
        condition.wait_queue_length()
    }

    pub fn waiting_threads(
        &self,
        condition: &ConditionObject<'_, P>,
    ) -> Result<Vec<ThreadHandle>, SyncError> {
        self.check_owned(condition)?;
        condition.waiting_threads()
    }
}

impl<P: Policy + Default> Default for Synchronizer<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P: fmt::Debug> fmt::Debug for Synchronizer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("state", &self.state.load(Relaxed))
            .field("owner", &self.owner.load(Relaxed))
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    /// Binary latch: shared acquires pass once the state is non-zero.
    #[derive(Debug, Default)]
    struct BooleanLatch;

    impl Policy for BooleanLatch {
        fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<i32, SyncError> {
            Ok(if sync.state() != 0 { 1 } else { -1 })
        }

        fn try_release_shared(&self, sync: &Synchronizer<Self>, _: i32) -> Result<bool, SyncError> {
            sync.set_state(1);
            Ok(true)
        }
    }

    #[test]
    fn unsupported_hooks_are_reported() {
        let sync = Synchronizer::new(BooleanLatch);
        assert_eq!(sync.try_acquire(1), Err(SyncError::Unsupported));
        assert_eq!(sync.acquire(1), Err(SyncError::Unsupported));
        assert_eq!(sync.release(1), Err(SyncError::Unsupported));
        assert_eq!(sync.is_held_exclusively(), Err(SyncError::Unsupported));
        assert!(!sync.has_contended());
    }

    #[test]
    fn shared_release_wakes_every_waiter() {
        let sync = Arc::new(Synchronizer::new(BooleanLatch));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                thread::spawn(move || sync.acquire_shared(1))
            })
            .collect();

        while sync.queue_length() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sync.shared_queued_threads().len(), 4);
        assert!(sync.exclusive_queued_threads().is_empty());

        sync.release_shared(1).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(()));
        }
        assert!(!sync.has_queued_threads());
    }

    #[test]
    fn first_waiter_stops_spinning_and_parks() {
        let sync = Arc::new(Synchronizer::new(BooleanLatch));
        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || sync.acquire_shared(1))
        };

        let handle = loop {
            if let Some(handle) = sync.first_queued_thread() {
                break handle;
            }
            thread::sleep(Duration::from_millis(1));
        };
        let blocker = Arc::as_ptr(&sync) as usize;
        while handle.blocker() != Some(blocker) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sync.queue_length(), 1);

        sync.release_shared(1).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(!sync.has_queued_threads());
    }

    #[test]
    fn timed_shared_acquire_times_out() {
        let sync = Synchronizer::new(BooleanLatch);
        let begin = Instant::now();
        assert_eq!(
            sync.try_acquire_shared_for(1, Duration::from_millis(30)),
            Ok(false)
        );
        assert!(begin.elapsed() >= Duration::from_millis(30));
        assert_eq!(sync.queue_length(), 0);
    }

    #[test]
    fn pending_interrupt_fails_fast() {
        let sync = Synchronizer::new(BooleanLatch);
        parker::self_interrupt();
        assert_eq!(
            sync.acquire_shared_interruptibly(1),
            Err(SyncError::Interrupted)
        );
        assert!(!parker::is_interrupted());
    }
}
