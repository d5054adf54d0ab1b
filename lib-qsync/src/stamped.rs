//! Capability based read/write lock with optimistic reads.
//!
//! The state word packs a version in its upper bits, a write bit and a 7 bit
//! reader count:
//!
//! ```text
//!  63                      8   7    6       0
//! +-------------------------+-----+---------+
//! |         version         |  W  | readers |
//! +-------------------------+-----+---------+
//! ```
//!
//! Readers beyond `RFULL` are counted in a side counter that is only touched
//! while the reader field is saturated to `RBITS`, which acts as a tiny spin
//! lock. Releasing the write lock bumps the version, so any optimistic stamp
//! taken before the write fails [`StampedLock::validate`].
//!
//! Queueing reuses [`WaitQueue`]. Readers that arrive while a reader node is
//! the tail do not enqueue; they attach to that node's cowaiter list and are
//! released together when the leader acquires.
//!
//! Optimistic readers may observe torn or inconsistent data and must only read
//! through atomics, then call [`StampedLock::validate`] before using what they
//! read.

use std::{
    fmt,
    hint::spin_loop,
    sync::{
        atomic::{
            fence, AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam::utils::{Backoff, CachePadded};
use tracing::debug;

use crate::{
    error::SyncError,
    parker,
    queue::{self, Node, NodeKind, WaitQueue, CANCELLED, WAITING},
};

const LG_READERS: u32 = 7;
const RUNIT: u64 = 1;
const WBIT: u64 = 1 << LG_READERS;
const RBITS: u64 = WBIT - 1;
const RFULL: u64 = RBITS - 1;
const ABITS: u64 = RBITS | WBIT;
const SBITS: u64 = !RBITS;
/// Clears the top reader bit and the write bit, for the unchecked fast path.
const RSAFE: u64 = !(3 << (LG_READERS - 1));
const ORIGIN: u64 = WBIT << 1;

/// Proof of a lock mode, or the version seen by an optimistic read.
///
/// Stamps are never zero. Operations that fail to produce a stamp return
/// `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stamp(u64);

impl Stamp {
    pub fn from_raw(raw: u64) -> Option<Stamp> {
        (raw != 0).then_some(Stamp(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_write(self) -> bool {
        self.0 & ABITS == WBIT
    }

    pub fn is_read(self) -> bool {
        self.0 & RBITS != 0
    }

    pub fn is_lock(self) -> bool {
        self.0 & ABITS != 0
    }

    pub fn is_optimistic(self) -> bool {
        self.0 & ABITS == 0
    }
}

enum Wait {
    Locked(u64),
    TimedOut,
    Interrupted,
}

fn unlock_write_state(s: u64) -> u64 {
    match s.wrapping_add(WBIT) {
        0 => ORIGIN,
        next => next,
    }
}

fn signal_cowaiters(node: &Node) {
    while let Some(c) = node.cowaiters.load_full() {
        if queue::cas_link(&node.cowaiters, &c, c.cowaiters.load_full()) {
            c.unpark();
        }
    }
}

pub struct StampedLock {
    queue: WaitQueue,
    state: CachePadded<AtomicU64>,
    reader_overflow: AtomicU64,
}

impl StampedLock {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
            state: CachePadded::new(AtomicU64::new(ORIGIN)),
            reader_overflow: AtomicU64::new(0),
        }
    }

    fn state(&self) -> u64 {
        self.state.load(Acquire)
    }

    fn cas_state(&self, expect: u64, update: u64) -> bool {
        self.state
            .compare_exchange(expect, update, AcqRel, Acquire)
            .is_ok()
    }

    fn signal_head(&self) {
        if let Some(head) = self.queue.head() {
            queue::signal_next(&head);
        }
    }

    fn try_acquire_write(&self) -> u64 {
        let s = self.state();
        if s & ABITS == 0 && self.cas_state(s, s | WBIT) {
            fence(Release);
            return s | WBIT;
        }
        0
    }

    fn try_acquire_read(&self) -> u64 {
        loop {
            let s = self.state();
            let m = s & ABITS;
            if m < RFULL {
                if self.cas_state(s, s + RUNIT) {
                    return s + RUNIT;
                }
            } else if m == WBIT {
                return 0;
            } else {
                let next = self.try_inc_reader_overflow(s);
                if next != 0 {
                    return next;
                }
            }
        }
    }

    fn try_inc_reader_overflow(&self, s: u64) -> u64 {
        if s & ABITS != RFULL {
            spin_loop();
        } else if self.cas_state(s, s | RBITS) {
            self.reader_overflow.fetch_add(1, Relaxed);
            self.state.store(s, Release);
            return s;
        }
        0
    }

    fn try_dec_reader_overflow(&self, s: u64) -> u64 {
        if s & ABITS != RFULL {
            spin_loop();
        } else if self.cas_state(s, s | RBITS) {
            let overflow = self.reader_overflow.load(Relaxed);
            let next = if overflow > 0 {
                self.reader_overflow.store(overflow - 1, Relaxed);
                s
            } else {
                s - RUNIT
            };
            self.state.store(next, Release);
            return next;
        }
        0
    }

    fn release_write(&self, s: u64) -> u64 {
        let next = unlock_write_state(s);
        self.state.store(next, Release);
        self.signal_head();
        next
    }

    /// Drops one read hold given the current state `s`; `None` means the
    /// attempt lost a race and should be retried.
    fn release_read(&self, s: u64, m: u64) -> Option<u64> {
        if m < RFULL {
            if self.cas_state(s, s - RUNIT) {
                if m == RUNIT {
                    self.signal_head();
                }
                return Some(s - RUNIT);
            }
        } else {
            let next = self.try_dec_reader_overflow(s);
            if next != 0 {
                return Some(next);
            }
        }
        None
    }

    /// Exclusively acquires, blocking until available.
    pub fn write_lock(&self) -> Stamp {
        let s = self.try_acquire_write();
        if s != 0 {
            return Stamp(s);
        }
        loop {
            if let Wait::Locked(s) = self.acquire_write(false, None) {
                return Stamp(s);
            }
        }
    }

    pub fn try_write_lock(&self) -> Option<Stamp> {
        Stamp::from_raw(self.try_acquire_write())
    }

    pub fn write_lock_interruptibly(&self) -> Result<Stamp, SyncError> {
        if !parker::interrupted() {
            let s = self.try_acquire_write();
            if s != 0 {
                return Ok(Stamp(s));
            }
            if let Wait::Locked(s) = self.acquire_write(true, None) {
                return Ok(Stamp(s));
            }
        }
        Err(SyncError::Interrupted)
    }

    pub fn try_write_lock_for(&self, timeout: Duration) -> Result<Option<Stamp>, SyncError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_write_lock_until(deadline),
            None => self.write_lock_interruptibly().map(Some),
        }
    }

    /// `Ok(None)` when the deadline passes first.
    pub fn try_write_lock_until(&self, deadline: Instant) -> Result<Option<Stamp>, SyncError> {
        if !parker::interrupted() {
            let s = self.try_acquire_write();
            if s != 0 {
                return Ok(Some(Stamp(s)));
            }
            if parker::remaining(deadline).is_none() {
                return Ok(None);
            }
            match self.acquire_write(true, Some(deadline)) {
                Wait::Locked(s) => return Ok(Some(Stamp(s))),
                Wait::TimedOut => return Ok(None),
                Wait::Interrupted => {}
            }
        }
        Err(SyncError::Interrupted)
    }

    /// Non-exclusively acquires, blocking while a writer holds the lock.
    pub fn read_lock(&self) -> Stamp {
        // unchecked first attempt, cannot overflow the reader field
        let s = self.state.load(Relaxed) & RSAFE;
        if self.cas_state(s, s + RUNIT) {
            return Stamp(s + RUNIT);
        }
        loop {
            if let Wait::Locked(s) = self.acquire_read(false, None) {
                return Stamp(s);
            }
        }
    }

    pub fn try_read_lock(&self) -> Option<Stamp> {
        Stamp::from_raw(self.try_acquire_read())
    }

    pub fn read_lock_interruptibly(&self) -> Result<Stamp, SyncError> {
        if !parker::interrupted() {
            let s = self.try_acquire_read();
            if s != 0 {
                return Ok(Stamp(s));
            }
            if let Wait::Locked(s) = self.acquire_read(true, None) {
                return Ok(Stamp(s));
            }
        }
        Err(SyncError::Interrupted)
    }

    pub fn try_read_lock_for(&self, timeout: Duration) -> Result<Option<Stamp>, SyncError> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_read_lock_until(deadline),
            None => self.read_lock_interruptibly().map(Some),
        }
    }

    pub fn try_read_lock_until(&self, deadline: Instant) -> Result<Option<Stamp>, SyncError> {
        if !parker::interrupted() {
            let s = self.try_acquire_read();
            if s != 0 {
                return Ok(Some(Stamp(s)));
            }
            if parker::remaining(deadline).is_none() {
                return Ok(None);
            }
            match self.acquire_read(true, Some(deadline)) {
                Wait::Locked(s) => return Ok(Some(Stamp(s))),
                Wait::TimedOut => return Ok(None),
                Wait::Interrupted => {}
            }
        }
        Err(SyncError::Interrupted)
    }

    /// A stamp to validate later, or `None` while write locked.
    pub fn try_optimistic_read(&self) -> Option<Stamp> {
        let s = self.state();
        if s & WBIT == 0 {
            Some(Stamp(s & SBITS))
        } else {
            None
        }
    }

    /// Whether no write lock was granted since `stamp` was issued.
    ///
    /// Always `true` for a stamp of a currently held lock.
    pub fn validate(&self, stamp: Stamp) -> bool {
        fence(Acquire);
        stamp.0 & SBITS == self.state.load(Relaxed) & SBITS
    }

    pub fn unlock_write(&self, stamp: Stamp) -> Result<(), SyncError> {
        let s = self.state();
        if s & WBIT == 0 || stamp.0 != s {
            debug!(stamp = stamp.0, state = s, "write unlock with a stale stamp");
            return Err(SyncError::IllegalMonitorState);
        }
        self.release_write(s);
        Ok(())
    }

    pub fn unlock_read(&self, stamp: Stamp) -> Result<(), SyncError> {
        if stamp.0 & RBITS != 0 {
            loop {
                let s = self.state();
                let m = s & RBITS;
                if s & SBITS != stamp.0 & SBITS || m == 0 {
                    break;
                }
                if self.release_read(s, m).is_some() {
                    return Ok(());
                }
            }
        }
        debug!(stamp = stamp.0, "read unlock with a stale stamp");
        Err(SyncError::IllegalMonitorState)
    }

    /// Releases whichever mode `stamp` represents.
    pub fn unlock(&self, stamp: Stamp) -> Result<(), SyncError> {
        if stamp.0 & WBIT != 0 {
            self.unlock_write(stamp)
        } else {
            self.unlock_read(stamp)
        }
    }

    /// Upgrades to the write lock without blocking.
    ///
    /// Succeeds for a write stamp, a read stamp held by the only reader, or an
    /// optimistic stamp that is still valid while the lock is free.
    pub fn try_convert_to_write_lock(&self, stamp: Stamp) -> Option<Stamp> {
        let a = stamp.0 & ABITS;
        loop {
            let s = self.state();
            if s & SBITS != stamp.0 & SBITS {
                return None;
            }
            let m = s & ABITS;
            if m == 0 {
                if a != 0 {
                    return None;
                }
                if self.cas_state(s, s | WBIT) {
                    fence(Release);
                    return Some(Stamp(s | WBIT));
                }
            } else if m == WBIT {
                return (a == m).then_some(stamp);
            } else if m == RUNIT && a != 0 {
                let next = s - RUNIT + WBIT;
                if self.cas_state(s, next) {
                    return Some(Stamp(next));
                }
            } else {
                return None;
            }
        }
    }

    /// Downgrades a write stamp, takes a read lock for a valid optimistic
    /// stamp, or returns a read stamp unchanged.
    pub fn try_convert_to_read_lock(&self, stamp: Stamp) -> Option<Stamp> {
        loop {
            let s = self.state();
            if s & SBITS != stamp.0 & SBITS {
                return None;
            }
            let a = stamp.0 & ABITS;
            if a >= WBIT {
                if s != stamp.0 {
                    return None;
                }
                let next = unlock_write_state(s) + RUNIT;
                self.state.store(next, Release);
                self.signal_head();
                return Some(Stamp(next));
            } else if a == 0 {
                if s & ABITS < RFULL {
                    if self.cas_state(s, s + RUNIT) {
                        return Some(Stamp(s + RUNIT));
                    }
                } else {
                    let next = self.try_inc_reader_overflow(s);
                    if next != 0 {
                        return Some(Stamp(next));
                    }
                }
            } else {
                return (s & ABITS != 0).then_some(stamp);
            }
        }
    }

    /// Releases any held lock and returns an optimistic stamp for the
    /// resulting state.
    pub fn try_convert_to_optimistic_read(&self, stamp: Stamp) -> Option<Stamp> {
        fence(Acquire);
        loop {
            let s = self.state();
            if s & SBITS != stamp.0 & SBITS {
                return None;
            }
            let a = stamp.0 & ABITS;
            if a >= WBIT {
                if s != stamp.0 {
                    return None;
                }
                return Stamp::from_raw(self.release_write(s));
            } else if a == 0 {
                return Some(stamp);
            }
            let m = s & ABITS;
            if m == 0 {
                return None;
            }
            if let Some(next) = self.release_read(s, m) {
                return Stamp::from_raw(next & SBITS);
            }
        }
    }

    /// Releases the write lock without a stamp, for recovery after errors.
    pub fn try_unlock_write(&self) -> bool {
        let s = self.state();
        if s & WBIT != 0 {
            self.release_write(s);
            return true;
        }
        false
    }

    pub fn try_unlock_read(&self) -> bool {
        loop {
            let s = self.state();
            let m = s & ABITS;
            if m == 0 || m >= WBIT {
                return false;
            }
            if self.release_read(s, m).is_some() {
                return true;
            }
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state() & WBIT != 0
    }

    pub fn is_read_locked(&self) -> bool {
        self.state() & RBITS != 0
    }

    pub fn read_lock_count(&self) -> u64 {
        let readers = self.state() & RBITS;
        if readers >= RFULL {
            RFULL + self.reader_overflow.load(Relaxed)
        } else {
            readers
        }
    }

    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    /// Queued writers and reader leaders; attached cowaiters are not counted.
    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    fn acquire_write(&self, interruptible: bool, deadline: Option<Instant>) -> Wait {
        let backoff = Backoff::new();
        let mut interrupted = false;
        let mut first = false;
        let mut node: Option<Arc<Node>> = None;
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
                            spin_loop();
                            continue;
                        }
                    }
                }
            }

            if first || pred.is_none() {
                let s = self.state();
                if s & ABITS == 0 && self.cas_state(s, s | WBIT) {
                    fence(Release);
                    if let (true, Some(n), Some(p)) = (first, &node, &pred) {
                        self.queue.set_head(n, p);
                        if interrupted {
                            parker::self_interrupt();
                        }
                    }
                    return Wait::Locked(s | WBIT);
                }
            }

            let Some(n) = node.as_ref() else {
                node = Some(Node::new(NodeKind::Exclusive, parker::current()));
                continue;
            };
            if pred.is_none() {
                match self.queue.tail() {
                    None => {
                        self.queue.try_initialize_head();
                    }
                    Some(t) => {
                        self.queue.try_append(&t, n);
                    }
                }
            } else if first && !backoff.is_completed() {
                backoff.snooze();
            } else if n.status() == 0 {
                n.set_status(WAITING);
            } else {
                backoff.reset();
                if !self.park(deadline) {
                    break;
                }
                n.clear_status();
                interrupted |= parker::interrupted();
                if interrupted && interruptible {
                    break;
                }
            }
        }

        match node {
            Some(node) => self.cancel_acquire(&node, interrupted),
            None => Wait::TimedOut,
        }
    }

    fn acquire_read(&self, interruptible: bool, deadline: Option<Instant>) -> Wait {
        let mut interrupted = false;
        let mut fresh: Option<Arc<Node>> = None;

        // enqueue as a leader, or attach as a cowaiter to a reader tail
        let node = loop {
            let tail = self.queue.tail();
            let tail_pred = tail.as_ref().and_then(|t| t.prev.load_full());
            if tail_pred.is_none() {
                let s = self.try_acquire_read();
                if s != 0 {
                    return Wait::Locked(s);
                }
            }
            let Some(tail) = tail else {
                self.queue.try_initialize_head();
                continue;
            };

            if tail_pred.is_none() || tail.kind() != NodeKind::Reader {
                let n = fresh
                    .get_or_insert_with(|| Node::new(NodeKind::Reader, parker::current()))
                    .clone();
                if self.queue.is_tail(&tail) && self.queue.try_append(&tail, &n) {
                    break n;
                }
            } else if self.queue.is_tail(&tail) {
                let leader = tail;
                let cowaiter = Node::new(NodeKind::Reader, parker::current());
                let mut attached = false;
                while !leader.is_cancelled() && !queue::is_empty(&leader.prev) {
                    if !attached {
                        let c = leader.cowaiters.load_full();
                        cowaiter.cowaiters.store(c.clone());
                        attached =
                            queue::cas_maybe(&leader.cowaiters, &c, Some(cowaiter.clone()));
                        if !attached {
                            cowaiter.cowaiters.store(None);
                        }
                        continue;
                    }
                    let expired = !self.park(deadline);
                    interrupted |= parker::interrupted();
                    if (interrupted && interruptible) || expired {
                        return self.cancel_cowaiter(&cowaiter, &leader, interrupted);
                    }
                }
                let s = self.try_acquire_read();
                signal_cowaiters(&leader);
                if interrupted {
                    parker::self_interrupt();
                }
                if s != 0 {
                    return Wait::Locked(s);
                }
                // leader went stale or cancelled, start over
                fresh = None;
            }
        };

        let backoff = Backoff::new();
        let mut first = false;
        let mut pred: Option<Arc<Node>> = None;
        loop {
            if !first {
                pred = node.prev.load_full();
                if let Some(p) = &pred {
                    first = self.queue.is_head(p);
                    if !first {
                        if p.is_cancelled() {
                            self.queue.clean();
                            continue;
                        }
                        if queue::is_empty(&p.prev) {
                            spin_loop();
                            continue;
                        }
                    }
                }
            }

            if first || pred.is_none() {
                let s = self.try_acquire_read();
                if s != 0 {
                    if let (true, Some(p)) = (first, &pred) {
                        self.queue.set_head(&node, p);
                    }
                    signal_cowaiters(&node);
                    if interrupted {
                        parker::self_interrupt();
                    }
                    return Wait::Locked(s);
                }
            }

            if first && !backoff.is_completed() {
                backoff.snooze();
            } else if node.status() == 0 {
                node.set_status(WAITING);
            } else {
                backoff.reset();
                if !self.park(deadline) {
                    break;
                }
                node.clear_status();
                interrupted |= parker::interrupted();
                if interrupted && interruptible {
                    break;
                }
            }
        }
        self.cancel_acquire(&node, interrupted)
    }

    /// Parks until woken or `deadline`. Returns `false` without parking once
    /// the deadline has passed.
    fn park(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => parker::park(self),
            Some(deadline) => match parker::remaining(deadline) {
                Some(left) => parker::park_timeout(self, left),
                None => return false,
            },
        }
        true
    }

    fn cancel_acquire(&self, node: &Arc<Node>, interrupted: bool) -> Wait {
        node.set_status(CANCELLED);
        self.queue.clean();
        if node.kind() == NodeKind::Reader {
            signal_cowaiters(node);
        }
        debug!(interrupted, kind = ?node.kind(), "stamped acquire cancelled");
        if interrupted || parker::interrupted() {
            Wait::Interrupted
        } else {
            Wait::TimedOut
        }
    }

    fn cancel_cowaiter(&self, node: &Arc<Node>, leader: &Arc<Node>, interrupted: bool) -> Wait {
        node.set_status(CANCELLED);
        // unlink unless the leader already released the whole cohort
        'recheck: while !queue::is_empty(&leader.prev) && !leader.is_cancelled() {
            let mut p = leader.clone();
            loop {
                let Some(q) = p.cowaiters.load_full() else {
                    break 'recheck;
                };
                if Arc::ptr_eq(&q, node) {
                    queue::cas_link(&p.cowaiters, &q, q.cowaiters.load_full());
                    continue 'recheck;
                }
                p = q;
            }
        }
        debug!(interrupted, "stamped cowaiter cancelled");
        if interrupted {
            Wait::Interrupted
        } else {
            Wait::TimedOut
        }
    }
}

impl Default for StampedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StampedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state();
        let mut d = f.debug_struct("StampedLock");
        if s & ABITS == 0 {
            d.field("mode", &"unlocked");
        } else if s & WBIT != 0 {
            d.field("mode", &"write");
        } else {
            d.field("readers", &self.read_lock_count());
        }
        d.field("queue", &self.queue).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread};

    use super::*;

    #[test]
    fn optimistic_stamp_survives_reads_not_writes() {
        let lock = StampedLock::new();
        let stamp = lock.try_optimistic_read().unwrap();
        assert!(stamp.is_optimistic());
        assert!(lock.validate(stamp));

        let read = lock.read_lock();
        assert!(lock.validate(stamp));
        lock.unlock_read(read).unwrap();
        assert!(lock.validate(stamp));

        let write = lock.write_lock();
        assert!(lock.try_optimistic_read().is_none());
        assert!(!lock.validate(stamp));
        assert!(lock.validate(write));
        lock.unlock_write(write).unwrap();
        assert!(!lock.validate(stamp));
        assert!(!lock.validate(write));
    }

    #[test]
    fn stamp_classifiers() {
        let lock = StampedLock::new();
        let write = lock.write_lock();
        assert!(write.is_write() && write.is_lock());
        assert!(!write.is_read() && !write.is_optimistic());
        lock.unlock(write).unwrap();

        let read = lock.read_lock();
        assert!(read.is_read() && read.is_lock() && !read.is_write());
        lock.unlock(read).unwrap();

        assert_eq!(Stamp::from_raw(0), None);
        assert_eq!(Stamp::from_raw(ORIGIN).map(Stamp::raw), Some(ORIGIN));
    }

    #[test]
    fn wrong_stamps_are_rejected() {
        let lock = StampedLock::new();
        let read = lock.read_lock();
        assert_eq!(lock.unlock_write(read), Err(SyncError::IllegalMonitorState));
        lock.unlock_read(read).unwrap();
        assert_eq!(lock.unlock_read(read), Err(SyncError::IllegalMonitorState));

        let write = lock.write_lock();
        lock.unlock_write(write).unwrap();
        assert_eq!(lock.unlock(write), Err(SyncError::IllegalMonitorState));
        assert!(!lock.try_unlock_write());
        assert!(!lock.try_unlock_read());
    }

    #[test]
    fn modes_exclude_each_other() {
        let lock = StampedLock::new();
        let write = lock.try_write_lock().unwrap();
        assert!(lock.try_read_lock().is_none());
        assert!(lock.try_write_lock().is_none());
        assert!(lock.try_unlock_write());

        let read = lock.try_read_lock().unwrap();
        assert!(lock.try_write_lock().is_none());
        assert!(lock.try_read_lock().is_some());
        assert_eq!(lock.read_lock_count(), 2);
        assert!(lock.try_unlock_read());
        lock.unlock_read(read).unwrap();
        assert!(!lock.is_read_locked());
        assert!(lock.try_convert_to_write_lock(write).is_none());
    }

    #[test]
    fn conversions() {
        let lock = StampedLock::new();

        let optimistic = lock.try_optimistic_read().unwrap();
        let write = lock.try_convert_to_write_lock(optimistic).unwrap();
        assert!(write.is_write());
        assert_eq!(lock.try_convert_to_write_lock(write), Some(write));

        let read = lock.try_convert_to_read_lock(write).unwrap();
        assert!(read.is_read());
        assert!(!lock.is_write_locked());
        assert_eq!(lock.try_convert_to_read_lock(read), Some(read));

        let write = lock.try_convert_to_write_lock(read).unwrap();
        let optimistic = lock.try_convert_to_optimistic_read(write).unwrap();
        assert!(optimistic.is_optimistic());
        assert!(lock.validate(optimistic));
        assert!(!lock.is_write_locked());

        let first = lock.read_lock();
        let second = lock.read_lock();
        assert!(lock.try_convert_to_write_lock(first).is_none());
        assert!(lock.try_convert_to_optimistic_read(second).is_some());
        assert_eq!(lock.read_lock_count(), 1);
        lock.unlock_read(first).unwrap();
    }

    #[test]
    fn readers_overflow_the_state_word() {
        let lock = StampedLock::new();
        let stamps: Vec<_> = (0..300).map(|_| lock.try_read_lock().unwrap()).collect();
        assert_eq!(lock.read_lock_count(), 300);
        assert!(lock.try_write_lock().is_none());
        for stamp in stamps {
            lock.unlock_read(stamp).unwrap();
        }
        assert_eq!(lock.read_lock_count(), 0);
        assert!(!lock.is_read_locked());
        assert!(lock.try_write_lock().is_some());
    }

    #[test]
    fn version_wraps_to_origin() {
        assert_eq!(unlock_write_state(SBITS), ORIGIN);
        assert_eq!(unlock_write_state(ORIGIN | WBIT), ORIGIN + ORIGIN);
    }

    #[test]
    fn timed_write_lock_gives_up() {
        let lock = StampedLock::new();
        let read = lock.read_lock();
        let begin = Instant::now();
        assert_eq!(lock.try_write_lock_for(Duration::from_millis(20)), Ok(None));
        assert!(begin.elapsed() >= Duration::from_millis(20));
        assert_eq!(lock.queue_length(), 0);
        lock.unlock_read(read).unwrap();
        assert!(lock.try_write_lock().is_some());
    }

    #[test]
    fn interrupt_aborts_blocked_reader() {
        let lock = StampedLock::new();
        let write = lock.write_lock();
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            let reader = s.spawn(|| {
                tx.send(parker::current()).unwrap();
                lock.read_lock_interruptibly()
            });
            let handle = rx.recv().unwrap();
            while !lock.has_queued_threads() {
                thread::yield_now();
            }
            handle.interrupt();
            assert_eq!(reader.join().unwrap(), Err(SyncError::Interrupted));
        });
        lock.unlock_write(write).unwrap();
        assert!(lock.try_read_lock().is_some());
    }
}
