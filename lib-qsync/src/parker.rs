//! Thread parking used by every blocking path in the crate.
//!
//! Each thread lazily gets a [`ThreadHandle`] carrying its std [`Thread`], a
//! process-unique numeric id and two flags: a cooperative interrupt flag and a
//! blocker marker naming the object the thread is parked on. Parking may
//! return spuriously, callers always re-check their wake condition.

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool, AtomicU64, AtomicUsize,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use tracing::trace;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ParkState {
    id: u64,
    interrupted: AtomicBool,
    blocker: AtomicUsize,
}

#[derive(Clone)]
pub struct ThreadHandle {
    thread: Thread,
    state: Arc<ParkState>,
}

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle {
        thread: thread::current(),
        state: Arc::new(ParkState {
            id: NEXT_ID.fetch_add(1, Relaxed),
            interrupted: AtomicBool::new(false),
            blocker: AtomicUsize::new(0),
        }),
    };
}

impl ThreadHandle {
    /// Non-zero id, unique for the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn unpark(&self) {
        self.thread.unpark();
    }

    /// Sets the interrupt flag and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Release);
        self.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Acquire)
    }

    /// Address of the object the thread is currently parked on, if any.
    pub fn blocker(&self) -> Option<usize> {
        match self.state.blocker.load(Relaxed) {
            0 => None,
            addr => Some(addr),
        }
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("name", &self.thread.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

pub fn current() -> ThreadHandle {
    CURRENT.with(|handle| handle.clone())
}

pub fn current_id() -> u64 {
    CURRENT.with(|handle| handle.state.id)
}

/// Reads and clears the current thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|handle| handle.state.interrupted.swap(false, AcqRel))
}

pub fn is_interrupted() -> bool {
    CURRENT.with(|handle| handle.is_interrupted())
}

/// Re-asserts an interrupt that was consumed by an uninterruptible wait.
pub fn self_interrupt() {
    CURRENT.with(|handle| handle.state.interrupted.store(true, Release));
}

pub fn unpark(handle: &ThreadHandle) {
    handle.unpark();
}

fn address<B: ?Sized>(blocker: &B) -> usize {
    blocker as *const B as *const () as usize
}

fn park_with<B: ?Sized>(blocker: &B, wait: impl FnOnce()) {
    CURRENT.with(|handle| {
        if handle.is_interrupted() {
            return;
        }
        let addr = address(blocker);
        handle.state.blocker.store(addr, Relaxed);
        trace!(thread = handle.state.id, blocker = addr, "park");
        wait();
        handle.state.blocker.store(0, Relaxed);
    })
}

/// Parks until unparked, interrupted, or a spurious wakeup.
pub fn park<B: ?Sized>(blocker: &B) {
    park_with(blocker, thread::park);
}

pub fn park_timeout<B: ?Sized>(blocker: &B, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }
    park_with(blocker, || thread::park_timeout(timeout));
}

pub fn park_until<B: ?Sized>(blocker: &B, deadline: Instant) {
    if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
        park_timeout(blocker, timeout);
    }
}

/// Time left until `deadline`, `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let me = current();
        me.unpark();
        let begin = Instant::now();
        park(&me);
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ids_are_unique_per_thread() {
        let mine = current_id();
        let other = thread::spawn(current_id).join().unwrap();
        assert_ne!(mine, other);
        assert_eq!(mine, current().id());
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            tx.send(current()).unwrap();
            let marker = 0u8;
            while !is_interrupted() {
                park(&marker);
            }
            interrupted()
        });
        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.interrupt();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn interrupted_clears_flag() {
        self_interrupt();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn park_until_past_deadline_returns() {
        let begin = Instant::now();
        park_until(&begin, begin);
        park_timeout(&begin, Duration::ZERO);
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert!(remaining(begin).is_none());
    }
}
