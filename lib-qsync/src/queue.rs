//! CLH-style wait queue shared by [`Synchronizer`](crate::sync::Synchronizer)
//! and [`StampedLock`](crate::stamped::StampedLock).
//!
//! Nodes are reference counted and linked through atomically swappable
//! optional `Arc`s, so a thread that still holds a stale link can always
//! dereference it. `prev` links are authoritative. `next` links are hints that
//! are published after the tail CAS and may lag behind; whenever they look
//! inconsistent the queue is re-derived backwards from `tail`.
//!
//! The head is a sentinel for the current owner and never represents a waiting
//! thread. It is created lazily on first contention.

use std::{
    fmt,
    hint::spin_loop,
    sync::{
        atomic::{
            AtomicI32,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use tracing::trace;

use crate::parker::ThreadHandle;

pub(crate) const WAITING: i32 = 1;
pub(crate) const COND: i32 = 2;
pub(crate) const CANCELLED: i32 = i32::MIN;

pub(crate) type Link = ArcSwapOption<Node>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Exclusive,
    Shared,
    /// Stamped lock reader, may lead a list of cowaiting readers.
    Reader,
    Condition,
}

pub(crate) struct Node {
    pub(crate) prev: Link,
    pub(crate) next: Link,
    pub(crate) status: AtomicI32,
    /// Singly linked cohort of readers parked behind a reader leader.
    pub(crate) cowaiters: Link,
    /// Next node on a condition wait list, only touched by the lock holder.
    pub(crate) next_waiter: Link,
    waiter: Option<ThreadHandle>,
    kind: NodeKind,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, waiter: ThreadHandle) -> Arc<Node> {
        Arc::new(Self::with_waiter(kind, Some(waiter)))
    }

    fn sentinel() -> Arc<Node> {
        Arc::new(Self::with_waiter(NodeKind::Exclusive, None))
    }

    fn with_waiter(kind: NodeKind, waiter: Option<ThreadHandle>) -> Node {
        Node {
            prev: ArcSwapOption::empty(),
            next: ArcSwapOption::empty(),
            status: AtomicI32::new(0),
            cowaiters: ArcSwapOption::empty(),
            next_waiter: ArcSwapOption::empty(),
            waiter,
            kind,
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn waiter(&self) -> Option<&ThreadHandle> {
        self.waiter.as_ref()
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Acquire)
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Release);
    }

    pub(crate) fn clear_status(&self) {
        self.status.store(0, Relaxed);
    }

    pub(crate) fn get_and_unset_status(&self, bits: i32) -> i32 {
        self.status.fetch_and(!bits, AcqRel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.status() < 0
    }

    /// A node that is not the head and still waits for its turn.
    fn is_live_waiter(&self) -> bool {
        self.waiter.is_some() && self.status() >= 0 && self.prev.load().is_some()
    }

    pub(crate) fn unpark(&self) {
        if let Some(waiter) = &self.waiter {
            waiter.unpark();
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("waiter", &self.waiter.as_ref().map(ThreadHandle::id))
            .finish()
    }
}

pub(crate) fn same(link: &Option<Arc<Node>>, node: &Arc<Node>) -> bool {
    link.as_ref().is_some_and(|l| Arc::ptr_eq(l, node))
}

pub(crate) fn is_empty(link: &Link) -> bool {
    link.load().is_none()
}

/// Replaces `current` with `new` if the link still points at `current`.
pub(crate) fn cas_link(link: &Link, current: &Arc<Node>, new: Option<Arc<Node>>) -> bool {
    let previous = link.compare_and_swap(current, new);
    same(&*previous, current)
}

/// Like [`cas_link`] but `current` may be empty.
pub(crate) fn cas_maybe(
    link: &Link,
    current: &Option<Arc<Node>>,
    new: Option<Arc<Node>>,
) -> bool {
    let previous = link.compare_and_swap(current, new);
    match (&*previous, current) {
        (None, None) => true,
        (Some(p), Some(c)) => Arc::ptr_eq(p, c),
        _ => false,
    }
}

fn cas_empty(link: &Link, new: Arc<Node>) -> bool {
    cas_maybe(link, &None, Some(new))
}

/// Wakes the successor of `head` if it asked to be signalled.
pub(crate) fn signal_next(head: &Node) {
    if let Some(next) = head.next.load_full() {
        if next.status() != 0 {
            next.get_and_unset_status(WAITING);
            next.unpark();
        }
    }
}

/// Like [`signal_next`], restricted to shared successors.
pub(crate) fn signal_next_if_shared(head: &Node) {
    if let Some(next) = head.next.load_full() {
        if next.kind() == NodeKind::Shared && next.status() != 0 {
            next.get_and_unset_status(WAITING);
            next.unpark();
        }
    }
}

pub(crate) struct WaitQueue {
    head: Link,
    tail: Link,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: ArcSwapOption::const_empty(),
            tail: ArcSwapOption::const_empty(),
        }
    }

    pub(crate) fn head(&self) -> Option<Arc<Node>> {
        self.head.load_full()
    }

    pub(crate) fn tail(&self) -> Option<Arc<Node>> {
        self.tail.load_full()
    }

    pub(crate) fn is_head(&self, node: &Arc<Node>) -> bool {
        self.head
            .load()
            .as_ref()
            .is_some_and(|head| Arc::ptr_eq(head, node))
    }

    pub(crate) fn is_tail(&self, node: &Arc<Node>) -> bool {
        self.tail
            .load()
            .as_ref()
            .is_some_and(|tail| Arc::ptr_eq(tail, node))
    }

    pub(crate) fn has_contended(&self) -> bool {
        !is_empty(&self.head)
    }

    /// Makes `node` the head after its owner acquired. `pred` is the old head.
    pub(crate) fn set_head(&self, node: &Arc<Node>, pred: &Arc<Node>) {
        node.prev.store(None);
        self.head.store(Some(node.clone()));
        pred.next.store(None);
    }

    pub(crate) fn cas_tail(&self, current: &Arc<Node>, node: &Arc<Node>) -> bool {
        cas_link(&self.tail, current, Some(node.clone()))
    }

    /// Installs the sentinel head if the queue has never been contended and
    /// returns the current tail. Only one CAS on `head` wins, losers retry
    /// until the winner publishes the tail.
    pub(crate) fn try_initialize_head(&self) -> Arc<Node> {
        let mut sentinel: Option<Arc<Node>> = None;
        loop {
            if let Some(tail) = self.tail.load_full() {
                return tail;
            }
            if !is_empty(&self.head) {
                spin_loop();
                continue;
            }
            let h = sentinel.get_or_insert_with(Node::sentinel).clone();
            if cas_empty(&self.head, h.clone()) {
                trace!("wait queue head initialized");
                self.tail.store(Some(h.clone()));
                return h;
            }
        }
    }

    /// Appends a node that was not queued before, e.g. a signalled condition
    /// waiter. If the new predecessor is already cancelled the node's thread
    /// is woken to clean up behind itself, reported by returning `true`.
    pub(crate) fn enqueue(&self, node: &Arc<Node>) -> bool {
        loop {
            let tail = self.try_initialize_head();
            node.prev.store(Some(tail.clone()));
            if self.cas_tail(&tail, node) {
                tail.next.store(Some(node.clone()));
                if tail.is_cancelled() {
                    node.unpark();
                    return true;
                }
                return false;
            }
        }
    }

    /// Appends `node` behind `tail` in a single attempt. On failure the
    /// node's `prev` is reset so it still counts as unqueued.
    pub(crate) fn try_append(&self, tail: &Arc<Node>, node: &Arc<Node>) -> bool {
        node.prev.store(Some(tail.clone()));
        if self.cas_tail(tail, node) {
            tail.next.store(Some(node.clone()));
            true
        } else {
            node.prev.store(None);
            false
        }
    }

    pub(crate) fn is_enqueued(&self, node: &Arc<Node>) -> bool {
        let mut p = self.tail.load_full();
        while let Some(n) = p {
            if Arc::ptr_eq(&n, node) {
                return true;
            }
            p = n.prev.load_full();
        }
        false
    }

    /// Unlinks cancelled nodes.
    ///
    /// Walks `(p, q, s)` triples backwards from the tail. A cancelled `q` is
    /// skipped by moving the tail or `s.prev` to `p`, after which `p.next` is
    /// repaired. Any inconsistency observed on the way restarts the whole
    /// walk. Safe to call from any number of threads at once.
    pub(crate) fn clean(&self) {
        'restart: loop {
            let mut q = self.tail.load_full();
            let mut s: Option<Arc<Node>> = None;
            loop {
                let Some(qn) = q else { return };
                let Some(p) = qn.prev.load_full() else { return };
                let consistent = match &s {
                    None => self.is_tail(&qn),
                    Some(sn) => same(&sn.prev.load_full(), &qn) && !sn.is_cancelled(),
                };
                if !consistent {
                    trace!("wait queue changed under cleanup, restarting");
                    continue 'restart;
                }
                if qn.is_cancelled() {
                    let skipped = match &s {
                        None => self.cas_tail(&qn, &p),
                        Some(sn) => cas_link(&sn.prev, &qn, Some(p.clone())),
                    };
                    if skipped && same(&qn.prev.load_full(), &p) {
                        cas_link(&p.next, &qn, s.clone());
                        if is_empty(&p.prev) {
                            signal_next(&p);
                        }
                    }
                    continue 'restart;
                }
                let n = p.next.load_full();
                if !same(&n, &qn) {
                    if let Some(n) = n {
                        if same(&qn.prev.load_full(), &p) && !qn.is_cancelled() {
                            cas_link(&p.next, &n, Some(qn.clone()));
                            if is_empty(&p.prev) {
                                signal_next(&p);
                            }
                        }
                    }
                    continue 'restart;
                }
                s = Some(qn);
                q = Some(p);
            }
        }
    }

    /// Waiting nodes from tail to head, head excluded.
    fn waiting(&self) -> impl Iterator<Item = Arc<Node>> {
        let mut p = self.tail.load_full();
        std::iter::from_fn(move || loop {
            let n = p.take()?;
            p = n.prev.load_full();
            if n.is_live_waiter() {
                return Some(n);
            }
        })
    }

    pub(crate) fn has_queued_threads(&self) -> bool {
        let head = self.head.load_full();
        let mut p = self.tail.load_full();
        while let Some(n) = p {
            if same(&head, &n) {
                break;
            }
            if !n.is_cancelled() {
                return true;
            }
            p = n.prev.load_full();
        }
        false
    }

    /// Thread of the longest waiting node.
    pub(crate) fn first_queued(&self) -> Option<ThreadHandle> {
        let head = self.head.load_full()?;
        if let Some(s) = head.next.load_full() {
            if s.is_live_waiter() {
                return s.waiter().cloned();
            }
        }
        // next hint is stale, scan from the tail
        self.waiting()
            .last()
            .and_then(|node| node.waiter().cloned())
    }

    pub(crate) fn has_queued_predecessors(&self, current: u64) -> bool {
        self.first_queued()
            .is_some_and(|first| first.id() != current)
    }

    pub(crate) fn apparently_first_queued_is_exclusive(&self) -> bool {
        let Some(head) = self.head.load_full() else {
            return false;
        };
        head.next.load_full().is_some_and(|s| {
            s.kind() != NodeKind::Shared && s.waiter().is_some() && !s.is_cancelled()
        })
    }

    pub(crate) fn is_queued(&self, thread: &ThreadHandle) -> bool {
        self.waiting()
            .any(|node| node.waiter().is_some_and(|w| w == thread))
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting().count()
    }

    pub(crate) fn threads(&self, filter: impl Fn(NodeKind) -> bool) -> Vec<ThreadHandle> {
        self.waiting()
            .filter(|node| filter(node.kind()))
            .filter_map(|node| node.waiter().cloned())
            .collect()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // break prev/next cycles so the nodes can be freed
        self.head.store(None);
        let mut p = self.tail.swap(None);
        while let Some(n) = p {
            n.next.store(None);
            n.cowaiters.store(None);
            p = n.prev.swap(None);
        }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("contended", &self.has_contended())
            .field("len", &self.len())
            .finish()
    }
}
