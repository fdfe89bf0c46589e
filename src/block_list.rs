//! The list of in-flight allocations. Pushing a node is what assigns it
//! an LSN range: the claim closure runs against the observed head and the
//! node is published with a single CAS, so the offsets are final the
//! moment any other thread can see them.
//!
//! Nodes are ordered newest first. Releasing an allocation only sets the
//! node's dead bit; the writer daemon, as the sole traverser, unlinks
//! runs of dead nodes while it scans, which keeps `release` wait-free.
#![allow(unsafe_code)]

use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Acquire, Release, SeqCst},
};

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::{debug_delay, LsnOffset};

const CLOSED_TAG: usize = 1;

/// One in-flight allocation. Live from the publishing CAS until the
/// owner releases or discards it.
pub(crate) struct Node {
    lsn_offset: AtomicU64,
    next_lsn_offset: AtomicU64,
    dead: AtomicBool,
    next: Atomic<Node>,
}

impl Node {
    fn empty() -> Node {
        Node {
            lsn_offset: AtomicU64::new(0),
            next_lsn_offset: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            next: Atomic::null(),
        }
    }

    pub(crate) fn lsn_offset(&self) -> LsnOffset {
        self.lsn_offset.load(SeqCst)
    }

    pub(crate) fn next_lsn_offset(&self) -> LsnOffset {
        self.next_lsn_offset.load(SeqCst)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(SeqCst)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        unsafe {
            let mut cursor = self.next.load(Acquire, unprotected());

            while !cursor.is_null() {
                // we carefully unset the next pointer here to avoid
                // a stack overflow when freeing long chains.
                let node = cursor.into_owned();
                cursor = node.next.swap(Shared::null(), Acquire, unprotected());
                drop(node);
            }
        }
    }
}

pub(crate) struct BlockList {
    head: CachePadded<Atomic<Node>>,
}

impl BlockList {
    /// Create a list primed with a single dead sentinel carrying the
    /// starting offset, so the head is always defined.
    pub(crate) fn start(durable_lsn_offset: LsnOffset) -> BlockList {
        let sentinel = Node {
            lsn_offset: AtomicU64::new(durable_lsn_offset),
            next_lsn_offset: AtomicU64::new(durable_lsn_offset),
            dead: AtomicBool::new(true),
            next: Atomic::null(),
        };

        BlockList { head: CachePadded::new(Atomic::new(sentinel)) }
    }

    /// Publish a new node whose LSN range is derived from the observed
    /// head: `claim` maps the head's `next_lsn_offset` to the new node's
    /// exclusive end. Returns `None` if the list has been killed.
    pub(crate) fn push_with<'g, F>(
        &self,
        guard: &'g Guard,
        claim: F,
    ) -> Option<&'g Node>
    where
        F: Fn(LsnOffset) -> LsnOffset,
    {
        debug_delay();
        let node = Owned::new(Node::empty()).into_shared(guard);

        loop {
            let head = self.head.load(Acquire, guard);
            if head.tag() == CLOSED_TAG {
                // shutdown has killed the list. the fresh node is
                // unreachable and can be dropped in place.
                unsafe {
                    drop(node.into_owned());
                }
                return None;
            }

            let prev =
                unsafe { head.as_ref().expect("head is always primed") };
            let lsn_offset = prev.next_lsn_offset();
            let next_lsn_offset = claim(lsn_offset);
            assert!(lsn_offset <= next_lsn_offset);

            let node_ref = unsafe { node.deref() };
            node_ref.lsn_offset.store(lsn_offset, SeqCst);
            node_ref.next_lsn_offset.store(next_lsn_offset, SeqCst);
            node_ref.next.store(head, Release);

            debug_delay();
            if self
                .head
                .compare_exchange(head, node, Release, Acquire, guard)
                .is_ok()
            {
                return Some(node_ref);
            }
        }
    }

    /// The raw head, dead or not. It carries the current frontier in
    /// its `next_lsn_offset`. Returns `None` once the list is killed.
    pub(crate) fn peek_raw<'g>(&self, guard: &'g Guard) -> Option<&'g Node> {
        let head = self.head.load(Acquire, guard);
        if head.tag() == CLOSED_TAG {
            None
        } else {
            unsafe { Some(head.deref()) }
        }
    }

    /// Mark a node dead. The daemon unlinks it once it sweeps past.
    pub(crate) fn remove_fast(&self, node: &Node) {
        debug_delay();
        node.dead.store(true, SeqCst);
    }

    /// Atomically remove `node` and close the list, iff `node` is still
    /// the head. Fails when a concurrent push has raced in, in which
    /// case the node is marked dead instead so the caller can try again
    /// later. Used exactly once, at shutdown.
    pub(crate) fn remove_and_kill(&self, node: &Node, guard: &Guard) -> bool {
        let head = self.head.load(Acquire, guard);
        if head.tag() == CLOSED_TAG {
            return false;
        }
        if !std::ptr::eq(unsafe { head.deref() } as *const Node, node) {
            self.remove_fast(node);
            return false;
        }

        let closed = Shared::null().with_tag(CLOSED_TAG);
        match self.head.compare_exchange(head, closed, Release, Acquire, guard)
        {
            Ok(_) => {
                // the whole remaining chain is unreachable now; its
                // Drop impl walks the links iteratively.
                unsafe {
                    guard.defer_destroy(head);
                }
                true
            }
            Err(_) => {
                self.remove_fast(node);
                false
            }
        }
    }

    /// Iterate live nodes, newest first. Only the daemon may call this:
    /// it unlinks the dead runs it walks over, and that pointer surgery
    /// assumes a single traverser.
    pub(crate) fn sweep_iter<'g>(&self, guard: &'g Guard) -> SweepIter<'g> {
        let head = self.head.load(Acquire, guard);
        SweepIter { prev: None, cursor: head, guard }
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        unsafe {
            let head = self.head.load(Acquire, unprotected());
            if !head.is_null() {
                drop(head.into_owned());
            }
        }
    }
}

/// An iterator over live nodes that lazily unlinks dead ones (except
/// the head, which always survives to carry the frontier).
pub(crate) struct SweepIter<'g> {
    prev: Option<&'g Node>,
    cursor: Shared<'g, Node>,
    guard: &'g Guard,
}

impl<'g> Iterator for SweepIter<'g> {
    type Item = &'g Node;

    fn next(&mut self) -> Option<&'g Node> {
        loop {
            debug_delay();
            if self.cursor.is_null() || self.cursor.tag() == CLOSED_TAG {
                return None;
            }
            let node = unsafe { self.cursor.deref() };
            let next = node.next.load(Acquire, self.guard);

            if node.is_dead() {
                if let Some(prev) = self.prev {
                    // single-traverser unlink. nobody else ever
                    // modifies a published node's next pointer.
                    prev.next.store(next, Release);
                    unsafe {
                        // unset the victim's next pointer before
                        // deferring destruction so its Drop does not
                        // walk into the live chain.
                        node.next.store(Shared::null(), SeqCst);
                        self.guard.defer_destroy(self.cursor);
                    }
                }
                self.cursor = next;
                continue;
            }

            self.prev = Some(node);
            self.cursor = next;
            return Some(node);
        }
    }
}
