//! A lock-free FIFO of pending callbacks.
//!
//! Every node carries a tag that works as a tiny lock between a node and the
//! node that is about to be linked after it or unlinked from after it:
//!
//! ```text
//! sentinel -> a -> b -> c -> null
//!     ^       ^              ^
//!     |       |              append locks the tail (c) CHAINED -> APPENDING
//!     |       pop locks the candidate (a) CHAINED -> POPPING
//!     pop locks the sentinel CHAINED -> POPPING
//! ```
//!
//! A popped node keeps the `POPPING` tag forever, so a thread that still holds
//! a stale pointer to it fails its lock attempt and rescans from the sentinel.
//! Popped nodes are handed to the epoch collector instead of being freed in
//! place, because concurrent scanners may still be reading their `next`.
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU8, Ordering};

const CHAINED: u8 = 0;
const APPENDING: u8 = 1;
const POPPING: u8 = 2;

struct Node<T> {
    /// `None` for the sentinel and for nodes whose payload was moved out.
    payload: UnsafeCell<Option<T>>,
    next: Atomic<Node<T>>,
    tag: AtomicU8,
}

impl<T> Node<T> {
    fn new(payload: Option<T>) -> Self {
        Self {
            payload: UnsafeCell::new(payload),
            next: Atomic::null(),
            tag: AtomicU8::new(CHAINED),
        }
    }

    fn try_lock(&self, tag: u8) -> bool {
        self.tag
            .compare_exchange(CHAINED, tag, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.tag.store(CHAINED, Ordering::Release);
    }
}

/// Lock-free singly-linked queue with concurrent `append` and `pop`.
///
/// # Examples
///
/// ```
/// use promise_core::CallbackChain;
/// let chain = CallbackChain::new();
/// chain.append("a");
/// chain.append("b");
/// assert_eq!(chain.pop(), Some("a"));
/// assert_eq!(chain.pop(), Some("b"));
/// assert_eq!(chain.pop(), None);
/// ```
pub struct CallbackChain<T> {
    head: Atomic<Node<T>>,
}

// Payloads are moved in by `append` and moved out by exactly one popper;
// no two threads ever hold a reference to the same payload.
unsafe impl<T: Send> Send for CallbackChain<T> {}
unsafe impl<T: Send> Sync for CallbackChain<T> {}

impl<T> CallbackChain<T> {
    /// Creates an empty chain. The sentinel is allocated on first use.
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Returns the sentinel, installing one if none exists yet. Losers of the
    /// installation race drop their candidate and use the winner's.
    fn sentinel<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<T>> {
        let head = self.head.load(Ordering::Acquire, guard);
        if !head.is_null() {
            return head;
        }
        match self.head.compare_exchange(
            Shared::null(),
            Owned::new(Node::new(None)),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(installed) => installed,
            Err(lost) => lost.current,
        }
    }

    /// Appends `payload` at the tail.
    pub fn append(&self, payload: T) {
        let guard = &epoch::pin();
        let sentinel = self.sentinel(guard);
        let node = Owned::new(Node::new(Some(payload))).into_shared(guard);
        let backoff = Backoff::new();
        loop {
            // SAFETY: nodes reachable from the sentinel are only reclaimed
            // through the epoch collector, and `guard` keeps this epoch pinned.
            let tail = unsafe { Self::tail(sentinel, guard).deref() };
            if tail.try_lock(APPENDING) {
                if tail.next.load(Ordering::Acquire, guard).is_null() {
                    tail.next.store(node, Ordering::Release);
                    tail.unlock();
                    return;
                }
                tail.unlock();
            }
            backoff.spin();
        }
    }

    fn tail<'g>(sentinel: Shared<'g, Node<T>>, guard: &'g Guard) -> Shared<'g, Node<T>> {
        let mut tail = sentinel;
        loop {
            // SAFETY: see `append`.
            let next = unsafe { tail.deref() }.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return tail;
            }
            tail = next;
        }
    }

    /// Pops the oldest payload.
    pub fn pop(&self) -> Option<T> {
        self.pop_matching(|_| true)
    }

    /// Unlinks nodes from the front until one whose payload satisfies
    /// `predicate` is found, and returns that payload. Unlinked payloads that
    /// do not match are dropped.
    pub fn pop_matching<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let guard = &epoch::pin();
        // SAFETY: the sentinel is never unlinked; it lives as long as `self`.
        let sentinel = unsafe { self.head.load(Ordering::Acquire, guard).as_ref() }?;
        let backoff = Backoff::new();
        loop {
            let candidate = sentinel.next.load(Ordering::Acquire, guard);
            // SAFETY: see `append`.
            let candidate_ref = unsafe { candidate.as_ref() }?;

            if !sentinel.try_lock(POPPING) {
                backoff.spin();
                continue;
            }
            if sentinel.next.load(Ordering::Acquire, guard) != candidate
                || !candidate_ref.try_lock(POPPING)
            {
                sentinel.unlock();
                backoff.spin();
                continue;
            }

            let successor = candidate_ref.next.load(Ordering::Acquire, guard);
            sentinel.next.store(successor, Ordering::Release);
            candidate_ref.next.store(Shared::null(), Ordering::Release);
            sentinel.unlock();

            // SAFETY: the candidate is unlinked and tagged POPPING for good, so
            // this thread is the only one that will ever touch its payload.
            // Its memory is released once every pinned scanner has moved on.
            let payload = unsafe {
                let payload = (*candidate_ref.payload.get()).take();
                guard.defer_destroy(candidate);
                payload
            };
            match payload {
                Some(payload) if predicate(&payload) => return Some(payload),
                _ => backoff.reset(),
            }
        }
    }

    /// Whether no payload is linked right now. Only a snapshot under
    /// concurrent use.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        match unsafe { self.head.load(Ordering::Acquire, guard).as_ref() } {
            Some(sentinel) => sentinel.next.load(Ordering::Acquire, guard).is_null(),
            None => true,
        }
    }

    /// Number of linked payloads. Only a snapshot under concurrent use.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see `append`.
        while let Some(current) = unsafe { node.as_ref() } {
            node = current.next.load(Ordering::Acquire, guard);
            if !node.is_null() {
                count += 1;
            }
        }
        count
    }
}

impl<T> Default for CallbackChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CallbackChain<T> {
    /// Drops every payload that was never popped.
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the chain, so
        // linked nodes can be freed immediately.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}

impl<T> Debug for CallbackChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain").field("len", &self.len()).finish()
    }
}
