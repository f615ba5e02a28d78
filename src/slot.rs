//! A single-assignment result cell.
//!
//! The slot moves `Pending -> Committing -> Succeeded | Failed` exactly once.
//! `Committing` only exists so the write of the result and the write of the
//! terminal state look atomic to every reader: a reader that observes a
//! terminal state with `Acquire` also observes the result stored before it.
use std::cell::UnsafeCell;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAILED: u8 = 3;

/// Observable state of a [`ResultSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Committing,
    Succeeded,
    Failed,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            PENDING => SlotState::Pending,
            COMMITTING => SlotState::Committing,
            SUCCEEDED => SlotState::Succeeded,
            _ => SlotState::Failed,
        }
    }
}

/// Holds at most one `Result<V, E>`, committed by exactly one thread.
///
/// # Examples
///
/// ```
/// use promise_core::ResultSlot;
/// let slot = ResultSlot::<u32, String>::new();
/// assert!(slot.try_commit_success(42));
/// assert!(!slot.try_commit_failure("late".into()));
/// assert_eq!(*slot.value_or_panic(), 42);
/// ```
pub struct ResultSlot<V, E> {
    state: AtomicU8,
    result: UnsafeCell<Option<Result<V, E>>>,
}

// `result` is written once, by the thread that won PENDING -> COMMITTING,
// and only read by threads that observed a terminal state afterwards.
unsafe impl<V: Send, E: Send> Send for ResultSlot<V, E> {}
unsafe impl<V: Send + Sync, E: Send + Sync> Sync for ResultSlot<V, E> {}

impl<V, E> ResultSlot<V, E> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            result: UnsafeCell::new(None),
        }
    }

    /// Commits `value` if nobody else has. Returns `false` without retrying
    /// when the slot is already terminal or another commit is in flight.
    pub fn try_commit_success(&self, value: V) -> bool {
        self.try_commit(Ok(value), SUCCEEDED)
    }

    /// Commits `error` if nobody else has. Same contract as
    /// [`try_commit_success`](Self::try_commit_success).
    pub fn try_commit_failure(&self, error: E) -> bool {
        self.try_commit(Err(error), FAILED)
    }

    fn try_commit(&self, result: Result<V, E>, terminal: u8) -> bool {
        if self.state.load(Ordering::Acquire) != PENDING {
            return false;
        }
        if self
            .state
            .compare_exchange(PENDING, COMMITTING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: winning the CAS above makes this thread the only writer, and
        // no reader touches `result` before the terminal state is published.
        unsafe { *self.result.get() = Some(result) };
        self.state.store(terminal, Ordering::Release);
        true
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_succeeded(&self) -> bool {
        self.state.load(Ordering::Acquire) == SUCCEEDED
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), SUCCEEDED | FAILED)
    }

    /// The committed result, or `None` while pending or committing.
    pub fn result(&self) -> Option<Result<&V, &E>> {
        if !self.is_terminal() {
            return None;
        }
        // SAFETY: the terminal state was loaded with Acquire, pairing with the
        // Release store in `try_commit`; the result is never written again.
        unsafe { (*self.result.get()).as_ref() }.map(Result::as_ref)
    }

    /// Borrows the success value.
    ///
    /// # Panics
    ///
    /// Panics unless the slot has succeeded. Check [`is_succeeded`](Self::is_succeeded) first.
    pub fn value_or_panic(&self) -> &V {
        match self.result() {
            Some(Ok(value)) => value,
            _ => panic!("value_or_panic on a slot in state {:?}", self.state()),
        }
    }

    /// Borrows the failure value.
    ///
    /// # Panics
    ///
    /// Panics unless the slot has failed. Check [`is_failed`](Self::is_failed) first.
    pub fn error_or_panic(&self) -> &E {
        match self.result() {
            Some(Err(error)) => error,
            _ => panic!("error_or_panic on a slot in state {:?}", self.state()),
        }
    }
}

impl<V, E> Default for ResultSlot<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Debug, E: Debug> Debug for ResultSlot<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSlot")
            .field("state", &self.state())
            .field("result", &self.result())
            .finish()
    }
}
