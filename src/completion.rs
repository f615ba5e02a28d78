//! One result slot plus three callback chains (and a chain of wakers), and
//! the protocol that ties them together.
//!
//! Both the committing thread and a registering thread may drain a chain.
//! Registration always appends first and only then looks at the slot: either
//! the committer's drain sees the new node, or the registering thread sees
//! the terminal state and drains the node itself. Chain pops are exclusive,
//! so whichever thread pops a node is the only one that runs it.
//!
//! The handshake pairs two store-then-load sequences: a registrar stores the
//! chain link and then loads the slot state, a drainer stores (or observed)
//! the terminal state and then loads the chain head. A `SeqCst` fence sits
//! between the store and the load on both sides, so at least one of them
//! sees the other's store.
//!
//! Callbacks run synchronously on the draining thread. Nothing here catches a
//! panicking callback; a panic unwinds out of the drain and leaves later
//! callbacks chained for the next drain. Wakers are kept apart from user
//! callbacks and are woken before any of them run, so a panicking callback
//! cannot strand a task waiting on the outcome.
use crate::chain::CallbackChain;
use crate::slot::{ResultSlot, SlotState};
use log::trace;
use std::fmt::{self, Debug};
use std::sync::atomic::{fence, Ordering};
use std::task::Waker;

pub type SuccessFn<V> = Box<dyn FnOnce(&V) + Send>;
pub type FailureFn<E> = Box<dyn FnOnce(&E) + Send>;
pub type AlwaysFn = Box<dyn FnOnce() + Send>;

/// Completion state and pending callbacks of a single promise.
///
/// # Examples
///
/// ```
/// use promise_core::Completion;
/// use std::sync::{Arc, Mutex};
///
/// let completion = Completion::<u32, String>::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// completion.add_success_callback(move |v| sink.lock().unwrap().push(*v));
/// assert!(completion.complete_success(7));
/// assert_eq!(*seen.lock().unwrap(), vec![7]);
/// ```
pub struct Completion<V, E> {
    slot: ResultSlot<V, E>,
    success: CallbackChain<SuccessFn<V>>,
    failure: CallbackChain<FailureFn<E>>,
    always: CallbackChain<AlwaysFn>,
    wakers: CallbackChain<Waker>,
}

impl<V, E> Completion<V, E> {
    pub fn new() -> Self {
        Self {
            slot: ResultSlot::new(),
            success: CallbackChain::new(),
            failure: CallbackChain::new(),
            always: CallbackChain::new(),
            wakers: CallbackChain::new(),
        }
    }

    /// Commits a success value. Does not run callbacks; the caller that gets
    /// `true` must call [`drain_and_invoke_on_success`](Self::drain_and_invoke_on_success).
    pub fn try_commit_success(&self, value: V) -> bool {
        self.slot.try_commit_success(value)
    }

    /// Commits a failure value. Does not run callbacks; the caller that gets
    /// `true` must call [`drain_and_invoke_on_failure`](Self::drain_and_invoke_on_failure).
    pub fn try_commit_failure(&self, error: E) -> bool {
        self.slot.try_commit_failure(error)
    }

    /// Commits `value` and, on winning, runs the success and always callbacks.
    pub fn complete_success(&self, value: V) -> bool {
        let won = self.try_commit_success(value);
        if won {
            trace!("completion committed success");
            self.drain_and_invoke_on_success();
        }
        won
    }

    /// Commits `error` and, on winning, runs the failure and always callbacks.
    pub fn complete_failure(&self, error: E) -> bool {
        let won = self.try_commit_failure(error);
        if won {
            trace!("completion committed failure");
            self.drain_and_invoke_on_failure();
        }
        won
    }

    pub fn state(&self) -> SlotState {
        self.slot.state()
    }

    pub fn is_succeeded(&self) -> bool {
        self.slot.is_succeeded()
    }

    pub fn is_failed(&self) -> bool {
        self.slot.is_failed()
    }

    pub fn is_terminal(&self) -> bool {
        self.slot.is_terminal()
    }

    pub fn result(&self) -> Option<Result<&V, &E>> {
        self.slot.result()
    }

    /// See [`ResultSlot::value_or_panic`].
    pub fn value_or_panic(&self) -> &V {
        self.slot.value_or_panic()
    }

    /// See [`ResultSlot::error_or_panic`].
    pub fn error_or_panic(&self) -> &E {
        self.slot.error_or_panic()
    }

    pub fn add_success_callback<F>(&self, callback: F)
    where
        F: FnOnce(&V) + Send + 'static,
    {
        self.success.append(Box::new(callback));
        // Pairs with the fence in `drain_and_invoke_on_success`.
        fence(Ordering::SeqCst);
        if self.slot.is_succeeded() {
            trace!("success callback registered after completion");
            self.drain_and_invoke_on_success();
        }
    }

    pub fn add_failure_callback<F>(&self, callback: F)
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.failure.append(Box::new(callback));
        // Pairs with the fence in `drain_and_invoke_on_failure`.
        fence(Ordering::SeqCst);
        if self.slot.is_failed() {
            trace!("failure callback registered after completion");
            self.drain_and_invoke_on_failure();
        }
    }

    pub fn add_always_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.always.append(Box::new(callback));
        fence(Ordering::SeqCst);
        self.drain_terminal();
    }

    /// Wakes `waker` once the slot is terminal. Wakers are woken before any
    /// success, failure or always callback runs.
    pub fn add_waker(&self, waker: Waker) {
        self.wakers.append(waker);
        fence(Ordering::SeqCst);
        self.drain_terminal();
    }

    fn drain_terminal(&self) {
        match self.slot.state() {
            SlotState::Succeeded => self.drain_and_invoke_on_success(),
            SlotState::Failed => self.drain_and_invoke_on_failure(),
            SlotState::Pending | SlotState::Committing => {}
        }
    }

    /// Wakes every chained waker, then pops and runs every chained success
    /// callback, then every always callback. Does nothing unless the slot has
    /// succeeded.
    pub fn drain_and_invoke_on_success(&self) {
        if !self.slot.is_succeeded() {
            return;
        }
        // Pairs with the fence after `append` in the `add_*` methods.
        fence(Ordering::SeqCst);
        let value = self.slot.value_or_panic();
        let mut fired = self.wake_all();
        while let Some(callback) = self.success.pop() {
            callback(value);
            fired += 1;
        }
        fired += self.drain_always();
        trace!("drained {fired} callbacks on success");
    }

    /// Wakes every chained waker, then pops and runs every chained failure
    /// callback, then every always callback. Does nothing unless the slot has
    /// failed.
    pub fn drain_and_invoke_on_failure(&self) {
        if !self.slot.is_failed() {
            return;
        }
        // Pairs with the fence after `append` in the `add_*` methods.
        fence(Ordering::SeqCst);
        let error = self.slot.error_or_panic();
        let mut fired = self.wake_all();
        while let Some(callback) = self.failure.pop() {
            callback(error);
            fired += 1;
        }
        fired += self.drain_always();
        trace!("drained {fired} callbacks on failure");
    }

    fn wake_all(&self) -> usize {
        let mut woken = 0;
        while let Some(waker) = self.wakers.pop() {
            waker.wake();
            woken += 1;
        }
        woken
    }

    fn drain_always(&self) -> usize {
        let mut fired = 0;
        while let Some(callback) = self.always.pop() {
            callback();
            fired += 1;
        }
        fired
    }
}

impl<V, E> Default for Completion<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> Debug for Completion<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.slot.state())
            .field("success", &self.success.len())
            .field("failure", &self.failure.len())
            .field("always", &self.always.len())
            .field("wakers", &self.wakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Completion;
    use futures::task::{waker, ArcWake};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(String) + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &str| {
            let sink = sink.clone();
            let name = name.to_string();
            Box::new(move |arg: String| sink.lock().unwrap().push(format!("{name}({arg})")))
                as Box<dyn Fn(String) + Send>
        };
        (log, make)
    }

    #[test]
    fn test_callback_after_success_gets_value() {
        let completion = Completion::<i32, String>::new();
        assert!(completion.complete_success(42));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        completion.add_success_callback(move |v| {
            assert_eq!(*v, 42);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        completion.drain_and_invoke_on_success();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let completion = Completion::<i32, String>::new();
        let (log, make) = recorder();
        for name in ["A", "B", "C"] {
            let record = make(name);
            completion.add_success_callback(move |v| record(v.to_string()));
        }
        assert!(log.lock().unwrap().is_empty());
        assert!(completion.complete_success(7));
        assert_eq!(*log.lock().unwrap(), vec!["A(7)", "B(7)", "C(7)"]);
    }

    #[test]
    fn test_always_after_failure() {
        let completion = Completion::<i32, String>::new();
        assert!(completion.complete_failure("boom".into()));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        completion.add_always_callback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(completion.error_or_panic(), "boom");
    }

    #[test]
    fn test_failure_skips_success_callbacks() {
        let completion = Completion::<i32, String>::new();
        let (log, make) = recorder();
        let on_success = make("ok");
        let on_failure = make("err");
        let on_always = make("always");
        completion.add_success_callback(move |v| on_success(v.to_string()));
        completion.add_failure_callback(move |e| on_failure(e.clone()));
        completion.add_always_callback(move || on_always(String::new()));
        assert!(completion.complete_failure("boom".into()));
        assert!(!completion.complete_success(1));
        assert_eq!(*log.lock().unwrap(), vec!["err(boom)", "always()"]);
    }

    #[test]
    fn test_drain_before_commit_is_noop() {
        let completion = Completion::<i32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        completion.add_always_callback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        completion.drain_and_invoke_on_success();
        completion.drain_and_invoke_on_failure();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(completion.try_commit_success(1));
        // Committing alone does not run anything.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        completion.drain_and_invoke_on_success();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_leaves_rest_chained() {
        let completion = Arc::new(Completion::<i32, ()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        completion.add_success_callback(|_| panic!("first callback"));
        let seen = calls.clone();
        completion.add_success_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let committer = completion.clone();
        let result = thread::spawn(move || committer.complete_success(1)).join();
        assert!(result.is_err());
        assert!(completion.is_succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        completion.drain_and_invoke_on_success();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wakers_fire_before_panicking_callback() {
        let completion = Arc::new(Completion::<i32, ()>::new());
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        completion.add_success_callback(|_| panic!("first callback"));
        completion.add_waker(waker(counter.clone()));

        let committer = completion.clone();
        let result = thread::spawn(move || committer.complete_success(1)).join();
        assert!(result.is_err());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Registered after completion: woken straight away.
        completion.add_waker(waker(counter.clone()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_and_commit_race() {
        for round in 0..50 {
            let registrars = 8;
            let per_thread = 50;
            let completion = Arc::new(Completion::<usize, usize>::new());
            let calls = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(registrars + 1));

            let mut tasks: Vec<_> = (0..registrars)
                .map(|_| {
                    let completion = completion.clone();
                    let calls = calls.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..per_thread {
                            let calls = calls.clone();
                            completion.add_success_callback(move |v| {
                                assert_eq!(*v, round);
                                calls.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    })
                })
                .collect();
            let committer = completion.clone();
            let gate = barrier.clone();
            tasks.push(thread::spawn(move || {
                gate.wait();
                assert!(committer.complete_success(round));
            }));
            for task in tasks {
                task.join().expect("A registering thread has panicked");
            }
            assert_eq!(calls.load(Ordering::SeqCst), registrars * per_thread);
        }
    }
}
