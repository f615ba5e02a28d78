//! A producer/consumer pair over a shared [`Completion`].
//!
//! `Deferred` is the producing half: cloneable, and whichever clone resolves
//! or rejects first decides the outcome. `Promise` is the consuming half:
//! cloneable, callbacks can be attached from any thread at any time, and it
//! can be awaited when the value and error are `Clone`.
use crate::completion::Completion;
use crate::context::Context;
use crate::{Error, Result, Settle};
use futures::task::{waker, ArcWake, AtomicWaker};
use log::debug;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

/// Producing half of a promise.
///
/// # Examples
///
/// ```
/// use promise_core::{deferred, Settle};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let deferred = deferred::<String, String>();
/// let promise = deferred.promise();
/// let task1 = thread::spawn(move || block_on(async {
///     println!("Received {:?}", promise.await);
/// }));
/// deferred.resolve("Hi".into()).unwrap();
/// task1.join().expect("The task1 thread has panicked.");
/// ```
pub struct Deferred<V, E> {
    completion: Arc<Completion<V, E>>,
    context: Context,
}

/// Consuming half of a promise.
pub struct Promise<V, E> {
    completion: Arc<Completion<V, E>>,
    context: Context,
    waker: Arc<WakeSlot>,
    waiting: bool,
}

/// Forwards a completion wakeup to whichever task polled the promise last.
struct WakeSlot(AtomicWaker);

impl ArcWake for WakeSlot {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.wake();
    }
}

/// A deferred with the default [`Context`].
pub fn deferred<V, E>() -> Deferred<V, E> {
    deferred_with(Context::default())
}

pub fn deferred_with<V, E>(context: Context) -> Deferred<V, E> {
    Deferred {
        completion: Arc::new(Completion::new()),
        context,
    }
}

impl<V, E> Deferred<V, E> {
    pub fn promise(&self) -> Promise<V, E> {
        Promise::from_parts(self.completion.clone(), self.context.clone())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl<V, E> Settle for Deferred<V, E> {
    type Output = V;
    type Error = E;
    type Waiter = Promise<V, E>;

    fn new() -> (Self, Self::Waiter) {
        let deferred = deferred();
        let promise = deferred.promise();
        (deferred, promise)
    }

    ///promise.resolve
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_core::{Deferred, Error, Settle};
    /// let (deferred, promise) = Deferred::<u32, ()>::new();
    /// deferred.resolve(1).unwrap();
    /// assert_eq!(deferred.resolve(2), Err(Error::AlreadyCompleted));
    /// assert!(promise.is_success());
    /// ```
    fn resolve(&self, value: V) -> Result<()> {
        if self.completion.complete_success(value) {
            Ok(())
        } else {
            debug!("resolve lost to an earlier completion");
            Err(Error::AlreadyCompleted)
        }
    }

    ///promise.reject
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_core::{Deferred, Error, Settle};
    /// let (deferred, promise) = Deferred::<(), String>::new();
    /// deferred.reject("💥".into()).unwrap();
    /// assert_eq!(deferred.reject("again".into()), Err(Error::AlreadyCompleted));
    /// assert!(promise.is_failure());
    /// ```
    fn reject(&self, err: E) -> Result<()> {
        if self.completion.complete_failure(err) {
            Ok(())
        } else {
            debug!("reject lost to an earlier completion");
            Err(Error::AlreadyCompleted)
        }
    }
}

impl<V, E> Clone for Deferred<V, E> {
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            context: self.context.clone(),
        }
    }
}

impl<V, E> Debug for Deferred<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("completion", &self.completion)
            .finish()
    }
}

impl<V, E> Promise<V, E> {
    fn from_parts(completion: Arc<Completion<V, E>>, context: Context) -> Self {
        Self {
            completion,
            context,
            waker: Arc::new(WakeSlot(AtomicWaker::new())),
            waiting: false,
        }
    }

    /// An already succeeded promise.
    pub fn of_value(value: V) -> Self {
        let completion = Completion::new();
        let committed = completion.try_commit_success(value);
        debug_assert!(committed);
        Self::from_parts(Arc::new(completion), Context::default())
    }

    /// An already failed promise.
    pub fn of_error(error: E) -> Self {
        let completion = Completion::new();
        let committed = completion.try_commit_failure(error);
        debug_assert!(committed);
        Self::from_parts(Arc::new(completion), Context::default())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.completion.is_succeeded()
    }

    pub fn is_failure(&self) -> bool {
        self.completion.is_failed()
    }

    /// Runs `callback` with the value once this promise succeeds.
    pub fn success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&V) + Send + 'static,
    {
        let context = self.context.clone();
        self.completion
            .add_success_callback(move |value| context.invoke(|| callback(value)));
        self
    }

    /// Runs `callback` with the error once this promise fails.
    pub fn fail<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let context = self.context.clone();
        self.completion
            .add_failure_callback(move |error| context.invoke(|| callback(error)));
        self
    }

    /// Runs `callback` once this promise completes either way.
    pub fn always<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.context.clone();
        self.completion
            .add_always_callback(move || context.invoke(callback));
        self
    }
}

impl<V, E> Clone for Promise<V, E> {
    /// Clones get their own waker registration.
    fn clone(&self) -> Self {
        Self::from_parts(self.completion.clone(), self.context.clone())
    }
}

impl<V: Clone, E: Clone> Future for Promise<V, E> {
    type Output = std::result::Result<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.completion.result() {
            return Poll::Ready(result.cloned().map_err(Clone::clone));
        }
        self.waker.0.register(cx.waker());
        if !self.waiting {
            self.waiting = true;
            self.completion.add_waker(waker(self.waker.clone()));
        }
        match self.completion.result() {
            Some(result) => Poll::Ready(result.cloned().map_err(Clone::clone)),
            None => Poll::Pending,
        }
    }
}

impl<V, E> Debug for Promise<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completion", &self.completion)
            .field("context", &self.context)
            .finish()
    }
}
