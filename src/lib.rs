//! Lock-free completion core for promises.
//!
//! A [`ResultSlot`] is committed exactly once with a success or a failure.
//! [`CallbackChain`]s queue the callbacks waiting for that outcome, and
//! [`Completion`] ties one slot to three chains (success, failure, always) so
//! that every registered callback runs exactly once, in registration order,
//! whether it was registered before or after completion. None of it takes a
//! lock.
//!
//! [`Deferred`] and [`Promise`] are the producing and consuming halves built
//! on top, configured by a [`Context`].
pub mod chain;
pub mod completion;
pub mod context;
pub mod deferred;
pub mod error;
pub mod slot;

pub use chain::CallbackChain;
pub use completion::Completion;
pub use context::{Context, ContextBuilder, PanicPolicy};
pub use deferred::{deferred, deferred_with, Deferred, Promise};
pub use error::{Error, Result};
pub use slot::{ResultSlot, SlotState};

/// The producing side of a promise.
pub trait Settle {
    type Output;
    type Error;
    type Waiter;

    /// Returns the producer together with something to wait on.
    fn new() -> (Self, Self::Waiter)
    where
        Self: Sized;

    /// Completes with a value. Fails with [`crate::Error::AlreadyCompleted`] when the
    /// outcome was already decided.
    fn resolve(&self, value: Self::Output) -> Result<()>;

    /// Completes with an error. Fails with [`crate::Error::AlreadyCompleted`] when the
    /// outcome was already decided.
    fn reject(&self, err: Self::Error) -> Result<()>;
}
