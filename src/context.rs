//! Settings of the layer that runs callbacks on behalf of a promise.
//!
//! The completion core never catches a panicking callback. Whether a panic
//! should abort the rest of a drain or be contained is decided here, per
//! [`Context`], and applied by the [`Deferred`](crate::Deferred) /
//! [`Promise`](crate::Promise) pair when callbacks are registered.
use crate::Error;
use log::error;
use std::any::Any;
use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type PanicHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// What happens when a registered callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// The panic unwinds out of the drain on whichever thread was draining.
    /// Callbacks not yet popped stay chained until the next drain.
    #[default]
    Propagate,
    /// The panic is caught, logged and reported to the panic handler, and the
    /// drain carries on with the next callback.
    Isolate,
}

#[derive(Clone, Default)]
pub struct Context {
    name: Option<Arc<str>>,
    panic_policy: PanicPolicy,
    on_panic: Option<PanicHandler>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn panic_policy(&self) -> PanicPolicy {
        self.panic_policy
    }

    /// Runs `callback` under this context's panic policy.
    pub(crate) fn invoke<F: FnOnce()>(&self, callback: F) {
        match self.panic_policy {
            PanicPolicy::Propagate => callback(),
            PanicPolicy::Isolate => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    let err = Error::Panicked {
                        message: panic_message(payload.as_ref()),
                    };
                    error!("[{}] {err}", self.name().unwrap_or("promise"));
                    if let Some(handler) = &self.on_panic {
                        handler(&err);
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("panic_policy", &self.panic_policy)
            .field("on_panic", &self.on_panic.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    context: Context,
}

impl ContextBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name: String = name.into();
        self.context.name = Some(Arc::from(name));
        self
    }

    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.context.panic_policy = policy;
        self
    }

    /// Handler for panics caught under [`PanicPolicy::Isolate`].
    pub fn on_panic<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.context.on_panic = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Context {
        self.context
    }
}
