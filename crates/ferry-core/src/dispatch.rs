//! Uniform dispatch over differently shaped handler callables.
//!
//! A handler module's author may write a plain function, an async function,
//! or a function returning an already-running future. The calling convention
//! is declared once, at registration, as a [`HandlerKind`]; dispatch is a
//! match over that closed set, so no runtime introspection of the callable
//! is ever needed.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{Error, Result};

/// Boxed error type produced by module handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one handler call.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

type SyncFn = dyn Fn(Value) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Calling convention of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Plain function returning its result directly.
    Sync,
    /// Async function; the call itself suspends.
    Async,
    /// Plain function returning an in-flight future.
    PromiseFactory,
}

/// A message handler with its calling convention attached at registration.
pub enum Handler {
    Sync(Box<SyncFn>),
    Async(Box<AsyncFn>),
    PromiseFactory(Box<AsyncFn>),
}

impl Handler {
    /// Register a plain synchronous handler.
    pub fn sync_fn<F>(f: F) -> Self
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Box::new(f))
    }

    /// Register an asynchronous handler.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Box::new(move |data| f(data).boxed()))
    }

    /// Register a handler that returns an in-flight future.
    pub fn promise_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::PromiseFactory(Box::new(move |data| f(data).boxed()))
    }

    /// The calling convention declared at registration.
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Sync(_) => HandlerKind::Sync,
            Handler::Async(_) => HandlerKind::Async,
            Handler::PromiseFactory(_) => HandlerKind::PromiseFactory,
        }
    }
}

/// Invoke `handler` with `data` and normalize the eventual result.
///
/// Checked in priority order: async handlers are awaited, promise factories
/// are called and their returned future awaited, plain handlers are called
/// synchronously. A handler error or panic surfaces as [`Error::Dispatch`].
pub async fn dispatch(handler: &Handler, data: Value) -> Result<Value> {
    match handler {
        Handler::Async(f) | Handler::PromiseFactory(f) => {
            let fut = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(data))) {
                Ok(fut) => fut,
                Err(panic) => return Err(Error::Dispatch(panic_message(panic))),
            };
            match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::Dispatch(e.to_string())),
                Err(panic) => Err(Error::Dispatch(panic_message(panic))),
            }
        }
        Handler::Sync(f) => {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(data))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::Dispatch(e.to_string())),
                Err(panic) => Err(Error::Dispatch(panic_message(panic))),
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
