//! Loaded-module contract for worker processes.
//!
//! A handler module is a dylib exporting [`ENTRY_SYMBOL`]:
//!
//! ```ignore
//! use ferry_core::{Handler, Module};
//!
//! #[no_mangle]
//! pub extern "C" fn ferry_module_entry() -> *mut Module {
//!     Box::into_raw(Box::new(Module {
//!         main: Handler::sync_fn(|data| Ok(data)),
//!         port: None,
//!     }))
//! }
//! ```
//!
//! The worker runtime takes ownership of the returned `Module`. The dylib
//! must be built against the same ferry-core version as the worker binary;
//! the entry contract passes a Rust `Module` across the boundary as a raw
//! pointer.

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::channel::Endpoint;
use crate::dispatch::{Handler, HandlerError};
use crate::error::{Error, Result};

/// Entry symbol every handler module must export.
pub const ENTRY_SYMBOL: &str = "ferry_module_entry";

/// Signature of the exported entry function.
pub type ModuleEntry = unsafe extern "C" fn() -> *mut Module;

/// Result of a module's port hook.
pub type PortResult = std::result::Result<(), HandlerError>;

/// Hook invoked once at load time with the worker's channel endpoint, for
/// modules that manage the endpoint themselves.
pub enum PortHook {
    Sync(Box<dyn FnOnce(Endpoint) -> PortResult + Send>),
    Async(Box<dyn FnOnce(Endpoint) -> BoxFuture<'static, PortResult> + Send>),
}

impl PortHook {
    /// A synchronous port hook.
    pub fn sync_fn<F>(f: F) -> Self
    where
        F: FnOnce(Endpoint) -> PortResult + Send + 'static,
    {
        PortHook::Sync(Box::new(f))
    }

    /// An asynchronous port hook; the runtime awaits its completion before
    /// binding message dispatch.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Endpoint) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = PortResult> + Send + 'static,
    {
        PortHook::Async(Box::new(move |endpoint| f(endpoint).boxed()))
    }

    /// Invoke the hook, awaiting asynchronous variants.
    pub async fn invoke(self, endpoint: Endpoint) -> Result<()> {
        match self {
            PortHook::Sync(f) => f(endpoint).map_err(|e| Error::PortBootstrap(e.to_string())),
            PortHook::Async(f) => f(endpoint)
                .await
                .map_err(|e| Error::PortBootstrap(e.to_string())),
        }
    }
}

/// A user-supplied handler module.
///
/// `main` receives every inbound message payload. `port` is optional and
/// called at most once, before message dispatch begins.
pub struct Module {
    pub main: Handler,
    pub port: Option<PortHook>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("has_port", &self.port.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::protocol::Message;
    use serde_json::json;

    #[tokio::test]
    async fn sync_port_hook_runs_with_endpoint() {
        let (a, b) = channel::pair();
        let hook = PortHook::sync_fn(|endpoint: Endpoint| {
            endpoint.send(Message::new(json!("from-port")))?;
            Ok(())
        });

        hook.invoke(a).await.unwrap();

        let mut rx = b.take_inbox().unwrap();
        assert_eq!(rx.recv().await.unwrap().data, json!("from-port"));
    }

    #[tokio::test]
    async fn failing_port_hook_maps_to_bootstrap_error() {
        let (a, _b) = channel::pair();
        let hook = PortHook::async_fn(|_| async { Err("no dongle".into()) });

        let err = hook.invoke(a).await.unwrap_err();
        assert!(matches!(err, Error::PortBootstrap(message) if message.contains("no dongle")));
    }
}
