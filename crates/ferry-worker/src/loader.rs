//! Dynamic loading of handler modules.

use ferry_core::module::{Module, ModuleEntry, ENTRY_SYMBOL};
use ferry_core::{Error, Result};
use libloading::Library;
use tracing::info;

/// Load the module at `path` and take ownership of its entry value.
///
/// The library stays mapped for the life of the worker process; unloading
/// would invalidate handler code that may still be executing.
pub fn load(path: &str) -> Result<Module> {
    info!(path, "loading handler module");

    // SAFETY: loading user-supplied code. The module author upholds the
    // entry contract documented on `ferry_core::module`.
    let library = unsafe { Library::new(path) }
        .map_err(|e| Error::ModuleLoad(format!("{path}: {e}")))?;

    let module = unsafe {
        let entry = library
            .get::<ModuleEntry>(ENTRY_SYMBOL.as_bytes())
            .map_err(|e| Error::ModuleLoad(format!("{path}: missing entry symbol: {e}")))?;
        let raw = entry();
        if raw.is_null() {
            return Err(Error::ModuleLoad(format!("{path}: entry returned null")));
        }
        *Box::from_raw(raw)
    };

    std::mem::forget(library);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rejects_missing_file() {
        let err = load("/nonexistent/handler.so").unwrap_err();
        assert!(matches!(err, Error::ModuleLoad(_)));
    }
}
